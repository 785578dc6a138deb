use criterion::{black_box, criterion_group, criterion_main, Criterion};
use livedata_core::{
    diff_query_ordered_changes, ejson, Collection, Document, FindOptions, Matcher, ObserveChanges, TypeRegistry,
    Value,
};
use serde_json::json;

fn doc(j: serde_json::Value) -> Document {
    match Value::from(j) {
        Value::Object(d) => d,
        _ => Document::new(),
    }
}

struct Sink;

impl ObserveChanges for Sink {
    fn ordered(&self) -> bool {
        true
    }
}

fn bench_selector_match(c: &mut Criterion) {
    let matcher = Matcher::new(&Value::from(json!({"owner": "u1", "n": {"$gt": 5}}))).unwrap();
    let d = doc(json!({"_id": "x", "owner": "u1", "n": 10, "tags": ["a", "b"]}));

    c.bench_function("selector_match_simple", |b| {
        b.iter(|| black_box(matcher.matches(black_box(&d))))
    });
}

fn bench_insert_with_live_queries(c: &mut Criterion) {
    let collection = Collection::new("bench");
    let handles: Vec<_> = (0..10)
        .map(|i| {
            collection
                .find_with(
                    &Value::from(json!({"n": {"$gte": i}})),
                    FindOptions { sort: Some(Value::from(json!({"n": 1}))), ..Default::default() },
                )
                .unwrap()
                .observe_changes(Sink)
        })
        .collect();
    let mut next = 0u64;

    c.bench_function("insert_10_live_queries", |b| {
        b.iter(|| {
            next += 1;
            collection.insert(doc(json!({"_id": format!("d{next}"), "n": next % 20}))).unwrap();
        })
    });
    drop(handles);
}

fn bench_ordered_diff(c: &mut Criterion) {
    let old: Vec<Document> = (0..1000).map(|i| doc(json!({"_id": format!("d{i}"), "n": i}))).collect();
    let mut new = old.clone();
    new.rotate_left(10);
    new.truncate(990);

    c.bench_function("ordered_diff_1k", |b| {
        b.iter(|| diff_query_ordered_changes(black_box(&old), black_box(&new), &mut Sink, None))
    });
}

fn bench_ejson_roundtrip(c: &mut Criterion) {
    let registry = TypeRegistry::new();
    let text = r#"{"_id":"abc","at":{"$date":1700000000000},"blob":{"$binary":"AAECAw=="},"n":[1,2,3]}"#;

    c.bench_function("ejson_parse_stringify", |b| {
        b.iter(|| {
            let value = ejson::parse(black_box(text), &registry).unwrap();
            black_box(ejson::stringify(&value, false));
        })
    });
}

criterion_group!(
    benches,
    bench_selector_match,
    bench_insert_with_live_queries,
    bench_ordered_diff,
    bench_ejson_roundtrip,
);
criterion_main!(benches);
