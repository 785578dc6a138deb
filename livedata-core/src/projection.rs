//! Field projections (`fields` option of `find`).
//!
//! A projection either includes only the listed paths or excludes them; the
//! two cannot be mixed except for `_id`, which is included unless
//! explicitly set to `0`.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::value::{Document, Value};

#[derive(Debug, Clone, Default, PartialEq)]
struct Tree {
    children: IndexMap<String, Tree>,
    leaf: bool,
}

impl Tree {
    fn insert(&mut self, path: &str) -> Result<()> {
        let mut node = self;
        let parts: Vec<&str> = path.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                return Err(Error::MalformedProjection(format!("invalid path '{path}'")));
            }
            if node.leaf {
                return Err(Error::MalformedProjection(format!("path collision at {path}")));
            }
            node = node.children.entry(part.to_string()).or_default();
            if i + 1 == parts.len() {
                if node.leaf || !node.children.is_empty() {
                    return Err(Error::MalformedProjection(format!("path collision at {path}")));
                }
                node.leaf = true;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    tree: Tree,
    including: bool,
    include_id: bool,
}

impl Projection {
    pub fn new(spec: &Value) -> Result<Self> {
        let fields = spec
            .as_object()
            .ok_or_else(|| Error::MalformedProjection(format!("fields must be an object, got {spec}")))?;
        let mut tree = Tree::default();
        let mut including: Option<bool> = None;
        let mut include_id = true;
        for (path, rule) in fields {
            let include = match rule {
                Value::Number(_) | Value::Bool(_) => rule.is_truthy(),
                other => {
                    return Err(Error::MalformedProjection(format!(
                        "unsupported projection value for {path}: {other}"
                    )))
                }
            };
            if path == "_id" {
                include_id = include;
                continue;
            }
            if path.contains('$') {
                return Err(Error::MalformedProjection(format!("unsupported projection operator in {path}")));
            }
            match including {
                Some(mode) if mode != include => {
                    return Err(Error::MalformedProjection(
                        "cannot mix inclusion and exclusion".into(),
                    ))
                }
                _ => including = Some(include),
            }
            tree.insert(path)?;
        }
        Ok(Projection {
            tree,
            // A projection listing only `_id` behaves like an exclusion of nothing
            // else, i.e. `{_id: 0}` keeps every other field.
            including: including.unwrap_or(false),
            include_id,
        })
    }

    /// Whether the projection passes every field through unchanged.
    pub fn is_identity(&self) -> bool {
        !self.including && self.tree.children.is_empty() && self.include_id
    }

    pub fn apply(&self, doc: &Document) -> Document {
        let mut out = if self.including {
            let mut out = include(doc, &self.tree);
            if self.include_id {
                if let Some(id) = doc.get("_id") {
                    out.shift_insert(0, "_id".to_string(), id.clone());
                }
            }
            out
        } else {
            let mut out = doc.clone();
            exclude(&mut out, &self.tree);
            out
        };
        if !self.include_id {
            out.shift_remove("_id");
        }
        out
    }
}

fn include(doc: &Document, tree: &Tree) -> Document {
    let mut out = Document::new();
    for (key, value) in doc {
        let Some(sub) = tree.children.get(key) else {
            continue;
        };
        if sub.leaf {
            out.insert(key.clone(), value.clone());
            continue;
        }
        match value {
            Value::Object(o) => {
                out.insert(key.clone(), Value::Object(include(o, sub)));
            }
            Value::Array(items) => {
                let projected = items
                    .iter()
                    .filter_map(|item| item.as_object().map(|o| Value::Object(include(o, sub))))
                    .collect();
                out.insert(key.clone(), Value::Array(projected));
            }
            _ => {}
        }
    }
    out
}

fn exclude(doc: &mut Document, tree: &Tree) {
    for (key, sub) in &tree.children {
        if sub.leaf {
            doc.shift_remove(key);
            continue;
        }
        match doc.get_mut(key) {
            Some(Value::Object(o)) => exclude(o, sub),
            Some(Value::Array(items)) => {
                for item in items.iter_mut() {
                    if let Value::Object(o) = item {
                        exclude(o, sub);
                    }
                }
            }
            _ => {}
        }
    }
}
