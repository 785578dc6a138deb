//! Id-keyed containers.
//!
//! Document ids travel as strings on the wire and key every map in the
//! store. [`id_stringify`] / [`id_parse`] convert between an id [`Value`]
//! and that key form without ambiguity: a string id and a numeric id that
//! print the same still get different keys.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::value::Value;

fn looks_like_object_id(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Key form of a document id.
///
/// Plain strings pass through. Strings that start with `-`, `~` or `{`, or
/// that look like a 24-hex ObjectID, get a `-` prefix. Numbers, booleans and
/// null become `~` followed by their JSON text. Objects cannot be ids.
pub fn id_stringify(id: &Value) -> Result<String> {
    match id {
        Value::String(s) => {
            if s.is_empty() {
                Ok(String::new())
            } else if s.starts_with('-') || s.starts_with('~') || s.starts_with('{') || looks_like_object_id(s) {
                Ok(format!("-{s}"))
            } else {
                Ok(s.clone())
            }
        }
        Value::Number(_) | Value::Bool(_) | Value::Null => {
            Ok(format!("~{}", crate::ejson::stringify(id, false)))
        }
        other => Err(Error::InvalidId(format!("{other} cannot be used as an id"))),
    }
}

/// Inverse of [`id_stringify`].
pub fn id_parse(key: &str) -> Result<Value> {
    if let Some(rest) = key.strip_prefix('-') {
        return Ok(Value::String(rest.to_string()));
    }
    if let Some(rest) = key.strip_prefix('~') {
        let json: serde_json::Value =
            serde_json::from_str(rest).map_err(|e| Error::InvalidId(format!("{key}: {e}")))?;
        return Ok(Value::from(json));
    }
    Ok(Value::String(key.to_string()))
}

/// Insertion-ordered map keyed by stringified document id.
#[derive(Debug, Clone, PartialEq)]
pub struct IdMap<V> {
    map: IndexMap<String, V>,
}

impl<V> Default for IdMap<V> {
    fn default() -> Self {
        Self { map: IndexMap::new() }
    }
}

impl<V> IdMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn insert(&mut self, key: String, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    /// Removes `key` keeping the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.map.shift_remove(key)
    }

    /// Position of `key` in insertion order.
    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.map.get_index_of(key)
    }

    pub fn entry_or_insert_with(&mut self, key: String, f: impl FnOnce() -> V) -> &mut V {
        self.map.entry(key).or_insert_with(f)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.map.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.map.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_by_id(&self, id: &Value) -> Option<&V> {
        id_stringify(id).ok().and_then(|key| self.map.get(&key))
    }
}

impl<V> FromIterator<(String, V)> for IdMap<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        Self { map: iter.into_iter().collect() }
    }
}

impl<V> IntoIterator for IdMap<V> {
    type Item = (String, V);
    type IntoIter = indexmap::map::IntoIter<String, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.into_iter()
    }
}

/// Ordered dictionary supporting positional insertion and moves, used to
/// track the order of an ordered live query's results.
#[derive(Debug, Clone)]
pub struct OrderedDict<V> {
    map: IndexMap<String, V>,
}

impl<V> Default for OrderedDict<V> {
    fn default() -> Self {
        Self { map: IndexMap::new() }
    }
}

impl<V> OrderedDict<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.map.get_index_of(key)
    }

    fn position_of(&self, before: Option<&str>) -> Result<usize> {
        match before {
            None => Ok(self.map.len()),
            Some(b) => self
                .index_of(b)
                .ok_or_else(|| Error::NotFound(format!("could not find item to put this one before: {b}"))),
        }
    }

    /// Inserts `key` directly before `before`, or at the end when `None`.
    pub fn put_before(&mut self, key: String, value: V, before: Option<&str>) -> Result<()> {
        if self.map.contains_key(&key) {
            return Err(Error::DuplicateId(key));
        }
        let index = self.position_of(before)?;
        self.map.shift_insert(index, key, value);
        Ok(())
    }

    pub fn append(&mut self, key: String, value: V) -> Result<()> {
        self.put_before(key, value, None)
    }

    pub fn remove(&mut self, key: &str) -> Result<V> {
        self.map
            .shift_remove(key)
            .ok_or_else(|| Error::NotFound(format!("item {key} not present in OrderedDict")))
    }

    /// Moves `key` so it sits directly before `before` (or last).
    pub fn move_before(&mut self, key: &str, before: Option<&str>) -> Result<()> {
        let from = self
            .index_of(key)
            .ok_or_else(|| Error::NotFound(format!("item {key} not present in OrderedDict")))?;
        if before == Some(key) {
            return Ok(());
        }
        let target = self.position_of(before)?;
        let to = if from < target { target - 1 } else { target };
        self.map.move_index(from, to);
        Ok(())
    }

    pub fn first(&self) -> Option<&str> {
        self.map.first().map(|(k, _)| k.as_str())
    }

    pub fn last(&self) -> Option<&str> {
        self.map.last().map(|(k, _)| k.as_str())
    }

    pub fn next(&self, key: &str) -> Option<&str> {
        let i = self.index_of(key)?;
        self.map.get_index(i + 1).map(|(k, _)| k.as_str())
    }

    pub fn prev(&self, key: &str) -> Option<&str> {
        let i = self.index_of(key)?;
        i.checked_sub(1)
            .and_then(|p| self.map.get_index(p))
            .map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stringify_plain_and_prefixed_strings() {
        assert_eq!(id_stringify(&Value::from("abc")).unwrap(), "abc");
        assert_eq!(id_stringify(&Value::from("")).unwrap(), "");
        assert_eq!(id_stringify(&Value::from("-x")).unwrap(), "--x");
        assert_eq!(id_stringify(&Value::from("~x")).unwrap(), "-~x");
        assert_eq!(id_stringify(&Value::from("{x")).unwrap(), "-{x");
        let oid = "0123456789abcdef01234567";
        assert_eq!(id_stringify(&Value::from(oid)).unwrap(), format!("-{oid}"));
    }

    #[test]
    fn test_stringify_scalars() {
        assert_eq!(id_stringify(&Value::from(42)).unwrap(), "~42");
        assert_eq!(id_stringify(&Value::Bool(true)).unwrap(), "~true");
        assert_eq!(id_stringify(&Value::Null).unwrap(), "~null");
        assert!(id_stringify(&Value::empty_object()).is_err());
    }

    #[test]
    fn test_parse_inverts_stringify() {
        for id in [
            Value::from("abc"),
            Value::from("-dash"),
            Value::from("~tilde"),
            Value::from(""),
            Value::from(7),
            Value::from(1.5),
            Value::Bool(false),
            Value::from("0123456789abcdef01234567"),
        ] {
            let key = id_stringify(&id).unwrap();
            assert_eq!(id_parse(&key).unwrap(), id, "key {key}");
        }
    }

    #[test]
    fn test_string_and_number_ids_do_not_collide() {
        assert_ne!(id_stringify(&Value::from("1")).unwrap(), id_stringify(&Value::from(1)).unwrap());
    }

    #[test]
    fn test_id_map_preserves_order_on_remove() {
        let mut map = IdMap::new();
        for k in ["a", "b", "c"] {
            map.insert(k.to_string(), k.len());
        }
        map.remove("a");
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        assert!(map.get_by_id(&Value::from("b")).is_some());
    }

    #[test]
    fn test_ordered_dict_positions() {
        let mut dict = OrderedDict::new();
        dict.append("a".into(), 1).unwrap();
        dict.append("c".into(), 3).unwrap();
        dict.put_before("b".into(), 2, Some("c")).unwrap();
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(dict.first(), Some("a"));
        assert_eq!(dict.last(), Some("c"));
        assert_eq!(dict.next("a"), Some("b"));
        assert_eq!(dict.prev("a"), None);
        assert_eq!(dict.index_of("c"), Some(2));
        assert!(dict.put_before("a".into(), 9, None).is_err());
        assert!(dict.put_before("z".into(), 9, Some("missing")).is_err());
    }

    #[test]
    fn test_ordered_dict_move_before() {
        let mut dict = OrderedDict::new();
        for k in ["a", "b", "c", "d"] {
            dict.append(k.to_string(), ()).unwrap();
        }
        dict.move_before("a", Some("d")).unwrap();
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["b", "c", "a", "d"]);
        dict.move_before("d", Some("b")).unwrap();
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["d", "b", "c", "a"]);
        dict.move_before("d", None).unwrap();
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["b", "c", "a", "d"]);
        dict.remove("c").unwrap();
        assert!(dict.remove("c").is_err());
    }
}
