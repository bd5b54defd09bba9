//! Ordered containers over [`Value`]: the argument list and the
//! string-keyed dictionary used as configuration and command payload.

use std::io::Cursor;

use crate::error::DecodeError;
use crate::value::{expect_consumed, read_mp, write_mp, Value};

/// Ordered sequence of values, encoded as a MessagePack array.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct List {
    items: Vec<Value>,
}

impl List {
    pub fn new() -> Self {
        List::default()
    }

    pub fn push(&mut self, value: impl Into<Value>) {
        self.items.push(value.into());
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    pub(crate) fn to_mp(&self) -> rmpv::Value {
        rmpv::Value::Array(self.items.iter().map(Value::to_mp).collect())
    }

    pub(crate) fn from_mp(mp: rmpv::Value) -> Result<Self, DecodeError> {
        let rmpv::Value::Array(elements) = mp else {
            return Err(DecodeError::payload("expected an array"));
        };
        let items = elements
            .into_iter()
            .map(Value::from_mp)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(List { items })
    }

    pub fn assemble(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_mp(&mut buf, &self.to_mp());
        buf
    }

    pub fn disassemble(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);
        let mp = read_mp(&mut cursor)?;
        expect_consumed(&cursor)?;
        List::from_mp(mp)
    }
}

impl From<Vec<Value>> for List {
    fn from(items: Vec<Value>) -> Self {
        List { items }
    }
}

impl FromIterator<Value> for List {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        List {
            items: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for List {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// String-keyed mapping with case-sensitive keys and insertion-order
/// iteration, encoded as a MessagePack map. A given insertion sequence
/// always packs to the same bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dictionary {
    entries: Vec<(String, Value)>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary::default()
    }

    /// Insert or overwrite. Overwriting keeps the key's original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn to_mp(&self) -> rmpv::Value {
        rmpv::Value::Map(
            self.entries
                .iter()
                .map(|(k, v)| (rmpv::Value::from(k.as_str()), v.to_mp()))
                .collect(),
        )
    }

    pub(crate) fn from_mp(mp: rmpv::Value) -> Result<Self, DecodeError> {
        let rmpv::Value::Map(pairs) = mp else {
            return Err(DecodeError::payload("expected a map"));
        };
        let mut dict = Dictionary::new();
        for (key, value) in pairs {
            let rmpv::Value::String(key) = key else {
                return Err(DecodeError::payload("map key is not a string"));
            };
            let Some(key) = key.into_str() else {
                return Err(DecodeError::payload("map key is not valid UTF-8"));
            };
            dict.insert(key, Value::from_mp(value)?);
        }
        Ok(dict)
    }

    pub fn assemble(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_mp(&mut buf, &self.to_mp());
        buf
    }

    pub fn disassemble(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);
        let mp = read_mp(&mut cursor)?;
        expect_consumed(&cursor)?;
        Dictionary::from_mp(mp)
    }
}

impl FromIterator<(String, Value)> for Dictionary {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut dict = Dictionary::new();
        for (key, value) in iter {
            dict.insert(key, value);
        }
        dict
    }
}

impl IntoIterator for Dictionary {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Timestamp;

    #[test]
    fn dictionary_preserves_insertion_order() {
        let mut dict = Dictionary::new();
        dict.insert("z", 1i64);
        dict.insert("a", 2i64);
        dict.insert("m", 3i64);
        let keys: Vec<&str> = dict.keys().collect();
        assert_eq!(keys, ["z", "a", "m"]);

        // overwrite keeps the slot
        dict.insert("a", 9i64);
        let keys: Vec<&str> = dict.keys().collect();
        assert_eq!(keys, ["z", "a", "m"]);
        assert_eq!(dict.get("a").unwrap().as_i64().unwrap(), 9);
    }

    #[test]
    fn dictionary_packs_deterministically() {
        let build = || {
            let mut d = Dictionary::new();
            d.insert("one", 1i64);
            d.insert("two", "2");
            d
        };
        assert_eq!(build().assemble(), build().assemble());
    }

    #[test]
    fn dictionary_round_trip() {
        let mut dict = Dictionary::new();
        dict.insert("a", 1i64);
        dict.insert("b", vec![1i64, 2, 3]);
        dict.insert("t", Timestamp::new(1_700_000_000, 5));
        dict.insert("s", "x");

        let decoded = Dictionary::disassemble(&dict.assemble()).unwrap();
        assert_eq!(decoded, dict);
        // and a re-pack is byte-identical
        assert_eq!(decoded.assemble(), dict.assemble());
    }

    #[test]
    fn list_round_trip() {
        let mut list = List::new();
        list.push(1i64);
        list.push("arg");
        list.push(true);
        let decoded = List::disassemble(&list.assemble()).unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn non_string_key_rejected() {
        let mp = rmpv::Value::Map(vec![(rmpv::Value::from(1i64), rmpv::Value::from(2i64))]);
        let mut buf = Vec::new();
        crate::value::write_mp(&mut buf, &mp);
        assert!(Dictionary::disassemble(&buf).is_err());
    }
}
