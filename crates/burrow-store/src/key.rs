//! Canonical store keys
//!
//! A [`Key`] is the JSON text of the caller's identifier. Identifiers must
//! serialize deterministically: structs and sequences do, but `HashMap`-backed
//! identifiers do not and should use a `BTreeMap` instead.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Canonical, immutable string key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    /// Derive the key for an identifier
    pub fn encode<K: Serialize + ?Sized>(id: &K) -> StoreResult<Self> {
        serde_json::to_string(id)
            .map(Self)
            .map_err(|e| StoreError::InvalidKey(e.to_string()))
    }

    /// Wrap text that is already a canonical key (e.g. read back from the log)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Decode the key back into the identifier type it was built from
    pub fn decode<K: serde::de::DeserializeOwned>(&self) -> StoreResult<K> {
        serde_json::from_str(&self.0).map_err(|e| StoreError::InvalidKey(e.to_string()))
    }

    /// The key text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the key text in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key text is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct TimelineId {
        account: u64,
        kind: String,
    }

    #[test]
    fn test_string_identifier() {
        let key = Key::encode("greeting").unwrap();
        assert_eq!(key.as_str(), "\"greeting\"");
        assert_eq!(key.decode::<String>().unwrap(), "greeting");
    }

    #[test]
    fn test_equal_identifiers_give_equal_keys() {
        let a = TimelineId {
            account: 1,
            kind: "home".into(),
        };
        let b = TimelineId {
            account: 1,
            kind: "home".into(),
        };
        assert_eq!(Key::encode(&a).unwrap(), Key::encode(&b).unwrap());
    }

    #[test]
    fn test_distinct_identifiers_give_distinct_keys() {
        assert_ne!(Key::encode("1").unwrap(), Key::encode(&1u32).unwrap());
    }

    #[test]
    fn test_btreemap_identifier_is_stable() {
        let mut first = BTreeMap::new();
        first.insert("b", 2);
        first.insert("a", 1);
        let mut second = BTreeMap::new();
        second.insert("a", 1);
        second.insert("b", 2);
        assert_eq!(Key::encode(&first).unwrap(), Key::encode(&second).unwrap());
    }

    #[test]
    fn test_non_string_map_keys_are_rejected() {
        let mut map = BTreeMap::new();
        map.insert(vec![1u8], 1);
        assert!(matches!(Key::encode(&map), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_struct_round_trip() {
        let id = TimelineId {
            account: 42,
            kind: "local".into(),
        };
        let key = Key::encode(&id).unwrap();
        assert_eq!(key.decode::<TimelineId>().unwrap(), id);
    }
}
