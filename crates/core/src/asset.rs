use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AssetKeyError;

/// Identifier of a data asset: an ordered list of path components.
///
/// The string form joins components with `/` (`warehouse/orders`). Keys
/// serialize as that string so they can be used as JSON map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey {
    path: Vec<String>,
}

impl AssetKey {
    /// Build a key from path components.
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a `/`-separated user string.
    pub fn from_user_string(s: &str) -> Result<Self, AssetKeyError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AssetKeyError::Empty);
        }
        let path: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return Err(AssetKeyError::EmptyComponent(s.to_string()));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn to_user_string(&self) -> String {
        self.path.join("/")
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.join("/"))
    }
}

impl FromStr for AssetKey {
    type Err = AssetKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_user_string(s)
    }
}

impl From<&str> for AssetKey {
    /// Single-component key. Use [`AssetKey::from_user_string`] to split on `/`.
    fn from(name: &str) -> Self {
        Self::new([name])
    }
}

impl Serialize for AssetKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AssetKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AssetKey::from_user_string(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn user_string_round_trip() {
        let key = AssetKey::from_user_string("warehouse/orders").unwrap();
        assert_eq!(key.path(), &["warehouse".to_string(), "orders".to_string()]);
        assert_eq!(key.to_string(), "warehouse/orders");
    }

    #[test]
    fn rejects_empty_components() {
        assert!(AssetKey::from_user_string("").is_err());
        assert!(AssetKey::from_user_string("a//b").is_err());
    }

    #[test]
    fn ordering_is_by_path() {
        let mut keys = vec![AssetKey::from("b"), AssetKey::new(["a", "z"]), AssetKey::from("a")];
        keys.sort();
        assert_eq!(
            keys.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
            vec!["a", "a/z", "b"]
        );
    }

    #[test]
    fn usable_as_json_map_key() {
        let mut map = BTreeMap::new();
        map.insert(AssetKey::new(["x", "y"]), 3);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"x/y":3}"#);
        let back: BTreeMap<AssetKey, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
