use anyhow::Result;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Key-value store handed to every filter for the whole fetch or deploy
/// operation.
///
/// Change groups may be deployed concurrently, so writers must tolerate
/// last-write-wins between groups touching the same key.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    entries: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().get(key).cloned()
    }

    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.write().insert(key.into(), value);
    }

    pub fn set_typed<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_clones_share_entries() {
        let context = SharedContext::new();
        let handle = context.clone();

        let ids: BTreeMap<String, String> = BTreeMap::from([("00u1".to_string(), "a@b.com".to_string())]);
        handle.set_typed("users", &ids).unwrap();

        let read: BTreeMap<String, String> = context.get_typed("users").unwrap().unwrap();
        assert_eq!(read, ids);
        assert!(context.remove("users").is_some());
        assert!(!handle.contains("users"));
    }
}
