/*!
Mock state store for tests without a redis server

Holds status hashes in memory and records every publish and set, so tests
can assert on what a coordinator or barrier sent.
*/

use paper_core::store::{StateStore, StoreError};
use paper_core::InstanceKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    keys: HashMap<String, String>,
    published: Vec<MockMessage>,
    offline: bool,
}

#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<Inner>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one status field of an instance, as a running hashpipe would.
    pub fn set_status(&self, key: &InstanceKey, field: &str, value: &str) {
        self.inner
            .lock()
            .hashes
            .entry(key.status_key())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    /// Makes every subsequent call fail.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().keys.get(key).cloned()
    }

    pub fn published(&self) -> Vec<MockMessage> {
        self.inner.lock().published.clone()
    }

    pub fn find_messages_by_channel(&self, channel: &str) -> Vec<MockMessage> {
        self.inner.lock().published.iter().filter(|m| m.channel == channel).cloned().collect()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.inner.lock().offline {
            Err(StoreError::Unavailable("mock store offline".into()))
        } else {
            Ok(())
        }
    }
}

impl StateStore for MockStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        Ok(self.inner.lock().hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.check_online()?;
        tracing::info!("[mock] published to {}: {} bytes", channel, payload.len());
        self.inner.lock().published.push(MockMessage { channel: channel.to_string(), payload: payload.to_string() });
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.inner.lock().keys.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_store_roundtrip() {
        let store = MockStore::new();
        let key = InstanceKey::new("px1", 0);
        store.set_status(&key, "GPUMCNT", "42");

        assert_eq!(store.hget(&key.status_key(), "GPUMCNT").await.unwrap(), Some("42".into()));
        assert_eq!(store.hget(&key.status_key(), "INTSTAT").await.unwrap(), None);

        store.publish("hashpipe:///set", "INTSTAT=stop").await.unwrap();
        assert_eq!(store.find_messages_by_channel("hashpipe:///set").len(), 1);

        store.set_offline(true);
        assert!(store.set("k", "v").await.is_err());
    }
}
