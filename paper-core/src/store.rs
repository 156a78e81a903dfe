//! Hashpipe status store client
//!
//! Each X engine instance publishes its status as a redis hash under
//! `hashpipe://{host}/{inst}/status`. Commands go out on the `hashpipe:///set`
//! broadcast channel as newline separated `KEY=VALUE` pairs.

use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Channel every hashpipe instance listens on for status updates.
pub const BCAST_SET_CHANNEL: &str = "hashpipe:///set";

/// Key holding the Unix time of the last F engine sync.
pub const SYNC_TIME_KEY: &str = "roachf_init_time";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One running X engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    host: String,
    instance: u32,
}

impl InstanceKey {
    pub fn new(host: impl Into<String>, instance: u32) -> Self {
        Self { host: host.into(), instance }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn status_key(&self) -> String {
        format!("hashpipe://{}/{}/status", self.host, self.instance)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.instance)
    }
}

/// Hosts `{prefix}1..={num_hosts}` crossed with instances `0..num_instances`.
pub fn instance_keys(prefix: &str, num_hosts: u32, num_instances: u32) -> Vec<InstanceKey> {
    (1..=num_hosts)
        .flat_map(|h| (0..num_instances).map(move |i| InstanceKey::new(format!("{prefix}{h}"), i)))
        .collect()
}

/// Values of one status field across instances; `None` means not reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    field: String,
    values: BTreeMap<InstanceKey, Option<String>>,
}

impl StatusSnapshot {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into(), values: BTreeMap::new() }
    }

    pub fn with(mut self, key: InstanceKey, value: Option<&str>) -> Self {
        self.insert(key, value.map(str::to_string));
        self
    }

    pub fn insert(&mut self, key: InstanceKey, value: Option<String>) {
        self.values.insert(key, value);
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Number of instances queried, reporting or not.
    pub fn expected(&self) -> usize {
        self.values.len()
    }

    pub fn reported(&self) -> impl Iterator<Item = (&InstanceKey, &str)> {
        self.values.iter().filter_map(|(k, v)| v.as_deref().map(|v| (k, v)))
    }

    pub fn missing(&self) -> impl Iterator<Item = &InstanceKey> {
        self.values.iter().filter(|(_, v)| v.is_none()).map(|(k, _)| k)
    }
}

/// Subset of the redis command set the control tools rely on.
#[allow(async_fn_in_trait)]
pub trait StateStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Reads `field` from every instance's status hash. Absence is not an error.
pub async fn query_status<S: StateStore>(
    store: &S,
    keys: &[InstanceKey],
    field: &str,
) -> Result<StatusSnapshot, StoreError> {
    let mut snapshot = StatusSnapshot::new(field);
    for key in keys {
        let value = store.hget(&key.status_key(), field).await?;
        debug!("{} {} = {:?}", key, field, value);
        snapshot.insert(key.clone(), value);
    }
    Ok(snapshot)
}

/// Stores the sync time for external consumers; nothing here reads it back.
pub async fn record_sync_time<S: StateStore>(store: &S, unix_seconds: i64) -> Result<(), StoreError> {
    store.set(SYNC_TIME_KEY, &unix_seconds.to_string()).await
}

/// Parses an integer with radix prefix (`0x`, `0b`, `0o` or leading `0`).
pub fn parse_int(text: &str) -> Option<u64> {
    let t = text.trim().replace('_', "");
    let (digits, radix) = if let Some(rest) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        (rest, 16)
    } else if let Some(rest) = t.strip_prefix("0b").or_else(|| t.strip_prefix("0B")) {
        (rest, 2)
    } else if let Some(rest) = t.strip_prefix("0o").or_else(|| t.strip_prefix("0O")) {
        (rest, 8)
    } else if t.len() > 1 && t.starts_with('0') {
        (&t[1..], 8)
    } else {
        (t.as_str(), 10)
    };
    match u64::from_str_radix(digits, radix) {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring non-integer status value {:?}", text);
            None
        }
    }
}

/// [`StateStore`] backed by a redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(host: &str, port: u16) -> Result<Self, StoreError> {
        let client = redis::Client::open(format!("redis://{host}:{port}/"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{host}:{port}: {e}")))?;
        debug!("connected to redis at {}:{}", host, port);
        Ok(Self { conn })
    }
}

impl StateStore for RedisStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!("published to {} ({} subscribers)", channel, receivers);
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_keys() {
        let keys = instance_keys("px", 2, 3);
        assert_eq!(keys.len(), 6);
        assert_eq!(keys[0].status_key(), "hashpipe://px1/0/status");
        assert_eq!(keys[5].status_key(), "hashpipe://px2/2/status");
        assert_eq!(keys[4].to_string(), "px2/1");
    }

    #[test]
    fn test_snapshot_partitions() {
        let snap = StatusSnapshot::new("GPUMCNT")
            .with(InstanceKey::new("px1", 0), Some("10"))
            .with(InstanceKey::new("px1", 1), None);
        assert_eq!(snap.expected(), 2);
        assert_eq!(snap.reported().count(), 1);
        assert_eq!(snap.missing().next(), Some(&InstanceKey::new("px1", 1)));
    }

    #[test]
    fn test_parse_int_radix() {
        assert_eq!(parse_int("1200"), Some(1200));
        assert_eq!(parse_int(" 0x10 "), Some(16));
        assert_eq!(parse_int("010"), Some(8));
        assert_eq!(parse_int("0b11"), Some(3));
        assert_eq!(parse_int("0"), Some(0));
        assert_eq!(parse_int("start"), None);
    }
}
