//! Key-value store abstraction.
//!
//! The durable job store, the toolkit registry mirror, the probe
//! scheduler, and the login throttle all talk to a Redis-shaped store
//! through the [`Kv`] trait. Production uses [`RedisKv`]; tests use
//! [`MemoryKv`], which implements the same semantics (including TTLs and
//! the compare-and-set used by the scheduler's reservation protocol).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

use crate::error::KvError;

/// Redis-shaped key-value operations used by the server.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), KvError>;
    async fn del(&self, key: &str) -> Result<bool, KvError>;
    async fn incr(&self, key: &str) -> Result<i64, KvError>;
    async fn expire(&self, key: &str, ttl_seconds: i64) -> Result<(), KvError>;
    /// TTL in seconds; -1 when the key has no expiry, -2 when absent.
    async fn ttl(&self, key: &str) -> Result<i64, KvError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError>;
    async fn hvals(&self, key: &str) -> Result<Vec<String>, KvError>;
    /// Atomically replace a hash field only when its current value matches
    /// `expected` (`None` = field must be absent). Returns false on
    /// conflict. Equivalent to a WATCH/MULTI/EXEC round on the field.
    async fn hset_if_equals(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, KvError>;

    async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), KvError>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError>;
}

const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if ARGV[2] == '1' then
  if current then return 0 end
else
  if not current or current ~= ARGV[3] then return 0 end
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
return 1
"#;

/// Redis-backed implementation over a multiplexed connection manager.
pub struct RedisKv {
    manager: ConnectionManager,
    cas: redis::Script,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(KvError::from)?;
        let manager = ConnectionManager::new(client).await.map_err(KvError::from)?;
        Ok(Self {
            manager,
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.conn().get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), KvError> {
        let () = self.conn().set_ex(key, value, ttl_seconds.max(0) as u64).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let removed: i64 = self.conn().del(key).await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        Ok(self.conn().incr(key, 1).await?)
    }

    async fn expire(&self, key: &str, ttl_seconds: i64) -> Result<(), KvError> {
        let _: bool = self.conn().expire(key, ttl_seconds).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, KvError> {
        Ok(self.conn().ttl(key).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let _: i64 = self.conn().hset(key, field, value).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError> {
        let removed: i64 = self.conn().hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hvals(&self, key: &str) -> Result<Vec<String>, KvError> {
        Ok(self.conn().hvals(key).await?)
    }

    async fn hset_if_equals(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let outcome: i64 = self
            .cas
            .key(key)
            .arg(field)
            .arg(if expected.is_none() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(outcome == 1)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError> {
        let _: i64 = self.conn().lpush(key, value).await?;
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), KvError> {
        let () = self.conn().ltrim(key, start as isize, stop as isize).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        Ok(self
            .conn()
            .lrange(key, start as isize, stop as isize)
            .await?)
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Str {
        value: String,
        expires_at: Option<Instant>,
    },
    Hash(HashMap<String, String>),
    List(Vec<String>),
}

impl Entry {
    fn expired(&self) -> bool {
        match self {
            Entry::Str {
                expires_at: Some(at),
                ..
            } => *at <= Instant::now(),
            _ => false,
        }
    }
}

/// In-memory store with the same observable semantics as [`RedisKv`].
#[derive(Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn prune(entries: &mut HashMap<String, Entry>, key: &str) {
    if entries.get(key).is_some_and(Entry::expired) {
        entries.remove(key);
    }
}

fn list_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop || len == 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock().await;
        prune(&mut entries, key);
        match entries.get(key) {
            Some(Entry::Str { value, .. }) => Ok(Some(value.clone())),
            _ => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry::Str {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds.max(0) as u64)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        prune(&mut entries, key);
        Ok(entries.remove(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut entries = self.entries.lock().await;
        prune(&mut entries, key);
        let (current, expires_at) = match entries.get(key) {
            Some(Entry::Str { value, expires_at }) => (
                value
                    .parse::<i64>()
                    .map_err(|_| KvError::Backend("value is not an integer".to_string()))?,
                *expires_at,
            ),
            _ => (0, None),
        };
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry::Str {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_seconds: i64) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        prune(&mut entries, key);
        if let Some(Entry::Str { expires_at, .. }) = entries.get_mut(key) {
            *expires_at = Some(Instant::now() + Duration::from_secs(ttl_seconds.max(0) as u64));
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, KvError> {
        let mut entries = self.entries.lock().await;
        prune(&mut entries, key);
        match entries.get(key) {
            None => Ok(-2),
            Some(Entry::Str {
                expires_at: Some(at),
                ..
            }) => {
                let remaining = at.saturating_duration_since(Instant::now()).as_secs() as i64;
                // A key that expires within the current second still reports 1.
                Ok(remaining.max(1))
            }
            Some(_) => Ok(-1),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(Entry::Hash(map)) => Ok(map.get(field).cloned()),
            _ => Ok(None),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry {
            Entry::Hash(map) => {
                map.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(KvError::Backend("wrong type for hash op".to_string())),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(Entry::Hash(map)) => Ok(map.remove(field).is_some()),
            _ => Ok(false),
        }
    }

    async fn hvals(&self, key: &str) -> Result<Vec<String>, KvError> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(Entry::Hash(map)) => Ok(map.values().cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn hset_if_equals(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry {
            Entry::Hash(map) => {
                let matches = match (map.get(field), expected) {
                    (None, None) => true,
                    (Some(current), Some(expected)) => current == expected,
                    _ => false,
                };
                if matches {
                    map.insert(field.to_string(), value.to_string());
                }
                Ok(matches)
            }
            _ => Err(KvError::Backend("wrong type for hash op".to_string())),
        }
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(Vec::new()));
        match entry {
            Entry::List(items) => {
                items.insert(0, value.to_string());
                Ok(())
            }
            _ => Err(KvError::Backend("wrong type for list op".to_string())),
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        if let Some(Entry::List(items)) = entries.get_mut(key) {
            match list_bounds(items.len(), start, stop) {
                Some((start, stop)) => {
                    *items = items[start..=stop].to_vec();
                }
                None => items.clear(),
            }
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(Entry::List(items)) => Ok(list_bounds(items.len(), start, stop)
                .map(|(start, stop)| items[start..=stop].to_vec())
                .unwrap_or_default()),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_roundtrip() {
        let kv = MemoryKv::new();
        kv.hset("jobs", "a", "1").await.unwrap();
        kv.hset("jobs", "b", "2").await.unwrap();

        assert_eq!(kv.hget("jobs", "a").await.unwrap(), Some("1".to_string()));
        assert_eq!(kv.hvals("jobs").await.unwrap().len(), 2);
        assert!(kv.hdel("jobs", "a").await.unwrap());
        assert!(!kv.hdel("jobs", "a").await.unwrap());
    }

    #[tokio::test]
    async fn cas_succeeds_only_on_matching_value() {
        let kv = MemoryKv::new();

        // Absent field, expecting absent: wins.
        assert!(kv.hset_if_equals("t", "f", None, "v1").await.unwrap());
        // Absent expectation against a present field: loses.
        assert!(!kv.hset_if_equals("t", "f", None, "v2").await.unwrap());
        // Matching expectation: wins.
        assert!(kv.hset_if_equals("t", "f", Some("v1"), "v2").await.unwrap());
        // Stale expectation: loses.
        assert!(!kv.hset_if_equals("t", "f", Some("v1"), "v3").await.unwrap());
        assert_eq!(kv.hget("t", "f").await.unwrap(), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn counters_and_ttls() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("attempts").await.unwrap(), 1);
        assert_eq!(kv.incr("attempts").await.unwrap(), 2);
        kv.expire("attempts", 300).await.unwrap();
        assert!(kv.ttl("attempts").await.unwrap() > 0);

        kv.set_ex("lockout", "1", 900).await.unwrap();
        assert!(kv.ttl("lockout").await.unwrap() > 0);
        assert_eq!(kv.ttl("missing").await.unwrap(), -2);

        assert!(kv.del("lockout").await.unwrap());
        assert_eq!(kv.ttl("lockout").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn list_push_trim_range() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.lpush("history", &i.to_string()).await.unwrap();
        }
        // Most recent first.
        assert_eq!(
            kv.lrange("history", 0, 1).await.unwrap(),
            vec!["4".to_string(), "3".to_string()]
        );
        kv.ltrim("history", 0, 2).await.unwrap();
        assert_eq!(kv.lrange("history", 0, -1).await.unwrap().len(), 3);
    }
}
