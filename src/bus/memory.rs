use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::client::{BusClient, BusError, StreamEntry};

/// In-memory bus used by tests and offline runs. Single-process only; the
/// delivery/ack bookkeeping mirrors what the Redis streams contract promises.
#[derive(Default)]
pub struct InMemoryBus {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<(String, Value)>>,
    /// (stream, group) -> index of the next undelivered entry.
    cursors: HashMap<(String, String), usize>,
    acks: Vec<(String, String, String)>,
    kv: HashMap<String, (Value, Option<Instant>)>,
    next_id: u64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All payloads appended to `stream`, in order.
    pub fn entries(&self, stream: &str) -> Vec<Value> {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map(|v| v.iter().map(|(_, data)| data.clone()).collect())
            .unwrap_or_default()
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// How many times `(stream, id)` has been acked across all groups.
    pub fn ack_count(&self, stream: &str, id: &str) -> usize {
        self.inner
            .lock()
            .acks
            .iter()
            .filter(|(s, _, i)| s == stream && i == id)
            .count()
    }

    pub fn total_acks(&self) -> usize {
        self.inner.lock().acks.len()
    }

    /// Remaining TTL recorded for `key`, if any. Test hook.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let inner = self.inner.lock();
        let (_, expiry) = inner.kv.get(key)?;
        expiry.map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn purge_expired(inner: &mut Inner) {
        let now = Instant::now();
        inner
            .kv
            .retain(|_, (_, expiry)| expiry.map(|at| at > now).unwrap_or(true));
    }
}

/// Glob match supporting `*` wildcards (the subset SCAN patterns use here).
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }
    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl BusClient for InMemoryBus {
    async fn create_consumer_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        inner.streams.entry(stream.to_string()).or_default();
        inner
            .cursors
            .entry((stream.to_string(), group.to_string()))
            .or_insert(0);
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        _consumer: &str,
        streams: &[&str],
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        for stream in streams {
            let cursor_key = (stream.to_string(), group.to_string());
            let cursor = *inner.cursors.get(&cursor_key).unwrap_or(&0);
            let entries = inner.streams.get(*stream).cloned().unwrap_or_default();
            let take = entries.iter().skip(cursor).take(count);
            let mut delivered = 0;
            for (id, data) in take {
                out.push(StreamEntry {
                    stream: stream.to_string(),
                    id: id.clone(),
                    data: data.clone(),
                });
                delivered += 1;
            }
            inner.cursors.insert(cursor_key, cursor + delivered);
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BusError> {
        self.inner
            .lock()
            .acks
            .push((stream.to_string(), group.to_string(), id.to_string()));
        Ok(())
    }

    async fn add(&self, stream: &str, data: &Value) -> Result<String, BusError> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = format!("{}-0", inner.next_id);
        inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .push((id.clone(), data.clone()));
        Ok(id)
    }

    async fn read_recent(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, BusError> {
        let inner = self.inner.lock();
        let entries = inner.streams.get(stream).cloned().unwrap_or_default();
        Ok(entries
            .iter()
            .rev()
            .take(count)
            .map(|(id, data)| StreamEntry {
                stream: stream.to_string(),
                id: id.clone(),
                data: data.clone(),
            })
            .collect())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let mut inner = self.inner.lock();
        Self::purge_expired(&mut inner);
        Ok(inner
            .kv
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Value>, BusError> {
        let mut inner = self.inner.lock();
        Self::purge_expired(&mut inner);
        Ok(inner.kv.get(key).map(|(v, _)| v.clone()))
    }

    async fn set_value(
        &self,
        key: &str,
        value: &Value,
        ttl_secs: Option<u64>,
    ) -> Result<(), BusError> {
        let expiry = ttl_secs.map(|s| Instant::now() + Duration::from_secs(s));
        self.inner
            .lock()
            .kv
            .insert(key.to_string(), (value.clone(), expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BusError> {
        self.inner.lock().kv.remove(key);
        Ok(())
    }
}
