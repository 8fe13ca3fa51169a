use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamRangeReply, StreamReadReply};
use serde_json::Value;
use tracing::debug;

use super::client::{BusClient, BusError, StreamEntry};

/// SCAN page size. Bounded so a large keyspace never stalls the event loop.
const SCAN_PAGE: usize = 100;

/// Redis-streams implementation of the bus contract.
///
/// All payloads live in a single `data` field holding a JSON blob, so entries
/// stay opaque to Redis and schema evolution happens in one place.
#[derive(Clone)]
pub struct RedisBus {
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(io_err)?;
        let conn = ConnectionManager::new(client).await.map_err(io_err)?;
        Ok(Self { conn })
    }

    fn parse_entry(stream: &str, id: String, map: &std::collections::HashMap<String, redis::Value>) -> Result<StreamEntry, BusError> {
        let raw = map
            .get("data")
            .ok_or_else(|| BusError::Payload(format!("entry {id} missing data field")))?;
        let text: String = redis::from_redis_value(raw)
            .map_err(|e| BusError::Payload(format!("entry {id} data not a string: {e}")))?;
        let data: Value = serde_json::from_str(&text)
            .map_err(|e| BusError::Payload(format!("entry {id} data not JSON: {e}")))?;
        Ok(StreamEntry {
            stream: stream.to_string(),
            id,
            data,
        })
    }
}

fn io_err(e: redis::RedisError) -> BusError {
    if e.is_timeout() {
        BusError::Timeout
    } else {
        BusError::Io(e.to_string())
    }
}

#[async_trait]
impl BusClient for RedisBus {
    async fn create_consumer_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            // Re-creating a group is a no-op, not a failure.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS");
        for stream in streams {
            cmd.arg(*stream);
        }
        for _ in streams {
            cmd.arg(">");
        }

        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await.map_err(io_err)?;
        let Some(reply) = reply else {
            // BLOCK elapsed with nothing new.
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                match Self::parse_entry(&key.key, id.id.clone(), &id.map) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        // Undecodable entries still surface so the consumer
                        // can ack them away instead of replaying forever.
                        debug!(stream = %key.key, id = %id.id, error = %e, "undecodable stream entry");
                        entries.push(StreamEntry {
                            stream: key.key.clone(),
                            id: id.id,
                            data: Value::Null,
                        });
                    }
                }
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(io_err)?;
        Ok(())
    }

    async fn add(&self, stream: &str, data: &Value) -> Result<String, BusError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(data)
            .map_err(|e| BusError::Payload(format!("unserializable payload: {e}")))?;
        let id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg("data")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(io_err)?;
        Ok(id)
    }

    async fn read_recent(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, BusError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(io_err)?;

        let mut entries = Vec::with_capacity(reply.ids.len());
        for id in reply.ids {
            if let Ok(entry) = Self::parse_entry(stream, id.id, &id.map) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await
                .map_err(io_err)?;
            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn get_value(&self, key: &str) -> Result<Option<Value>, BusError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(io_err)?;
        match raw {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| BusError::Payload(format!("key {key} holds invalid JSON: {e}"))),
        }
    }

    async fn set_value(
        &self,
        key: &str,
        value: &Value,
        ttl_secs: Option<u64>,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value)
            .map_err(|e| BusError::Payload(format!("unserializable value: {e}")))?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(payload);
        if let Some(ttl) = ttl_secs {
            cmd.arg("EX").arg(ttl);
        }
        cmd.query_async::<_, ()>(&mut conn).await.map_err(io_err)
    }

    async fn delete(&self, key: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(io_err)?;
        Ok(())
    }
}
