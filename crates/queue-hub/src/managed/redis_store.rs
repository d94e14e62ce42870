//! Redis-backed [`MessageClient`].
//!
//! Each managed queue uses three keys:
//! - `messages`: hash of message id to envelope JSON
//! - `visibility`: sorted set of message id scored by the time it becomes visible
//! - `deliveries`: hash of message id to delivery count
//!
//! Fetches run as a Lua script so claiming a batch is atomic.

use super::client::{MessageClient, MessageStats, OutgoingMessage, ReceivedMessage};
use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};
use crate::scheduling::now_ms;
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::Script;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const PUT_SCRIPT: &str = r"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], 0)
return 1
";

const FETCH_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local out = {}
for _, id in ipairs(ids) do
  local body = redis.call('HGET', KEYS[1], id)
  if body then
    local n
    if ARGV[4] == '1' then
      n = tonumber(redis.call('HGET', KEYS[3], id) or '0')
    else
      redis.call('ZADD', KEYS[2], ARGV[3], id)
      n = redis.call('HINCRBY', KEYS[3], id, 1)
    end
    table.insert(out, id)
    table.insert(out, body)
    table.insert(out, tostring(n))
  else
    redis.call('ZREM', KEYS[2], id)
  end
end
return out
";

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> QueueResult<Pool> {
    info!("Creating Redis connection pool for managed queues...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| QueueError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .wait_timeout(Some(config.connect_timeout()))
        .create_timeout(Some(config.connect_timeout()))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| QueueError::Configuration(format!("Failed to create pool: {}", e)))?;

    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Key builder for one managed queue.
#[derive(Debug, Clone)]
pub struct ManagedKeys {
    base: String,
}

impl ManagedKeys {
    pub fn new(prefix: &str, queue_id: &str) -> Self {
        Self {
            base: format!("{}:managed:{}", prefix, queue_id),
        }
    }

    pub fn messages(&self) -> String {
        format!("{}:messages", self.base)
    }

    pub fn visibility(&self) -> String {
        format!("{}:visibility", self.base)
    }

    pub fn deliveries(&self) -> String {
        format!("{}:deliveries", self.base)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    content: String,
    metadata: HashMap<String, String>,
}

/// Builds the receipt handed out for one delivery.
pub fn make_receipt(id: &str, delivery: u32) -> String {
    format!("{}#{}", id, delivery)
}

/// Extracts the message id from a receipt.
pub fn receipt_message_id(receipt: &str) -> QueueResult<&str> {
    match receipt.rsplit_once('#') {
        Some((id, delivery)) if !id.is_empty() && delivery.parse::<u32>().is_ok() => Ok(id),
        _ => Err(QueueError::Transport(format!("Malformed receipt: {}", receipt))),
    }
}

/// Managed queue client storing messages in Redis.
pub struct RedisMessageClient {
    pool: Pool,
    keys: ManagedKeys,
    put_script: Script,
    fetch_script: Script,
}

impl RedisMessageClient {
    pub fn new(pool: Pool, key_prefix: &str, queue_id: &str) -> Self {
        Self {
            pool,
            keys: ManagedKeys::new(key_prefix, queue_id),
            put_script: Script::new(PUT_SCRIPT),
            fetch_script: Script::new(FETCH_SCRIPT),
        }
    }
}

#[async_trait]
impl MessageClient for RedisMessageClient {
    async fn put_message(&self, message: OutgoingMessage) -> QueueResult<()> {
        let envelope = serde_json::to_string(&Envelope {
            content: message.content,
            metadata: message.metadata,
        })?;

        let mut conn = self.pool.get().await?;
        let created: i64 = self
            .put_script
            .key(self.keys.messages())
            .key(self.keys.visibility())
            .key(self.keys.deliveries())
            .arg(&message.id)
            .arg(envelope)
            .arg(now_ms())
            .invoke_async(&mut *conn)
            .await?;

        if created == 0 {
            return Err(QueueError::DuplicateJob(message.id));
        }
        Ok(())
    }

    async fn get_messages(&self, limit: usize, visibility: Duration) -> QueueResult<Vec<ReceivedMessage>> {
        let now = now_ms();
        let peek = visibility.is_zero();
        let hidden_until = now.saturating_add(i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX));

        let mut conn = self.pool.get().await?;
        let flat: Vec<String> = self
            .fetch_script
            .key(self.keys.messages())
            .key(self.keys.visibility())
            .key(self.keys.deliveries())
            .arg(now)
            .arg(limit)
            .arg(hidden_until)
            .arg(if peek { "1" } else { "0" })
            .invoke_async(&mut *conn)
            .await?;

        let mut messages = Vec::with_capacity(flat.len() / 3);
        for chunk in flat.chunks_exact(3) {
            let envelope: Envelope = serde_json::from_str(&chunk[1])?;
            let delivery_count = chunk[2].parse::<u32>().unwrap_or(0);
            messages.push(ReceivedMessage {
                id: chunk[0].clone(),
                content: envelope.content,
                metadata: envelope.metadata,
                receipt: make_receipt(&chunk[0], delivery_count),
                delivery_count,
            });
        }

        debug!(count = messages.len(), peek, "Fetched managed queue messages");
        Ok(messages)
    }

    async fn delete_message(&self, receipt: &str) -> QueueResult<()> {
        let id = receipt_message_id(receipt)?;
        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .hdel(self.keys.messages(), id)
            .ignore()
            .zrem(self.keys.visibility(), id)
            .ignore()
            .hdel(self.keys.deliveries(), id)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn change_visibility(&self, receipt: &str, visible_at: i64) -> QueueResult<()> {
        let id = receipt_message_id(receipt)?;
        let mut conn = self.pool.get().await?;
        let _: i64 = redis::cmd("ZADD")
            .arg(self.keys.visibility())
            .arg("XX")
            .arg(visible_at)
            .arg(id)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn stats(&self) -> QueueResult<MessageStats> {
        let mut conn = self.pool.get().await?;
        let (visible, total): (u64, u64) = redis::pipe()
            .cmd("ZCOUNT")
            .arg(self.keys.visibility())
            .arg("-inf")
            .arg(now_ms())
            .cmd("ZCARD")
            .arg(self.keys.visibility())
            .query_async(&mut *conn)
            .await?;

        Ok(MessageStats {
            visible,
            in_flight: total.saturating_sub(visible),
        })
    }

    async fn purge(&self) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("DEL")
            .arg(self.keys.messages())
            .arg(self.keys.visibility())
            .arg(self.keys.deliveries())
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }
}
