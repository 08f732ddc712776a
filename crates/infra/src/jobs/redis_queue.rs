//! Redis-backed job queue (durable, at-least-once delivery).
//!
//! ## Keys
//!
//! - `{prefix}:ready`: list of messages ready for delivery
//! - `{prefix}:delayed`: sorted set of messages scored by due time (ms)
//! - `{prefix}:inflight`: sorted set of receipts scored by visibility deadline (ms)
//! - `{prefix}:receipts`: hash receipt → message
//!
//! A message is `"{job_id}:{delivery_count}"`. Promotion of due / expired
//! messages and the pop into in-flight happen in one Lua script, so two
//! workers never receive the same delivery. Extending a lease only touches a
//! receipt whose deadline has not passed yet.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, instrument};
use uuid::Uuid;

use forgebatch_core::BatchJobId;

use super::queue::{Delivery, JobQueue, QueueError};

const DEFAULT_PREFIX: &str = "forgebatch:jobs";

/// Longest single sleep while waiting for a message.
const POLL_STEP: Duration = Duration::from_millis(100);

const RECEIVE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, m in ipairs(due) do
  redis.call('ZREM', KEYS[2], m)
  redis.call('LPUSH', KEYS[1], m)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, r in ipairs(expired) do
  local m = redis.call('HGET', KEYS[4], r)
  redis.call('ZREM', KEYS[3], r)
  redis.call('HDEL', KEYS[4], r)
  if m then redis.call('LPUSH', KEYS[1], m) end
end
local m = redis.call('RPOP', KEYS[1])
if not m then return false end
local sep = string.find(m, ':', 1, true)
local delivered = string.sub(m, 1, sep - 1) .. ':' .. (tonumber(string.sub(m, sep + 1)) + 1)
redis.call('ZADD', KEYS[3], tonumber(ARGV[1]) + tonumber(ARGV[2]), ARGV[3])
redis.call('HSET', KEYS[4], ARGV[3], delivered)
return delivered
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('HDEL', KEYS[2], ARGV[1]) == 1 then
  redis.call('ZREM', KEYS[1], ARGV[1])
  return 1
end
return 0
"#;

const EXTEND_SCRIPT: &str = r#"
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[1])
if deadline and tonumber(deadline) > tonumber(ARGV[2]) and redis.call('HEXISTS', KEYS[2], ARGV[1]) == 1 then
  redis.call('ZADD', KEYS[1], 'XX', tonumber(ARGV[2]) + tonumber(ARGV[3]), ARGV[1])
  return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisJobQueue {
    conn: MultiplexedConnection,
    keys: Arc<Keys>,
    visibility_timeout: Duration,
    receive_script: Arc<Script>,
    ack_script: Arc<Script>,
    extend_script: Arc<Script>,
}

#[derive(Debug)]
struct Keys {
    ready: String,
    delayed: String,
    inflight: String,
    receipts: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            ready: format!("{prefix}:ready"),
            delayed: format!("{prefix}:delayed"),
            inflight: format!("{prefix}:inflight"),
            receipts: format!("{prefix}:receipts"),
        }
    }
}

impl RedisJobQueue {
    /// Connect with the default key prefix.
    pub async fn connect(redis_url: &str, visibility_timeout: Duration) -> Result<Self, QueueError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX, visibility_timeout).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;

        Ok(Self {
            conn,
            keys: Arc::new(Keys::new(prefix)),
            visibility_timeout,
            receive_script: Arc::new(Script::new(RECEIVE_SCRIPT)),
            ack_script: Arc::new(Script::new(ACK_SCRIPT)),
            extend_script: Arc::new(Script::new(EXTEND_SCRIPT)),
        })
    }

    async fn try_receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let receipt = Uuid::now_v7().to_string();
        let message: Option<String> = self
            .receive_script
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&self.keys.inflight)
            .key(&self.keys.receipts)
            .arg(Utc::now().timestamp_millis())
            .arg(self.visibility_timeout.as_millis() as i64)
            .arg(&receipt)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match message {
            None => Ok(None),
            Some(m) => {
                let (job_id, delivery_count) = decode_message(&m)?;
                Ok(Some(Delivery {
                    job_id,
                    receipt,
                    delivery_count,
                }))
            }
        }
    }
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("keys", &self.keys)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish()
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip_all, fields(job_id = %job_id, delay_ms = delay.as_millis() as u64))]
    async fn enqueue(&self, job_id: BatchJobId, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let message = encode_message(job_id, 0);

        if delay.is_zero() {
            let _: i64 = conn.lpush(&self.keys.ready, message).await.map_err(unavailable)?;
        } else {
            let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let _: i64 = conn
                .zadd(&self.keys.delayed, message, due)
                .await
                .map_err(unavailable)?;
        }
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_receive().await? {
                debug!(job_id = %delivery.job_id, delivery_count = delivery.delivery_count, "received");
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .ack_script
            .key(&self.keys.inflight)
            .key(&self.keys.receipts)
            .arg(&delivery.receipt)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if removed == 1 {
            Ok(())
        } else {
            Err(QueueError::UnknownReceipt(delivery.receipt.clone()))
        }
    }

    async fn extend_visibility(&self, delivery: &Delivery, extension: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_script
            .key(&self.keys.inflight)
            .key(&self.keys.receipts)
            .arg(&delivery.receipt)
            .arg(Utc::now().timestamp_millis())
            .arg(extension.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if extended == 1 {
            Ok(())
        } else {
            Err(QueueError::UnknownReceipt(delivery.receipt.clone()))
        }
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}

fn unavailable(e: redis::RedisError) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

fn encode_message(job_id: BatchJobId, delivery_count: u32) -> String {
    format!("{job_id}:{delivery_count}")
}

fn decode_message(message: &str) -> Result<(BatchJobId, u32), QueueError> {
    let malformed = || QueueError::Unavailable(format!("malformed queue message: {message}"));
    let (id, count) = message.split_once(':').ok_or_else(malformed)?;
    let job_id = id.parse::<BatchJobId>().map_err(|_| malformed())?;
    let delivery_count = count.parse::<u32>().map_err(|_| malformed())?;
    Ok((job_id, delivery_count))
}
