use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use uuid::Uuid;

/// Proof of an active lease on one message. Required to delete, extend or
/// release that message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub message_id: String,
    pub token: String,
}

/// A message handed out by [`MessageQueue::lease`].
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    pub body: String,
    /// Number of times this message has been leased without being deleted,
    /// counting the current lease.
    pub redelivery_count: u32,
    pub lease: Lease,
}

/// At-least-once work queue with visibility-timeout leases.
///
/// A leased message is hidden from other consumers until its lease expires
/// or is released. Only `delete` removes a message for good, so a consumer
/// that crashes mid-processing causes a redelivery rather than a loss.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Append a message body.
    async fn enqueue(&self, body: &str) -> Result<(), QueueError>;

    /// Lease the next visible message, hiding it for `visibility_timeout`.
    async fn lease(&self, visibility_timeout: Duration)
        -> Result<Option<LeasedMessage>, QueueError>;

    /// Permanently remove a leased message. Fails with
    /// [`QueueError::LeaseLost`] once the lease has expired.
    async fn delete(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Push the lease deadline out to `visibility_timeout` from now.
    async fn extend(&self, lease: &Lease, visibility_timeout: Duration) -> Result<(), QueueError>;

    /// Give the message back immediately without deleting it.
    async fn release(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Number of messages held by the queue, leased or not.
    async fn approximate_len(&self) -> Result<u64, QueueError>;

    /// Check connectivity (for health checks).
    async fn ping(&self) -> Result<(), QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Lease on message {0} is no longer held")]
    LeaseLost(String),
}

// KEYS: visible, bodies, counts, leases. ARGV: now_ms, timeout_ms, token.
const LEASE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
    return false
end
local id = ids[1]
redis.call('ZADD', KEYS[1], tonumber(ARGV[1]) + tonumber(ARGV[2]), id)
local count = redis.call('HINCRBY', KEYS[3], id, 1)
redis.call('HSET', KEYS[4], id, ARGV[3])
local body = redis.call('HGET', KEYS[2], id)
return {id, body, count}
"#;

// KEYS: visible, bodies, counts, leases. ARGV: id, token, now_ms.
const DELETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[2] then
    return 0
end
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not deadline or tonumber(deadline) <= tonumber(ARGV[3]) then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return 1
"#;

// KEYS: visible, leases. ARGV: id, token, now_ms, new_deadline_ms.
const RESCHEDULE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
    return 0
end
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not deadline or tonumber(deadline) <= tonumber(ARGV[3]) then
    return 0
end
redis.call('ZADD', KEYS[1], 'XX', ARGV[4], ARGV[1])
return 1
"#;

/// Redis-backed lease queue.
///
/// Layout under the queue name `q`: `q:visible` is a sorted set of message
/// ids scored by the time (ms) they become visible again, `q:bodies`,
/// `q:counts` and `q:leases` are hashes keyed by message id.
pub struct RedisQueue {
    client: redis::Client,
    name: String,
    lease_script: redis::Script,
    delete_script: redis::Script,
    reschedule_script: redis::Script,
}

impl RedisQueue {
    pub fn new(redis_url: &str, name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            name: name.to_string(),
            lease_script: redis::Script::new(LEASE_SCRIPT),
            delete_script: redis::Script::new(DELETE_SCRIPT),
            reschedule_script: redis::Script::new(RESCHEDULE_SCRIPT),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.name, suffix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    async fn reschedule(&self, lease: &Lease, visible_at_ms: i64) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let updated: i32 = self
            .reschedule_script
            .key(self.key("visible"))
            .key(self.key("leases"))
            .arg(&lease.message_id)
            .arg(&lease.token)
            .arg(now_millis())
            .arg(visible_at_ms)
            .invoke_async(&mut conn)
            .await?;

        if updated == 0 {
            return Err(QueueError::LeaseLost(lease.message_id.clone()));
        }
        Ok(())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn enqueue(&self, body: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let id = Uuid::new_v4().to_string();
        redis::pipe()
            .atomic()
            .hset(self.key("bodies"), &id, body)
            .hset(self.key("counts"), &id, 0)
            .zadd(self.key("visible"), &id, now_millis())
            .query_async::<()>(&mut conn)
            .await?;

        tracing::debug!(queue = %self.name, message_id = %id, "Message enqueued");
        Ok(())
    }

    async fn lease(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Option<LeasedMessage>, QueueError> {
        let mut conn = self.connection().await?;
        let token = Uuid::new_v4().to_string();
        let leased: Option<(String, String, u32)> = self
            .lease_script
            .key(self.key("visible"))
            .key(self.key("bodies"))
            .key(self.key("counts"))
            .key(self.key("leases"))
            .arg(now_millis())
            .arg(duration_millis(visibility_timeout))
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        Ok(leased.map(|(message_id, body, redelivery_count)| LeasedMessage {
            body,
            redelivery_count,
            lease: Lease { message_id, token },
        }))
    }

    async fn delete(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let deleted: i32 = self
            .delete_script
            .key(self.key("visible"))
            .key(self.key("bodies"))
            .key(self.key("counts"))
            .key(self.key("leases"))
            .arg(&lease.message_id)
            .arg(&lease.token)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            return Err(QueueError::LeaseLost(lease.message_id.clone()));
        }
        Ok(())
    }

    async fn extend(&self, lease: &Lease, visibility_timeout: Duration) -> Result<(), QueueError> {
        self.reschedule(lease, now_millis() + duration_millis(visibility_timeout))
            .await
    }

    async fn release(&self, lease: &Lease) -> Result<(), QueueError> {
        self.reschedule(lease, now_millis()).await
    }

    async fn approximate_len(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.zcard(self.key("visible")).await?;
        Ok(depth)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct StoredMessage {
    body: String,
    redelivery_count: u32,
    visible_at: Instant,
    lease_token: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
    next_id: u64,
    messages: BTreeMap<u64, StoredMessage>,
}

/// In-process lease queue with the same semantics as [`RedisQueue`].
/// Messages are leased oldest first.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryQueueInner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire every outstanding lease now, as if its timeout had elapsed.
    pub fn expire_leases(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        for message in inner.messages.values_mut() {
            if message.visible_at > now {
                message.visible_at = now;
            }
        }
    }

    /// Bodies of all messages still held, leased or not.
    pub fn bodies(&self) -> Vec<String> {
        self.lock()
            .messages
            .values()
            .map(|m| m.body.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryQueueInner> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_active_lease<T>(
        &self,
        lease: &Lease,
        f: impl FnOnce(&mut MemoryQueueInner, u64) -> T,
    ) -> Result<T, QueueError> {
        let lost = || QueueError::LeaseLost(lease.message_id.clone());
        let id: u64 = lease.message_id.parse().map_err(|_| lost())?;
        let mut inner = self.lock();
        let message = inner.messages.get(&id).ok_or_else(lost)?;
        let active = message.lease_token.as_deref() == Some(lease.token.as_str())
            && message.visible_at > Instant::now();
        if !active {
            return Err(lost());
        }
        Ok(f(&mut inner, id))
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn enqueue(&self, body: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.messages.insert(
            id,
            StoredMessage {
                body: body.to_string(),
                redelivery_count: 0,
                visible_at: Instant::now(),
                lease_token: None,
            },
        );
        Ok(())
    }

    async fn lease(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Option<LeasedMessage>, QueueError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let next = inner
            .messages
            .iter_mut()
            .find(|(_, m)| m.visible_at <= now);

        Ok(next.map(|(id, message)| {
            let token = Uuid::new_v4().to_string();
            message.redelivery_count += 1;
            message.visible_at = now + visibility_timeout;
            message.lease_token = Some(token.clone());
            LeasedMessage {
                body: message.body.clone(),
                redelivery_count: message.redelivery_count,
                lease: Lease {
                    message_id: id.to_string(),
                    token,
                },
            }
        }))
    }

    async fn delete(&self, lease: &Lease) -> Result<(), QueueError> {
        self.with_active_lease(lease, |inner, id| {
            inner.messages.remove(&id);
        })
    }

    async fn extend(&self, lease: &Lease, visibility_timeout: Duration) -> Result<(), QueueError> {
        self.with_active_lease(lease, |inner, id| {
            if let Some(message) = inner.messages.get_mut(&id) {
                message.visible_at = Instant::now() + visibility_timeout;
            }
        })
    }

    async fn release(&self, lease: &Lease) -> Result<(), QueueError> {
        self.with_active_lease(lease, |inner, id| {
            if let Some(message) = inner.messages.get_mut(&id) {
                message.visible_at = Instant::now();
            }
        })
    }

    async fn approximate_len(&self) -> Result<u64, QueueError> {
        Ok(self.lock().messages.len() as u64)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
