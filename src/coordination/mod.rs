pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// Thin facade over a Redis-compatible store. Everything the control plane
/// needs from the shared store goes through this trait so tests and single
/// node deployments can swap in the in-memory backend.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// SET NX with expiry; returns true when the key was created.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Deletes `key` only while it still holds `token`. Atomic on the store
    /// side; a lease that expired and was re-acquired by someone else is left
    /// alone.
    async fn del_if_equals(&self, key: &str, token: &str) -> Result<bool>;
    /// Refreshes the expiry of `key` only while it still holds `token`.
    async fn expire_if_equals(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Increments a counter, arming `ttl` when the counter is created.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64>;
    async fn decr(&self, key: &str) -> Result<i64>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>>;
    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>>;
    async fn zcard(&self, key: &str) -> Result<u64>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    /// Subscribes to a channel; messages are forwarded until the receiver is
    /// dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}
