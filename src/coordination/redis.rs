use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, Script};
use tokio::sync::mpsc;
use tracing::warn;

use super::CoordinationStore;
use crate::Result;

const DEL_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

const PEXPIRE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
  return 0
end
"#;

pub struct Store {
    client: redis::Client,
    manager: ConnectionManager,
    del_if_equals: Script,
    pexpire_if_equals: Script,
}

impl Store {
    pub async fn open(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;

        Ok(Self {
            client,
            manager,
            del_if_equals: Script::new(DEL_IF_EQUALS),
            pexpire_if_equals: Script::new(PEXPIRE_IF_EQUALS),
        })
    }

    fn conn(&self) -> ConnectionManager {
        // ConnectionManager is a cheap handle around a multiplexed connection
        self.manager.clone()
    }
}

#[async_trait]
impl CoordinationStore for Store {
    async fn ping(&self) -> Result<()> {
        let mut con = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut con).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut con = self.conn();
        match ttl {
            Some(ttl) => {
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut con)
                    .await?;
            }
            None => {
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .query_async(&mut con)
                    .await?;
            }
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut con = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut con = self.conn();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut con).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut con = self.conn();
        let _: () = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn del_if_equals(&self, key: &str, token: &str) -> Result<bool> {
        let mut con = self.conn();
        let deleted: i64 = self
            .del_if_equals
            .key(key)
            .arg(token)
            .invoke_async(&mut con)
            .await?;
        Ok(deleted == 1)
    }

    async fn expire_if_equals(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut con = self.conn();
        let refreshed: i64 = self
            .pexpire_if_equals
            .key(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut con)
            .await?;
        Ok(refreshed == 1)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut con = self.conn();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut con).await?;
        if value == 1 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis() as u64)
                .query_async(&mut con)
                .await?;
        }
        Ok(value)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut con = self.conn();
        let value: i64 = redis::cmd("DECR").arg(key).query_async(&mut con).await?;
        Ok(value)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut con = self.conn();
        let _: () = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut con = self.conn();
        let _: () = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut con = self.conn();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut con)
            .await?;
        Ok(members)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut con = self.conn();
        let _: () = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut con = self.conn();
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(removed == 1)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut con = self.conn();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(score)
    }

    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let mut con = self.conn();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut con)
            .await?;
        Ok(entries)
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>> {
        let mut con = self.conn();
        let mut popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(key)
            .query_async(&mut con)
            .await?;
        Ok(popped.pop())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut con = self.conn();
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut con).await?;
        Ok(count)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut con = self.conn();
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (sender, receiver) = mpsc::channel(256);
        let channel = channel.to_owned();

        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Dropping non-utf8 message on {channel}: {e}");
                        continue;
                    }
                };
                if sender.send(payload).await.is_err() {
                    // Receiver is gone, stop forwarding
                    break;
                }
            }
        });

        Ok(receiver)
    }
}
