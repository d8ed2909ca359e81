use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::CoordinationStore;
use crate::Result;

struct Expiring<T> {
    value: T,
    deadline: Option<Instant>,
}

impl<T> Expiring<T> {
    fn alive(&self) -> bool {
        self.deadline.map_or(true, |d| d > Instant::now())
    }
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Expiring<String>>,
    counters: HashMap<String, Expiring<i64>>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, Expiring<BTreeMap<String, f64>>>,
}

impl Inner {
    fn purge(&mut self, key: &str) {
        if self.kv.get(key).is_some_and(|e| !e.alive()) {
            self.kv.remove(key);
        }
        if self.counters.get(key).is_some_and(|e| !e.alive()) {
            self.counters.remove(key);
        }
        if self.zsets.get(key).is_some_and(|e| !e.alive()) {
            self.zsets.remove(key);
        }
    }
}

/// Single-process stand-in for the shared store. Used by tests and by
/// development deployments that run exactly one replica.
#[derive(Default)]
pub struct Store {
    inner: Mutex<Inner>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for Store {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        Ok(inner.kv.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.kv.insert(
            key.to_owned(),
            Expiring {
                value: value.to_owned(),
                deadline: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_owned(),
            Expiring {
                value: value.to_owned(),
                deadline: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.kv.remove(key);
        inner.counters.remove(key);
        inner.sets.remove(key);
        inner.zsets.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = Some(Instant::now() + ttl);
        if let Some(e) = inner.kv.get_mut(key) {
            e.deadline = deadline;
        }
        if let Some(e) = inner.counters.get_mut(key) {
            e.deadline = deadline;
        }
        if let Some(e) = inner.zsets.get_mut(key) {
            e.deadline = deadline;
        }
        Ok(())
    }

    async fn del_if_equals(&self, key: &str, token: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        if inner.kv.get(key).is_some_and(|e| e.value == token) {
            inner.kv.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire_if_equals(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        match inner.kv.get_mut(key) {
            Some(e) if e.value == token => {
                e.deadline = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        let entry = inner.counters.entry(key.to_owned()).or_insert(Expiring {
            value: 0,
            deadline: Some(Instant::now() + ttl),
        });
        entry.value += 1;
        Ok(entry.value)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        let entry = inner.counters.entry(key.to_owned()).or_insert(Expiring {
            value: 0,
            deadline: None,
        });
        entry.value -= 1;
        Ok(entry.value)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        inner
            .zsets
            .entry(key.to_owned())
            .or_insert(Expiring {
                value: BTreeMap::new(),
                deadline: None,
            })
            .value
            .insert(member.to_owned(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        Ok(inner
            .zsets
            .get_mut(key)
            .is_some_and(|z| z.value.remove(member).is_some()))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        Ok(inner.zsets.get(key).and_then(|z| z.value.get(member).copied()))
    }

    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        let mut entries: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|z| z.value.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        Ok(entries)
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(None);
        };
        let lowest = zset
            .value
            .iter()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap().then_with(|| a.0.cmp(b.0)))
            .map(|(m, s)| (m.clone(), *s));
        if let Some((member, _)) = &lowest {
            zset.value.remove(member);
        }
        Ok(lowest)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        Ok(inner.zsets.get(key).map(|z| z.value.len() as u64).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let sender = {
            let channels = self.channels.lock().unwrap();
            channels.get(channel).cloned()
        };
        if let Some(sender) = sender {
            // No subscribers is fine
            let _ = sender.send(payload.to_owned());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut broadcast_receiver = {
            let mut channels = self.channels.lock().unwrap();
            channels
                .entry(channel.to_owned())
                .or_insert_with(|| broadcast::channel(256).0)
                .subscribe()
        };

        let (sender, receiver) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Ok(payload) = broadcast_receiver.recv().await {
                if sender.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_second_writer_loses() {
        let store = Store::new();
        assert!(store
            .set_nx("k", "a", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!store
            .set_nx("k", "b", Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn del_if_equals_checks_token() {
        let store = Store::new();
        store
            .set_nx("k", "token", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!store.del_if_equals("k", "other").await.unwrap());
        assert!(store.del_if_equals("k", "token").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_keys_vanish() {
        let store = Store::new();
        store
            .set_nx("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store
            .set_nx("k", "v2", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn zpop_min_returns_lowest_score() {
        let store = Store::new();
        store.zadd("z", "b", 2.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "c", 3.0).await.unwrap();
        assert_eq!(
            store.zpop_min("z").await.unwrap(),
            Some(("a".to_owned(), 1.0))
        );
        assert_eq!(store.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscriber() {
        let store = Store::new();
        let mut receiver = store.subscribe("ch").await.unwrap();
        store.publish("ch", "hello").await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap();
        assert_eq!(message.as_deref(), Some("hello"));
    }
}
