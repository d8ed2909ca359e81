use std::{collections::HashSet, sync::Arc, time::Duration};

use tracing::warn;

use crate::{
    coordination::CoordinationStore, service::mutex, utils, Error, ErrorKind, Result,
};

/// ZSET of display names currently held in a room, scored by expiration
/// epoch millis.
fn participants_key(room_id: &str) -> String {
    format!("ov_meet:room_participants:{room_id}")
}

/// ZSET of numeric suffixes freed for a base name, scored by the suffix
/// itself so the lowest one is reused first.
fn pool_key(room_id: &str, base: &str) -> String {
    format!("ov_meet:participant_pool:{room_id}:{base}")
}

/// Gauge of in-flight reservation requests per base name.
fn requests_key(room_id: &str, base: &str) -> String {
    format!("ov_meet:name_requests:{room_id}:{base}")
}

const ALLOC_LOCK_TTL: Duration = Duration::from_secs(5);
const GAUGE_TTL: Duration = Duration::from_secs(60);
const MAX_NAME_LENGTH: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub assigned_name: String,
    pub reservation_token: String,
}

pub struct Service {
    pub store: Arc<dyn CoordinationStore>,
    pub mutex: Arc<mutex::Service>,
    pub max_concurrent_name_requests: u32,
    pub reservation_ttl: Duration,
}

impl Service {
    /// Trims, collapses whitespace and bounds the requested name.
    pub fn normalize(requested: &str) -> String {
        let collapsed = requested.split_whitespace().collect::<Vec<_>>().join(" ");
        let bounded: String = collapsed.chars().take(MAX_NAME_LENGTH).collect();
        let bounded = bounded.trim_end().to_owned();
        if bounded.is_empty() {
            "Participant".to_owned()
        } else {
            bounded
        }
    }

    fn format_with_suffix(base: &str, suffix: u32) -> String {
        if suffix == 0 {
            base.to_owned()
        } else {
            format!("{base} ({suffix})")
        }
    }

    /// Splits `"Bob (3)"` into `("Bob", 3)`; a bare name has suffix 0.
    fn split_suffix(name: &str) -> (&str, u32) {
        if let Some(stripped) = name.strip_suffix(')') {
            if let Some((base, digits)) = stripped.rsplit_once(" (") {
                if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                    if let Ok(n) = digits.parse() {
                        return (base, n);
                    }
                }
            }
        }
        (name, 0)
    }

    /// Allocates a unique display name for a participant joining `room_id`.
    #[tracing::instrument(skip(self))]
    pub async fn reserve(&self, room_id: &str, requested_name: &str) -> Result<Reservation> {
        let base = Self::normalize(requested_name);
        let gauge = requests_key(room_id, &base);

        let in_flight = self.store.incr(&gauge, GAUGE_TTL).await?;
        if in_flight > self.max_concurrent_name_requests as i64 {
            self.store.decr(&gauge).await?;
            return Err(Error::BadRequest(
                ErrorKind::Busy,
                "Too many concurrent reservation requests for this name",
            ));
        }

        let result = self.reserve_under_lock(room_id, &base).await;

        if let Err(e) = self.store.decr(&gauge).await {
            warn!("Could not settle reservation gauge for {room_id}: {e}");
        }

        let assigned_name = result?;
        Ok(Reservation {
            assigned_name,
            reservation_token: utils::random_string(24),
        })
    }

    async fn reserve_under_lock(&self, room_id: &str, base: &str) -> Result<String> {
        let Some(lock) = self
            .mutex
            .acquire_with_retry(
                &format!("name_alloc:{room_id}"),
                ALLOC_LOCK_TTL,
                20,
                Duration::from_millis(25),
            )
            .await?
        else {
            return Err(Error::BadRequest(
                ErrorKind::Busy,
                "Name allocation for this room is contended",
            ));
        };

        let result = self.allocate(room_id, base).await;

        if let Err(e) = self.mutex.release(&lock).await {
            warn!("Could not release name_alloc lock for {room_id}: {e}");
        }

        result
    }

    async fn allocate(&self, room_id: &str, base: &str) -> Result<String> {
        let key = participants_key(room_id);
        let now = utils::millis_since_unix_epoch() as f64;

        let mut active = HashSet::new();
        for (name, expires_at) in self.store.zrange_withscores(&key).await? {
            if expires_at <= now {
                // Reservation outlived its TTL without a release
                self.store.zrem(&key, &name).await?;
                continue;
            }
            active.insert(name);
        }

        let assigned = if !active.contains(base) {
            base.to_owned()
        } else {
            self.next_free_suffix(room_id, base, &active).await?
        };

        let expires_at = now + self.reservation_ttl.as_millis() as f64;
        self.store.zadd(&key, &assigned, expires_at).await?;
        self.store.expire(&key, self.reservation_ttl).await?;

        Ok(assigned)
    }

    async fn next_free_suffix(
        &self,
        room_id: &str,
        base: &str,
        active: &HashSet<String>,
    ) -> Result<String> {
        let pool = pool_key(room_id, base);

        // Recycled suffixes first, lowest wins; entries that somehow became
        // active again are discarded.
        while let Some((member, _)) = self.store.zpop_min(&pool).await? {
            let Ok(suffix) = member.parse::<u32>() else {
                continue;
            };
            let candidate = Self::format_with_suffix(base, suffix);
            if !active.contains(&candidate) {
                return Ok(candidate);
            }
        }

        // Pool exhausted: go one past the high-water mark.
        let high_water = active
            .iter()
            .filter_map(|name| {
                let (b, n) = Self::split_suffix(name);
                (b == base).then_some(n)
            })
            .max()
            .unwrap_or(0);

        Ok(Self::format_with_suffix(base, high_water + 1))
    }

    /// Frees a reservation. The numeric suffix returns to the pool so it is
    /// handed out again before new high-water values.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, room_id: &str, assigned_name: &str) -> Result<()> {
        let key = participants_key(room_id);
        if !self.store.zrem(&key, assigned_name).await? {
            return Ok(());
        }

        let (base, suffix) = Self::split_suffix(assigned_name);
        self.store
            .zadd(&pool_key(room_id, base), &suffix.to_string(), suffix as f64)
            .await?;
        self.store
            .expire(&pool_key(room_id, base), self.reservation_ttl)
            .await?;

        Ok(())
    }

    pub async fn active_names(&self, room_id: &str) -> Result<Vec<String>> {
        let now = utils::millis_since_unix_epoch() as f64;
        Ok(self
            .store
            .zrange_withscores(&participants_key(room_id))
            .await?
            .into_iter()
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(name, _)| name)
            .collect())
    }

    /// Drops every reservation and suffix pool of a room. Called when the
    /// meeting ends or the room is deleted.
    #[tracing::instrument(skip(self))]
    pub async fn release_all(&self, room_id: &str) -> Result<()> {
        let key = participants_key(room_id);
        let mut bases = HashSet::new();
        for (name, _) in self.store.zrange_withscores(&key).await? {
            bases.insert(Self::split_suffix(&name).0.to_owned());
        }
        for base in bases {
            self.store.del(&pool_key(room_id, &base)).await?;
        }
        self.store.del(&key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory;

    fn service() -> Arc<Service> {
        let store: Arc<dyn CoordinationStore> = Arc::new(memory::Store::new());
        Arc::new(Service {
            store: store.clone(),
            mutex: Arc::new(mutex::Service { store }),
            max_concurrent_name_requests: 20,
            reservation_ttl: Duration::from_secs(60),
        })
    }

    #[test]
    fn normalization_is_bounded_and_collapsed() {
        assert_eq!(Service::normalize("  Bob   Smith "), "Bob Smith");
        assert_eq!(Service::normalize(""), "Participant");
        assert_eq!(Service::normalize("   "), "Participant");
        assert_eq!(Service::normalize(&"x".repeat(80)).len(), 50);
    }

    #[test]
    fn suffix_splitting() {
        assert_eq!(Service::split_suffix("Bob"), ("Bob", 0));
        assert_eq!(Service::split_suffix("Bob (3)"), ("Bob", 3));
        assert_eq!(Service::split_suffix("Bob (x)"), ("Bob (x)", 0));
        assert_eq!(Service::split_suffix("Bob ()"), ("Bob ()", 0));
    }

    #[tokio::test]
    async fn verbatim_then_suffixed() {
        let names = service();
        let first = names.reserve("r1", "Bob").await.unwrap();
        let second = names.reserve("r1", "Bob").await.unwrap();
        let third = names.reserve("r1", "Bob").await.unwrap();

        assert_eq!(first.assigned_name, "Bob");
        assert_eq!(second.assigned_name, "Bob (1)");
        assert_eq!(third.assigned_name, "Bob (2)");
    }

    #[tokio::test]
    async fn released_suffix_is_recycled_lowest_first() {
        let names = service();
        for _ in 0..4 {
            names.reserve("r1", "Bob").await.unwrap();
        }
        names.release("r1", "Bob (1)").await.unwrap();
        names.release("r1", "Bob (3)").await.unwrap();

        assert_eq!(names.reserve("r1", "Bob").await.unwrap().assigned_name, "Bob (1)");
        assert_eq!(names.reserve("r1", "Bob").await.unwrap().assigned_name, "Bob (3)");
        assert_eq!(names.reserve("r1", "Bob").await.unwrap().assigned_name, "Bob (4)");
    }

    #[tokio::test]
    async fn releasing_bare_name_makes_it_available_again() {
        let names = service();
        names.reserve("r1", "Bob").await.unwrap();
        names.reserve("r1", "Bob").await.unwrap(); // Bob (1)
        names.release("r1", "Bob").await.unwrap();

        assert_eq!(names.reserve("r1", "Bob").await.unwrap().assigned_name, "Bob");
    }

    #[tokio::test]
    async fn concurrent_reservations_stay_unique() {
        let names = service();
        let mut tasks = Vec::new();
        for _ in 0..12 {
            let names = Arc::clone(&names);
            tasks.push(tokio::spawn(async move {
                names.reserve("busy-room", "Carol").await.unwrap()
            }));
        }

        let mut assigned = HashSet::new();
        for task in tasks {
            assert!(assigned.insert(task.await.unwrap().assigned_name));
        }
        assert_eq!(assigned.len(), 12);
        assert!(assigned.contains("Carol"));
    }

    #[tokio::test]
    async fn rooms_do_not_share_names() {
        let names = service();
        assert_eq!(names.reserve("a", "Dave").await.unwrap().assigned_name, "Dave");
        assert_eq!(names.reserve("b", "Dave").await.unwrap().assigned_name, "Dave");
    }

    #[tokio::test]
    async fn contention_cap_returns_retryable_busy() {
        let names = service();
        // Saturate the in-flight gauge as if 20 requests were mid-allocation
        for _ in 0..20 {
            names
                .store
                .incr(&requests_key("r1", "Eve"), GAUGE_TTL)
                .await
                .unwrap();
        }

        let error = names.reserve("r1", "Eve").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Busy);
        assert!(error.kind().is_retryable());
    }

    #[tokio::test]
    async fn expired_reservations_are_reaped_on_allocation() {
        let store: Arc<dyn CoordinationStore> = Arc::new(memory::Store::new());
        let names = Service {
            store: store.clone(),
            mutex: Arc::new(mutex::Service {
                store: store.clone(),
            }),
            max_concurrent_name_requests: 20,
            reservation_ttl: Duration::from_secs(60),
        };

        // A reservation whose score is already in the past
        store
            .zadd(&participants_key("r1"), "Mallory", 1.0)
            .await
            .unwrap();

        let reservation = names.reserve("r1", "Mallory").await.unwrap();
        assert_eq!(reservation.assigned_name, "Mallory");
    }

    #[tokio::test]
    async fn release_all_clears_room_state() {
        let names = service();
        names.reserve("r1", "Bob").await.unwrap();
        names.reserve("r1", "Bob").await.unwrap();
        names.release("r1", "Bob (1)").await.unwrap();

        names.release_all("r1").await.unwrap();
        assert!(names.active_names("r1").await.unwrap().is_empty());

        // The pool was dropped too, so allocation starts from scratch
        assert_eq!(names.reserve("r1", "Bob").await.unwrap().assigned_name, "Bob");
    }
}
