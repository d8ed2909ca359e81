use std::{
    str::FromStr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use chrono::Utc;
use cron::Schedule;
use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{service::mutex, Error, Result};

/// Ticks shorter than this never shrink the lease below the floor, so a tick
/// on one replica still fences the same tick on a replica with skewed clocks.
const DEFAULT_MIN_LOCK_TTL: Duration = Duration::from_secs(59);
/// Subtracted from the inferred interval so the lease is free again slightly
/// before the next tick.
const TICK_EPSILON: Duration = Duration::from_secs(1);

pub type JobHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct Job {
    pub name: String,
    pub schedule: Schedule,
    pub min_lock_ttl: Duration,
    pub handler: JobHandler,
}

impl Job {
    /// Lease that covers one tick window: the larger of the floor and the
    /// schedule's own period, minus a margin.
    fn lock_ttl(&self) -> Duration {
        let mut upcoming = self.schedule.upcoming(Utc);
        let inferred = match (upcoming.next(), upcoming.next()) {
            (Some(a), Some(b)) => (b - a).to_std().unwrap_or(self.min_lock_ttl),
            _ => self.min_lock_ttl,
        };
        self.min_lock_ttl
            .max(inferred.saturating_sub(TICK_EPSILON))
    }
}

/// Cron scheduler with cross-replica exclusivity: each tick is guarded by a
/// `scheduled_task:{name}` lease, so exactly one replica in the fleet runs a
/// given tick.
pub struct Service {
    mutex: Arc<mutex::Service>,
    jobs: StdMutex<Vec<Arc<Job>>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl Service {
    pub fn build(mutex: Arc<mutex::Service>) -> Self {
        Self {
            mutex,
            jobs: StdMutex::new(Vec::new()),
            handles: StdMutex::new(Vec::new()),
        }
    }

    pub fn register(&self, name: &str, schedule: Schedule, handler: JobHandler) {
        self.register_with_ttl(name, schedule, DEFAULT_MIN_LOCK_TTL, handler);
    }

    pub fn register_with_ttl(
        &self,
        name: &str,
        schedule: Schedule,
        min_lock_ttl: Duration,
        handler: JobHandler,
    ) {
        self.jobs.lock().unwrap().push(Arc::new(Job {
            name: name.to_owned(),
            schedule,
            min_lock_ttl,
            handler,
        }));
    }

    /// Builds a schedule that fires every `interval`, aligned to the top of
    /// the hour/minute.
    pub fn schedule_every(interval: Duration) -> Result<Schedule> {
        let secs = interval.as_secs().max(1);
        let expression = if secs % 3600 == 0 {
            format!("0 0 */{} * * *", (secs / 3600).min(23).max(1))
        } else if secs % 60 == 0 {
            format!("0 */{} * * * *", (secs / 60).min(59).max(1))
        } else {
            format!("*/{} * * * * *", secs.min(59))
        };
        Schedule::from_str(&expression)
            .map_err(|_| Error::bad_config("Could not build a cron schedule from interval"))
    }

    /// One tick of one job: try to win the fleet-wide lease and run the
    /// handler when we do. The lease is deliberately not released; it expires
    /// right before the next tick so a lagging replica cannot re-fire it.
    pub async fn tick_job(&self, job: &Job) -> Result<bool> {
        let resource = format!("scheduled_task:{}", job.name);

        let lock = match self.mutex.acquire(&resource, job.lock_ttl()).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!("Tick of {} taken by another replica", job.name);
                return Ok(false);
            }
            Err(e) => {
                // Never assume the lock was granted
                warn!("Skipping tick of {}: coordination store failed: {e}", job.name);
                return Err(e);
            }
        };

        debug!("Running scheduled task {} (lease {:?})", job.name, lock.ttl());
        if let Err(e) = (job.handler)().await {
            error!("Scheduled task {} failed: {e}", job.name);
        }

        Ok(true)
    }

    /// Starts one loop per registered job. New registrations after this call
    /// are not picked up.
    pub fn start(self: &Arc<Self>) {
        let jobs = self.jobs.lock().unwrap().clone();
        info!("Starting scheduler with {} jobs", jobs.len());

        for job in jobs {
            let scheduler = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let mut shutdown = crate::services().globals.shutdown_signal();
                loop {
                    let Some(next) = job.schedule.upcoming(Utc).next() else {
                        warn!("Schedule of {} has no upcoming ticks, stopping", job.name);
                        break;
                    };
                    let wait = (next - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::from_secs(0));

                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.recv() => break,
                    }

                    if crate::services().globals.is_shutting_down() {
                        break;
                    }

                    let _ = scheduler.tick_job(&job).await;
                }
            });
            self.handles.lock().unwrap().push(handle);
        }
    }

    /// Completes any in-flight handler, then stops. New ticks are refused by
    /// the shutdown flag checked in each loop.
    pub async fn stop(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        info!("Scheduler drained");
    }

    /// Runs a job handler immediately, bypassing the schedule but not the
    /// fleet lease. Used by admin tooling and tests.
    pub async fn run_job_now(&self, name: &str) -> Result<bool> {
        let job = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.name == name)
            .cloned()
            .ok_or(Error::BadRequest(
                crate::ErrorKind::NotFound,
                "No such scheduled task",
            ))?;
        self.tick_job(&job).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::coordination::memory;

    fn fleet(replicas: usize) -> Vec<Arc<Service>> {
        let store: Arc<dyn crate::coordination::CoordinationStore> =
            Arc::new(memory::Store::new());
        (0..replicas)
            .map(|_| {
                Arc::new(Service::build(Arc::new(mutex::Service {
                    store: Arc::clone(&store),
                })))
            })
            .collect()
    }

    fn counting_job(name: &str, counter: Arc<AtomicU32>, min_lock_ttl: Duration) -> Job {
        Job {
            name: name.to_owned(),
            schedule: Schedule::from_str("0 0 * * * *").unwrap(),
            min_lock_ttl,
            handler: Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        }
    }

    #[tokio::test]
    async fn only_one_replica_runs_each_tick() {
        let replicas = fleet(3);
        let counter = Arc::new(AtomicU32::new(0));

        // 24 simulated ticks; the lease outlives the whole test so each tick
        // key is contended exactly once per round.
        for round in 0..24 {
            let job_name = format!("room_gc_{round}");
            let mut ran = 0;
            for replica in &replicas {
                let job = counting_job(&job_name, counter.clone(), Duration::from_secs(60));
                if replica.tick_job(&job).await.unwrap() {
                    ran += 1;
                }
            }
            assert_eq!(ran, 1, "tick {round} ran on more than one replica");
        }

        assert_eq!(counter.load(Ordering::SeqCst), 24);
    }

    #[tokio::test]
    async fn lease_expiry_allows_next_tick() {
        let replicas = fleet(1);
        let counter = Arc::new(AtomicU32::new(0));
        let job = counting_job("short", counter.clone(), Duration::from_millis(20));

        assert!(replicas[0].tick_job(&job).await.unwrap());
        // Within the lease window the same tick cannot re-fire
        assert!(!replicas[0].tick_job(&job).await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(replicas[0].tick_job(&job).await.unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn interval_schedules_parse() {
        for interval in [
            Duration::from_secs(60 * 60),
            Duration::from_secs(30 * 60),
            Duration::from_secs(15 * 60),
            Duration::from_secs(45),
        ] {
            let schedule = Service::schedule_every(interval).unwrap();
            assert!(schedule.upcoming(Utc).next().is_some());
        }
    }

    #[test]
    fn lock_ttl_honours_floor() {
        let job = Job {
            name: "dense".to_owned(),
            schedule: Schedule::from_str("*/2 * * * * *").unwrap(),
            min_lock_ttl: DEFAULT_MIN_LOCK_TTL,
            handler: Arc::new(|| Box::pin(async { Ok(()) })),
        };
        // A 2s schedule must not shrink the lease below the floor
        assert_eq!(job.lock_ttl(), DEFAULT_MIN_LOCK_TTL);
    }
}
