use std::sync::Arc;

use crate::{coordination::CoordinationStore, Config, Result};

pub mod events;
pub mod globals;
pub mod media_server;
pub mod mutex;
pub mod names;
pub mod recordings;
pub mod rooms;
pub mod scheduler;
pub mod settings;
pub mod users;
pub mod webhooks;

pub struct Services {
    pub globals: globals::Service,
    pub mutex: Arc<mutex::Service>,
    pub scheduler: Arc<scheduler::Service>,
    pub events: events::Service,
    pub names: names::Service,
    pub rooms: rooms::Service,
    pub recordings: recordings::Service,
    pub webhooks: webhooks::Service,
    pub media_server: media_server::Service,
    pub users: users::Service,
    pub settings: settings::Service,
}

impl Services {
    pub fn build<D>(
        db: &'static D,
        store: Arc<dyn CoordinationStore>,
        config: Config,
    ) -> Result<Self>
    where
        D: rooms::Data + recordings::Data + users::Data + settings::Data + 'static,
    {
        let mutex = Arc::new(mutex::Service {
            store: Arc::clone(&store),
        });

        let max_concurrent_name_requests = config.participant_max_concurrent_name_requests;
        let reservation_ttl = config.participant_name_reservation_ttl;

        Ok(Self {
            mutex: Arc::clone(&mutex),
            scheduler: Arc::new(scheduler::Service::build(Arc::clone(&mutex))),
            events: events::Service::build(Arc::clone(&store)),
            names: names::Service {
                store,
                mutex,
                max_concurrent_name_requests,
                reservation_ttl,
            },
            rooms: rooms::Service { db },
            recordings: recordings::Service { db },
            webhooks: webhooks::Service,
            media_server: media_server::Service,
            users: users::Service { db },
            settings: settings::Service { db },

            globals: globals::Service::load(config)?,
        })
    }

    /// Seeds singleton rows, wires the built-in scheduled tasks and starts
    /// the long-running handlers. Must run after the `SERVICES` static is
    /// initialized.
    pub async fn start(&self) -> Result<()> {
        self.settings.bootstrap().await?;
        self.users.bootstrap_admin().await?;

        self.events.start_bridge();
        self.webhooks.start_handler();

        let config = &self.globals.config;
        self.scheduler.register(
            "room_gc",
            scheduler::Service::schedule_every(config.room_gc_interval)?,
            Arc::new(|| Box::pin(async { crate::services().rooms.run_gc().await })),
        );
        self.scheduler.register(
            "recording_lock_gc",
            scheduler::Service::schedule_every(config.recording_lock_gc_interval)?,
            Arc::new(|| Box::pin(async { crate::services().recordings.run_lock_gc().await })),
        );
        self.scheduler.register(
            "recording_stale_cleanup",
            scheduler::Service::schedule_every(config.recording_stale_cleanup_interval)?,
            Arc::new(|| {
                Box::pin(async { crate::services().recordings.run_stale_cleanup().await })
            }),
        );
        self.scheduler.start();

        Ok(())
    }

    /// Drains the scheduler, then flips every long-running task's shutdown
    /// signal. Called from the signal handler.
    pub async fn shutdown(&self) {
        self.globals.shutdown();
        self.scheduler.stop().await;
    }
}
