use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    coordination::CoordinationStore, service::recordings::RecordingStatus, services, utils, Result,
};

/// Pub/sub channel carrying domain events between replicas.
pub const EVENTS_CHANNEL: &str = "ov_meet:events";

/// Domain events emitted by the room and recording managers. The webhook
/// dispatcher translates these into the outbound webhook vocabulary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeetEvent {
    MeetingStarted {
        room_id: String,
        room_name: String,
        timestamp: u64,
    },
    MeetingEnded {
        room_id: String,
        room_name: String,
        timestamp: u64,
    },
    RecordingStatusChanged {
        recording_id: String,
        room_id: String,
        old_status: Option<RecordingStatus>,
        new_status: RecordingStatus,
        timestamp: u64,
    },
}

impl MeetEvent {
    /// Identifier of the entity the event is about, used for webhook dedupe
    /// keys.
    pub fn primary_id(&self) -> &str {
        match self {
            MeetEvent::MeetingStarted { room_id, .. } | MeetEvent::MeetingEnded { room_id, .. } => {
                room_id
            }
            MeetEvent::RecordingStatusChanged { recording_id, .. } => recording_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            MeetEvent::MeetingStarted { timestamp, .. }
            | MeetEvent::MeetingEnded { timestamp, .. }
            | MeetEvent::RecordingStatusChanged { timestamp, .. } => *timestamp,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    origin: String,
    event: MeetEvent,
}

/// Process-local broadcast of domain events, bridged across replicas over the
/// coordination store's pub/sub.
pub struct Service {
    node_id: String,
    sender: broadcast::Sender<MeetEvent>,
    store: Arc<dyn CoordinationStore>,
}

impl Service {
    pub fn build(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            node_id: utils::random_string(16),
            sender: broadcast::channel(512).0,
            store,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeetEvent> {
        self.sender.subscribe()
    }

    /// Delivers locally and fans out to the other replicas.
    #[tracing::instrument(skip(self, event))]
    pub async fn publish(&self, event: MeetEvent) -> Result<()> {
        // Local subscribers first; no subscriber yet is fine
        let _ = self.sender.send(event.clone());

        let wire = serde_json::to_string(&Envelope {
            origin: self.node_id.clone(),
            event,
        })
        .expect("domain events serialize");

        self.store.publish(EVENTS_CHANNEL, &wire).await
    }

    /// Starts the cross-replica bridge. Messages this node published are
    /// skipped so local subscribers see each event exactly once.
    pub fn start_bridge(&self) {
        let store = Arc::clone(&self.store);
        let sender = self.sender.clone();
        let node_id = self.node_id.clone();

        tokio::spawn(async move {
            let mut receiver = match store.subscribe(EVENTS_CHANNEL).await {
                Ok(receiver) => receiver,
                Err(e) => {
                    warn!("Event bridge could not subscribe: {e}");
                    return;
                }
            };

            let mut shutdown = services().globals.shutdown_signal();
            loop {
                tokio::select! {
                    payload = receiver.recv() => {
                        let Some(payload) = payload else { break };
                        let envelope: Envelope = match serde_json::from_str(&payload) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!("Dropping malformed bus message: {e}");
                                continue;
                            }
                        };
                        if envelope.origin == node_id {
                            continue;
                        }
                        debug!("Bridged event from {}", envelope.origin);
                        let _ = sender.send(envelope.event);
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}
