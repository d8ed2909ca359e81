use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::{
    service::events::MeetEvent, service::recordings::RecordingStatus, services, utils, Error,
    Result,
};

type HmacSha256 = Hmac<Sha256>;

/// Events a customer endpoint can receive.
const EVENT_MEETING_STARTED: &str = "meetingStarted";
const EVENT_MEETING_ENDED: &str = "meetingEnded";
const EVENT_RECORDING_STARTED: &str = "recordingStarted";
const EVENT_RECORDING_UPDATED: &str = "recordingUpdated";
const EVENT_RECORDING_ENDED: &str = "recordingEnded";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundPayload<'a> {
    creation_date: u64,
    event: &'a str,
    data: serde_json::Value,
}

/// Delivers domain events to the configured customer endpoint, at least
/// once. A per-event lease deduplicates across replicas; within a replica the
/// retry loop runs under the same lease so retries are never deduped away.
pub struct Service;

impl Service {
    /// Maps a bus event onto the outbound vocabulary. Internal-only events
    /// return None.
    fn outbound(event: &MeetEvent) -> Option<(&'static str, serde_json::Value)> {
        match event {
            MeetEvent::MeetingStarted {
                room_id, room_name, ..
            } => Some((
                EVENT_MEETING_STARTED,
                serde_json::json!({ "roomId": room_id, "roomName": room_name }),
            )),
            MeetEvent::MeetingEnded {
                room_id, room_name, ..
            } => Some((
                EVENT_MEETING_ENDED,
                serde_json::json!({ "roomId": room_id, "roomName": room_name }),
            )),
            MeetEvent::RecordingStatusChanged {
                recording_id,
                room_id,
                old_status,
                new_status,
                ..
            } => {
                let data = serde_json::json!({
                    "recordingId": recording_id,
                    "roomId": room_id,
                    "status": new_status,
                });
                let name = if old_status.is_none() && *new_status == RecordingStatus::Starting {
                    EVENT_RECORDING_STARTED
                } else if new_status.is_terminal() {
                    EVENT_RECORDING_ENDED
                } else {
                    EVENT_RECORDING_UPDATED
                };
                Some((name, data))
            }
        }
    }

    /// Deterministic key shared by every replica that sees this event.
    fn event_key(name: &str, event: &MeetEvent) -> String {
        let digest = Sha256::digest(
            format!("{name}:{}:{}", event.primary_id(), event.timestamp()).as_bytes(),
        );
        hex::encode(&digest[..8])
    }

    /// Lease long enough to cover the whole retry budget.
    fn delivery_ttl() -> Duration {
        let config = &services().globals.config;
        let backoff_total = config
            .webhook_backoff
            .saturating_mul(2u32.saturating_pow(config.webhook_max_attempts));
        backoff_total + Duration::from_secs(30) * config.webhook_max_attempts
    }

    pub fn start_handler(&self) {
        tokio::spawn(async move {
            let mut events = services().events.subscribe();
            let mut shutdown = services().globals.shutdown_signal();

            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Ok(event) = event else { break };
                        if let Err(e) = Self::handle_event(event).await {
                            warn!("Webhook handling failed: {e}");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("Webhook dispatcher stopped");
        });
    }

    async fn handle_event(event: MeetEvent) -> Result<()> {
        let Some((name, data)) = Self::outbound(&event) else {
            return Ok(());
        };

        let Some(url) = services().settings.webhook_url().await? else {
            return Ok(());
        };

        let key = Self::event_key(name, &event);
        let Some(lock) = services()
            .mutex
            .acquire(&format!("webhook:{key}"), Self::delivery_ttl())
            .await?
        else {
            debug!("Another replica is delivering webhook {key}");
            return Ok(());
        };

        let result = Self::deliver(&url, name, event.timestamp(), data).await;

        match &result {
            Ok(attempts) => info!("Delivered {name} webhook after {attempts} attempt(s)"),
            Err(e) => error!("Giving up on {name} webhook: {e}"),
        }

        if let Err(e) = services().mutex.release(&lock).await {
            warn!("Could not release webhook lock {key}: {e}");
        }

        result.map(|_| ())
    }

    /// POSTs the signed payload with exponential backoff and jitter. Returns
    /// the number of attempts it took.
    async fn deliver(
        url: &str,
        name: &str,
        creation_date: u64,
        data: serde_json::Value,
    ) -> Result<u32> {
        let payload = OutboundPayload {
            creation_date,
            event: name,
            data,
        };
        let body = serde_json::to_vec(&payload).expect("webhook payload serializes");
        let signature = Self::sign(&body);

        let config = &services().globals.config;
        let client = services().globals.default_client();
        let mut last_error: Option<Error> = None;

        for attempt in 0..config.webhook_max_attempts {
            if attempt > 0 {
                let backoff = config
                    .webhook_backoff
                    .saturating_mul(2u32.saturating_pow(attempt - 1));
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                tokio::time::sleep(backoff + jitter).await;
            }

            let response = client
                .post(url)
                .header(http::header::AUTHORIZATION, &signature)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => return Ok(attempt + 1),
                Ok(response) => {
                    debug!(
                        "Webhook endpoint answered {} on attempt {}",
                        response.status(),
                        attempt + 1
                    );
                    last_error = Some(Error::BadServerResponse(
                        "Webhook endpoint answered with a non-success status",
                    ));
                }
                Err(e) => {
                    debug!("Webhook POST failed on attempt {}: {e}", attempt + 1);
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.expect("at least one attempt happened"))
    }

    fn sign(body: &[u8]) -> String {
        let secret = services().globals.config.token_secret();
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Fires a signed probe at a candidate endpoint without touching the
    /// configured one. Used by `POST /config/webhooks/test`.
    pub async fn test_delivery(&self, url: &str) -> Result<()> {
        let payload = OutboundPayload {
            creation_date: utils::millis_since_unix_epoch(),
            event: "webhookTest",
            data: serde_json::json!({}),
        };
        let body = serde_json::to_vec(&payload).expect("webhook payload serializes");
        let signature = Self::sign(&body);

        let response = services()
            .globals
            .default_client()
            .post(url)
            .header(http::header::AUTHORIZATION, &signature)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::BadServerResponse(
                "Webhook endpoint answered with a non-success status",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_event(
        old_status: Option<RecordingStatus>,
        new_status: RecordingStatus,
    ) -> MeetEvent {
        MeetEvent::RecordingStatusChanged {
            recording_id: "room--uid".to_owned(),
            room_id: "room".to_owned(),
            old_status,
            new_status,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn transition_events_map_to_outbound_names() {
        let (name, _) = Service::outbound(&recording_event(None, RecordingStatus::Starting)).unwrap();
        assert_eq!(name, EVENT_RECORDING_STARTED);

        let (name, _) = Service::outbound(&recording_event(
            Some(RecordingStatus::Starting),
            RecordingStatus::Active,
        ))
        .unwrap();
        assert_eq!(name, EVENT_RECORDING_UPDATED);

        for terminal in [
            RecordingStatus::Complete,
            RecordingStatus::Failed,
            RecordingStatus::Aborted,
            RecordingStatus::LimitReached,
        ] {
            let (name, data) =
                Service::outbound(&recording_event(Some(RecordingStatus::Active), terminal))
                    .unwrap();
            assert_eq!(name, EVENT_RECORDING_ENDED);
            assert_eq!(data["recordingId"], "room--uid");
        }
    }

    #[test]
    fn event_keys_are_deterministic_across_replicas() {
        let event = recording_event(Some(RecordingStatus::Active), RecordingStatus::Complete);
        let (name, _) = Service::outbound(&event).unwrap();
        assert_eq!(Service::event_key(name, &event), Service::event_key(name, &event));

        // A different transition of the same recording gets its own key
        let other = MeetEvent::RecordingStatusChanged {
            recording_id: "room--uid".to_owned(),
            room_id: "room".to_owned(),
            old_status: Some(RecordingStatus::Starting),
            new_status: RecordingStatus::Active,
            timestamp: 1_700_000_000_001,
        };
        let (other_name, _) = Service::outbound(&other).unwrap();
        assert_ne!(
            Service::event_key(name, &event),
            Service::event_key(other_name, &other)
        );
    }
}
