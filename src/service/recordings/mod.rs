mod data;

use std::time::Duration;

pub use data::Data;
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::{
    database::cursor::Cursor,
    service::{events::MeetEvent, media_server::EgressInfo, rooms::RoomStatus},
    services, utils, Error, ErrorKind, Result,
};

/// Held for the whole lifetime of a recording; its presence is what makes
/// "at most one non-terminal recording per room" hold across replicas.
pub fn recording_lock(room_id: &str) -> String {
    format!("RECORDING_ACTIVE:{room_id}")
}

const RECORDING_UID_LENGTH: usize = 10;
const ACCESS_SECRET_LENGTH: usize = 10;
const MEDIA_URL_VALIDITY: Duration = Duration::from_secs(60 * 60);
/// Brief retry for egress webhooks racing the row insert on another replica.
const LOOKUP_RETRIES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingStatus {
    Starting,
    Active,
    Ending,
    Complete,
    Failed,
    Aborted,
    LimitReached,
}

impl RecordingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecordingStatus::Complete
                | RecordingStatus::Failed
                | RecordingStatus::Aborted
                | RecordingStatus::LimitReached
        )
    }

    /// The egress lifecycle graph. Terminal states never transition; a row is
    /// never back-transitioned.
    pub fn can_transition_to(self, next: Self) -> bool {
        use RecordingStatus::*;
        match (self, next) {
            (Starting, Active | Ending | Complete | Failed | Aborted | LimitReached) => true,
            (Active, Ending | Complete | Failed | Aborted | LimitReached) => true,
            (Ending, Complete | Failed | Aborted) => true,
            _ => false,
        }
    }
}

/// Secrets minted into share links; `public` gates the default link, the
/// `private` one survives regenerating the public secret.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessSecrets {
    pub public: String,
    pub private: String,
}

impl AccessSecrets {
    fn generate() -> Self {
        Self {
            public: utils::random_id(ACCESS_SECRET_LENGTH),
            private: utils::random_id(ACCESS_SECRET_LENGTH),
        }
    }

    pub fn matches(&self, secret: &str) -> bool {
        self.public == secret || self.private == secret
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub recording_id: String,
    pub room_id: String,
    pub status: RecordingStatus,
    pub filename: Option<String>,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    /// Seconds.
    pub duration: Option<f64>,
    /// Bytes.
    pub size: Option<i64>,
    pub error: Option<String>,
    pub layout: String,
    pub encoding: String,
    pub access_secrets: AccessSecrets,
    pub egress_id: Option<String>,
    pub updated_at: i64,
}

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Starts a recording for a room with a live meeting. The per-room lease
    /// makes a concurrent second start fail with `ALREADY_RECORDING`; the
    /// lease is only returned once the recording reaches a terminal status.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, room_id: &str) -> Result<Recording> {
        let room = services().rooms.room(room_id).await?;
        if room.status != RoomStatus::ActiveMeeting {
            return Err(Error::Conflict("Room has no active meeting to record"));
        }
        if !room.config.recording_enabled {
            return Err(Error::Conflict("Recording is disabled for this room"));
        }

        let config = &services().globals.config;
        let Some(lock) = services()
            .mutex
            .acquire(&recording_lock(room_id), config.recording_lock_ttl)
            .await?
        else {
            return Err(Error::Conflict("ALREADY_RECORDING"));
        };

        match self.start_locked(room_id).await {
            Ok(recording) => {
                self.arm_start_timeout(recording.recording_id.clone());
                Ok(recording)
            }
            Err(e) => {
                // The lease must not outlive a failed start
                if let Err(release_error) = services().mutex.release(&lock).await {
                    warn!("Could not release recording lock for {room_id}: {release_error}");
                }
                Err(e)
            }
        }
    }

    async fn start_locked(&self, room_id: &str) -> Result<Recording> {
        let now = utils::millis_since_unix_epoch() as i64;
        let mut recording = Recording {
            recording_id: format!("{room_id}--{}", utils::random_id(RECORDING_UID_LENGTH)),
            room_id: room_id.to_owned(),
            status: RecordingStatus::Starting,
            filename: None,
            start_date: None,
            end_date: None,
            duration: None,
            size: None,
            error: None,
            layout: "grid".to_owned(),
            encoding: "mp4".to_owned(),
            access_secrets: AccessSecrets::generate(),
            egress_id: None,
            updated_at: now,
        };

        self.db.insert_recording(&recording).await?;

        let egress_id = match services()
            .media_server
            .start_room_egress(room_id, &recording.recording_id)
            .await
        {
            Ok(egress_id) => egress_id,
            Err(e) => {
                recording.status = RecordingStatus::Failed;
                recording.error = Some("Media server refused to start egress".to_owned());
                recording.updated_at = utils::millis_since_unix_epoch() as i64;
                let _ = self
                    .db
                    .replace_recording_if_status(&recording, RecordingStatus::Starting)
                    .await;
                return Err(e);
            }
        };

        recording.egress_id = Some(egress_id);
        self.db.replace_recording(&recording).await?;

        self.publish_transition(&recording, None).await?;
        info!("Recording {} starting", recording.recording_id);
        Ok(recording)
    }

    /// Marks the recording FAILED when the media server never confirmed the
    /// egress, then returns the lease after a grace period.
    fn arm_start_timeout(&self, recording_id: String) {
        tokio::spawn(async move {
            let config = &services().globals.config;
            let started_timeout = config.recording_started_timeout;
            let grace = config.recording_orphaned_lock_grace_period;

            let mut shutdown = services().globals.shutdown_signal();
            tokio::select! {
                _ = tokio::time::sleep(started_timeout) => {}
                _ = shutdown.recv() => return,
            }

            match services().recordings.fail_if_still_starting(&recording_id).await {
                Ok(true) => {
                    tokio::time::sleep(grace).await;
                    if let Some((room_id, _)) = recording_id.split_once("--") {
                        if let Err(e) = services().mutex.force_release(&recording_lock(room_id)).await
                        {
                            warn!("Could not release orphaned recording lock: {e}");
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Start timeout check failed for {recording_id}: {e}"),
            }
        });
    }

    /// Returns true when the row was still STARTING and is now FAILED.
    pub async fn fail_if_still_starting(&self, recording_id: &str) -> Result<bool> {
        let Some(mut recording) = self.db.recording(recording_id).await? else {
            return Ok(false);
        };
        if recording.status != RecordingStatus::Starting {
            return Ok(false);
        }

        recording.status = RecordingStatus::Failed;
        recording.error = Some("Recording never started".to_owned());
        recording.updated_at = utils::millis_since_unix_epoch() as i64;

        if !self
            .db
            .replace_recording_if_status(&recording, RecordingStatus::Starting)
            .await?
        {
            return Ok(false);
        }

        self.publish_transition(&recording, Some(RecordingStatus::Starting))
            .await?;
        warn!("Recording {recording_id} timed out before starting");
        Ok(true)
    }

    /// Applies one media-server egress event to the owning row.
    #[tracing::instrument(skip(self, info))]
    pub async fn handle_egress_event(&self, info: EgressInfo) -> Result<()> {
        let mut recording = None;
        for attempt in 0..LOOKUP_RETRIES {
            recording = self.db.recording_by_egress(&info.egress_id).await?;
            if recording.is_some() {
                break;
            }
            if attempt + 1 < LOOKUP_RETRIES {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        let Some(mut recording) = recording else {
            warn!("Egress event for unknown egress {}", info.egress_id);
            return Ok(());
        };

        let old_status = recording.status;
        if old_status.is_terminal() {
            // Redelivered events must not touch a finished row
            warn!(
                "Dropping egress event for terminal recording {}",
                recording.recording_id
            );
            return Ok(());
        }

        let mut new_status = info.status;

        // COMPLETE must carry a playable file; anything else failed
        if new_status == RecordingStatus::Complete
            && (info.filename.is_none() || info.size.unwrap_or(0) == 0)
        {
            warn!(
                "Egress {} completed without a usable file, failing {}",
                info.egress_id, recording.recording_id
            );
            new_status = RecordingStatus::Failed;
        }

        if new_status != old_status && !old_status.can_transition_to(new_status) {
            warn!(
                "Rejecting egress transition {:?} -> {:?} for {}",
                old_status, new_status, recording.recording_id
            );
            return Ok(());
        }

        recording.status = new_status;
        recording.updated_at = utils::millis_since_unix_epoch() as i64;
        if let Some(filename) = info.filename {
            recording.filename = Some(filename);
        }
        if let Some(size) = info.size {
            recording.size = Some(size);
        }
        if let Some(duration) = info.duration {
            recording.duration = Some(duration);
        }
        if let Some(started_at) = info.started_at {
            recording.start_date = Some(started_at);
        }
        if let Some(ended_at) = info.ended_at {
            recording.end_date = Some(ended_at);
        }
        if let Some(error) = info.error {
            recording.error = Some(error);
        }

        if !self
            .db
            .replace_recording_if_status(&recording, old_status)
            .await?
        {
            // Lost the race against another event; that event's view wins
            warn!(
                "Concurrent status change while applying egress event to {}",
                recording.recording_id
            );
            return Ok(());
        }

        if new_status != old_status {
            self.publish_transition(&recording, Some(old_status)).await?;
        }

        if new_status.is_terminal() {
            if let Err(e) = services()
                .mutex
                .force_release(&recording_lock(&recording.room_id))
                .await
            {
                warn!("Could not release recording lock for {}: {e}", recording.room_id);
            }
        }

        Ok(())
    }

    /// Asks the media server to stop the egress; the row transitions when the
    /// resulting egress event arrives.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, recording_id: &str) -> Result<Recording> {
        let recording = self.recording(recording_id).await?;
        if recording.status.is_terminal() {
            return Err(Error::Conflict("Recording already ended"));
        }
        let Some(egress_id) = recording.egress_id.clone() else {
            return Err(Error::Conflict("Recording has no egress yet"));
        };

        services().media_server.stop_egress(&egress_id).await?;
        Ok(recording)
    }

    pub async fn recording(&self, recording_id: &str) -> Result<Recording> {
        self.db
            .recording(recording_id)
            .await?
            .ok_or(Error::BadRequest(ErrorKind::NotFound, "Recording not found"))
    }

    pub async fn recordings_page(
        &self,
        room_id: Option<&str>,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<(Vec<Recording>, Option<String>)> {
        self.db.recordings_page(room_id, cursor, limit).await
    }

    pub async fn recordings_of_room(&self, room_id: &str) -> Result<Vec<Recording>> {
        self.db.recordings_of_room(room_id).await
    }

    /// Deleting is only allowed once the row is terminal; in-flight
    /// recordings must be stopped first.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, recording_id: &str) -> Result<()> {
        let recording = self.recording(recording_id).await?;
        if !recording.status.is_terminal() {
            return Err(Error::Conflict("Recording is still in progress"));
        }
        self.db.delete_recording(recording_id).await?;
        info!("Deleted recording {recording_id}");
        Ok(())
    }

    /// Force-removes every recording of a room, aborting an in-flight egress
    /// if there is one. Used by forced room deletion.
    #[tracing::instrument(skip(self))]
    pub async fn purge_room(&self, room_id: &str) -> Result<()> {
        for recording in self.db.recordings_of_room(room_id).await? {
            if !recording.status.is_terminal() {
                if let Some(egress_id) = &recording.egress_id {
                    if let Err(e) = services().media_server.stop_egress(egress_id).await {
                        warn!("Could not stop egress while purging {room_id}: {e}");
                    }
                }
            }
            self.db.delete_recording(&recording.recording_id).await?;
        }
        services()
            .mutex
            .force_release(&recording_lock(room_id))
            .await?;
        Ok(())
    }

    /// Signed, short-lived URL for downloading the media file. The secret
    /// must match one of the recording's access secrets.
    pub async fn media_url(&self, recording_id: &str, secret: &str) -> Result<Url> {
        let recording = self.recording(recording_id).await?;
        if !recording.access_secrets.matches(secret) {
            return Err(Error::BadRequest(
                ErrorKind::Forbidden,
                "Invalid recording access secret",
            ));
        }
        let Some(filename) = &recording.filename else {
            return Err(Error::BadRequest(
                ErrorKind::NotFound,
                "Recording has no media file",
            ));
        };

        let Some(blob) = &services().globals.config.blob else {
            return Err(Error::BadRequest(
                ErrorKind::DependencyUnavailable,
                "Recording storage is not configured",
            ));
        };

        let bucket = Bucket::new(
            blob.endpoint.clone(),
            UrlStyle::Path,
            blob.bucket.clone(),
            blob.region.clone(),
        )
        .map_err(|_| Error::bad_config("Invalid blob storage endpoint"))?;
        let credentials = Credentials::new(blob.access_key.clone(), blob.secret_key.clone());

        Ok(bucket
            .get_object(Some(&credentials), filename)
            .sign(MEDIA_URL_VALIDITY))
    }

    /// The `recording_stale_cleanup` scheduled task: aborts rows whose last
    /// update is older than the staleness window.
    #[tracing::instrument(skip(self))]
    pub async fn run_stale_cleanup(&self) -> Result<()> {
        let stale_after = services().globals.config.recording_stale_after;
        let cutoff = utils::millis_since_unix_epoch() as i64 - stale_after.as_millis() as i64;

        for mut recording in self.db.non_terminal_recordings().await? {
            if recording.updated_at >= cutoff {
                continue;
            }

            let old_status = recording.status;
            recording.status = RecordingStatus::Aborted;
            recording.error = Some("Recording went stale".to_owned());
            recording.updated_at = utils::millis_since_unix_epoch() as i64;

            if !self
                .db
                .replace_recording_if_status(&recording, old_status)
                .await?
            {
                continue;
            }

            info!("Marked stale recording {} as aborted", recording.recording_id);
            self.publish_transition(&recording, Some(old_status)).await?;
            if let Err(e) = services()
                .mutex
                .force_release(&recording_lock(&recording.room_id))
                .await
            {
                warn!("Could not release lock of stale recording: {e}");
            }
        }
        Ok(())
    }

    /// The `recording_lock_gc` scheduled task: returns leases whose row is
    /// terminal or missing, leaving just-created rows alone for the grace
    /// period.
    #[tracing::instrument(skip(self))]
    pub async fn run_lock_gc(&self) -> Result<()> {
        let grace = services()
            .globals
            .config
            .recording_orphaned_lock_grace_period;
        let grace_cutoff = utils::millis_since_unix_epoch() as i64 - grace.as_millis() as i64;

        for name in services().mutex.registered_names().await? {
            let Some(room_id) = name.strip_prefix("RECORDING_ACTIVE:") else {
                continue;
            };

            let recordings = self.db.recordings_of_room(room_id).await?;
            let latest = recordings.iter().max_by_key(|r| r.updated_at);

            let orphaned = match latest {
                None => true,
                Some(recording) => {
                    recording.status.is_terminal() && recording.updated_at < grace_cutoff
                }
            };

            if orphaned {
                info!("Releasing orphaned recording lock for {room_id}");
                services().mutex.force_release(&name).await?;
            }
        }
        Ok(())
    }

    async fn publish_transition(
        &self,
        recording: &Recording,
        old_status: Option<RecordingStatus>,
    ) -> Result<()> {
        services()
            .events
            .publish(MeetEvent::RecordingStatusChanged {
                recording_id: recording.recording_id.clone(),
                room_id: recording.room_id.clone(),
                old_status,
                new_status: recording.status,
                timestamp: utils::millis_since_unix_epoch(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_never_transition() {
        use RecordingStatus::*;
        for terminal in [Complete, Failed, Aborted, LimitReached] {
            for next in [Starting, Active, Ending, Complete, Failed, Aborted, LimitReached] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn graph_allows_expected_paths() {
        use RecordingStatus::*;
        assert!(Starting.can_transition_to(Active));
        assert!(Starting.can_transition_to(Failed));
        assert!(Active.can_transition_to(Ending));
        assert!(Active.can_transition_to(Aborted));
        assert!(Ending.can_transition_to(Complete));
        assert!(Ending.can_transition_to(Failed));

        // No back-transitions
        assert!(!Active.can_transition_to(Starting));
        assert!(!Ending.can_transition_to(Active));
    }

    #[test]
    fn access_secrets_match_either_secret() {
        let secrets = AccessSecrets::generate();
        assert!(secrets.matches(&secrets.public));
        assert!(secrets.matches(&secrets.private));
        assert!(!secrets.matches("nope"));
        assert_ne!(secrets.public, secrets.private);
    }

    #[test]
    fn status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&RecordingStatus::LimitReached).unwrap(),
            "\"LIMIT_REACHED\""
        );
        assert_eq!(
            serde_json::from_str::<RecordingStatus>("\"STARTING\"").unwrap(),
            RecordingStatus::Starting
        );
    }
}
