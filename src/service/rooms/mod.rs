mod data;

use std::time::Duration;

pub use data::Data;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    database::cursor::Cursor,
    service::events::MeetEvent,
    services, utils, Error, ErrorKind, Result,
};

/// Locks that serialize all state transitions of one room.
fn room_lock(room_id: &str) -> String {
    format!("room:{room_id}")
}

const ROOM_LOCK_TTL: Duration = Duration::from_secs(30);
const ROOM_ID_SUFFIX_LENGTH: usize = 8;
const MAX_ROOM_NAME_LENGTH: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Open,
    ActiveMeeting,
    Closed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicyWithMeeting {
    #[default]
    DoNotDelete,
    WhenMeetingEnds,
    Force,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicyWithRecordings {
    #[default]
    DoNotDelete,
    WhenNoRecordings,
    Force,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoDeletionPolicy {
    pub with_meeting: DeletionPolicyWithMeeting,
    pub with_recordings: DeletionPolicyWithRecordings,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingEndAction {
    #[default]
    None,
    Close,
    Delete,
}

/// Per-room feature toggles, embedded in the media-server room metadata on
/// meeting creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomConfig {
    pub chat_enabled: bool,
    pub recording_enabled: bool,
    pub virtual_background_enabled: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            chat_enabled: true,
            recording_enabled: true,
            virtual_background_enabled: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: String,
    pub room_name: String,
    pub status: RoomStatus,
    pub creation_date: i64,
    pub auto_deletion_date: Option<i64>,
    #[serde(default)]
    pub auto_deletion_policy: AutoDeletionPolicy,
    #[serde(default)]
    pub config: RoomConfig,
    #[serde(default)]
    pub meeting_end_action: MeetingEndAction,
    pub created_by: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub room_name: String,
    pub auto_deletion_date: Option<i64>,
    #[serde(default)]
    pub auto_deletion_policy: AutoDeletionPolicy,
    #[serde(default)]
    pub config: Option<RoomConfig>,
}

/// What a deletion request resolves to, before any side effect happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionPlan {
    Refuse(&'static str),
    /// Persist `meetingEndAction = delete` and return 202.
    Defer,
    Proceed {
        end_meeting: bool,
        purge_recordings: bool,
    },
}

/// Outcome reported to the API layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionOutcome {
    Deleted,
    Deferred,
}

/// The auto-deletion policy matrix as a pure decision. All the async
/// orchestration hangs off this.
pub fn plan_deletion(
    meeting_active: bool,
    has_recordings: bool,
    policy: AutoDeletionPolicy,
) -> DeletionPlan {
    use DeletionPolicyWithMeeting as M;
    use DeletionPolicyWithRecordings as R;

    if meeting_active {
        return match policy.with_meeting {
            M::DoNotDelete => DeletionPlan::Refuse("Room has an active meeting"),
            M::WhenMeetingEnds => DeletionPlan::Defer,
            M::Force => match policy.with_recordings {
                R::Force => DeletionPlan::Proceed {
                    end_meeting: true,
                    purge_recordings: true,
                },
                R::DoNotDelete | R::WhenNoRecordings if has_recordings => {
                    DeletionPlan::Refuse("Room has recordings")
                }
                _ => DeletionPlan::Proceed {
                    end_meeting: true,
                    purge_recordings: false,
                },
            },
        };
    }

    match policy.with_recordings {
        R::Force => DeletionPlan::Proceed {
            end_meeting: false,
            purge_recordings: true,
        },
        R::DoNotDelete | R::WhenNoRecordings if has_recordings => {
            DeletionPlan::Refuse("Room has recordings")
        }
        _ => DeletionPlan::Proceed {
            end_meeting: false,
            purge_recordings: false,
        },
    }
}

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    fn generate_room_id(room_name: &str) -> String {
        let slug: String = room_name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-");

        let slug = if slug.is_empty() { "room" } else { &slug };
        format!("{slug}-{}", utils::random_id(ROOM_ID_SUFFIX_LENGTH))
    }

    #[tracing::instrument(skip(self, request))]
    pub async fn create_room(
        &self,
        request: CreateRoomRequest,
        created_by: Option<String>,
    ) -> Result<Room> {
        let room_name = request.room_name.trim().to_owned();
        if room_name.is_empty() || room_name.len() > MAX_ROOM_NAME_LENGTH {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "roomName must be between 1 and 100 characters",
            ));
        }

        if let Some(deletion_date) = request.auto_deletion_date {
            let min_future = services()
                .globals
                .config
                .min_future_time_for_room_autodeletion_date;
            let earliest = utils::millis_since_unix_epoch() as i64 + min_future.as_millis() as i64;
            if deletion_date < earliest {
                return Err(Error::BadRequest(
                    ErrorKind::Validation,
                    "autoDeletionDate must be far enough in the future",
                ));
            }
        }

        let room = Room {
            room_id: Self::generate_room_id(&room_name),
            room_name,
            status: RoomStatus::Open,
            creation_date: utils::millis_since_unix_epoch() as i64,
            auto_deletion_date: request.auto_deletion_date,
            auto_deletion_policy: request.auto_deletion_policy,
            config: request.config.unwrap_or_default(),
            meeting_end_action: MeetingEndAction::None,
            created_by,
        };

        self.db.insert_room(&room).await?;
        info!("Created room {}", room.room_id);
        Ok(room)
    }

    pub async fn room(&self, room_id: &str) -> Result<Room> {
        self.db
            .room(room_id)
            .await?
            .ok_or(Error::BadRequest(ErrorKind::NotFound, "Room not found"))
    }

    pub async fn rooms_page(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<(Vec<Room>, Option<String>)> {
        self.db.rooms_page(cursor, limit).await
    }

    /// Explicit open/closed flip. Rooms with a live meeting refuse to close.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(&self, room_id: &str, target: RoomStatus) -> Result<Room> {
        let Some(lock) = services()
            .mutex
            .acquire(&room_lock(room_id), ROOM_LOCK_TTL)
            .await?
        else {
            return Err(Error::BadRequest(
                ErrorKind::Busy,
                "Room is being modified by another request",
            ));
        };

        let result = self.update_status_locked(room_id, target).await;
        if let Err(e) = services().mutex.release(&lock).await {
            warn!("Could not release room lock for {room_id}: {e}");
        }
        result
    }

    async fn update_status_locked(&self, room_id: &str, target: RoomStatus) -> Result<Room> {
        let mut room = self.room(room_id).await?;

        let allowed = matches!(
            (room.status, target),
            (RoomStatus::Open, RoomStatus::Closed) | (RoomStatus::Closed, RoomStatus::Open)
        );
        if !allowed {
            return Err(Error::Conflict(
                "Room status can only be switched between open and closed",
            ));
        }

        let expected = room.status;
        room.status = target;
        if !self.db.replace_room_if_status(&room, expected).await? {
            return Err(Error::Conflict("Room status changed concurrently"));
        }
        Ok(room)
    }

    /// Explicit delete request with optional policy overrides from the query
    /// string. Runs under the room lock.
    #[tracing::instrument(skip(self))]
    pub async fn delete_room(
        &self,
        room_id: &str,
        policy_override: Option<AutoDeletionPolicy>,
    ) -> Result<DeletionOutcome> {
        let Some(lock) = services()
            .mutex
            .acquire(&room_lock(room_id), ROOM_LOCK_TTL)
            .await?
        else {
            return Err(Error::BadRequest(
                ErrorKind::Busy,
                "Room is being modified by another request",
            ));
        };

        let result = self.delete_room_locked(room_id, policy_override).await;
        if let Err(e) = services().mutex.release(&lock).await {
            warn!("Could not release room lock for {room_id}: {e}");
        }
        result
    }

    async fn delete_room_locked(
        &self,
        room_id: &str,
        policy_override: Option<AutoDeletionPolicy>,
    ) -> Result<DeletionOutcome> {
        let mut room = self.room(room_id).await?;
        let policy = policy_override.unwrap_or(room.auto_deletion_policy);

        let meeting_active = room.status == RoomStatus::ActiveMeeting;
        let has_recordings = !services()
            .recordings
            .recordings_of_room(room_id)
            .await?
            .is_empty();

        match plan_deletion(meeting_active, has_recordings, policy) {
            DeletionPlan::Refuse(reason) => Err(Error::Conflict(reason)),
            DeletionPlan::Defer => {
                room.meeting_end_action = MeetingEndAction::Delete;
                room.auto_deletion_policy = policy;
                self.db.replace_room(&room).await?;
                info!("Deferred deletion of {room_id} until the meeting ends");
                Ok(DeletionOutcome::Deferred)
            }
            DeletionPlan::Proceed {
                end_meeting,
                purge_recordings,
            } => {
                if end_meeting {
                    services().media_server.delete_room(room_id).await?;
                }
                if purge_recordings {
                    services().recordings.purge_room(room_id).await?;
                }
                services().names.release_all(room_id).await?;
                self.db.delete_room(room_id).await?;

                if end_meeting {
                    self.publish_meeting_ended(&room).await?;
                }
                info!("Deleted room {room_id}");
                Ok(DeletionOutcome::Deleted)
            }
        }
    }

    /// Handles the media server's `room_started` webhook.
    #[tracing::instrument(skip(self))]
    pub async fn on_meeting_started(&self, room_id: &str) -> Result<()> {
        let Some(lock) = services()
            .mutex
            .acquire_with_retry(&room_lock(room_id), ROOM_LOCK_TTL, 5, Duration::from_millis(200))
            .await?
        else {
            return Err(Error::BadRequest(
                ErrorKind::Busy,
                "Room is being modified by another request",
            ));
        };

        let result = self.on_meeting_started_locked(room_id).await;
        if let Err(e) = services().mutex.release(&lock).await {
            warn!("Could not release room lock for {room_id}: {e}");
        }
        result
    }

    async fn on_meeting_started_locked(&self, room_id: &str) -> Result<()> {
        let Some(mut room) = self.db.room(room_id).await? else {
            warn!("Media server started a meeting for unknown room {room_id}");
            return Ok(());
        };

        if room.status == RoomStatus::ActiveMeeting {
            return Ok(());
        }

        let expected = room.status;
        room.status = RoomStatus::ActiveMeeting;
        if !self.db.replace_room_if_status(&room, expected).await? {
            // Raced with another transition; the webhook will not be replayed
            // so log and move on
            warn!("Lost a status race while starting meeting in {room_id}");
            return Ok(());
        }

        services()
            .events
            .publish(MeetEvent::MeetingStarted {
                room_id: room.room_id.clone(),
                room_name: room.room_name.clone(),
                timestamp: utils::millis_since_unix_epoch(),
            })
            .await
    }

    /// Handles the media server's `room_finished` webhook: applies any
    /// deferred end-of-meeting action and releases participant names.
    #[tracing::instrument(skip(self))]
    pub async fn on_meeting_ended(&self, room_id: &str) -> Result<()> {
        let Some(lock) = services()
            .mutex
            .acquire_with_retry(&room_lock(room_id), ROOM_LOCK_TTL, 5, Duration::from_millis(200))
            .await?
        else {
            return Err(Error::BadRequest(
                ErrorKind::Busy,
                "Room is being modified by another request",
            ));
        };

        let result = self.on_meeting_ended_locked(room_id).await;
        if let Err(e) = services().mutex.release(&lock).await {
            warn!("Could not release room lock for {room_id}: {e}");
        }
        result
    }

    async fn on_meeting_ended_locked(&self, room_id: &str) -> Result<()> {
        let Some(mut room) = self.db.room(room_id).await? else {
            warn!("Media server finished a meeting for unknown room {room_id}");
            return Ok(());
        };

        if room.status != RoomStatus::ActiveMeeting {
            return Ok(());
        }

        services().names.release_all(room_id).await?;

        let action = room.meeting_end_action;
        match action {
            MeetingEndAction::Delete => {
                let has_recordings = !services()
                    .recordings
                    .recordings_of_room(room_id)
                    .await?
                    .is_empty();
                match plan_deletion(false, has_recordings, room.auto_deletion_policy) {
                    DeletionPlan::Proceed {
                        purge_recordings, ..
                    } => {
                        if purge_recordings {
                            services().recordings.purge_room(room_id).await?;
                        }
                        self.db.delete_room(room_id).await?;
                        info!("Deleted room {room_id} after its meeting ended");
                    }
                    _ => {
                        // Recordings appeared since the deferral; fall back to
                        // closing so the request is not silently lost
                        room.status = RoomStatus::Closed;
                        room.meeting_end_action = MeetingEndAction::None;
                        self.db.replace_room(&room).await?;
                    }
                }
            }
            MeetingEndAction::Close => {
                room.status = RoomStatus::Closed;
                room.meeting_end_action = MeetingEndAction::None;
                self.db.replace_room(&room).await?;
            }
            MeetingEndAction::None => {
                room.status = RoomStatus::Open;
                self.db.replace_room(&room).await?;
            }
        }

        self.publish_meeting_ended(&room).await
    }

    async fn publish_meeting_ended(&self, room: &Room) -> Result<()> {
        services()
            .events
            .publish(MeetEvent::MeetingEnded {
                room_id: room.room_id.clone(),
                room_name: room.room_name.clone(),
                timestamp: utils::millis_since_unix_epoch(),
            })
            .await
    }

    /// Ends a meeting on request. The media server will confirm with a
    /// `room_finished` webhook; applying the transition here as well keeps
    /// the row correct when that webhook is delayed.
    #[tracing::instrument(skip(self))]
    pub async fn end_meeting(&self, room_id: &str) -> Result<()> {
        let room = self.room(room_id).await?;
        if room.status != RoomStatus::ActiveMeeting {
            return Err(Error::Conflict("Room has no active meeting"));
        }

        services().media_server.delete_room(room_id).await?;
        self.on_meeting_ended(room_id).await
    }

    /// The `room_gc` scheduled task: applies auto-deletion policies to rooms
    /// whose expiration date passed.
    #[tracing::instrument(skip(self))]
    pub async fn run_gc(&self) -> Result<()> {
        let now = utils::millis_since_unix_epoch() as i64;
        for room in self.db.rooms_due_for_deletion(now).await? {
            match self.delete_room(&room.room_id, None).await {
                Ok(outcome) => info!("Room GC handled {}: {outcome:?}", room.room_id),
                Err(e) if e.kind() == ErrorKind::Conflict => {
                    // Policy refused; the room stays until its state changes
                    info!("Room GC skipped {}: {e}", room.room_id);
                }
                Err(e) => warn!("Room GC failed for {}: {e}", room.room_id),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeletionPolicyWithMeeting as M;
    use DeletionPolicyWithRecordings as R;

    fn policy(with_meeting: M, with_recordings: R) -> AutoDeletionPolicy {
        AutoDeletionPolicy {
            with_meeting,
            with_recordings,
        }
    }

    #[test]
    fn matrix_refuses_while_meeting_active() {
        for with_recordings in [R::DoNotDelete, R::WhenNoRecordings, R::Force] {
            assert!(matches!(
                plan_deletion(true, false, policy(M::DoNotDelete, with_recordings)),
                DeletionPlan::Refuse(_)
            ));
        }
    }

    #[test]
    fn matrix_defers_when_meeting_ends() {
        assert_eq!(
            plan_deletion(true, true, policy(M::WhenMeetingEnds, R::WhenNoRecordings)),
            DeletionPlan::Defer
        );
    }

    #[test]
    fn matrix_force_terminates_and_purges() {
        assert_eq!(
            plan_deletion(true, true, policy(M::Force, R::Force)),
            DeletionPlan::Proceed {
                end_meeting: true,
                purge_recordings: true
            }
        );
    }

    #[test]
    fn matrix_force_meeting_respects_recordings() {
        assert!(matches!(
            plan_deletion(true, true, policy(M::Force, R::WhenNoRecordings)),
            DeletionPlan::Refuse(_)
        ));
        assert_eq!(
            plan_deletion(true, false, policy(M::Force, R::WhenNoRecordings)),
            DeletionPlan::Proceed {
                end_meeting: true,
                purge_recordings: false
            }
        );
    }

    #[test]
    fn matrix_idle_room_with_recordings() {
        assert!(matches!(
            plan_deletion(false, true, policy(M::DoNotDelete, R::DoNotDelete)),
            DeletionPlan::Refuse(_)
        ));
        assert_eq!(
            plan_deletion(false, true, policy(M::DoNotDelete, R::Force)),
            DeletionPlan::Proceed {
                end_meeting: false,
                purge_recordings: true
            }
        );
        assert_eq!(
            plan_deletion(false, false, policy(M::DoNotDelete, R::DoNotDelete)),
            DeletionPlan::Proceed {
                end_meeting: false,
                purge_recordings: false
            }
        );
    }

    #[test]
    fn room_ids_are_sluggy_and_unique() {
        let a = Service::generate_room_id("Weekly Sync!");
        let b = Service::generate_room_id("Weekly Sync!");
        assert!(a.starts_with("weekly-sync-"));
        assert_ne!(a, b);

        assert!(Service::generate_room_id("日本語").starts_with("room-"));
    }
}
