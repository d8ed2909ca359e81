use std::{
    sync::{Arc, Once},
    time::Duration,
};

use ovmeet::{
    coordination,
    database::{abstraction::memory, Database},
    service::{
        events::MeetEvent,
        recordings::{recording_lock, AccessSecrets, Recording, RecordingStatus},
        rooms::{
            AutoDeletionPolicy, CreateRoomRequest, DeletionOutcome, DeletionPolicyWithMeeting,
            DeletionPolicyWithRecordings, MeetingEndAction, RoomStatus,
        },
    },
    services, Config, ErrorKind, Services, SERVICES,
};
use tokio::sync::OnceCell;

fn test_config() -> Config {
    serde_json::from_value(serde_json::json!({
        "storage_backend": "memory",
        "redis_url": "memory",
        "media_server": {
            // Nothing listens here; tests never reach a live media server
            "url": "http://127.0.0.1:9/",
            "api_key": "devkey",
            "api_secret": "devsecret-devsecret-devsecret",
        },
        "initial_admin_password": "correct horse battery staple",
    }))
    .expect("test config deserializes")
}

static INIT: Once = Once::new();
static BOOTSTRAP: OnceCell<()> = OnceCell::const_new();

async fn setup() -> &'static Services {
    INIT.call_once(|| {
        let db = Box::leak(Box::new(Database {
            engine: Arc::new(memory::Engine::new()),
        }));
        let store = Arc::new(coordination::memory::Store::new());
        let services_raw = Box::new(
            Services::build(db, store, test_config()).expect("services build"),
        );
        *SERVICES.write().unwrap() = Some(Box::leak(services_raw));
    });

    BOOTSTRAP
        .get_or_init(|| async {
            services().settings.bootstrap().await.unwrap();
            services().users.bootstrap_admin().await.unwrap();
        })
        .await;

    services()
}

fn make_room_request(name: &str) -> CreateRoomRequest {
    serde_json::from_value(serde_json::json!({ "roomName": name })).unwrap()
}

fn seed_recording(room_id: &str, status: RecordingStatus, updated_at: i64) -> Recording {
    Recording {
        recording_id: format!("{room_id}--seeded{updated_at}"),
        room_id: room_id.to_owned(),
        status,
        filename: None,
        start_date: None,
        end_date: None,
        duration: None,
        size: None,
        error: None,
        layout: "grid".to_owned(),
        encoding: "mp4".to_owned(),
        access_secrets: AccessSecrets {
            public: "pub-secret".to_owned(),
            private: "priv-secret".to_owned(),
        },
        egress_id: Some(format!("EG_{room_id}_{updated_at}")),
        updated_at,
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Tests share one `Services`, so the bus carries events from concurrently
/// running tests; always filter by the room under test.
async fn next_event_for(
    events: &mut tokio::sync::broadcast::Receiver<MeetEvent>,
    room_id: &str,
) -> MeetEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("expected an event for this room")
            .expect("bus stays open");
        if event.primary_id().starts_with(room_id) {
            return event;
        }
    }
}

async fn count_events_for(
    events: &mut tokio::sync::broadcast::Receiver<MeetEvent>,
    room_id: &str,
    window: Duration,
) -> usize {
    let mut seen = 0;
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) if event.primary_id().starts_with(room_id) => seen += 1,
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return seen,
        }
    }
}

#[tokio::test]
async fn create_room_and_first_meeting() {
    let services = setup().await;

    let room = services
        .rooms
        .create_room(make_room_request("Demo"), Some("admin".to_owned()))
        .await
        .unwrap();
    assert!(room.room_id.starts_with("demo-"));
    assert_eq!(room.status, RoomStatus::Open);

    let mut events = services.events.subscribe();

    // The media server confirms the meeting
    services.rooms.on_meeting_started(&room.room_id).await.unwrap();
    let fetched = services.rooms.room(&room.room_id).await.unwrap();
    assert_eq!(fetched.status, RoomStatus::ActiveMeeting);

    let event = next_event_for(&mut events, &room.room_id).await;
    assert!(matches!(
        event,
        MeetEvent::MeetingStarted { room_id, .. } if room_id == room.room_id
    ));

    // A replayed webhook is a no-op
    services.rooms.on_meeting_started(&room.room_id).await.unwrap();
    assert_eq!(
        services.rooms.room(&room.room_id).await.unwrap().status,
        RoomStatus::ActiveMeeting
    );
}

#[tokio::test]
async fn concurrent_name_collision_and_recycling() {
    let services = setup().await;
    let room = services
        .rooms
        .create_room(make_room_request("Names"), None)
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        services.names.reserve(&room.room_id, "Bob"),
        services.names.reserve(&room.room_id, "Bob"),
    );
    let mut assigned = vec![first.unwrap().assigned_name, second.unwrap().assigned_name];
    assigned.sort();
    assert_eq!(assigned, vec!["Bob", "Bob (1)"]);

    // After "Bob" leaves, the next join takes the verbatim name again
    services.names.release(&room.room_id, "Bob").await.unwrap();
    assert_eq!(
        services
            .names
            .reserve(&room.room_id, "Bob")
            .await
            .unwrap()
            .assigned_name,
        "Bob"
    );
}

#[tokio::test]
async fn second_recording_start_is_refused() {
    let services = setup().await;
    let room = services
        .rooms
        .create_room(make_room_request("Recorded"), None)
        .await
        .unwrap();
    services.rooms.on_meeting_started(&room.room_id).await.unwrap();

    // Simulate an in-flight recording holding the per-room lease, with a
    // live row so the lock GC leaves it alone
    let in_flight = seed_recording(&room.room_id, RecordingStatus::Starting, now_ms());
    services.recordings.db.insert_recording(&in_flight).await.unwrap();
    let lock = services
        .mutex
        .acquire(&recording_lock(&room.room_id), Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let error = services.recordings.start(&room.room_id).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Conflict);
    assert_eq!(error.to_string(), "ALREADY_RECORDING");

    services.mutex.release(&lock).await.unwrap();
}

#[tokio::test]
async fn recording_without_meeting_is_refused() {
    let services = setup().await;
    let room = services
        .rooms
        .create_room(make_room_request("Idle"), None)
        .await
        .unwrap();

    let error = services.recordings.start(&room.room_id).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn egress_events_drive_the_state_machine() {
    let services = setup().await;
    let room = services
        .rooms
        .create_room(make_room_request("Lifecycle"), None)
        .await
        .unwrap();

    let recording = seed_recording(&room.room_id, RecordingStatus::Starting, now_ms());
    services.recordings.db.insert_recording(&recording).await.unwrap();
    let egress_id = recording.egress_id.clone().unwrap();

    let active = ovmeet::service::media_server::EgressInfo {
        egress_id: egress_id.clone(),
        room_id: room.room_id.clone(),
        status: RecordingStatus::Active,
        filename: None,
        size: None,
        duration: None,
        started_at: Some(now_ms()),
        ended_at: None,
        error: None,
    };
    services.recordings.handle_egress_event(active).await.unwrap();
    assert_eq!(
        services
            .recordings
            .recording(&recording.recording_id)
            .await
            .unwrap()
            .status,
        RecordingStatus::Active
    );

    let complete = ovmeet::service::media_server::EgressInfo {
        egress_id: egress_id.clone(),
        room_id: room.room_id.clone(),
        status: RecordingStatus::Complete,
        filename: Some(format!("recordings/{}.mp4", recording.recording_id)),
        size: Some(2_048_000),
        duration: Some(61.5),
        started_at: None,
        ended_at: Some(now_ms()),
        error: None,
    };
    services.recordings.handle_egress_event(complete).await.unwrap();

    let finished = services
        .recordings
        .recording(&recording.recording_id)
        .await
        .unwrap();
    assert_eq!(finished.status, RecordingStatus::Complete);
    assert!(finished.size.unwrap() > 0);
    assert!(finished.duration.unwrap() >= 0.0);
    assert!(finished.filename.is_some());

    // Terminal rows reject any further event
    let late = ovmeet::service::media_server::EgressInfo {
        egress_id: egress_id.clone(),
        room_id: room.room_id.clone(),
        status: RecordingStatus::Active,
        filename: None,
        size: None,
        duration: None,
        started_at: None,
        ended_at: None,
        error: None,
    };
    services.recordings.handle_egress_event(late).await.unwrap();
    assert_eq!(
        services
            .recordings
            .recording(&recording.recording_id)
            .await
            .unwrap()
            .status,
        RecordingStatus::Complete
    );

    // A redelivered COMPLETE must not rewrite the finished row either
    let replay = ovmeet::service::media_server::EgressInfo {
        egress_id,
        room_id: room.room_id.clone(),
        status: RecordingStatus::Complete,
        filename: Some("recordings/other-file.mp4".to_owned()),
        size: Some(1),
        duration: Some(0.5),
        started_at: None,
        ended_at: Some(now_ms()),
        error: Some("spurious".to_owned()),
    };
    services.recordings.handle_egress_event(replay).await.unwrap();
    let untouched = services
        .recordings
        .recording(&recording.recording_id)
        .await
        .unwrap();
    assert_eq!(untouched.filename, finished.filename);
    assert_eq!(untouched.size, finished.size);
    assert_eq!(untouched.duration, finished.duration);
    assert_eq!(untouched.error, None);
}

#[tokio::test]
async fn complete_without_file_becomes_failed() {
    let services = setup().await;
    let room = services
        .rooms
        .create_room(make_room_request("Broken"), None)
        .await
        .unwrap();

    let recording = seed_recording(&room.room_id, RecordingStatus::Active, now_ms());
    services.recordings.db.insert_recording(&recording).await.unwrap();

    let bogus_complete = ovmeet::service::media_server::EgressInfo {
        egress_id: recording.egress_id.clone().unwrap(),
        room_id: room.room_id.clone(),
        status: RecordingStatus::Complete,
        filename: None,
        size: None,
        duration: None,
        started_at: None,
        ended_at: None,
        error: None,
    };
    services
        .recordings
        .handle_egress_event(bogus_complete)
        .await
        .unwrap();

    assert_eq!(
        services
            .recordings
            .recording(&recording.recording_id)
            .await
            .unwrap()
            .status,
        RecordingStatus::Failed
    );
}

#[tokio::test]
async fn stale_recordings_are_aborted_and_unlock_the_room() {
    let services = setup().await;
    let room = services
        .rooms
        .create_room(make_room_request("Stale"), None)
        .await
        .unwrap();

    // Active recording last touched 10 minutes ago, lease still held
    let stale_ts = now_ms() - 10 * 60 * 1000;
    let recording = seed_recording(&room.room_id, RecordingStatus::Active, stale_ts);
    services.recordings.db.insert_recording(&recording).await.unwrap();
    services
        .mutex
        .acquire(&recording_lock(&room.room_id), Duration::from_secs(3600))
        .await
        .unwrap()
        .unwrap();

    let mut events = services.events.subscribe();
    services.recordings.run_stale_cleanup().await.unwrap();

    let aborted = services
        .recordings
        .recording(&recording.recording_id)
        .await
        .unwrap();
    assert_eq!(aborted.status, RecordingStatus::Aborted);

    let event = next_event_for(&mut events, &room.room_id).await;
    assert!(matches!(
        event,
        MeetEvent::RecordingStatusChanged {
            new_status: RecordingStatus::Aborted,
            ..
        }
    ));

    // The room can record again
    assert!(!services
        .mutex
        .is_held(&recording_lock(&room.room_id))
        .await
        .unwrap());
}

#[tokio::test]
async fn orphaned_recording_locks_are_collected() {
    let services = setup().await;
    let room = services
        .rooms
        .create_room(make_room_request("Orphan"), None)
        .await
        .unwrap();

    // Terminal row older than the grace period, but its lease was never
    // returned (e.g. the replica died mid-release)
    let old_ts = now_ms() - 5 * 60 * 1000;
    let mut recording = seed_recording(&room.room_id, RecordingStatus::Starting, old_ts);
    recording.status = RecordingStatus::Complete;
    services.recordings.db.insert_recording(&recording).await.unwrap();
    services
        .mutex
        .acquire(&recording_lock(&room.room_id), Duration::from_secs(3600))
        .await
        .unwrap()
        .unwrap();

    services.recordings.run_lock_gc().await.unwrap();

    assert!(!services
        .mutex
        .is_held(&recording_lock(&room.room_id))
        .await
        .unwrap());
}

#[tokio::test]
async fn deferred_deletion_waits_for_meeting_end() {
    let services = setup().await;
    let room = services
        .rooms
        .create_room(make_room_request("Deferred"), None)
        .await
        .unwrap();
    services.rooms.on_meeting_started(&room.room_id).await.unwrap();

    let outcome = services
        .rooms
        .delete_room(
            &room.room_id,
            Some(AutoDeletionPolicy {
                with_meeting: DeletionPolicyWithMeeting::WhenMeetingEnds,
                with_recordings: DeletionPolicyWithRecordings::DoNotDelete,
            }),
        )
        .await
        .unwrap();
    assert_eq!(outcome, DeletionOutcome::Deferred);

    let pending = services.rooms.room(&room.room_id).await.unwrap();
    assert_eq!(pending.meeting_end_action, MeetingEndAction::Delete);

    let mut events = services.events.subscribe();
    services.rooms.on_meeting_ended(&room.room_id).await.unwrap();

    // Room is gone and exactly one meetingEnded event was emitted
    let error = services.rooms.room(&room.room_id).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);

    let event = next_event_for(&mut events, &room.room_id).await;
    assert!(matches!(
        event,
        MeetEvent::MeetingEnded { room_id, .. } if room_id == room.room_id
    ));
    assert_eq!(
        count_events_for(&mut events, &room.room_id, Duration::from_millis(150)).await,
        0,
        "no duplicate meetingEnded"
    );
}

#[tokio::test]
async fn deletion_matrix_refuses_active_meeting() {
    let services = setup().await;
    let room = services
        .rooms
        .create_room(make_room_request("Protected"), None)
        .await
        .unwrap();
    services.rooms.on_meeting_started(&room.room_id).await.unwrap();

    let error = services
        .rooms
        .delete_room(&room.room_id, None)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Conflict);
    assert!(services.rooms.room(&room.room_id).await.is_ok());
}

#[tokio::test]
async fn room_gc_deletes_expired_rooms() {
    let services = setup().await;
    let room = services
        .rooms
        .create_room(make_room_request("Expiring"), None)
        .await
        .unwrap();

    // Backdate the expiration; validation prevents creating it expired
    let mut expired = room.clone();
    expired.auto_deletion_date = Some(now_ms() - 1000);
    services.rooms.db.replace_room(&expired).await.unwrap();

    services.rooms.run_gc().await.unwrap();

    let error = services.rooms.room(&room.room_id).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn closed_rooms_flip_back_open() {
    let services = setup().await;
    let room = services
        .rooms
        .create_room(make_room_request("Toggle"), None)
        .await
        .unwrap();

    let closed = services
        .rooms
        .update_status(&room.room_id, RoomStatus::Closed)
        .await
        .unwrap();
    assert_eq!(closed.status, RoomStatus::Closed);

    let reopened = services
        .rooms
        .update_status(&room.room_id, RoomStatus::Open)
        .await
        .unwrap();
    assert_eq!(reopened.status, RoomStatus::Open);
}

#[tokio::test]
async fn admin_login_and_refresh() {
    let services = setup().await;

    let (user, tokens) = services
        .users
        .login("admin", "correct horse battery staple")
        .await
        .unwrap();
    assert_eq!(user.user_id, "admin");

    let claims = services
        .users
        .validate_token(&tokens.access_token, "access")
        .unwrap();
    assert_eq!(claims.sub, "admin");

    // Access tokens are not refresh tokens
    assert!(services
        .users
        .refresh_session(&tokens.access_token)
        .await
        .is_err());
    assert!(services
        .users
        .refresh_session(&tokens.refresh_token)
        .await
        .is_ok());

    let error = services.users.login("admin", "wrong").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Unauthenticated);
}

#[tokio::test]
async fn single_api_key_in_community_edition() {
    let services = setup().await;

    let key = services.users.create_api_key().await.unwrap();
    services.users.validate_api_key(&key.key).await.unwrap();

    let error = services.users.create_api_key().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ProFeature);

    services.users.delete_api_key(&key.key_id).await.unwrap();
    assert!(services.users.create_api_key().await.is_ok());
}
