use std::time::Duration;

use mongodb::bson::{self, doc, Bson, Document};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    database::abstraction::StorageEngine, service::mutex, utils, Error, Result,
};

pub const MIGRATIONS_COLLECTION: &str = "migrations";
/// Fleet-wide guard so exactly one replica migrates at startup.
pub const MIGRATION_LOCK: &str = "MIGRATION";
const MIGRATION_LOCK_TTL: Duration = Duration::from_secs(10 * 60);

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

/// A pure transform lifting every document of one collection from
/// `from` to `to`.
pub struct Migration {
    pub name: &'static str,
    pub collection: &'static str,
    pub from: u32,
    pub to: u32,
    pub transform: fn(Document) -> Result<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub name: String,
    pub status: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

/// Ordered registry of schema migrations. Versions are per collection and
/// strictly consecutive.
pub fn registry() -> Vec<Migration> {
    vec![
        Migration {
            name: "rooms_default_meeting_end_action",
            collection: "rooms",
            from: 0,
            to: 1,
            transform: |mut doc| {
                if !doc.contains_key("meetingEndAction") {
                    doc.insert("meetingEndAction", "none");
                }
                Ok(doc)
            },
        },
        Migration {
            name: "recordings_backfill_room_id",
            collection: "recordings",
            from: 0,
            to: 1,
            transform: |mut doc| {
                if !doc.contains_key("roomId") {
                    let room_id = doc
                        .get_str("recordingId")
                        .ok()
                        .and_then(|id| id.split_once("--").map(|(room, _)| room.to_owned()))
                        .ok_or_else(|| {
                            Error::bad_database("Recording row without derivable roomId")
                        })?;
                    doc.insert("roomId", room_id);
                }
                Ok(doc)
            },
        },
        Migration {
            name: "users_default_must_change_password",
            collection: "users",
            from: 0,
            to: 1,
            transform: |mut doc| {
                if !doc.contains_key("mustChangePassword") {
                    doc.insert("mustChangePassword", false);
                }
                Ok(doc)
            },
        },
    ]
}

/// Runs the optional legacy import and every pending migration under the
/// fleet-wide `MIGRATION` lock. Returns an error when migration failed;
/// startup must abort in that case.
pub async fn run_startup(
    engine: &dyn StorageEngine,
    legacy: Option<&dyn StorageEngine>,
    mutex: &mutex::Service,
) -> Result<()> {
    let Some(lock) = mutex
        .acquire_with_retry(MIGRATION_LOCK, MIGRATION_LOCK_TTL, 40, Duration::from_secs(3))
        .await?
    else {
        return Err(Error::bad_database(
            "Another replica is holding the migration lock for too long",
        ));
    };

    let mut result = match legacy {
        Some(legacy) => run_legacy_import(legacy, engine).await,
        None => Ok(()),
    };
    if result.is_ok() {
        result = run_all(engine).await;
    }

    if let Err(e) = mutex.release(&lock).await {
        warn!("Could not release migration lock: {e}");
    }

    result
}

/// Schema migrations only; see `run_startup` for the full startup sequence.
pub async fn run_pending(engine: &dyn StorageEngine, mutex: &mutex::Service) -> Result<()> {
    run_startup(engine, None, mutex).await
}

async fn run_all(engine: &dyn StorageEngine) -> Result<()> {
    for migration in registry() {
        let current = engine.schema_version(migration.collection).await?;
        if current >= migration.to {
            continue;
        }
        if current != migration.from {
            return Err(Error::bad_database(
                "Schema version gap detected, refusing to migrate",
            ));
        }
        run_one(engine, &migration).await?;
    }
    Ok(())
}

async fn run_one(engine: &dyn StorageEngine, migration: &Migration) -> Result<()> {
    // A failed or interrupted run left a row behind; update it instead of
    // inserting a duplicate so reruns stay idempotent.
    let mut record = match engine.get(MIGRATIONS_COLLECTION, migration.name).await? {
        Some(doc) => {
            let mut record: MigrationRecord = bson::from_document(doc)
                .map_err(|_| Error::bad_database("Corrupt migration record"))?;
            if record.status != STATUS_COMPLETED {
                info!("Resuming migration {}", migration.name);
            }
            record.status = STATUS_RUNNING.to_owned();
            record.started_at = utils::millis_since_unix_epoch() as i64;
            record.completed_at = None;
            record.error = None;
            record
        }
        None => MigrationRecord {
            name: migration.name.to_owned(),
            status: STATUS_RUNNING.to_owned(),
            started_at: utils::millis_since_unix_epoch() as i64,
            completed_at: None,
            error: None,
        },
    };
    put_record(engine, &record).await?;

    match apply(engine, migration).await {
        Ok(()) => {
            engine
                .set_schema_version(migration.collection, migration.to)
                .await?;
            record.status = STATUS_COMPLETED.to_owned();
            record.completed_at = Some(utils::millis_since_unix_epoch() as i64);
            put_record(engine, &record).await?;
            info!(
                "Migration {} finished: {} {} -> {}",
                migration.name, migration.collection, migration.from, migration.to
            );
            Ok(())
        }
        Err(e) => {
            record.status = STATUS_FAILED.to_owned();
            record.error = Some(e.to_string());
            put_record(engine, &record).await?;
            Err(e)
        }
    }
}

async fn apply(engine: &dyn StorageEngine, migration: &Migration) -> Result<()> {
    for doc in engine.find_all(migration.collection, doc! {}).await? {
        let id = doc
            .get_str("_id")
            .map(ToOwned::to_owned)
            .map_err(|_| Error::bad_database("Document without id during migration"))?;
        let transformed = (migration.transform)(doc)?;
        engine.put(migration.collection, &id, transformed).await?;
    }
    Ok(())
}

async fn put_record(engine: &dyn StorageEngine, record: &MigrationRecord) -> Result<()> {
    let doc = bson::to_document(record).expect("migration record serializes");
    engine.put(MIGRATIONS_COLLECTION, &record.name, doc).await
}

/// One-shot copy of every legacy blob collection into the document store.
/// Keyed like any other migration, so it runs exactly once per deployment.
pub const LEGACY_IMPORT: &str = "legacy_storage_to_mongodb";

pub async fn run_legacy_import(
    legacy: &dyn StorageEngine,
    target: &dyn StorageEngine,
) -> Result<()> {
    if let Some(doc) = target.get(MIGRATIONS_COLLECTION, LEGACY_IMPORT).await? {
        if doc.get_str("status") == Ok(STATUS_COMPLETED) {
            return Ok(());
        }
        info!("Resuming legacy storage import");
    }

    let mut record = MigrationRecord {
        name: LEGACY_IMPORT.to_owned(),
        status: STATUS_RUNNING.to_owned(),
        started_at: utils::millis_since_unix_epoch() as i64,
        completed_at: None,
        error: None,
    };
    put_record(target, &record).await?;

    let result = copy_collections(legacy, target).await;

    match result {
        Ok(copied) => {
            record.status = STATUS_COMPLETED.to_owned();
            record.completed_at = Some(utils::millis_since_unix_epoch() as i64);
            put_record(target, &record).await?;
            info!("Legacy storage import finished, {copied} documents copied");
            Ok(())
        }
        Err(e) => {
            record.status = STATUS_FAILED.to_owned();
            record.error = Some(e.to_string());
            put_record(target, &record).await?;
            Err(e)
        }
    }
}

async fn copy_collections(
    legacy: &dyn StorageEngine,
    target: &dyn StorageEngine,
) -> Result<u64> {
    let mut copied = 0;
    for collection in legacy.collections().await? {
        if collection == MIGRATIONS_COLLECTION {
            continue;
        }
        for doc in legacy.find_all(&collection, doc! {}).await? {
            let id = match doc.get("_id") {
                Some(Bson::String(id)) => id.clone(),
                _ => continue,
            };
            target.put(&collection, &id, doc).await?;
            copied += 1;
        }
        let version = legacy.schema_version(&collection).await?;
        if version > target.schema_version(&collection).await? {
            target.set_schema_version(&collection, version).await?;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{coordination::memory as coord_memory, database::abstraction::memory};

    fn mutex_service() -> mutex::Service {
        mutex::Service {
            store: Arc::new(coord_memory::Store::new()),
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let engine = memory::Engine::new();
        engine
            .put("rooms", "r1", doc! { "roomId": "r1", "status": "open" })
            .await
            .unwrap();

        let mutex = mutex_service();
        run_pending(&engine, &mutex).await.unwrap();
        let after_first = engine.get("rooms", "r1").await.unwrap().unwrap();
        assert_eq!(after_first.get_str("meetingEndAction").unwrap(), "none");

        // Second run is a no-op with an identical end state
        run_pending(&engine, &mutex).await.unwrap();
        let after_second = engine.get("rooms", "r1").await.unwrap().unwrap();
        assert_eq!(after_first, after_second);
        assert_eq!(engine.schema_version("rooms").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_migration_is_resumable() {
        let engine = memory::Engine::new();
        // This row makes recordings_backfill_room_id fail: no roomId and no
        // derivable id
        engine
            .put("recordings", "bad", doc! { "recordingId": "no-separator" })
            .await
            .unwrap();

        let mutex = mutex_service();
        run_pending(&engine, &mutex).await.unwrap_err();

        let record = engine
            .get(MIGRATIONS_COLLECTION, "recordings_backfill_room_id")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.get_str("status").unwrap(), STATUS_FAILED);
        assert!(record.get_str("error").is_ok());

        // Fix the data, rerun: the same record flips to completed
        engine
            .put(
                "recordings",
                "bad",
                doc! { "recordingId": "room--uid", "roomId": "room" },
            )
            .await
            .unwrap();
        run_pending(&engine, &mutex).await.unwrap();

        let record = engine
            .get(MIGRATIONS_COLLECTION, "recordings_backfill_room_id")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.get_str("status").unwrap(), STATUS_COMPLETED);
        assert_eq!(
            engine
                .count(MIGRATIONS_COLLECTION, doc! { "name": "recordings_backfill_room_id" })
                .await
                .unwrap(),
            1,
            "rerun must update the row, not insert a duplicate"
        );
    }

    #[tokio::test]
    async fn legacy_import_copies_once() {
        let legacy = memory::Engine::new();
        let target = memory::Engine::new();
        legacy
            .put("rooms", "r1", doc! { "roomId": "r1", "status": "open" })
            .await
            .unwrap();
        legacy.set_schema_version("rooms", 1).await.unwrap();

        run_legacy_import(&legacy, &target).await.unwrap();
        assert!(target.get("rooms", "r1").await.unwrap().is_some());
        assert_eq!(target.schema_version("rooms").await.unwrap(), 1);

        // Re-running after completion touches nothing
        target.delete("rooms", "r1").await.unwrap();
        run_legacy_import(&legacy, &target).await.unwrap();
        assert!(target.get("rooms", "r1").await.unwrap().is_none());
    }
}
