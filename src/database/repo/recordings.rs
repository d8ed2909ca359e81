use async_trait::async_trait;
use mongodb::bson::doc;

use super::{from_document, to_document};
use crate::{
    database::{
        abstraction::{PageRequest, SortOrder},
        cursor::Cursor,
        Database,
    },
    service::recordings::{Data, Recording, RecordingStatus},
    Result,
};

const RECORDINGS: &str = "recordings";

fn non_terminal_statuses() -> mongodb::bson::Bson {
    mongodb::bson::bson!(["STARTING", "ACTIVE", "ENDING"])
}

#[async_trait]
impl Data for Database {
    async fn insert_recording(&self, recording: &Recording) -> Result<()> {
        self.engine
            .insert(RECORDINGS, &recording.recording_id, to_document(recording)?)
            .await
    }

    async fn recording(&self, recording_id: &str) -> Result<Option<Recording>> {
        self.engine
            .get(RECORDINGS, recording_id)
            .await?
            .map(from_document)
            .transpose()
    }

    async fn recording_by_egress(&self, egress_id: &str) -> Result<Option<Recording>> {
        self.engine
            .find_all(RECORDINGS, doc! { "egressId": egress_id })
            .await?
            .into_iter()
            .next()
            .map(from_document)
            .transpose()
    }

    async fn replace_recording(&self, recording: &Recording) -> Result<()> {
        self.engine
            .put(RECORDINGS, &recording.recording_id, to_document(recording)?)
            .await
    }

    async fn replace_recording_if_status(
        &self,
        recording: &Recording,
        expected: RecordingStatus,
    ) -> Result<bool> {
        let guard = doc! { "status": mongodb::bson::to_bson(&expected)
            .expect("recording status serializes") };
        self.engine
            .replace_if(RECORDINGS, &recording.recording_id, guard, to_document(recording)?)
            .await
    }

    async fn delete_recording(&self, recording_id: &str) -> Result<bool> {
        self.engine.delete(RECORDINGS, recording_id).await
    }

    async fn recordings_page(
        &self,
        room_id: Option<&str>,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<(Vec<Recording>, Option<String>)> {
        let filter = match room_id {
            Some(room_id) => doc! { "roomId": room_id },
            None => doc! {},
        };

        let page = self
            .engine
            .find_page(
                RECORDINGS,
                filter,
                PageRequest {
                    sort_field: "updatedAt".to_owned(),
                    order: SortOrder::Descending,
                    cursor,
                    limit,
                },
            )
            .await?;

        let recordings = page
            .items
            .into_iter()
            .map(from_document)
            .collect::<Result<Vec<_>>>()?;
        Ok((recordings, page.next_cursor))
    }

    async fn recordings_of_room(&self, room_id: &str) -> Result<Vec<Recording>> {
        self.engine
            .find_all(RECORDINGS, doc! { "roomId": room_id })
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    async fn non_terminal_recordings(&self) -> Result<Vec<Recording>> {
        self.engine
            .find_all(RECORDINGS, doc! { "status": { "$in": non_terminal_statuses() } })
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }
}
