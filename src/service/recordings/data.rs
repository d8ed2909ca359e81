use async_trait::async_trait;

use super::{Recording, RecordingStatus};
use crate::{database::cursor::Cursor, Result};

#[async_trait]
pub trait Data: Send + Sync {
    async fn insert_recording(&self, recording: &Recording) -> Result<()>;

    async fn recording(&self, recording_id: &str) -> Result<Option<Recording>>;

    async fn recording_by_egress(&self, egress_id: &str) -> Result<Option<Recording>>;

    async fn replace_recording(&self, recording: &Recording) -> Result<()>;

    /// Conditional write for status transitions; false when the stored status
    /// no longer matches `expected`.
    async fn replace_recording_if_status(
        &self,
        recording: &Recording,
        expected: RecordingStatus,
    ) -> Result<bool>;

    async fn delete_recording(&self, recording_id: &str) -> Result<bool>;

    async fn recordings_page(
        &self,
        room_id: Option<&str>,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<(Vec<Recording>, Option<String>)>;

    async fn recordings_of_room(&self, room_id: &str) -> Result<Vec<Recording>>;

    /// Every recording still in a non-terminal status, across all rooms.
    async fn non_terminal_recordings(&self) -> Result<Vec<Recording>>;
}
