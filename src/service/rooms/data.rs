use async_trait::async_trait;

use super::{Room, RoomStatus};
use crate::{database::cursor::Cursor, Result};

#[async_trait]
pub trait Data: Send + Sync {
    async fn insert_room(&self, room: &Room) -> Result<()>;

    async fn room(&self, room_id: &str) -> Result<Option<Room>>;

    async fn replace_room(&self, room: &Room) -> Result<()>;

    /// Conditional write guarding a state transition; returns false when the
    /// stored status no longer matches `expected`.
    async fn replace_room_if_status(&self, room: &Room, expected: RoomStatus) -> Result<bool>;

    async fn delete_room(&self, room_id: &str) -> Result<bool>;

    async fn rooms_page(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<(Vec<Room>, Option<String>)>;

    /// Rooms whose auto-deletion date has passed.
    async fn rooms_due_for_deletion(&self, now: i64) -> Result<Vec<Room>>;
}
