use async_trait::async_trait;
use mongodb::bson::doc;

use super::{from_document, to_document};
use crate::{
    database::{
        abstraction::{PageRequest, SortOrder},
        cursor::Cursor,
        Database,
    },
    service::rooms::{Data, Room, RoomStatus},
    Result,
};

const ROOMS: &str = "rooms";

#[async_trait]
impl Data for Database {
    async fn insert_room(&self, room: &Room) -> Result<()> {
        self.engine
            .insert(ROOMS, &room.room_id, to_document(room)?)
            .await
    }

    async fn room(&self, room_id: &str) -> Result<Option<Room>> {
        self.engine
            .get(ROOMS, room_id)
            .await?
            .map(from_document)
            .transpose()
    }

    async fn replace_room(&self, room: &Room) -> Result<()> {
        self.engine
            .put(ROOMS, &room.room_id, to_document(room)?)
            .await
    }

    async fn replace_room_if_status(&self, room: &Room, expected: RoomStatus) -> Result<bool> {
        let guard = doc! { "status": mongodb::bson::to_bson(&expected)
            .expect("room status serializes") };
        self.engine
            .replace_if(ROOMS, &room.room_id, guard, to_document(room)?)
            .await
    }

    async fn delete_room(&self, room_id: &str) -> Result<bool> {
        self.engine.delete(ROOMS, room_id).await
    }

    async fn rooms_page(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<(Vec<Room>, Option<String>)> {
        let page = self
            .engine
            .find_page(
                ROOMS,
                doc! {},
                PageRequest {
                    sort_field: "creationDate".to_owned(),
                    order: SortOrder::Ascending,
                    cursor,
                    limit,
                },
            )
            .await?;

        let rooms = page
            .items
            .into_iter()
            .map(from_document)
            .collect::<Result<Vec<_>>>()?;
        Ok((rooms, page.next_cursor))
    }

    async fn rooms_due_for_deletion(&self, now: i64) -> Result<Vec<Room>> {
        self.engine
            .find_all(ROOMS, doc! { "autoDeletionDate": { "$lte": now } })
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }
}
