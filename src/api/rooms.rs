use axum::{
    extract::{Path, Query},
    response::IntoResponse,
    Json,
};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::AdminUser;
use crate::{
    database::cursor::Cursor,
    service::rooms::{
        AutoDeletionPolicy, CreateRoomRequest, DeletionOutcome, DeletionPolicyWithMeeting,
        DeletionPolicyWithRecordings, Room, RoomStatus,
    },
    services, Error, ErrorKind, Result,
};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub max_items: Option<usize>,
    pub next_page_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomsPage {
    pub rooms: Vec<Room>,
    pub next_page_token: Option<String>,
}

pub(super) fn page_limit(max_items: Option<usize>) -> usize {
    max_items.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

pub(super) fn decode_cursor(token: Option<String>) -> Result<Option<Cursor>> {
    token.as_deref().map(Cursor::decode).transpose()
}

pub async fn create_room(
    AdminUser(claims): AdminUser,
    Json(request): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse> {
    let room = services()
        .rooms
        .create_room(request, Some(claims.sub))
        .await?;
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn list_rooms(
    _admin: AdminUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<RoomsPage>> {
    let cursor = decode_cursor(query.next_page_token)?;
    let (rooms, next_page_token) = services()
        .rooms
        .rooms_page(cursor, page_limit(query.max_items))
        .await?;
    Ok(Json(RoomsPage {
        rooms,
        next_page_token,
    }))
}

pub async fn get_room(_admin: AdminUser, Path(room_id): Path<String>) -> Result<Json<Room>> {
    Ok(Json(services().rooms.room(&room_id).await?))
}

#[derive(Deserialize)]
pub struct StatusPatch {
    pub status: RoomStatus,
}

pub async fn update_status(
    _admin: AdminUser,
    Path(room_id): Path<String>,
    Json(patch): Json<StatusPatch>,
) -> Result<Json<Room>> {
    let room = services()
        .rooms
        .update_status(&room_id, patch.status)
        .await?;
    Ok(Json(room))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteQuery {
    pub with_meeting: Option<DeletionPolicyWithMeeting>,
    pub with_recordings: Option<DeletionPolicyWithRecordings>,
    pub force: Option<bool>,
}

pub async fn delete_room(
    _admin: AdminUser,
    Path(room_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse> {
    if query.force == Some(true)
        && (query.with_meeting.is_some() || query.with_recordings.is_some())
    {
        return Err(Error::BadRequest(
            ErrorKind::Validation,
            "force cannot be combined with explicit policies",
        ));
    }

    let policy_override = if query.force == Some(true) {
        Some(AutoDeletionPolicy {
            with_meeting: DeletionPolicyWithMeeting::Force,
            with_recordings: DeletionPolicyWithRecordings::Force,
        })
    } else if query.with_meeting.is_some() || query.with_recordings.is_some() {
        Some(AutoDeletionPolicy {
            with_meeting: query.with_meeting.unwrap_or_default(),
            with_recordings: query.with_recordings.unwrap_or_default(),
        })
    } else {
        None
    };

    match services()
        .rooms
        .delete_room(&room_id, policy_override)
        .await?
    {
        DeletionOutcome::Deleted => Ok(StatusCode::NO_CONTENT),
        DeletionOutcome::Deferred => Ok(StatusCode::ACCEPTED),
    }
}
