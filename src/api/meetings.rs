use axum::{extract::Path, response::IntoResponse};
use http::StatusCode;

use super::AdminUser;
use crate::{services, Result};

pub async fn end_meeting(
    _admin: AdminUser,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse> {
    services().rooms.end_meeting(&room_id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Kicks a participant out of a live meeting. Identities on the media server
/// are the assigned display names, so the path parameter is enough.
pub async fn kick_participant(
    _admin: AdminUser,
    Path((room_id, participant_name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    services()
        .media_server
        .remove_participant(&room_id, &participant_name)
        .await?;
    services().names.release(&room_id, &participant_name).await?;
    Ok(StatusCode::NO_CONTENT)
}
