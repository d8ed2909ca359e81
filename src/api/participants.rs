use axum::Json;
use http::{header, HeaderMap};
use serde::{Deserialize, Serialize};

use crate::{
    service::{media_server::ParticipantRole, rooms::RoomStatus},
    services, Error, ErrorKind, Result,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub room_id: String,
    pub participant_name: String,
    #[serde(default)]
    pub role: ParticipantRole,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    pub participant_name: String,
    pub reservation_token: String,
}

/// Mints a join token. This is the first-join path: an open room gets its
/// media-server room created here, lazily.
pub async fn create_token(
    headers: HeaderMap,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>> {
    let room = services().rooms.room(&request.room_id).await?;
    if room.status == RoomStatus::Closed {
        return Err(Error::Conflict("Room is closed"));
    }

    let security = services().settings.global_config().await?.security_config;
    if security.authentication_required {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(Error::BadRequest(
                ErrorKind::Unauthenticated,
                "This deployment requires authentication to join",
            ))?;
        services().users.validate_token(token.trim(), "access")?;
    }

    let reservation = services()
        .names
        .reserve(&request.room_id, &request.participant_name)
        .await?;

    if room.status == RoomStatus::Open {
        let metadata = serde_json::json!({
            "createdBy": room.created_by,
            "roomOptions": room.config,
        });
        services()
            .media_server
            .create_room(&room.room_id, metadata)
            .await?;
    }

    let token = services().media_server.participant_token(
        &room.room_id,
        &reservation.assigned_name,
        &reservation.assigned_name,
        request.role,
    )?;

    Ok(Json(TokenResponse {
        token,
        participant_name: reservation.assigned_name,
        reservation_token: reservation.reservation_token,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub room_id: String,
    pub participant_name: String,
    #[serde(default)]
    pub role: ParticipantRole,
}

/// Re-mints a token for a participant whose reservation is still live,
/// without touching the reservation itself.
pub async fn refresh_token(Json(request): Json<RefreshRequest>) -> Result<Json<TokenResponse>> {
    let active = services().names.active_names(&request.room_id).await?;
    if !active.contains(&request.participant_name) {
        return Err(Error::BadRequest(
            ErrorKind::NotFound,
            "No live reservation for this participant",
        ));
    }

    let token = services().media_server.participant_token(
        &request.room_id,
        &request.participant_name,
        &request.participant_name,
        request.role,
    )?;

    Ok(Json(TokenResponse {
        token,
        participant_name: request.participant_name.clone(),
        reservation_token: String::new(),
    }))
}
