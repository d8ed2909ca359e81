use axum::{
    extract::{Path, Query},
    response::{IntoResponse, Redirect},
    Json,
};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::{rooms::page_limit, AdminUser};
use crate::{
    api::rooms::decode_cursor, service::recordings::Recording, services, Error, ErrorKind, Result,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub room_id: String,
}

pub async fn start_recording(
    _admin: AdminUser,
    Json(request): Json<StartRequest>,
) -> Result<impl IntoResponse> {
    let recording = services().recordings.start(&request.room_id).await?;
    Ok((StatusCode::CREATED, Json(recording)))
}

pub async fn stop_recording(
    _admin: AdminUser,
    Path(recording_id): Path<String>,
) -> Result<impl IntoResponse> {
    services().recordings.stop(&recording_id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub room_id: Option<String>,
    pub max_items: Option<usize>,
    pub next_page_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingsPage {
    pub recordings: Vec<Recording>,
    pub next_page_token: Option<String>,
}

pub async fn list_recordings(
    _admin: AdminUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<RecordingsPage>> {
    let cursor = decode_cursor(query.next_page_token)?;
    let (recordings, next_page_token) = services()
        .recordings
        .recordings_page(
            query.room_id.as_deref(),
            cursor,
            page_limit(query.max_items),
        )
        .await?;
    Ok(Json(RecordingsPage {
        recordings,
        next_page_token,
    }))
}

pub async fn get_recording(
    _admin: AdminUser,
    Path(recording_id): Path<String>,
) -> Result<Json<Recording>> {
    Ok(Json(services().recordings.recording(&recording_id).await?))
}

pub async fn delete_recording(
    _admin: AdminUser,
    Path(recording_id): Path<String>,
) -> Result<impl IntoResponse> {
    services().recordings.delete(&recording_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct MediaQuery {
    pub secret: Option<String>,
}

/// Share-link download: no session required, the recording access secret is
/// the credential.
pub async fn recording_media(
    Path(recording_id): Path<String>,
    Query(query): Query<MediaQuery>,
) -> Result<impl IntoResponse> {
    let secret = query.secret.ok_or(Error::BadRequest(
        ErrorKind::Validation,
        "Missing recording access secret",
    ))?;
    let url = services()
        .recordings
        .media_url(&recording_id, &secret)
        .await?;
    Ok(Redirect::temporary(url.as_str()))
}
