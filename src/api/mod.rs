pub mod auth;
pub mod config;
pub mod media_webhook;
pub mod meetings;
pub mod participants;
pub mod recordings;
pub mod rooms;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    routing::{delete, get, patch, post, put},
    Router,
};
use http::{header, request::Parts};

use crate::{
    service::users::{Role, SessionClaims},
    services, Error, ErrorKind,
};

/// Claims of a logged-in user, any role.
pub struct AuthedUser(pub SessionClaims);

/// Claims of a logged-in admin.
pub struct AdminUser(pub SessionClaims);

/// A caller of the internal API: a valid API key, or an admin session.
pub struct InternalCaller;

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthedUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(Error::BadRequest(
            ErrorKind::Unauthenticated,
            "Missing access token",
        ))?;
        let claims = services().users.validate_token(token, "access")?;
        Ok(AuthedUser(claims))
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AdminUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let AuthedUser(claims) = AuthedUser::from_request_parts(parts, state).await?;
        if claims.role != Role::Admin {
            return Err(Error::BadRequest(
                ErrorKind::Forbidden,
                "Admin privileges required",
            ));
        }
        Ok(AdminUser(claims))
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for InternalCaller {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(api_key) = parts.headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            services().users.validate_api_key(api_key).await?;
            return Ok(InternalCaller);
        }
        AdminUser::from_request_parts(parts, state).await?;
        Ok(InternalCaller)
    }
}

pub fn routes() -> Router {
    Router::new()
        // Rooms
        .route("/api/v1/rooms", post(rooms::create_room).get(rooms::list_rooms))
        .route("/api/v1/rooms/:room_id", get(rooms::get_room).delete(rooms::delete_room))
        .route("/api/v1/rooms/:room_id/status", patch(rooms::update_status))
        // Meetings
        .route("/api/v1/meetings/:room_id/end", post(meetings::end_meeting))
        .route(
            "/api/v1/meetings/:room_id/participants/:participant_name",
            delete(meetings::kick_participant),
        )
        // Participants
        .route("/api/v1/participants/token", post(participants::create_token))
        .route(
            "/api/v1/participants/token/refresh",
            post(participants::refresh_token),
        )
        // Recordings
        .route(
            "/api/v1/recordings",
            get(recordings::list_recordings),
        )
        .route("/api/v1/recordings/start", post(recordings::start_recording))
        .route(
            "/api/v1/recordings/:recording_id",
            get(recordings::get_recording).delete(recordings::delete_recording),
        )
        .route(
            "/api/v1/recordings/:recording_id/stop",
            post(recordings::stop_recording),
        )
        .route(
            "/api/v1/recordings/:recording_id/media",
            get(recordings::recording_media),
        )
        // Global config
        .route(
            "/api/v1/config/security",
            get(config::get_security).put(config::put_security),
        )
        .route(
            "/api/v1/config/webhooks",
            get(config::get_webhooks).put(config::put_webhooks),
        )
        .route("/api/v1/config/webhooks/test", post(config::test_webhook))
        .route(
            "/api/v1/config/rooms/appearance",
            get(config::get_rooms_appearance).put(config::put_rooms_appearance),
        )
        // Auth
        .route("/api/v1/auth/login", post(auth::login))
        .route("/api/v1/auth/logout", post(auth::logout))
        .route("/api/v1/auth/refresh", post(auth::refresh))
        .route("/api/v1/auth/change-password", post(auth::change_password))
        // Internal API
        .route(
            "/internal-api/v1/api-keys",
            post(auth::create_api_key).get(auth::list_api_keys),
        )
        .route("/internal-api/v1/api-keys/:key_id", delete(auth::delete_api_key))
        // Media server callbacks
        .route("/livekit/webhook", post(media_webhook::livekit_webhook))
        .route("/", get(healthz))
}

async fn healthz() -> &'static str {
    "ovmeet is up"
}
