use axum::response::IntoResponse;
use http::{header, HeaderMap, StatusCode};
use tracing::{debug, warn};

use crate::{service::media_server::WebhookEvent, services, Error, ErrorKind, Result};

/// Inbound callbacks from the media server. The body is
/// `application/webhook+json` signed with a JWT over its digest.
pub async fn livekit_webhook(headers: HeaderMap, body: String) -> Result<impl IntoResponse> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::BadRequest(
            ErrorKind::Unauthenticated,
            "Missing webhook signature",
        ))?;

    let event = services().media_server.parse_webhook(authorization, &body)?;

    match event {
        WebhookEvent::RoomStarted { room_id } => {
            services().rooms.on_meeting_started(&room_id).await?;
        }
        WebhookEvent::RoomFinished { room_id } => {
            services().rooms.on_meeting_ended(&room_id).await?;
        }
        WebhookEvent::ParticipantJoined { room_id, name } => {
            debug!("Participant {name} joined {room_id}");
        }
        WebhookEvent::ParticipantLeft { room_id, name } => {
            if let Err(e) = services().names.release(&room_id, &name).await {
                warn!("Could not release name {name} in {room_id}: {e}");
            }
        }
        WebhookEvent::Egress(info) => {
            services().recordings.handle_egress_event(info).await?;
        }
        WebhookEvent::Ignored(event) => {
            debug!("Ignoring media server event {event}");
        }
    }

    Ok(StatusCode::OK)
}
