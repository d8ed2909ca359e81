use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    service::recordings::RecordingStatus, services, utils, Error, ErrorKind, Result,
};

/// How long server-to-server API tokens stay valid.
const SERVER_TOKEN_TTL_SECS: u64 = 10 * 60;

/// Capability tiers inside a room. Each tier grants strictly less than the
/// one above it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Moderator,
    #[default]
    Publisher,
    Viewer,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoGrants {
    #[serde(skip_serializing_if = "Option::is_none")]
    room: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    room_join: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    room_create: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    room_list: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    room_admin: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    room_record: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    can_publish: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    can_subscribe: Option<bool>,
}

#[derive(Serialize)]
struct TokenClaims {
    iss: String,
    sub: String,
    nbf: u64,
    exp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<String>,
    video: VideoGrants,
}

#[derive(Deserialize)]
struct WebhookClaims {
    #[allow(dead_code)]
    iss: String,
    sha256: String,
}

/// One egress event, normalized for the recording state engine.
#[derive(Clone, Debug)]
pub struct EgressInfo {
    pub egress_id: String,
    pub room_id: String,
    pub status: RecordingStatus,
    pub filename: Option<String>,
    pub size: Option<i64>,
    /// Seconds.
    pub duration: Option<f64>,
    /// Epoch millis.
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub error: Option<String>,
}

/// Inbound media-server webhook, after signature validation.
#[derive(Clone, Debug)]
pub enum WebhookEvent {
    RoomStarted { room_id: String },
    RoomFinished { room_id: String },
    ParticipantJoined { room_id: String, name: String },
    ParticipantLeft { room_id: String, name: String },
    Egress(EgressInfo),
    Ignored(String),
}

/// REST client for a LiveKit-class media server. All calls authenticate with
/// short-lived HS256 JWTs minted from the configured API key pair.
pub struct Service;

impl Service {
    fn sign(&self, claims: &TokenClaims) -> Result<String> {
        let secret = &services().globals.config.media_server.api_secret;
        Ok(jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )?)
    }

    fn server_token(&self, grants: VideoGrants) -> Result<String> {
        let config = &services().globals.config;
        let now = utils::secs_since_unix_epoch();
        self.sign(&TokenClaims {
            iss: config.media_server.api_key.clone(),
            sub: "ovmeet-control-plane".to_owned(),
            nbf: now,
            exp: now + SERVER_TOKEN_TTL_SECS,
            name: None,
            metadata: None,
            video: grants,
        })
    }

    /// Join token for a participant whose name reservation succeeded. The
    /// token identity is the reservation token so departures can be
    /// correlated even after renames.
    pub fn participant_token(
        &self,
        room_id: &str,
        identity: &str,
        name: &str,
        role: ParticipantRole,
    ) -> Result<String> {
        let config = &services().globals.config;
        let now = utils::secs_since_unix_epoch();

        let grants = VideoGrants {
            room: Some(room_id.to_owned()),
            room_join: true,
            room_admin: role == ParticipantRole::Moderator,
            can_publish: Some(role != ParticipantRole::Viewer),
            can_subscribe: Some(true),
            ..Default::default()
        };

        self.sign(&TokenClaims {
            iss: config.media_server.api_key.clone(),
            sub: identity.to_owned(),
            nbf: now,
            exp: now + config.participant_token_expiration.as_secs(),
            name: Some(name.to_owned()),
            metadata: None,
            video: grants,
        })
    }

    async fn twirp(
        &self,
        service: &str,
        method: &str,
        token: String,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let config = &services().globals.config;
        let url = config
            .media_server
            .url
            .join(&format!("twirp/livekit.{service}/{method}"))
            .map_err(|_| Error::bad_config("Invalid media server url"))?;

        let response = services()
            .globals
            .default_client()
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            debug!("Media server {service}/{method} returned {status}: {text}");
            return Err(Error::BadMediaServerResponse(
                "Media server rejected the request",
            ));
        }

        serde_json::from_str(&text)
            .map_err(|_| Error::bad_media_server_response("Media server returned malformed JSON"))
    }

    /// Creates the media-server room for a meeting, carrying the creator and
    /// room options in its metadata.
    #[tracing::instrument(skip(self, metadata))]
    pub async fn create_room(&self, room_id: &str, metadata: serde_json::Value) -> Result<()> {
        let config = &services().globals.config;
        let token = self.server_token(VideoGrants {
            room_create: true,
            ..Default::default()
        })?;

        self.twirp(
            "RoomService",
            "CreateRoom",
            token,
            serde_json::json!({
                "name": room_id,
                "emptyTimeout": config.meeting_empty_timeout.as_secs(),
                "departureTimeout": config.meeting_departure_timeout.as_secs(),
                "metadata": metadata.to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    /// Terminates the meeting. A room the media server no longer knows about
    /// counts as success.
    #[tracing::instrument(skip(self))]
    pub async fn delete_room(&self, room_id: &str) -> Result<()> {
        let token = self.server_token(VideoGrants {
            room_create: true,
            room_admin: true,
            room: Some(room_id.to_owned()),
            ..Default::default()
        })?;

        match self
            .twirp(
                "RoomService",
                "DeleteRoom",
                token,
                serde_json::json!({ "room": room_id }),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::BadMediaServerResponse(_)) => {
                warn!("Meeting {room_id} was already gone on the media server");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_participant(&self, room_id: &str, identity: &str) -> Result<()> {
        let token = self.server_token(VideoGrants {
            room_admin: true,
            room: Some(room_id.to_owned()),
            ..Default::default()
        })?;

        self.twirp(
            "RoomService",
            "RemoveParticipant",
            token,
            serde_json::json!({ "room": room_id, "identity": identity }),
        )
        .await?;
        Ok(())
    }

    /// Starts a room-composite egress writing to the shared media bucket.
    /// Returns the egress id the webhook events will carry.
    #[tracing::instrument(skip(self))]
    pub async fn start_room_egress(&self, room_id: &str, recording_id: &str) -> Result<String> {
        let token = self.server_token(VideoGrants {
            room_record: true,
            room: Some(room_id.to_owned()),
            ..Default::default()
        })?;

        let response = self
            .twirp(
                "Egress",
                "StartRoomCompositeEgress",
                token,
                serde_json::json!({
                    "roomName": room_id,
                    "layout": "grid",
                    "fileOutputs": [{
                        "filepath": format!("recordings/{recording_id}.mp4"),
                    }],
                }),
            )
            .await?;

        response
            .get("egressId")
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned)
            .ok_or(Error::BadMediaServerResponse(
                "Egress start response carried no egressId",
            ))
    }

    #[tracing::instrument(skip(self))]
    pub async fn stop_egress(&self, egress_id: &str) -> Result<()> {
        let token = self.server_token(VideoGrants {
            room_record: true,
            ..Default::default()
        })?;

        self.twirp(
            "Egress",
            "StopEgress",
            token,
            serde_json::json!({ "egressId": egress_id }),
        )
        .await?;
        Ok(())
    }

    /// Validates the webhook signature (a JWT over the body digest) and
    /// normalizes the event.
    pub fn parse_webhook(&self, authorization: &str, body: &str) -> Result<WebhookEvent> {
        let secret = &services().globals.config.media_server.api_secret;

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let token = authorization.trim().trim_start_matches("Bearer ").trim();
        let claims = jsonwebtoken::decode::<WebhookClaims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(|_| Error::BadRequest(ErrorKind::Unauthenticated, "Invalid webhook signature"))?
        .claims;

        let digest = hex::encode(Sha256::digest(body.as_bytes()));
        let claimed = claims.sha256.to_lowercase();
        // Older media servers send the digest base64 encoded
        let claimed_hex = if claimed.len() == 64 {
            claimed
        } else {
            use base64::{engine::general_purpose, Engine};
            general_purpose::STANDARD
                .decode(&claims.sha256)
                .map(hex::encode)
                .map_err(|_| {
                    Error::BadRequest(ErrorKind::Unauthenticated, "Invalid webhook signature")
                })?
        };
        if digest != claimed_hex {
            return Err(Error::BadRequest(
                ErrorKind::Unauthenticated,
                "Webhook body does not match its signature",
            ));
        }

        Self::normalize_webhook(body)
    }

    fn normalize_webhook(body: &str) -> Result<WebhookEvent> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|_| Error::BadRequest(ErrorKind::Validation, "Malformed webhook body"))?;

        let event = value.get("event").and_then(|v| v.as_str()).unwrap_or("");
        let room_id = value
            .get("room")
            .and_then(|r| r.get("name"))
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned);

        let webhook = match event {
            "room_started" => WebhookEvent::RoomStarted {
                room_id: room_id.ok_or(Error::BadRequest(
                    ErrorKind::Validation,
                    "room_started without a room",
                ))?,
            },
            "room_finished" => WebhookEvent::RoomFinished {
                room_id: room_id.ok_or(Error::BadRequest(
                    ErrorKind::Validation,
                    "room_finished without a room",
                ))?,
            },
            "participant_joined" | "participant_left" => {
                let name = value
                    .get("participant")
                    .and_then(|p| p.get("name").or_else(|| p.get("identity")))
                    .and_then(|v| v.as_str())
                    .map(ToOwned::to_owned);
                let (Some(room_id), Some(name)) = (room_id, name) else {
                    return Err(Error::BadRequest(
                        ErrorKind::Validation,
                        "participant event without room or participant",
                    ));
                };
                if event == "participant_joined" {
                    WebhookEvent::ParticipantJoined { room_id, name }
                } else {
                    WebhookEvent::ParticipantLeft { room_id, name }
                }
            }
            "egress_started" | "egress_updated" | "egress_ended" => {
                let info = value.get("egressInfo").ok_or(Error::BadRequest(
                    ErrorKind::Validation,
                    "egress event without egressInfo",
                ))?;
                WebhookEvent::Egress(Self::parse_egress_info(info)?)
            }
            other => WebhookEvent::Ignored(other.to_owned()),
        };

        Ok(webhook)
    }

    fn parse_egress_info(info: &serde_json::Value) -> Result<EgressInfo> {
        let egress_id = info
            .get("egressId")
            .and_then(|v| v.as_str())
            .ok_or(Error::BadRequest(
                ErrorKind::Validation,
                "egressInfo without egressId",
            ))?
            .to_owned();
        let room_id = info
            .get("roomName")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();

        let status = match info.get("status").and_then(|v| v.as_str()).unwrap_or("") {
            "EGRESS_STARTING" => RecordingStatus::Starting,
            "EGRESS_ACTIVE" => RecordingStatus::Active,
            "EGRESS_ENDING" => RecordingStatus::Ending,
            "EGRESS_COMPLETE" => RecordingStatus::Complete,
            "EGRESS_FAILED" => RecordingStatus::Failed,
            "EGRESS_ABORTED" => RecordingStatus::Aborted,
            "EGRESS_LIMIT_REACHED" => RecordingStatus::LimitReached,
            _ => {
                return Err(Error::BadRequest(
                    ErrorKind::Validation,
                    "Unknown egress status",
                ))
            }
        };

        // File results carry nanosecond timestamps and byte sizes
        let file = info
            .get("fileResults")
            .and_then(|v| v.as_array())
            .and_then(|files| files.first());

        let filename = file
            .and_then(|f| f.get("filename"))
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned);
        let size = file
            .and_then(|f| f.get("size"))
            .and_then(Self::lenient_i64);
        let duration = file
            .and_then(|f| f.get("duration"))
            .and_then(Self::lenient_i64)
            .map(|nanos| nanos as f64 / 1_000_000_000.0);
        let started_at = file
            .and_then(|f| f.get("startedAt"))
            .and_then(Self::lenient_i64)
            .map(|nanos| nanos / 1_000_000);
        let ended_at = file
            .and_then(|f| f.get("endedAt"))
            .and_then(Self::lenient_i64)
            .map(|nanos| nanos / 1_000_000);
        let error = info
            .get("error")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned);

        Ok(EgressInfo {
            egress_id,
            room_id,
            status,
            filename,
            size,
            duration,
            started_at,
            ended_at,
            error,
        })
    }

    /// Protobuf-JSON encodes 64-bit numbers as strings.
    fn lenient_i64(value: &serde_json::Value) -> Option<i64> {
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn egress_info_parses_protobuf_json() {
        let info = serde_json::json!({
            "egressId": "EG_123",
            "roomName": "demo-abc",
            "status": "EGRESS_COMPLETE",
            "fileResults": [{
                "filename": "recordings/demo-abc--xyz.mp4",
                "size": "1048576",
                "duration": "120000000000",
                "startedAt": "1700000000000000000",
                "endedAt": "1700000120000000000",
            }],
        });

        let parsed = Service::parse_egress_info(&info).unwrap();
        assert_eq!(parsed.egress_id, "EG_123");
        assert_eq!(parsed.status, RecordingStatus::Complete);
        assert_eq!(parsed.size, Some(1_048_576));
        assert_eq!(parsed.duration, Some(120.0));
        assert_eq!(parsed.started_at, Some(1_700_000_000_000));
    }

    #[test]
    fn unknown_events_are_ignored_not_errors() {
        let body = serde_json::json!({ "event": "track_published" }).to_string();
        assert!(matches!(
            Service::normalize_webhook(&body).unwrap(),
            WebhookEvent::Ignored(_)
        ));
    }

    #[test]
    fn room_events_need_a_room() {
        let body = serde_json::json!({ "event": "room_started" }).to_string();
        assert!(Service::normalize_webhook(&body).is_err());

        let body = serde_json::json!({
            "event": "room_started",
            "room": { "name": "demo-abc" },
        })
        .to_string();
        assert!(matches!(
            Service::normalize_webhook(&body).unwrap(),
            WebhookEvent::RoomStarted { room_id } if room_id == "demo-abc"
        ));
    }
}
