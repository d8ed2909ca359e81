use axum::{response::IntoResponse, Json};
use http::StatusCode;
use serde::Deserialize;

use super::AdminUser;
use crate::{
    service::settings::{RoomsAppearanceConfig, SecurityConfig, WebhooksConfig},
    services, Result,
};

pub async fn get_security(_admin: AdminUser) -> Result<Json<SecurityConfig>> {
    Ok(Json(services().settings.global_config().await?.security_config))
}

pub async fn put_security(
    _admin: AdminUser,
    Json(security): Json<SecurityConfig>,
) -> Result<Json<SecurityConfig>> {
    let config = services().settings.update_security(security).await?;
    Ok(Json(config.security_config))
}

pub async fn get_webhooks(_admin: AdminUser) -> Result<Json<WebhooksConfig>> {
    Ok(Json(services().settings.global_config().await?.webhooks_config))
}

pub async fn put_webhooks(
    _admin: AdminUser,
    Json(webhooks): Json<WebhooksConfig>,
) -> Result<Json<WebhooksConfig>> {
    let config = services().settings.update_webhooks(webhooks).await?;
    Ok(Json(config.webhooks_config))
}

#[derive(Deserialize)]
pub struct TestRequest {
    pub url: String,
}

/// Probes a candidate endpoint with a signed test event before the admin
/// commits to it.
pub async fn test_webhook(
    _admin: AdminUser,
    Json(request): Json<TestRequest>,
) -> Result<impl IntoResponse> {
    services().webhooks.test_delivery(&request.url).await?;
    Ok(StatusCode::OK)
}

pub async fn get_rooms_appearance(_admin: AdminUser) -> Result<Json<RoomsAppearanceConfig>> {
    Ok(Json(
        services()
            .settings
            .global_config()
            .await?
            .rooms_config
            .appearance,
    ))
}

pub async fn put_rooms_appearance(
    _admin: AdminUser,
    Json(appearance): Json<RoomsAppearanceConfig>,
) -> Result<Json<RoomsAppearanceConfig>> {
    let config = services()
        .settings
        .update_rooms_appearance(appearance)
        .await?;
    Ok(Json(config.rooms_config.appearance))
}
