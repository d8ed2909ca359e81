use axum::{extract::Path, response::IntoResponse, Json};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::{AdminUser, AuthedUser, InternalCaller};
use crate::{
    service::users::{ApiKey, Role},
    services, Result,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user_id: String,
    pub password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub name: String,
    pub role: Role,
    pub must_change_password: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserInfo,
}

pub async fn login(Json(request): Json<LoginRequest>) -> Result<Json<SessionResponse>> {
    let (user, tokens) = services()
        .users
        .login(&request.user_id, &request.password)
        .await?;

    Ok(Json(SessionResponse {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        user: UserInfo {
            user_id: user.user_id,
            name: user.name,
            role: user.role,
            must_change_password: user.must_change_password,
        },
    }))
}

/// Sessions are stateless JWTs; logout exists so clients have a uniform
/// endpoint to call while discarding their tokens.
pub async fn logout(_user: AuthedUser) -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(Json(request): Json<RefreshRequest>) -> Result<Json<SessionResponse>> {
    let (user, tokens) = services()
        .users
        .refresh_session(&request.refresh_token)
        .await?;

    Ok(Json(SessionResponse {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        user: UserInfo {
            user_id: user.user_id,
            name: user.name,
            role: user.role,
            must_change_password: user.must_change_password,
        },
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub new_password: String,
}

pub async fn change_password(
    AuthedUser(claims): AuthedUser,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse> {
    services()
        .users
        .change_password(&claims.sub, &request.new_password)
        .await?;
    Ok(StatusCode::OK)
}

pub async fn create_api_key(_admin: AdminUser) -> Result<impl IntoResponse> {
    let key = services().users.create_api_key().await?;
    Ok((StatusCode::CREATED, Json(key)))
}

pub async fn list_api_keys(_caller: InternalCaller) -> Result<Json<Vec<ApiKey>>> {
    Ok(Json(services().users.api_keys().await?))
}

pub async fn delete_api_key(
    _admin: AdminUser,
    Path(key_id): Path<String>,
) -> Result<impl IntoResponse> {
    services().users.delete_api_key(&key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
