mod data;

pub use data::Data;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{services, utils, Error, ErrorKind, Result};

const API_KEY_PREFIX: &str = "ovmeet-api-key-";
const API_KEY_LENGTH: usize = 36;
const DEFAULT_ADMIN: &str = "admin";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
    RoomMember,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub role: Role,
    pub password_hash: String,
    pub must_change_password: bool,
    pub creation_date: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub key_id: String,
    pub key: String,
    pub creation_date: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub role: Role,
    /// "access" or "refresh"
    pub typ: String,
    pub iat: u64,
    pub exp: u64,
}

#[derive(Debug)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Creates the admin account on first run, the way a fresh deployment
    /// bootstraps itself.
    pub async fn bootstrap_admin(&self) -> Result<()> {
        if self.db.user(DEFAULT_ADMIN).await?.is_some() {
            return Ok(());
        }

        let configured = services()
            .globals
            .config
            .initial_admin_password
            .clone();
        let (password, must_change) = match configured {
            Some(password) => (password, false),
            None => (utils::random_string(16), true),
        };

        let user = User {
            user_id: DEFAULT_ADMIN.to_owned(),
            name: "Administrator".to_owned(),
            role: Role::Admin,
            password_hash: utils::calculate_password_hash(&password)
                .map_err(|_| Error::bad_database("Could not hash the admin password"))?,
            must_change_password: must_change,
            creation_date: utils::millis_since_unix_epoch() as i64,
        };
        self.db.create_user(&user).await?;

        if must_change {
            warn!("Created admin user with a generated password: {password} (change it immediately)");
        } else {
            info!("Created admin user");
        }
        Ok(())
    }

    pub async fn user(&self, user_id: &str) -> Result<User> {
        self.db
            .user(user_id)
            .await?
            .ok_or(Error::BadRequest(ErrorKind::NotFound, "User not found"))
    }

    #[tracing::instrument(skip(self, password))]
    pub async fn login(&self, user_id: &str, password: &str) -> Result<(User, TokenPair)> {
        let user = self.db.user(user_id).await?.ok_or(Error::BadRequest(
            ErrorKind::Unauthenticated,
            "Wrong username or password",
        ))?;

        if !utils::verify_password_hash(&user.password_hash, password) {
            return Err(Error::BadRequest(
                ErrorKind::Unauthenticated,
                "Wrong username or password",
            ));
        }

        let tokens = self.mint_session(&user)?;
        Ok((user, tokens))
    }

    pub async fn change_password(&self, user_id: &str, new_password: &str) -> Result<()> {
        if new_password.len() < 8 {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "Password must be at least 8 characters",
            ));
        }
        let mut user = self.user(user_id).await?;
        user.password_hash = utils::calculate_password_hash(new_password)
            .map_err(|_| Error::bad_database("Could not hash the password"))?;
        user.must_change_password = false;
        self.db.replace_user(&user).await
    }

    fn mint_session(&self, user: &User) -> Result<TokenPair> {
        let config = &services().globals.config;
        let now = utils::secs_since_unix_epoch();

        Ok(TokenPair {
            access_token: self.mint_token(
                user,
                "access",
                now,
                now + config.access_token_expiration.as_secs(),
            )?,
            refresh_token: self.mint_token(
                user,
                "refresh",
                now,
                now + config.refresh_token_expiration.as_secs(),
            )?,
        })
    }

    fn mint_token(&self, user: &User, typ: &str, iat: u64, exp: u64) -> Result<String> {
        let secret = services().globals.config.token_secret();
        Ok(jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &SessionClaims {
                sub: user.user_id.clone(),
                role: user.role,
                typ: typ.to_owned(),
                iat,
                exp,
            },
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )?)
    }

    pub fn validate_token(&self, token: &str, expected_typ: &str) -> Result<SessionClaims> {
        let secret = services().globals.config.token_secret();
        let claims = jsonwebtoken::decode::<SessionClaims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
            &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
        )
        .map_err(|_| Error::BadRequest(ErrorKind::Unauthenticated, "Invalid or expired token"))?
        .claims;

        if claims.typ != expected_typ {
            return Err(Error::BadRequest(
                ErrorKind::Unauthenticated,
                "Wrong token type",
            ));
        }
        Ok(claims)
    }

    /// Trades a refresh token for a new session pair.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<(User, TokenPair)> {
        let claims = self.validate_token(refresh_token, "refresh")?;
        let user = self.user(&claims.sub).await?;
        let tokens = self.mint_session(&user)?;
        Ok((user, tokens))
    }

    /// Community edition allows a single active API key; creating another one
    /// while one exists is a pro feature.
    #[tracing::instrument(skip(self))]
    pub async fn create_api_key(&self) -> Result<ApiKey> {
        if !self.db.api_keys().await?.is_empty() {
            return Err(Error::BadRequest(
                ErrorKind::ProFeature,
                "Multiple API keys require a pro subscription",
            ));
        }

        let key = ApiKey {
            key_id: utils::random_id(12),
            key: format!("{API_KEY_PREFIX}{}", utils::random_string(API_KEY_LENGTH)),
            creation_date: utils::millis_since_unix_epoch() as i64,
        };
        self.db.insert_api_key(&key).await?;
        Ok(key)
    }

    pub async fn api_keys(&self) -> Result<Vec<ApiKey>> {
        self.db.api_keys().await
    }

    pub async fn delete_api_key(&self, key_id: &str) -> Result<()> {
        if !self.db.delete_api_key(key_id).await? {
            return Err(Error::BadRequest(ErrorKind::NotFound, "API key not found"));
        }
        Ok(())
    }

    pub async fn validate_api_key(&self, presented: &str) -> Result<()> {
        let valid = self
            .db
            .api_keys()
            .await?
            .iter()
            .any(|key| key.key == presented);
        if !valid {
            return Err(Error::BadRequest(
                ErrorKind::Unauthenticated,
                "Invalid API key",
            ));
        }
        Ok(())
    }
}
