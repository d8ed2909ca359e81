mod data;

pub use data::Data;
use serde::{Deserialize, Serialize};

use crate::{Error, ErrorKind, Result};

/// Project-wide singleton settings, editable over the config API and
/// schema-versioned like every other collection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default)]
    pub security_config: SecurityConfig,
    #[serde(default)]
    pub webhooks_config: WebhooksConfig,
    #[serde(default)]
    pub rooms_config: RoomsConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    /// When set, minting a participant token requires a logged-in user.
    #[serde(default)]
    pub authentication_required: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhooksConfig {
    #[serde(default)]
    pub enabled: bool,
    pub url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomsConfig {
    pub appearance: RoomsAppearanceConfig,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            appearance: RoomsAppearanceConfig {
                theme: "default".to_owned(),
                logo_url: None,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomsAppearanceConfig {
    pub theme: String,
    pub logo_url: Option<String>,
}

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    pub async fn global_config(&self) -> Result<GlobalConfig> {
        Ok(self.db.global_config().await?.unwrap_or_default())
    }

    pub async fn update_security(&self, security: SecurityConfig) -> Result<GlobalConfig> {
        let mut config = self.global_config().await?;
        config.security_config = security;
        self.db.put_global_config(&config).await?;
        Ok(config)
    }

    pub async fn update_webhooks(&self, webhooks: WebhooksConfig) -> Result<GlobalConfig> {
        if webhooks.enabled && webhooks.url.is_none() {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "Webhooks cannot be enabled without a url",
            ));
        }
        if let Some(url) = &webhooks.url {
            url::Url::parse(url).map_err(|_| {
                Error::BadRequest(ErrorKind::Validation, "Webhook url is not a valid url")
            })?;
        }

        let mut config = self.global_config().await?;
        config.webhooks_config = webhooks;
        self.db.put_global_config(&config).await?;
        Ok(config)
    }

    pub async fn update_rooms_appearance(
        &self,
        appearance: RoomsAppearanceConfig,
    ) -> Result<GlobalConfig> {
        let mut config = self.global_config().await?;
        config.rooms_config.appearance = appearance;
        self.db.put_global_config(&config).await?;
        Ok(config)
    }

    /// Webhook target, when outbound webhooks are configured and enabled.
    pub async fn webhook_url(&self) -> Result<Option<String>> {
        let config = self.global_config().await?;
        if !config.webhooks_config.enabled {
            return Ok(None);
        }
        Ok(config.webhooks_config.url)
    }

    /// Ensures the singleton row exists so the config API always has
    /// something to PATCH.
    pub async fn bootstrap(&self) -> Result<()> {
        if self.db.global_config().await?.is_none() {
            self.db.put_global_config(&GlobalConfig::default()).await?;
        }
        Ok(())
    }
}
