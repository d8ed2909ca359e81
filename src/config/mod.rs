use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use serde::{de::IgnoredAny, Deserialize};
use tracing::warn;
use url::Url;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    pub tls: Option<TlsConfig>,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Which persistence backend to use: "mongodb" (preferred), "blob"
    /// (legacy) or "memory" (single node, volatile).
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,
    #[serde(default = "default_mongodb_url")]
    pub mongodb_url: String,
    #[serde(default = "default_mongodb_database")]
    pub mongodb_database: String,
    pub blob: Option<BlobConfig>,

    pub media_server: MediaServerConfig,

    /// Secret for access/refresh tokens. Falls back to the media server API
    /// secret when unset.
    pub jwt_secret: Option<String>,
    pub initial_admin_password: Option<String>,

    #[serde(with = "humantime_serde", default = "default_access_token_expiration")]
    pub access_token_expiration: Duration,
    #[serde(with = "humantime_serde", default = "default_refresh_token_expiration")]
    pub refresh_token_expiration: Duration,
    #[serde(
        with = "humantime_serde",
        default = "default_participant_token_expiration"
    )]
    pub participant_token_expiration: Duration,

    #[serde(with = "humantime_serde", default = "default_room_gc_interval")]
    pub room_gc_interval: Duration,
    #[serde(
        with = "humantime_serde",
        default = "default_min_future_time_for_room_autodeletion_date"
    )]
    pub min_future_time_for_room_autodeletion_date: Duration,

    #[serde(with = "humantime_serde", default = "default_recording_lock_ttl")]
    pub recording_lock_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_recording_started_timeout")]
    pub recording_started_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_recording_stale_after")]
    pub recording_stale_after: Duration,
    #[serde(
        with = "humantime_serde",
        default = "default_recording_stale_cleanup_interval"
    )]
    pub recording_stale_cleanup_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_recording_lock_gc_interval")]
    pub recording_lock_gc_interval: Duration,
    #[serde(
        with = "humantime_serde",
        default = "default_recording_orphaned_lock_grace_period"
    )]
    pub recording_orphaned_lock_grace_period: Duration,

    #[serde(default = "default_participant_max_concurrent_name_requests")]
    pub participant_max_concurrent_name_requests: u32,
    #[serde(
        with = "humantime_serde",
        default = "default_participant_name_reservation_ttl"
    )]
    pub participant_name_reservation_ttl: Duration,

    #[serde(with = "humantime_serde", default = "default_meeting_empty_timeout")]
    pub meeting_empty_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_meeting_departure_timeout")]
    pub meeting_departure_timeout: Duration,

    #[serde(default = "default_webhook_max_attempts")]
    pub webhook_max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_webhook_backoff")]
    pub webhook_backoff: Duration,

    #[serde(default = "default_log")]
    pub log: String,

    #[serde(flatten)]
    pub catchall: BTreeMap<String, IgnoredAny>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TlsConfig {
    pub certs: String,
    pub key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MediaServerConfig {
    pub url: Url,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BlobConfig {
    pub endpoint: Url,
    pub bucket: String,
    #[serde(default = "default_blob_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

const DEPRECATED_KEYS: &[&str] = &["livekit_url", "database_path"];

impl Config {
    pub fn warn_deprecated(&self) {
        let mut was_deprecated = false;
        for key in self
            .catchall
            .keys()
            .filter(|key| DEPRECATED_KEYS.iter().any(|s| s == key))
        {
            warn!("Config parameter {} is deprecated", key);
            was_deprecated = true;
        }

        if was_deprecated {
            warn!("Read the ovmeet documentation and check your configuration if any new configuration parameters should be adjusted");
        }
    }

    pub fn token_secret(&self) -> &str {
        self.jwt_secret
            .as_deref()
            .unwrap_or(&self.media_server.api_secret)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = [
            ("Address", self.address.to_string()),
            ("Port", self.port.to_string()),
            ("Coordination store", self.redis_url.clone()),
            ("Storage backend", self.storage_backend.clone()),
            ("Media server", self.media_server.url.to_string()),
            (
                "JWT secret",
                match self.jwt_secret {
                    Some(_) => "set".to_owned(),
                    None => "derived from media server secret".to_owned(),
                },
            ),
            (
                "Room GC interval",
                humantime::format_duration(self.room_gc_interval).to_string(),
            ),
            (
                "Recording lock TTL",
                humantime::format_duration(self.recording_lock_ttl).to_string(),
            ),
            (
                "Name reservation TTL",
                humantime::format_duration(self.participant_name_reservation_ttl).to_string(),
            ),
        ];

        let mut msg: String = "Active config values:\n\n".to_owned();

        for (name, value) in lines {
            msg += &format!("{name}: {value}\n");
        }

        write!(f, "{msg}")
    }
}

fn default_address() -> IpAddr {
    Ipv4Addr::LOCALHOST.into()
}

fn default_port() -> u16 {
    6090
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

fn default_storage_backend() -> String {
    "mongodb".to_owned()
}

fn default_mongodb_url() -> String {
    "mongodb://127.0.0.1:27017".to_owned()
}

fn default_mongodb_database() -> String {
    "ovmeet".to_owned()
}

fn default_blob_region() -> String {
    "us-east-1".to_owned()
}

fn default_access_token_expiration() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_refresh_token_expiration() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_participant_token_expiration() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_room_gc_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_min_future_time_for_room_autodeletion_date() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_recording_lock_ttl() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_recording_started_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_recording_stale_after() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_recording_stale_cleanup_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_recording_lock_gc_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_recording_orphaned_lock_grace_period() -> Duration {
    Duration::from_secs(60)
}

fn default_participant_max_concurrent_name_requests() -> u32 {
    20
}

fn default_participant_name_reservation_ttl() -> Duration {
    Duration::from_secs(12 * 60 * 60)
}

fn default_meeting_empty_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_meeting_departure_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_webhook_max_attempts() -> u32 {
    5
}

fn default_webhook_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_log() -> String {
    "warn,ovmeet=info".to_owned()
}
