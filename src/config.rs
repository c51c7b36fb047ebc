// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use serde_derive::Deserialize;

pub const DEFAULT_BASE_URL: &str = "https://api.rlpp.psynet.gg/rpc";
pub const DEFAULT_GAME_VERSION: &str = "250811.43331.492665";
pub const DEFAULT_FEATURE_SET: &str = "PrimeUpdate55_1";
pub const DEFAULT_BUILD_ID: &str = "151471783";
pub const DEFAULT_ENVIRONMENT: &str = "Prod";

/// Settings supplied by the embedding application. Everything except the
/// signing key has a default matching the current game build.
///
/// Durations are given in milliseconds when deserialized.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub signing_key: String,
    #[serde(default = "default_build_id")]
    pub build_id: String,
    #[serde(default = "default_game_version")]
    pub game_version: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_feature_set")]
    pub feature_set: String,
    #[serde(default = "default_ping_interval", with = "millis")]
    pub ping_interval: Duration,
    #[serde(default = "default_pong_timeout", with = "millis")]
    pub pong_timeout: Duration,
    #[serde(default = "default_http_timeout", with = "millis")]
    pub http_timeout: Duration,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_request_id_prefix")]
    pub request_id_prefix: String,
}

impl Config {
    pub fn new<S: Into<String>>(signing_key: S) -> Config {
        Config {
            base_url: default_base_url(),
            signing_key: signing_key.into(),
            build_id: default_build_id(),
            game_version: default_game_version(),
            environment: default_environment(),
            feature_set: default_feature_set(),
            ping_interval: default_ping_interval(),
            pong_timeout: default_pong_timeout(),
            http_timeout: default_http_timeout(),
            event_capacity: default_event_capacity(),
            request_id_prefix: default_request_id_prefix(),
        }
    }

    /// User agent sent when dialing the WebSocket.
    pub fn socket_user_agent(&self) -> String {
        format!("RL Win/{} gzip", self.game_version)
    }

    /// User agent sent with bootstrap HTTP requests.
    pub fn http_user_agent(&self) -> String {
        format!(
            "RL Win/{} gzip (x86_64-pc-win32) curl-7.67.0 Schannel",
            self.game_version
        )
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_build_id() -> String {
    DEFAULT_BUILD_ID.to_string()
}

fn default_game_version() -> String {
    DEFAULT_GAME_VERSION.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

fn default_feature_set() -> String {
    DEFAULT_FEATURE_SET.to_string()
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_pong_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_event_capacity() -> usize {
    64
}

fn default_request_id_prefix() -> String {
    crate::protocol::DEFAULT_REQUEST_ID_PREFIX.to_string()
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new("key");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.environment, "Prod");
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.socket_user_agent(), "RL Win/250811.43331.492665 gzip");
        assert!(config.http_user_agent().ends_with("curl-7.67.0 Schannel"));
    }

    #[test]
    fn deserialize_with_overrides() {
        let config: Config = serde_json::from_str(
            r#"{
                "signing_key": "secret",
                "base_url": "http://127.0.0.1:8080/rpc",
                "ping_interval": 250,
                "pong_timeout": 100
            }"#,
        )
        .unwrap();
        assert_eq!(config.signing_key, "secret");
        assert_eq!(config.base_url, "http://127.0.0.1:8080/rpc");
        assert_eq!(config.ping_interval, Duration::from_millis(250));
        assert_eq!(config.pong_timeout, Duration::from_millis(100));
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.event_capacity, 64);
    }

    #[test]
    fn signing_key_is_required() {
        assert!(serde_json::from_str::<Config>("{}").is_err());
    }
}
