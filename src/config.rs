//! Client and session configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::SyncMode;

/// How aggressively the client tries to re-establish broken connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectMode {
    /// Capped exponential backoff with jitter.
    #[default]
    Normal,
    /// Never reconnect automatically. Used by tests that drive
    /// reconnection explicitly through `cancel_reconnect_delay()`.
    Testing,
}

/// Parameters of the exponential resumption-delay schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectBackoff {
    /// Upper bound on the delay between connect attempts, ms.
    pub max_resumption_delay_interval: u64,
    /// Delay after the first failure, ms.
    pub resumption_delay_interval: u64,
    /// Growth factor applied after each successive failure.
    pub resumption_delay_backoff_multiplier: u64,
    /// Each delay is jittered by `delay / delay_jitter_divisor` in either
    /// direction. 0 disables jitter.
    pub delay_jitter_divisor: u64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            max_resumption_delay_interval: 5 * 60 * 1000,
            resumption_delay_interval: 1000,
            resumption_delay_backoff_multiplier: 2,
            delay_jitter_divisor: 4,
        }
    }
}

/// Configuration of the sync client shared by all of its sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Upper bound on establishing a connection end to end (transport plus
    /// protocol handshake), ms.
    pub connect_timeout: u64,
    /// How long a connection without active sessions lingers before a
    /// voluntary disconnect, ms.
    pub connection_linger_time: u64,
    /// Period between keepalive PING messages, ms.
    pub ping_keepalive_period: u64,
    /// How long to wait for a PONG before giving up on the connection, ms.
    pub pong_keepalive_timeout: u64,
    /// A reconnect within this window of the previous disconnect counts as
    /// "fast" and lets sessions skip a MARK round-trip, ms.
    pub fast_reconnect_limit: u64,
    pub reconnect_mode: ReconnectMode,
    pub reconnect_backoff: ReconnectBackoff,
    /// When true every session gets a dedicated connection instead of
    /// pooling on `(endpoint, user)`.
    pub one_connection_per_session: bool,
    /// Map the `lagoon`/`lagoons` schemes to ports 80/443 instead of the
    /// native 7800/7801.
    pub enable_default_port_hack: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 2 * 60 * 1000,
            connection_linger_time: 30 * 1000,
            ping_keepalive_period: 60 * 1000,
            pong_keepalive_timeout: 2 * 60 * 1000,
            fast_reconnect_limit: 60 * 1000,
            reconnect_mode: ReconnectMode::Normal,
            reconnect_backoff: ReconnectBackoff::default(),
            one_connection_per_session: false,
            enable_default_port_hack: false,
        }
    }
}

/// What `close()` does to a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStopPolicy {
    /// Drop the session at once; pending uploads are abandoned.
    Immediately,
    /// Keep the session alive until local changes have been uploaded.
    #[default]
    AfterChangesUploaded,
    /// `close()` is a no-op; the session lives until the client shuts down.
    LiveIndefinitely,
}

/// How the client recovers when the server demands a client reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientResyncMode {
    /// Surface the error and stop; the application resolves it.
    Manual,
    /// Download a fresh copy and attempt to replay unsynced local changes.
    #[default]
    Recover,
    /// Recover if allowed by the server, otherwise discard local changes.
    RecoverOrDiscard,
    /// Discard unsynced local changes outright.
    DiscardLocal,
}

impl ClientResyncMode {
    pub fn recovery_is_allowed(self) -> bool {
        matches!(
            self,
            ClientResyncMode::Recover | ClientResyncMode::RecoverOrDiscard
        )
    }
}

/// Per-session configuration snapshot taken when the session is created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sync server URL (`lagoon://`, `lagoons://`, `ws://` or `wss://`).
    pub server_url: String,
    /// Path of the local database file this session syncs.
    pub store_path: PathBuf,
    pub mode: SyncMode,
    /// Partition value; required in partition mode, ignored in flexible.
    #[serde(default)]
    pub partition_value: Option<String>,
    #[serde(default)]
    pub stop_policy: SessionStopPolicy,
    #[serde(default)]
    pub client_resync_mode: ClientResyncMode,
    /// Directory where pre-reset backups are placed when the server asks
    /// for the file to be deleted.
    #[serde(default)]
    pub recovery_directory: Option<PathBuf>,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            server_url: server_url.into(),
            store_path: store_path.into(),
            mode: SyncMode::Partition,
            partition_value: None,
            stop_policy: SessionStopPolicy::default(),
            client_resync_mode: ClientResyncMode::default(),
            recovery_directory: None,
        }
    }

    pub fn flexible(mut self) -> Self {
        self.mode = SyncMode::Flexible;
        self
    }

    pub fn with_partition(mut self, value: impl Into<String>) -> Self {
        self.mode = SyncMode::Partition;
        self.partition_value = Some(value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ClientConfig::default();
        assert!(config.pong_keepalive_timeout > config.ping_keepalive_period);
        assert!(config.reconnect_backoff.resumption_delay_interval > 0);
        assert!(
            config.reconnect_backoff.max_resumption_delay_interval
                >= config.reconnect_backoff.resumption_delay_interval
        );
    }

    #[test]
    fn config_roundtrips_through_serde() {
        let config = ClientConfig {
            one_connection_per_session: true,
            reconnect_mode: ReconnectMode::Testing,
            ..ClientConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn partial_session_config_fills_defaults() {
        let json = r#"{"server_url":"lagoon://host/a","store_path":"/tmp/a.lagoon","mode":"Partition"}"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.stop_policy, SessionStopPolicy::AfterChangesUploaded);
        assert_eq!(config.client_resync_mode, ClientResyncMode::Recover);
    }
}
