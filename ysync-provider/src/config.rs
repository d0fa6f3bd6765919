//! Provider and relay configuration.
//!
//! Both structs deserialize from JSON with every field optional, so a host
//! only spells out what it changes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SyncError};
use crate::transport::{ConnectRequest, TransportKind};

/// Configuration of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Server base url, e.g. `ws://localhost:9090`. Trailing slashes are ignored.
    pub server_url: String,
    /// Room to join.
    pub room: String,
    /// Connect as soon as the provider is created.
    pub connect: bool,
    /// Query parameters appended to the connection url.
    pub params: BTreeMap<String, String>,
    /// Periodically resend sync step 1 while connected (None = never).
    pub resync_interval_ms: Option<u64>,
    /// Upper bound of the reconnect backoff.
    pub max_backoff_ms: u64,
    /// Skip the in-process channel shared with same-room providers.
    pub disable_local_channel: bool,
    /// Close a connection that has been silent this long.
    pub reconnect_timeout_ms: u64,
    /// Preferred wire transports, in order.
    pub transports: Vec<TransportKind>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            room: String::new(),
            connect: true,
            params: BTreeMap::new(),
            resync_interval_ms: None,
            max_backoff_ms: 2500,
            disable_local_channel: false,
            reconnect_timeout_ms: 30_000,
            transports: vec![TransportKind::WebSocket],
        }
    }
}

impl ProviderConfig {
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            room: room.into(),
            ..Self::default()
        }
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_connect(mut self, connect: bool) -> Self {
        self.connect = connect;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_local_channel(mut self, enabled: bool) -> Self {
        self.disable_local_channel = !enabled;
        self
    }

    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(SyncError::Config("server_url must not be empty".into()));
        }
        if self.room.is_empty() {
            return Err(SyncError::Config("room must not be empty".into()));
        }
        if self.reconnect_timeout_ms == 0 {
            return Err(SyncError::Config("reconnect_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// `{server}/{room}` plus the url-encoded query parameters.
    pub fn url(&self) -> String {
        let mut url = format!("{}/{}", self.base_url(), self.room);
        if !self.params.is_empty() {
            let query: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }

    /// Name of the in-process channel shared by providers of the same room.
    pub fn channel_name(&self) -> String {
        format!("{}/{}", self.base_url(), self.room)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    /// Resync period, if enabled.
    pub fn resync_interval(&self) -> Option<Duration> {
        self.resync_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub(crate) fn connect_request(&self) -> ConnectRequest {
        ConnectRequest {
            url: self.url(),
            transports: self.transports.clone(),
        }
    }
}

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Frames buffered per connection before it starts lagging
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::default();
        assert!(config.connect);
        assert_eq!(config.resync_interval(), None);
        assert_eq!(config.max_backoff(), Duration::from_millis(2500));
        assert_eq!(config.reconnect_timeout(), Duration::from_secs(30));
        assert!(!config.disable_local_channel);
        assert_eq!(config.transports, vec![TransportKind::WebSocket]);

        let relay = RelayConfig::default();
        assert_eq!(relay.bind_addr, "127.0.0.1:9090");
        assert_eq!(relay.broadcast_capacity, 256);
    }

    #[test]
    fn test_url_and_channel_name() {
        let config = ProviderConfig::new("ws://localhost:9090//", "notes")
            .with_param("token", "a b&c")
            .with_param("auth", "1");

        assert_eq!(config.url(), "ws://localhost:9090/notes?auth=1&token=a%20b%26c");
        assert_eq!(config.channel_name(), "ws://localhost:9090/notes");
        assert_eq!(ProviderConfig::new("ws://h", "r").url(), "ws://h/r");
    }

    #[test]
    fn test_connect_request_carries_full_url() {
        let config = ProviderConfig::new("ws://h", "r")
            .with_param("token", "t")
            .with_transports(vec![TransportKind::WebSocket, TransportKind::WebTransport]);
        let request = config.connect_request();
        assert_eq!(request.url, "ws://h/r?token=t");
        assert_eq!(
            request.transports,
            vec![TransportKind::WebSocket, TransportKind::WebTransport]
        );
    }

    #[test]
    fn test_from_json_partial() {
        let config = ProviderConfig::from_json(
            r#"{"server_url": "ws://h", "room": "r", "resync_interval_ms": 5000,
                "transports": ["webtransport", "websocket"]}"#,
        )
        .unwrap();
        assert_eq!(config.resync_interval(), Some(Duration::from_secs(5)));
        assert_eq!(config.max_backoff_ms, 2500);
        assert_eq!(
            config.transports,
            vec![TransportKind::WebTransport, TransportKind::WebSocket]
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            ProviderConfig::from_json(r#"{"room": "r"}"#),
            Err(SyncError::Config(_))
        ));
        assert!(ProviderConfig::from_json("not json").is_err());
        assert!(ProviderConfig::new("ws://h", "r")
            .with_reconnect_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_zero_resync_disables() {
        let mut config = ProviderConfig::new("ws://h", "r");
        config.resync_interval_ms = Some(0);
        assert_eq!(config.resync_interval(), None);
    }

    #[test]
    fn test_relay_from_json() {
        let relay = RelayConfig::from_json(r#"{"bind_addr": "0.0.0.0:1234"}"#).unwrap();
        assert_eq!(relay.bind_addr, "0.0.0.0:1234");
        assert_eq!(relay.max_peers_per_room, 100);
    }
}
