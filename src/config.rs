//! Configuration for HTTP/3 connections and WebTransport clients.

use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for an HTTP/3 connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum accepted size of a received HEADERS frame payload.
    /// Larger frames fail the exchange with HTTP status 414.
    pub max_header_section_size: usize,

    /// Maximum accepted size of a received DATA frame payload.
    /// Larger frames fail the exchange with HTTP status 400.
    pub max_data_frame_size: usize,

    /// How long to wait for the peer's SETTINGS frame before a
    /// settings-dependent operation gives up.
    pub settings_wait: Duration,

    /// Deadline for establishing an extended CONNECT tunnel.
    pub connect_timeout: Duration,

    /// Maximum number of concurrently open WebTransport sessions.
    pub max_webtransport_sessions: usize,

    /// SETTINGS_QPACK_MAX_TABLE_CAPACITY advertised to the peer.
    pub qpack_max_table_capacity: u64,

    /// SETTINGS_QPACK_BLOCKED_STREAMS advertised to the peer.
    pub qpack_blocked_streams: u64,

    /// Extension SETTINGS parameters sent verbatim on the control stream.
    pub extra_settings: BTreeMap<u64, u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_header_section_size: 16384,
            max_data_frame_size: 65536,
            settings_wait: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            max_webtransport_sessions: 1,
            qpack_max_table_capacity: 0,
            qpack_blocked_streams: 0,
            extra_settings: BTreeMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }
}

/// Builder for connection configuration.
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Set the maximum accepted HEADERS frame payload size.
    pub fn max_header_section_size(mut self, size: usize) -> Self {
        self.config.max_header_section_size = size;
        self
    }

    /// Set the maximum accepted DATA frame payload size.
    pub fn max_data_frame_size(mut self, size: usize) -> Self {
        self.config.max_data_frame_size = size;
        self
    }

    /// Set the peer-SETTINGS wait deadline.
    pub fn settings_wait(mut self, wait: Duration) -> Self {
        self.config.settings_wait = wait;
        self
    }

    /// Set the extended CONNECT deadline.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the maximum number of concurrent WebTransport sessions.
    pub fn max_webtransport_sessions(mut self, max: usize) -> Self {
        self.config.max_webtransport_sessions = max;
        self
    }

    /// Set the advertised QPACK dynamic table capacity.
    pub fn qpack_max_table_capacity(mut self, capacity: u64) -> Self {
        self.config.qpack_max_table_capacity = capacity;
        self
    }

    /// Set the advertised QPACK blocked-streams limit.
    pub fn qpack_blocked_streams(mut self, blocked: u64) -> Self {
        self.config.qpack_blocked_streams = blocked;
        self
    }

    /// Add an extension SETTINGS parameter.
    pub fn extra_setting(mut self, identifier: u64, value: u64) -> Self {
        self.config.extra_settings.insert(identifier, value);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}
