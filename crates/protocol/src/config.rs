use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub ice: IceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// UDP addresses to ingest RTP from, one stream per entry
    #[serde(default = "default_ingress_addrs")]
    pub addrs: Vec<String>,
    /// Read buffer size for UDP ingress; datagrams larger than this truncate
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP + WebSocket bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum concurrent peers
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Bounded inbound signal queue depth
    #[serde(default = "default_signal_buffer")]
    pub inbound_buffer: usize,
    /// Bounded outbound signal queue depth
    #[serde(default = "default_signal_buffer")]
    pub outbound_buffer: usize,
    /// Interval between WebSocket ping frames
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Unacknowledged pings tolerated before the channel is closed
    #[serde(default = "default_max_pending_pings")]
    pub max_pending_pings: usize,
    /// Close handshake timeout
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// A polite peer rolls back on offer collisions; the relay defaults to
    /// the impolite side and expects browsers to be polite.
    #[serde(default)]
    pub polite: bool,
    /// Per-consumer datagram queue depth in the fan-out
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub codec: CodecConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// MIME type advertised for every stream track
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    /// RTP clock rate for the advertised codec
    #[serde(default = "default_clock_rate")]
    pub clock_rate: u32,
}

/// ICE configuration handed to the WebRTC stack. Empty by default: the relay
/// is expected to sit on the same network segment as its peers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default)]
    pub stun_urls: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ingress: IngressConfig::default(),
            server: ServerConfig::default(),
            channel: ChannelConfig::default(),
            peer: PeerConfig::default(),
            ice: IceConfig::default(),
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            addrs: default_ingress_addrs(),
            mtu: default_mtu(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_peers: default_max_peers(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inbound_buffer: default_signal_buffer(),
            outbound_buffer: default_signal_buffer(),
            ping_interval_ms: default_ping_interval_ms(),
            max_pending_pings: default_max_pending_pings(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            polite: false,
            queue_capacity: default_queue_capacity(),
            codec: CodecConfig::default(),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            mime_type: default_mime_type(),
            clock_rate: default_clock_rate(),
        }
    }
}

impl ChannelConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

impl RelayConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the relay should not start)
    /// or "WARNING:" (advisory, the relay can start but the config is likely
    /// wrong). Returns `Ok(())` if no issues.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.ingress.addrs.is_empty() {
            issues.push("ERROR: ingress.addrs is empty, no streams to relay.".to_string());
        }
        for addr in &self.ingress.addrs {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                issues.push(format!(
                    "ERROR: ingress address '{addr}' is not a valid host:port."
                ));
            }
        }

        // 576 is the IPv4 minimum reassembly size, 65507 the UDP payload maximum
        if self.ingress.mtu < 576 || self.ingress.mtu > 65_507 {
            issues.push(format!(
                "ERROR: ingress.mtu must be between 576 and 65507, got {}.",
                self.ingress.mtu
            ));
        }

        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            issues.push(format!(
                "ERROR: server.bind '{}' is not a valid host:port.",
                self.server.bind
            ));
        }
        if self.server.max_peers == 0 {
            issues.push("ERROR: server.max_peers must be >= 1.".to_string());
        }

        if self.channel.ping_interval_ms < 10 {
            issues.push(format!(
                "ERROR: channel.ping_interval_ms must be at least 10, got {}.",
                self.channel.ping_interval_ms
            ));
        }
        if self.channel.max_pending_pings == 0 {
            issues.push("ERROR: channel.max_pending_pings must be >= 1.".to_string());
        }
        if self.channel.inbound_buffer == 0 || self.channel.outbound_buffer == 0 {
            issues.push("ERROR: channel signal buffers must be >= 1.".to_string());
        }
        if self.channel.disconnect_timeout_ms < self.channel.ping_interval_ms {
            issues.push(format!(
                "WARNING: channel.disconnect_timeout_ms ({}) is shorter than \
                 channel.ping_interval_ms ({}). Close handshakes may be cut off.",
                self.channel.disconnect_timeout_ms, self.channel.ping_interval_ms
            ));
        }

        if self.peer.queue_capacity == 0 {
            issues.push("ERROR: peer.queue_capacity must be >= 1.".to_string());
        }
        if !self.peer.codec.mime_type.contains('/') {
            issues.push(format!(
                "ERROR: peer.codec.mime_type '{}' is not a MIME type. Example: video/H264",
                self.peer.codec.mime_type
            ));
        }
        if self.peer.codec.clock_rate == 0 {
            issues.push("ERROR: peer.codec.clock_rate must be >= 1.".to_string());
        }

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{url}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302"
                ));
            }
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_ingress_addrs() -> Vec<String> {
    vec!["127.0.0.1:9090".to_string()]
}
fn default_mtu() -> usize {
    1500
}
fn default_bind() -> String {
    "0.0.0.0:4040".to_string()
}
fn default_max_peers() -> usize {
    300
}
fn default_signal_buffer() -> usize {
    16
}
fn default_ping_interval_ms() -> u64 {
    5000
}
fn default_max_pending_pings() -> usize {
    3
}
fn default_disconnect_timeout_ms() -> u64 {
    10_000
}
fn default_queue_capacity() -> usize {
    100
}
fn default_mime_type() -> String {
    "video/H264".to_string()
}
fn default_clock_rate() -> u32 {
    90_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: RelayConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.ingress.addrs, vec!["127.0.0.1:9090"]);
        assert_eq!(config.ingress.mtu, 1500);
        assert_eq!(config.server.bind, "0.0.0.0:4040");
        assert_eq!(config.server.max_peers, 300);
        assert_eq!(config.channel.inbound_buffer, 16);
        assert_eq!(config.channel.outbound_buffer, 16);
        assert_eq!(config.channel.ping_interval_ms, 5000);
        assert_eq!(config.channel.max_pending_pings, 3);
        assert_eq!(config.channel.disconnect_timeout_ms, 10_000);
        assert!(!config.peer.polite);
        assert_eq!(config.peer.queue_capacity, 100);
        assert_eq!(config.peer.codec.mime_type, "video/H264");
        assert_eq!(config.peer.codec.clock_rate, 90_000);
        assert!(config.ice.stun_urls.is_empty());
    }

    #[test]
    fn default_trait_matches_empty_toml() {
        let from_toml: RelayConfig = toml::from_str("").unwrap();
        let from_default = RelayConfig::default();

        assert_eq!(from_default.ingress.addrs, from_toml.ingress.addrs);
        assert_eq!(from_default.ingress.mtu, from_toml.ingress.mtu);
        assert_eq!(from_default.server.bind, from_toml.server.bind);
        assert_eq!(from_default.server.max_peers, from_toml.server.max_peers);
        assert_eq!(
            from_default.channel.ping_interval_ms,
            from_toml.channel.ping_interval_ms
        );
        assert_eq!(from_default.peer.queue_capacity, from_toml.peer.queue_capacity);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let toml_str = r#"
[ingress]
addrs = ["127.0.0.1:5004", "127.0.0.1:5006"]

[channel]
ping_interval_ms = 100
"#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.ingress.addrs.len(), 2);
        assert_eq!(config.ingress.mtu, 1500);
        assert_eq!(config.channel.ping_interval_ms, 100);
        assert_eq!(config.channel.max_pending_pings, 3);
        assert_eq!(config.server.max_peers, 300);
    }

    #[test]
    fn durations_convert_to_std() {
        let config = RelayConfig::default();
        assert_eq!(config.channel.ping_interval(), Duration::from_secs(5));
        assert_eq!(config.channel.disconnect_timeout(), Duration::from_secs(10));
    }

    fn validate_issues(config: &RelayConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_empty_ingress_is_error() {
        let mut config = RelayConfig::default();
        config.ingress.addrs.clear();
        assert!(has_error(&validate_issues(&config), "ingress.addrs"));
    }

    #[test]
    fn validate_bad_ingress_addr_is_error() {
        let mut config = RelayConfig::default();
        config.ingress.addrs = vec!["not-an-addr".to_string()];
        assert!(has_error(&validate_issues(&config), "not-an-addr"));
    }

    #[test]
    fn validate_mtu_bounds() {
        let mut config = RelayConfig::default();
        config.ingress.mtu = 575;
        assert!(has_error(&validate_issues(&config), "mtu"));

        config.ingress.mtu = 65_508;
        assert!(has_error(&validate_issues(&config), "mtu"));

        config.ingress.mtu = 65_507;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_zero_max_peers_is_error() {
        let mut config = RelayConfig::default();
        config.server.max_peers = 0;
        assert!(has_error(&validate_issues(&config), "max_peers"));
    }

    #[test]
    fn validate_short_disconnect_timeout_is_warning() {
        let mut config = RelayConfig::default();
        config.channel.disconnect_timeout_ms = 100;
        let issues = validate_issues(&config);
        assert!(issues.iter().any(|i| i.starts_with("WARNING:")));
        assert!(!issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_bad_mime_type_is_error() {
        let mut config = RelayConfig::default();
        config.peer.codec.mime_type = "H264".to_string();
        assert!(has_error(&validate_issues(&config), "mime_type"));
    }

    #[test]
    fn validate_stun_url_prefix() {
        let mut config = RelayConfig::default();
        config.ice.stun_urls = vec!["http://stun.example.com:3478".to_string()];
        assert!(has_error(&validate_issues(&config), "STUN URL"));

        config.ice.stun_urls = vec!["stun:stun.l.google.com:19302".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut config = RelayConfig::default();
        config.server.max_peers = 0;
        config.peer.queue_capacity = 0;
        config.channel.max_pending_pings = 0;
        let issues = validate_issues(&config);
        assert!(issues.len() >= 3, "expected >= 3 issues, got {issues:?}");
    }
}
