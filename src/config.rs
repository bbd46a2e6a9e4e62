//! # Node Configuration
//!
//! [`MeshConfig`] is loaded from TOML. Every section and field has a
//! default, so a partial file (or none at all) is valid:
//!
//! ```toml
//! listen_addr = "0.0.0.0:7400"
//! dht_addr = "0.0.0.0:7401"
//! data_dir = "/var/lib/meshgate"
//!
//! [tls]
//! policy = "latest_with_fallback"
//!
//! [dht]
//! k = 20
//! alpha = 3
//! bootstrap = ["203.0.113.7:7401/5f1c...e2"]
//!
//! [descriptor]
//! clock_skew_tolerance_ms = 30000
//!
//! [nat]
//! relay_eligible = true
//! ```
//!
//! Protocol limits that must agree across the network (message sizes,
//! domain prefixes) are constants in their modules, not configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::identity::PeerId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid bootstrap peer {entry:?}: {reason}")]
    BootstrapPeer { entry: String, reason: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which TLS protocol versions overlay connections may negotiate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersionPolicy {
    /// TLS 1.3 only.
    #[default]
    StrictLatest,
    /// TLS 1.3 preferred, TLS 1.2 accepted for older peers.
    LatestWithFallback,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// TCP listener for overlay (TLS) connections.
    pub listen_addr: SocketAddr,
    /// UDP socket for DHT RPC, NAT probes and hole punching.
    pub dht_addr: SocketAddr,
    /// Host advertised in the local descriptor's direct endpoint. Defaults
    /// to the listener's IP.
    pub advertise_host: Option<String>,
    /// Directory for the identity key, certificate, pins and sequence marks.
    /// `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub tls: TlsSettings,
    pub dht: DhtSettings,
    pub descriptor: DescriptorSettings,
    pub rate_limit: RateLimitSettings,
    pub nat: NatSettings,
    pub connection: ConnectionSettings,
    pub cert_monitor: CertMonitorSettings,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            dht_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise_host: None,
            data_dir: None,
            tls: TlsSettings::default(),
            dht: DhtSettings::default(),
            descriptor: DescriptorSettings::default(),
            rate_limit: RateLimitSettings::default(),
            nat: NatSettings::default(),
            connection: ConnectionSettings::default(),
            cert_monitor: CertMonitorSettings::default(),
        }
    }
}

impl MeshConfig {
    /// Loopback configuration on ephemeral ports.
    pub fn local() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            dht_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dht.k == 0 {
            return Err(ConfigError::Invalid("dht.k must be at least 1".into()));
        }
        if self.dht.alpha == 0 {
            return Err(ConfigError::Invalid("dht.alpha must be at least 1".into()));
        }
        if self.dht.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "dht.max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_ms must be non-zero".into()));
        }
        if self.cert_monitor.critical_days > self.cert_monitor.warning_days {
            return Err(ConfigError::Invalid(
                "cert_monitor.critical_days must not exceed warning_days".into(),
            ));
        }
        if self.descriptor.republish_interval_secs >= self.descriptor.lifetime_secs {
            return Err(ConfigError::Invalid(
                "descriptor.republish_interval_secs must be shorter than lifetime_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn identity_key_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("identity.key"))
    }

    pub fn certificate_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("overlay.cert.der"))
    }

    pub fn pin_store_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("pins.json"))
    }

    pub fn sequence_store_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("sequences.json"))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub policy: TlsVersionPolicy,
    /// Validity of freshly generated identity certificates.
    pub certificate_validity_days: u32,
    /// Regenerate the persisted certificate when it has fewer days left.
    pub renew_before_days: u32,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            policy: TlsVersionPolicy::StrictLatest,
            certificate_validity_days: 365,
            renew_before_days: 7,
        }
    }
}

/// A seed peer: `IP:PORT` or `IP:PORT/PEER_ID_HEX`.
///
/// When the PeerId is given, the node refuses a seed that answers with a
/// different identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
}

impl FromStr for BootstrapPeer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::BootstrapPeer {
            entry: s.to_string(),
            reason: reason.to_string(),
        };
        let (addr_part, id_part) = match s.rsplit_once('/') {
            Some((addr, id)) => (addr, Some(id)),
            None => (s, None),
        };
        let addr: SocketAddr = addr_part
            .parse()
            .map_err(|_| invalid("invalid socket address"))?;
        let peer_id = id_part
            .map(|id| PeerId::from_hex(id).map_err(|_| invalid("peer id must be 64 hex characters")))
            .transpose()?;
        Ok(BootstrapPeer { addr, peer_id })
    }
}

impl std::fmt::Display for BootstrapPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.peer_id {
            Some(id) => write!(f, "{}/{}", self.addr, id.to_hex()),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl Serialize for BootstrapPeer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BootstrapPeer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    /// Bucket capacity and lookup result size.
    pub k: usize,
    /// Parallel queries per lookup round.
    pub alpha: usize,
    pub bootstrap: Vec<BootstrapPeer>,
    pub rpc_timeout_ms: u64,
    pub lookup_timeout_ms: u64,
    /// Entries failing this many RPCs in a row are evicted.
    pub max_consecutive_failures: u32,
    pub refresh_interval_secs: u64,
    /// Entries not heard from for this long are pinged during refresh.
    pub liveness_threshold_secs: u64,
    pub max_value_ttl_secs: u64,
    pub expiry_sweep_interval_secs: u64,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            bootstrap: Vec::new(),
            rpc_timeout_ms: 3_000,
            lookup_timeout_ms: 10_000,
            max_consecutive_failures: 3,
            refresh_interval_secs: 15 * 60,
            liveness_threshold_secs: 15 * 60,
            max_value_ttl_secs: 24 * 60 * 60,
            expiry_sweep_interval_secs: 60,
        }
    }
}

impl DhtSettings {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_secs(self.liveness_threshold_secs)
    }

    pub fn max_value_ttl(&self) -> Duration {
        Duration::from_secs(self.max_value_ttl_secs)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorSettings {
    /// How long a freshly signed local descriptor stays valid.
    pub lifetime_secs: u64,
    pub republish_interval_secs: u64,
    /// Slack applied to expiry checks in both directions.
    pub clock_skew_tolerance_ms: u64,
    /// Remote descriptors kept in the lookup cache.
    pub cache_capacity: usize,
}

impl Default for DescriptorSettings {
    fn default() -> Self {
        Self {
            lifetime_secs: 60 * 60,
            republish_interval_secs: 20 * 60,
            clock_skew_tolerance_ms: 30_000,
            cache_capacity: 4_096,
        }
    }
}

impl DescriptorSettings {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_secs(self.republish_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Sliding window length shared by every counter.
    pub window_ms: u64,
    pub max_connection_attempts: u32,
    pub max_handshake_failures: u32,
    pub max_protocol_violations: u32,
    /// DHT STOREs accepted per source per window.
    pub max_stores: u32,
    /// NAT classification probes answered per source per window.
    pub max_probes: u32,
    /// First quarantine length; doubles on every further offense.
    pub quarantine_base_ms: u64,
    pub quarantine_max_ms: u64,
    pub max_tracked_sources: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_connection_attempts: 30,
            max_handshake_failures: 5,
            max_protocol_violations: 10,
            max_stores: 20,
            max_probes: 30,
            quarantine_base_ms: 60_000,
            quarantine_max_ms: 60 * 60 * 1000,
            max_tracked_sources: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NatSettings {
    /// Run a relay service other peers may use.
    pub relay_eligible: bool,
    /// TCP listener for the relay service when `relay_eligible`.
    pub relay_listen_addr: SocketAddr,
    /// Relays this node registers with when it is not directly reachable.
    pub relays: Vec<SocketAddr>,
    /// Extra reflectors probed during classification, besides routing peers.
    pub reflectors: Vec<SocketAddr>,
    pub probe_timeout_ms: u64,
    /// Window in which a punched path must confirm a round trip.
    pub punch_window_ms: u64,
    pub reclassify_interval_secs: u64,
}

impl Default for NatSettings {
    fn default() -> Self {
        Self {
            relay_eligible: false,
            relay_listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            relays: Vec::new(),
            reflectors: Vec::new(),
            probe_timeout_ms: 1_500,
            punch_window_ms: 5_000,
            reclassify_interval_secs: 10 * 60,
        }
    }
}

impl NatSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn punch_window(&self) -> Duration {
        Duration::from_millis(self.punch_window_ms)
    }

    pub fn reclassify_interval(&self) -> Duration {
        Duration::from_secs(self.reclassify_interval_secs)
    }
}

/// Per-state handshake timeouts and connection caps.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout_ms: u64,
    pub tls_timeout_ms: u64,
    pub hello_timeout_ms: u64,
    pub max_concurrent_handshakes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            tls_timeout_ms: 10_000,
            hello_timeout_ms: 5_000,
            max_concurrent_handshakes: 128,
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tls_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_timeout_ms)
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CertMonitorSettings {
    pub scan_interval_secs: u64,
    pub warning_days: u32,
    pub critical_days: u32,
    /// Additional DER certificate files to watch besides the identity certificate.
    pub extra_certificates: Vec<PathBuf>,
}

impl Default for CertMonitorSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 12 * 60 * 60,
            warning_days: 30,
            critical_days: 7,
            extra_certificates: Vec::new(),
        }
    }
}

impl CertMonitorSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = MeshConfig::from_toml_str("").expect("empty config is valid");
        assert_eq!(config.dht.k, 20);
        assert_eq!(config.dht.alpha, 3);
        assert_eq!(config.tls.policy, TlsVersionPolicy::StrictLatest);
        assert_eq!(config.descriptor.clock_skew_tolerance_ms, 30_000);
        assert!(!config.nat.relay_eligible);
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let id = crate::identity::Keypair::generate().peer_id();
        let content = format!(
            r#"
            listen_addr = "127.0.0.1:7400"

            [tls]
            policy = "latest_with_fallback"

            [dht]
            k = 8
            bootstrap = ["10.0.0.1:7401", "10.0.0.2:7401/{}"]

            [descriptor]
            clock_skew_tolerance_ms = 1500

            [nat]
            relay_eligible = true
            "#,
            id.to_hex()
        );
        let config = MeshConfig::from_toml_str(&content).expect("valid config");
        assert_eq!(config.listen_addr.port(), 7400);
        assert_eq!(config.tls.policy, TlsVersionPolicy::LatestWithFallback);
        assert_eq!(config.dht.k, 8);
        assert_eq!(config.dht.alpha, 3, "unspecified fields keep defaults");
        assert_eq!(config.dht.bootstrap.len(), 2);
        assert_eq!(config.dht.bootstrap[0].peer_id, None);
        assert_eq!(config.dht.bootstrap[1].peer_id, Some(id));
        assert_eq!(config.descriptor.clock_skew_tolerance_ms, 1500);
        assert!(config.nat.relay_eligible);
    }

    #[test]
    fn bootstrap_peer_rejects_garbage() {
        assert!("not-an-addr".parse::<BootstrapPeer>().is_err());
        assert!("10.0.0.1:7401/xyz".parse::<BootstrapPeer>().is_err());
        let peer: BootstrapPeer = "10.0.0.1:7401".parse().unwrap();
        assert_eq!(peer.to_string(), "10.0.0.1:7401");
    }

    #[test]
    fn validation_rejects_zero_k() {
        let err = MeshConfig::from_toml_str("[dht]\nk = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn validation_rejects_inverted_cert_horizons() {
        let err = MeshConfig::from_toml_str("[cert_monitor]\nwarning_days = 5\ncritical_days = 9\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn data_dir_paths() {
        let config = MeshConfig {
            data_dir: Some(PathBuf::from("/tmp/mesh")),
            ..MeshConfig::default()
        };
        assert_eq!(config.pin_store_path(), Some(PathBuf::from("/tmp/mesh/pins.json")));
        assert_eq!(MeshConfig::default().pin_store_path(), None);
    }
}
