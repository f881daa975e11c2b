use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for a farm worker node.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error); the
    /// `--log-level` flag overrides it. Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Local network identity and receive interface.
    #[serde(default)]
    pub network: NetworkConfig,

    /// UDP ports the classifier dispatches on.
    #[serde(default)]
    pub ports: PortsConfig,

    /// Event-building parameters.
    #[serde(default)]
    pub event_building: EventBuildingConfig,

    /// Detector source topology.
    #[serde(default)]
    pub sources: SourcesConfig,

    /// IP-level fragment reassembly limits.
    #[serde(default)]
    pub reassembly: ReassemblyConfig,
}

/// Local network identity and receive interface.
#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    /// Interface the receive ring binds to (e.g., "eth2").
    #[serde(default)]
    pub interface: String,

    /// IPv4 address MEPs are addressed to. Datagrams for other hosts are
    /// dropped.
    #[serde(default = "default_host_ip")]
    pub host_ip: Ipv4Addr,

    /// MAC address used in ARP replies, "aa:bb:cc:dd:ee:ff".
    #[serde(default)]
    pub host_mac: String,
}

/// UDP ports the classifier dispatches on.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PortsConfig {
    /// L0 MEP ingress port.
    #[serde(default = "default_l0_port")]
    pub l0: u16,

    /// Calorimeter (LKr) MEP ingress port.
    #[serde(default = "default_cream_port")]
    pub cream: u16,

    /// Straw-tracker port, routed to the external straw handler.
    #[serde(default = "default_straw_port")]
    pub straw: u16,

    /// End-of-burst broadcast port.
    #[serde(default = "default_eob_port")]
    pub eob_broadcast: u16,
}

/// Event-building parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EventBuildingConfig {
    /// Burst ID the node starts in.
    #[serde(default)]
    pub first_burst_id: u32,

    /// Worker fan-out count; each worker owns one ring slice.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Event slot count. Must exceed the in-flight event window.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Grace period between EOB reception and burst-ID advance. Default: 1s.
    #[serde(default = "default_burst_grace", with = "humantime_serde")]
    pub burst_grace: Duration,

    /// Consecutive ring poll failures tolerated before a worker exits.
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,
}

/// Detector source topology.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    /// L0 source IDs expected for every event. Fragments from IDs outside
    /// this set fail their whole MEP.
    #[serde(default = "default_l0_sources")]
    pub l0_source_ids: Vec<u8>,

    /// Calorimeter crate IDs expected for every event.
    #[serde(default = "default_lkr_crates")]
    pub lkr_crate_ids: Vec<u8>,
}

/// IP-level fragment reassembly limits.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ReassemblyConfig {
    /// Maximum datagrams under reassembly at once; oldest evicted beyond.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Age past which a partial datagram is discarded. Default: 2s.
    #[serde(default = "default_reassembly_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host_ip() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_l0_port() -> u16 {
    58913
}

fn default_cream_port() -> u16 {
    58915
}

fn default_straw_port() -> u16 {
    58916
}

fn default_eob_port() -> u16 {
    14162
}

fn default_workers() -> usize {
    4
}

fn default_pool_capacity() -> usize {
    1 << 16
}

fn default_burst_grace() -> Duration {
    Duration::from_secs(1)
}

fn default_max_poll_errors() -> u32 {
    100
}

fn default_l0_sources() -> Vec<u8> {
    vec![0x04, 0x08, 0x0C]
}

fn default_lkr_crates() -> Vec<u8> {
    vec![0x00, 0x01]
}

fn default_max_pending() -> usize {
    256
}

fn default_reassembly_timeout() -> Duration {
    Duration::from_secs(2)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            network: NetworkConfig::default(),
            ports: PortsConfig::default(),
            event_building: EventBuildingConfig::default(),
            sources: SourcesConfig::default(),
            reassembly: ReassemblyConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            host_ip: default_host_ip(),
            host_mac: String::new(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            l0: default_l0_port(),
            cream: default_cream_port(),
            straw: default_straw_port(),
            eob_broadcast: default_eob_port(),
        }
    }
}

impl Default for EventBuildingConfig {
    fn default() -> Self {
        Self {
            first_burst_id: 0,
            workers: default_workers(),
            pool_capacity: default_pool_capacity(),
            burst_grace: default_burst_grace(),
            max_poll_errors: default_max_poll_errors(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            l0_source_ids: default_l0_sources(),
            lkr_crate_ids: default_lkr_crates(),
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            timeout: default_reassembly_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.network.host_ip.is_unspecified() {
            bail!("network.host_ip is required");
        }

        if !self.network.host_mac.is_empty() {
            parse_mac(&self.network.host_mac)
                .with_context(|| format!("invalid network.host_mac: {}", self.network.host_mac))?;
        }

        let ports = [
            self.ports.l0,
            self.ports.cream,
            self.ports.straw,
            self.ports.eob_broadcast,
        ];
        for (i, a) in ports.iter().enumerate() {
            if *a == 0 {
                bail!("ports must be nonzero");
            }
            if ports.iter().skip(i + 1).any(|b| a == b) {
                bail!("port {a} is assigned to more than one role");
            }
        }

        if self.event_building.workers == 0 {
            bail!("event_building.workers must be positive");
        }

        if self.event_building.pool_capacity == 0 {
            bail!("event_building.pool_capacity must be positive");
        }

        if self.sources.l0_source_ids.is_empty() {
            bail!("sources.l0_source_ids must not be empty");
        }

        if self.sources.lkr_crate_ids.is_empty() {
            bail!("sources.lkr_crate_ids must not be empty");
        }

        if self.reassembly.max_pending == 0 {
            bail!("reassembly.max_pending must be positive");
        }

        Ok(())
    }

    /// Host MAC as bytes; all-zero when unconfigured.
    pub fn host_mac_bytes(&self) -> [u8; 6] {
        if self.network.host_mac.is_empty() {
            return [0; 6];
        }
        parse_mac(&self.network.host_mac).unwrap_or([0; 6])
    }
}

/// Parse "aa:bb:cc:dd:ee:ff" into bytes.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');

    for byte in &mut out {
        let part = parts.next().context("MAC has fewer than 6 octets")?;
        *byte = u8::from_str_radix(part, 16)
            .with_context(|| format!("bad MAC octet {part:?}"))?;
    }

    if parts.next().is_some() {
        bail!("MAC has more than 6 octets");
    }

    Ok(out)
}
