use crate::RelayId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Cell layout constants
pub mod cells {
    /// Fixed cell payload size
    pub const CELL_PAYLOAD_SIZE: usize = 509;

    /// Relay cell header: command, recognized, stream id, digest, length
    pub const RELAY_HEADER_SIZE: usize = 11;

    /// Usable bytes in a relay cell body
    pub const RELAY_PAYLOAD_SIZE: usize = CELL_PAYLOAD_SIZE - RELAY_HEADER_SIZE;

    /// Key block produced by every handshake: Df | Db | Kf | Kb
    pub const KEY_MATERIAL_LEN: usize = 20 * 2 + 16 * 2;

    /// Legacy onionskin and reply sizes
    pub const TAP_ONIONSKIN_CHALLENGE_LEN: usize = 186;
    pub const TAP_ONIONSKIN_REPLY_LEN: usize = 148;

    /// CREATE_FAST sizes
    pub const CREATE_FAST_LEN: usize = 20;
    pub const CREATED_FAST_LEN: usize = 40;

    /// ntor sizes
    pub const NTOR_ONIONSKIN_LEN: usize = 84;
    pub const NTOR_REPLY_LEN: usize = 64;
}

/// Path construction constants
pub mod routing {
    /// Default number of hops
    pub const DEFAULT_ROUTE_LEN: usize = 3;

    /// Fewest acceptable relays needed to build anything
    pub const MIN_ACCEPTABLE_RELAYS: usize = 2;

    /// Default number of entry guards kept in rotation
    pub const DEFAULT_NUM_ENTRY_GUARDS: usize = 3;

    /// Default OR port
    pub const DEFAULT_OR_PORT: u16 = 9001;
}

/// Path-bias defaults and lower bounds for local overrides
pub mod path_bias {
    pub const DFLT_MIN_CIRCS: i32 = 150;
    pub const MIN_MIN_CIRCS: i32 = 5;

    pub const DFLT_NOTICE_PCT: i32 = 70;
    pub const DFLT_WARN_PCT: i32 = 50;
    pub const DFLT_EXTREME_PCT: i32 = 30;
    pub const DFLT_DROP_GUARDS: i32 = 0;

    pub const DFLT_SCALE_THRESHOLD: i32 = 300;
    pub const MIN_SCALE_THRESHOLD: i32 = 10;

    pub const DFLT_MIN_USE: i32 = 20;
    pub const MIN_MIN_USE: i32 = 3;

    pub const DFLT_NOTICE_USE_PCT: i32 = 80;
    pub const DFLT_EXTREME_USE_PCT: i32 = 60;

    pub const DFLT_SCALE_USE_THRESHOLD: i32 = 100;

    pub const DFLT_MULT_FACTOR: i32 = 1;
    pub const DFLT_SCALE_FACTOR: i32 = 2;
}

/// Circuit build timeout constants
pub mod build_timeout {
    /// Initial timeout before any builds are observed
    pub const INITIAL_TIMEOUT_MS: u64 = 60_000;

    /// Samples needed before the timeout is learned from observations
    pub const MIN_CIRCUITS_TO_OBSERVE: usize = 100;

    /// Samples retained
    pub const MAX_RECORDED_BUILD_TIMES: usize = 1000;

    /// Slack added to twice the close timeout when rejecting outliers
    pub const OUTLIER_SLACK_MS: i64 = 1000;

    /// How long a liveness probe may stay outstanding
    pub const PROBE_TIMEOUT_SECS: u64 = 10;
}

/// Local path-bias overrides. `None` means "use the consensus value".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathBiasConfig {
    /// Circuits attempted before build rates are judged
    pub circ_threshold: Option<i32>,
    pub notice_rate: Option<f64>,
    pub warn_rate: Option<f64>,
    pub extreme_rate: Option<f64>,
    /// Disable guards whose build rate is extreme
    pub drop_guards: Option<bool>,
    /// Attempts after which counts are scaled down
    pub scale_threshold: Option<i32>,
    /// Use attempts before use rates are judged
    pub use_threshold: Option<i32>,
    pub notice_use_rate: Option<f64>,
    pub extreme_use_rate: Option<f64>,
    pub scale_use_threshold: Option<i32>,
}

/// Options recognized by the circuit core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub use_entry_guards: bool,

    pub num_entry_guards: usize,

    /// Running as a relay (accepts CREATE and EXTEND)
    pub server_mode: bool,

    pub bridge_relay: bool,

    /// Allow CREATE_FAST for the first hop
    pub fast_first_hop_pk: bool,

    /// `None` leaves the decision to the consensus
    pub use_ntor_handshake: Option<bool>,

    pub extend_allow_private_addresses: bool,

    /// Avoid relays that would serve as a single-hop exit
    pub exclude_single_hop_relays: bool,

    /// Treat relays in the same /16 as one family
    pub enforce_distinct_subnets: bool,

    pub exclude_nodes: Vec<RelayId>,

    pub exclude_exit_nodes: Vec<RelayId>,

    /// When non-empty, exits are restricted to these relays
    pub exit_nodes: Vec<RelayId>,

    pub strict_nodes: bool,

    /// When non-empty, only first hops on these ports are reachable
    pub reachable_or_ports: Vec<u16>,

    pub client_prefer_ipv6_orport: bool,

    pub learn_circuit_build_timeout: bool,

    /// Kept last so it serializes as a trailing TOML table
    pub path_bias: PathBiasConfig,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            use_entry_guards: true,
            num_entry_guards: routing::DEFAULT_NUM_ENTRY_GUARDS,
            server_mode: false,
            bridge_relay: false,
            fast_first_hop_pk: true,
            use_ntor_handshake: None,
            extend_allow_private_addresses: false,
            exclude_single_hop_relays: true,
            enforce_distinct_subnets: true,
            exclude_nodes: Vec::new(),
            exclude_exit_nodes: Vec::new(),
            exit_nodes: Vec::new(),
            strict_nodes: false,
            reachable_or_ports: Vec::new(),
            client_prefer_ipv6_orport: false,
            learn_circuit_build_timeout: true,
            path_bias: PathBiasConfig::default(),
        }
    }
}

impl CircuitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a relay
    pub fn relay() -> Self {
        Self {
            server_mode: true,
            ..Self::default()
        }
    }

    pub fn with_entry_guards(mut self, enabled: bool) -> Self {
        self.use_entry_guards = enabled;
        self
    }

    pub fn with_server_mode(mut self, enabled: bool) -> Self {
        self.server_mode = enabled;
        self
    }

    pub fn with_ntor(mut self, enabled: bool) -> Self {
        self.use_ntor_handshake = Some(enabled);
        self
    }

    pub fn with_fast_first_hop(mut self, enabled: bool) -> Self {
        self.fast_first_hop_pk = enabled;
        self
    }

    pub fn with_path_bias(mut self, path_bias: PathBiasConfig) -> Self {
        self.path_bias = path_bias;
        self
    }

    pub fn with_private_extends(mut self, allowed: bool) -> Self {
        self.extend_allow_private_addresses = allowed;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(build_timeout::PROBE_TIMEOUT_SECS)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}
