/// API Response types

use onioncirc_core::circuit::CircuitSummary;
use onioncirc_core::pathbias::PathBiasParams;
use serde::{Deserialize, Serialize};

/// Path-bias record of one entry guard
#[derive(Debug, Serialize, Deserialize)]
pub struct GuardInfo {
    /// Identity fingerprint (hex)
    pub identity: String,
    pub nickname: String,
    /// Whether a first hop through this guard has ever completed
    pub made_contact: bool,
    /// Disabled by path bias
    pub disabled: bool,
    pub circ_attempts: f64,
    pub circ_successes: f64,
    pub successful_circuits_closed: f64,
    pub collapsed_circuits: f64,
    pub unusable_circuits: f64,
    pub timeouts: f64,
    pub use_attempts: f64,
    pub use_successes: f64,
    /// Close success rate, counting circuits still open as successes
    pub close_rate: Option<f64>,
    /// Use success rate, counting circuits in use as successes
    pub use_rate: Option<f64>,
}

/// Guard list response
#[derive(Debug, Serialize, Deserialize)]
pub struct GuardsResponse {
    pub guards: Vec<GuardInfo>,
    pub total: usize,
}

/// Open origin circuits response
#[derive(Debug, Serialize)]
pub struct CircuitsResponse {
    pub circuits: Vec<CircuitSummary>,
    pub total: usize,
    /// Whether any circuit has opened since startup
    pub has_completed_circuit: bool,
    pub build_time_samples: usize,
    pub build_timeout_ms: u64,
}

/// Resolved path-bias thresholds
#[derive(Debug, Serialize)]
pub struct ParamsResponse {
    pub path_bias: PathBiasParams,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

/// `numerator / denominator`, or `None` before there is anything to divide
pub fn rate(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator > 0.0 {
        Some(numerator / denominator)
    } else {
        None
    }
}
