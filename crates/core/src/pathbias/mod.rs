/// Path-bias defense: per-guard accounting of how often circuits through
/// each entry guard get built and then actually carry traffic.
///
/// A guard that kills circuits it cannot observe end to end shows up as a
/// low success rate. `params` resolves the thresholds, `rates` judges and
/// scales guard counters, `ratelim` keeps repeated notices down, `probe` is the liveness check sent down an
/// attempted-but-unproven circuit before it is closed, and the per-circuit
/// accounting lives on `Node`.
mod monitor;
pub mod params;
pub mod probe;
pub mod ratelim;
pub mod rates;

pub use monitor::CloseDecision;
pub use params::PathBiasParams;
pub use probe::{PathBiasProbe, ProbeVerdict, PROBE_PORT};
pub use ratelim::{LogRateLimit, PathBiasLogLimits};
