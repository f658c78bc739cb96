use onioncirc_common::path_bias::*;
use onioncirc_common::{NetworkParams, PathBiasConfig};
use serde::Serialize;

/// Path-bias tunables after resolving local overrides against the
/// consensus. A local value wins when it is set and in range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PathBiasParams {
    /// Circuit attempts needed before build rates are judged
    pub min_circs: i32,
    pub notice_rate: f64,
    pub warn_rate: f64,
    pub extreme_rate: f64,
    pub drop_guards: bool,
    /// Attempts after which build counters are scaled down
    pub scale_threshold: i32,
    /// Use attempts needed before use rates are judged
    pub min_use: i32,
    pub notice_use_rate: f64,
    pub extreme_use_rate: f64,
    pub scale_use_threshold: i32,
    /// Factor applied to counters when scaling
    pub scale_ratio: f64,
}

impl PathBiasParams {
    pub fn resolve(local: &PathBiasConfig, consensus: &NetworkParams) -> Self {
        Self {
            min_circs: count_param(
                local.circ_threshold,
                consensus,
                "pb_mincircs",
                DFLT_MIN_CIRCS,
                MIN_MIN_CIRCS,
            ),
            notice_rate: rate_param(local.notice_rate, consensus, "pb_noticepct", DFLT_NOTICE_PCT),
            warn_rate: rate_param(local.warn_rate, consensus, "pb_warnpct", DFLT_WARN_PCT),
            extreme_rate: rate_param(
                local.extreme_rate,
                consensus,
                "pb_extremepct",
                DFLT_EXTREME_PCT,
            ),
            drop_guards: match local.drop_guards {
                Some(drop) => drop,
                None => consensus.get("pb_dropguards", DFLT_DROP_GUARDS, 0, 1) != 0,
            },
            scale_threshold: count_param(
                local.scale_threshold,
                consensus,
                "pb_scalecircs",
                DFLT_SCALE_THRESHOLD,
                MIN_SCALE_THRESHOLD,
            ),
            min_use: count_param(
                local.use_threshold,
                consensus,
                "pb_minuse",
                DFLT_MIN_USE,
                MIN_MIN_USE,
            ),
            notice_use_rate: rate_param(
                local.notice_use_rate,
                consensus,
                "pb_noticeusepct",
                DFLT_NOTICE_USE_PCT,
            ),
            extreme_use_rate: rate_param(
                local.extreme_use_rate,
                consensus,
                "pb_extremeusepct",
                DFLT_EXTREME_USE_PCT,
            ),
            scale_use_threshold: count_param(
                local.scale_use_threshold,
                consensus,
                "pb_scaleuse",
                DFLT_SCALE_USE_THRESHOLD,
                MIN_SCALE_THRESHOLD,
            ),
            scale_ratio: scale_ratio(consensus),
        }
    }
}

impl Default for PathBiasParams {
    fn default() -> Self {
        Self::resolve(&PathBiasConfig::default(), &NetworkParams::new())
    }
}

fn count_param(local: Option<i32>, consensus: &NetworkParams, name: &str, default: i32, min: i32) -> i32 {
    match local {
        Some(value) if value >= min => value,
        _ => consensus.get(name, default, min, i32::MAX),
    }
}

fn rate_param(local: Option<f64>, consensus: &NetworkParams, name: &str, default_pct: i32) -> f64 {
    match local {
        Some(rate) if rate >= 0.0 => rate,
        _ => consensus.get(name, default_pct, 0, 100) as f64 / 100.0,
    }
}

/// `pb_multfactor / pb_scalefactor`, never above 1
fn scale_ratio(consensus: &NetworkParams) -> f64 {
    let denominator = consensus.get("pb_scalefactor", DFLT_SCALE_FACTOR, 2, i32::MAX);
    let numerator = consensus.get("pb_multfactor", DFLT_MULT_FACTOR, 1, denominator);
    numerator as f64 / denominator as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = PathBiasParams::default();
        assert_eq!(params.min_circs, 150);
        assert_eq!(params.notice_rate, 0.70);
        assert_eq!(params.warn_rate, 0.50);
        assert_eq!(params.extreme_rate, 0.30);
        assert!(!params.drop_guards);
        assert_eq!(params.scale_threshold, 300);
        assert_eq!(params.min_use, 20);
        assert_eq!(params.notice_use_rate, 0.80);
        assert_eq!(params.extreme_use_rate, 0.60);
        assert_eq!(params.scale_use_threshold, 100);
        assert_eq!(params.scale_ratio, 0.5);
    }

    #[test]
    fn test_consensus_values_used() {
        let consensus = NetworkParams::new()
            .with("pb_mincircs", 40)
            .with("pb_extremepct", 10)
            .with("pb_dropguards", 1)
            .with("pb_scalefactor", 4)
            .with("pb_multfactor", 3);
        let params = PathBiasParams::resolve(&PathBiasConfig::default(), &consensus);
        assert_eq!(params.min_circs, 40);
        assert_eq!(params.extreme_rate, 0.10);
        assert!(params.drop_guards);
        assert_eq!(params.scale_ratio, 0.75);
    }

    #[test]
    fn test_local_overrides_win_when_valid() {
        let consensus = NetworkParams::new().with("pb_mincircs", 40).with("pb_noticepct", 90);
        let local = PathBiasConfig {
            circ_threshold: Some(25),
            notice_rate: Some(0.2),
            drop_guards: Some(false),
            ..PathBiasConfig::default()
        };
        let params = PathBiasParams::resolve(&local, &consensus.clone().with("pb_dropguards", 1));
        assert_eq!(params.min_circs, 25);
        assert_eq!(params.notice_rate, 0.2);
        assert!(!params.drop_guards);

        // Out-of-range local values fall back to the consensus
        let local = PathBiasConfig {
            circ_threshold: Some(2),
            notice_rate: Some(-1.0),
            ..PathBiasConfig::default()
        };
        let params = PathBiasParams::resolve(&local, &consensus);
        assert_eq!(params.min_circs, 40);
        assert_eq!(params.notice_rate, 0.9);
    }

    #[test]
    fn test_consensus_values_clamped() {
        let consensus = NetworkParams::new()
            .with("pb_scalecircs", 1)
            .with("pb_multfactor", 9);
        let params = PathBiasParams::resolve(&PathBiasConfig::default(), &consensus);
        assert_eq!(params.scale_threshold, 10);
        assert_eq!(params.scale_ratio, 1.0);
    }
}
