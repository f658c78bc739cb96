//! Success-rate checks and counter scaling for one guard.
//!
//! Circuits that are still open are given the benefit of the doubt: the
//! caller supplies `open(from, to)`, the number of live counted circuits
//! through the guard whose path state lies in `from..=to`.

use super::params::PathBiasParams;
use crate::circuit::PathState;
use crate::guard::EntryGuard;
use onioncirc_common::Timestamp;
use tracing::{info, warn};

/// Live circuits through a guard in an inclusive path-state range
pub trait OpenCircuits {
    fn count(&self, from: PathState, to: PathState) -> usize;
}

impl<F: Fn(PathState, PathState) -> usize> OpenCircuits for F {
    fn count(&self, from: PathState, to: PathState) -> usize {
        self(from, to)
    }
}

/// Successful closes plus circuits that built and are still open
pub fn close_success_count(guard: &EntryGuard, open: &impl OpenCircuits) -> f64 {
    guard.successful_circuits_closed
        + open.count(PathState::BuildSucceeded, PathState::UseSucceeded) as f64
}

/// Successful uses plus circuits being used right now
pub fn use_success_count(guard: &EntryGuard, open: &impl OpenCircuits) -> f64 {
    guard.use_successes + open.count(PathState::UseAttempted, PathState::UseSucceeded) as f64
}

fn describe(guard: &EntryGuard, open: &impl OpenCircuits) -> String {
    format!(
        "Success counts are {:.0}/{:.0}. Use counts are {:.0}/{:.0}. \
         {:.0} circuits completed, {:.0} were unusable, {:.0} collapsed, and {:.0} timed out.",
        close_success_count(guard, open),
        guard.circ_attempts,
        use_success_count(guard, open),
        guard.use_attempts,
        guard.circ_successes,
        guard.unusable_circuits,
        guard.collapsed_circuits,
        guard.timeouts,
    )
}

fn disable(guard: &mut EntryGuard) {
    guard.path_bias_disabled = true;
    guard.bad_since = Some(Timestamp::now());
}

/// Judge the build success rate once enough circuits were attempted.
/// Each severity is reported once per guard. A strict `<` lets a rate of
/// zero turn a check off.
pub fn measure_close_rate(guard: &mut EntryGuard, params: &PathBiasParams, open: &impl OpenCircuits) {
    if guard.circ_attempts <= params.min_circs as f64 {
        return;
    }
    let rate = close_success_count(guard, open) / guard.circ_attempts;

    if rate < params.extreme_rate {
        if params.drop_guards {
            if !guard.path_bias_disabled {
                warn!(
                    "Your guard {} ({}) is failing an extremely large amount of circuits. \
                     To avoid potential route manipulation attacks, it has been disabled. {}",
                    guard.nickname,
                    guard.identity,
                    describe(guard, open)
                );
                disable(guard);
            }
        } else if !guard.path_bias_extreme {
            guard.path_bias_extreme = true;
            warn!(
                "Your guard {} ({}) is failing an extremely large amount of circuits. \
                 This could indicate a route manipulation attack, extreme network overload, \
                 or a bug. {}",
                guard.nickname,
                guard.identity,
                describe(guard, open)
            );
        }
    } else if rate < params.warn_rate {
        if !guard.path_bias_warned {
            guard.path_bias_warned = true;
            warn!(
                "Your guard {} ({}) is failing a very large amount of circuits. \
                 Most likely the network is overloaded, but it could also mean an attack \
                 against you or the guard itself. {}",
                guard.nickname,
                guard.identity,
                describe(guard, open)
            );
        }
    } else if rate < params.notice_rate && !guard.path_bias_noticed {
        guard.path_bias_noticed = true;
        info!(
            "Your guard {} ({}) is failing more circuits than usual. \
             Most likely the network is overloaded. {}",
            guard.nickname,
            guard.identity,
            describe(guard, open)
        );
    }
}

/// Judge the use success rate once enough circuits were used
pub fn measure_use_rate(guard: &mut EntryGuard, params: &PathBiasParams, open: &impl OpenCircuits) {
    if guard.use_attempts <= params.min_use as f64 {
        return;
    }
    let rate = use_success_count(guard, open) / guard.use_attempts;

    if rate < params.extreme_use_rate {
        if params.drop_guards {
            if !guard.path_bias_disabled {
                warn!(
                    "Your guard {} ({}) is failing to carry an extremely large amount of \
                     streams on its circuits. To avoid potential route manipulation attacks, \
                     it has been disabled. {}",
                    guard.nickname,
                    guard.identity,
                    describe(guard, open)
                );
                disable(guard);
            }
        } else if !guard.path_bias_use_extreme {
            guard.path_bias_use_extreme = true;
            warn!(
                "Your guard {} ({}) is failing to carry an extremely large amount of streams \
                 on its circuits. This could indicate a route manipulation attack, network \
                 overload, bad local network connectivity, or a bug. {}",
                guard.nickname,
                guard.identity,
                describe(guard, open)
            );
        }
    } else if rate < params.notice_use_rate && !guard.path_bias_use_noticed {
        guard.path_bias_use_noticed = true;
        info!(
            "Your guard {} ({}) is failing to carry more streams on its circuits than usual. \
             Most likely the network is overloaded or your connection is poor. {}",
            guard.nickname,
            guard.identity,
            describe(guard, open)
        );
    }
}

/// Scale build counters down once there are many of them. Circuits still
/// in flight are taken out first and put back afterwards, so each one
/// keeps exactly one attempt (and, once built, one success).
pub fn scale_close_rates(guard: &mut EntryGuard, params: &PathBiasParams, open: &impl OpenCircuits) {
    if guard.circ_attempts <= params.scale_threshold as f64 {
        return;
    }
    let ratio = params.scale_ratio;
    let opened_attempts =
        open.count(PathState::BuildAttempted, PathState::BuildAttempted) as f64;
    let opened_built = open.count(PathState::BuildSucceeded, PathState::UseFailed) as f64;
    let counts_are_sane = guard.circ_attempts >= guard.circ_successes;

    guard.circ_attempts -= opened_attempts + opened_built;
    guard.circ_successes -= opened_built;

    guard.circ_attempts *= ratio;
    guard.circ_successes *= ratio;
    guard.timeouts *= ratio;
    guard.successful_circuits_closed *= ratio;
    guard.collapsed_circuits *= ratio;
    guard.unusable_circuits *= ratio;

    guard.circ_attempts += opened_attempts + opened_built;
    guard.circ_successes += opened_built;

    info!(
        "Scaled pathbias counts to ({:.2},{:.2})/{:.2} ({}/{} open) for guard {} ({})",
        guard.circ_successes,
        guard.successful_circuits_closed,
        guard.circ_attempts,
        opened_built,
        opened_attempts,
        guard.nickname,
        guard.identity
    );

    if counts_are_sane && guard.circ_attempts < guard.circ_successes {
        info!(
            "Bug: Scaling has mangled pathbias counts to {:.2}/{:.2} ({}/{} open) for guard {} ({})",
            guard.circ_successes,
            guard.circ_attempts,
            opened_built,
            opened_attempts,
            guard.nickname,
            guard.identity
        );
    }
}

/// Scale use counters down once there are many of them
pub fn scale_use_rates(guard: &mut EntryGuard, params: &PathBiasParams, open: &impl OpenCircuits) {
    if guard.use_attempts <= params.scale_use_threshold as f64 {
        return;
    }
    let ratio = params.scale_ratio;
    let opened_attempts = open.count(PathState::UseAttempted, PathState::UseSucceeded) as f64;
    let counts_are_sane = guard.use_attempts >= guard.use_successes;

    guard.use_attempts -= opened_attempts;
    guard.use_attempts *= ratio;
    guard.use_successes *= ratio;
    guard.use_attempts += opened_attempts;

    info!(
        "Scaled pathbias use counts to {:.2}/{:.2} ({} open) for guard {} ({})",
        guard.use_successes, guard.use_attempts, opened_attempts, guard.nickname, guard.identity
    );

    if counts_are_sane && guard.use_attempts < guard.use_successes {
        info!(
            "Bug: Scaling has mangled pathbias usage counts to {:.2}/{:.2} ({} open) for guard {} ({})",
            guard.use_successes, guard.use_attempts, opened_attempts, guard.nickname, guard.identity
        );
    }
}

/// Count one more circuit attempt through `guard`, first judging and
/// scaling what came before. Returns false when the guard has just been
/// (or already was) disabled and the attempt must not proceed.
pub fn inc_circ_attempt(guard: &mut EntryGuard, params: &PathBiasParams, open: &impl OpenCircuits) -> bool {
    measure_close_rate(guard, params, open);
    if guard.path_bias_disabled {
        return false;
    }
    scale_close_rates(guard, params, open);
    guard.circ_attempts += 1.0;

    info!(
        "Got success count {:.2}/{:.2} for guard {} ({})",
        guard.circ_successes, guard.circ_attempts, guard.nickname, guard.identity
    );
    true
}

/// Count one more use attempt through `guard`
pub fn inc_use_attempt(guard: &mut EntryGuard, params: &PathBiasParams, open: &impl OpenCircuits) {
    measure_use_rate(guard, params, open);
    scale_use_rates(guard, params, open);
    guard.use_attempts += 1.0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use onioncirc_common::RelayId;
    use proptest::prelude::*;

    fn guard() -> EntryGuard {
        EntryGuard::new(RelayId::from([7u8; 20]), "guard")
    }

    fn none_open(_: PathState, _: PathState) -> usize {
        0
    }

    fn params() -> PathBiasParams {
        PathBiasParams {
            min_circs: 20,
            scale_threshold: 100,
            min_use: 10,
            scale_use_threshold: 50,
            ..PathBiasParams::default()
        }
    }

    #[test]
    fn test_no_judgement_below_minimum() {
        let mut g = guard();
        g.circ_attempts = 20.0;
        measure_close_rate(&mut g, &params(), &none_open);
        assert!(!g.path_bias_extreme && !g.path_bias_warned && !g.path_bias_noticed);
    }

    #[test]
    fn test_severity_levels() {
        let p = params();

        let mut g = guard();
        g.circ_attempts = 100.0;
        g.successful_circuits_closed = 60.0;
        measure_close_rate(&mut g, &p, &none_open);
        assert!(g.path_bias_noticed && !g.path_bias_warned);

        let mut g = guard();
        g.circ_attempts = 100.0;
        g.successful_circuits_closed = 40.0;
        measure_close_rate(&mut g, &p, &none_open);
        assert!(g.path_bias_warned && !g.path_bias_extreme);

        let mut g = guard();
        g.circ_attempts = 100.0;
        g.successful_circuits_closed = 10.0;
        measure_close_rate(&mut g, &p, &none_open);
        assert!(g.path_bias_extreme && !g.path_bias_disabled);
    }

    #[test]
    fn test_open_circuits_get_benefit_of_doubt() {
        let mut g = guard();
        g.circ_attempts = 100.0;
        g.successful_circuits_closed = 10.0;
        let open = |from: PathState, to: PathState| {
            if from == PathState::BuildSucceeded && to == PathState::UseSucceeded {
                80
            } else {
                0
            }
        };
        measure_close_rate(&mut g, &params(), &open);
        assert!(!g.path_bias_extreme && !g.path_bias_warned && !g.path_bias_noticed);
    }

    #[test]
    fn test_drop_guards_disables() {
        let p = PathBiasParams {
            drop_guards: true,
            ..params()
        };
        let mut g = guard();
        g.circ_attempts = 100.0;
        g.successful_circuits_closed = 5.0;
        assert!(!inc_circ_attempt(&mut g, &p, &none_open));
        assert!(g.path_bias_disabled);
        assert!(g.bad_since.is_some());
        assert_eq!(g.circ_attempts, 100.0);
    }

    #[test]
    fn test_use_rate_levels() {
        let p = params();
        let mut g = guard();
        g.use_attempts = 20.0;
        g.use_successes = 14.0;
        measure_use_rate(&mut g, &p, &none_open);
        assert!(g.path_bias_use_noticed && !g.path_bias_use_extreme);

        let mut g = guard();
        g.use_attempts = 20.0;
        g.use_successes = 5.0;
        measure_use_rate(&mut g, &p, &none_open);
        assert!(g.path_bias_use_extreme);
    }

    #[test]
    fn test_scaling_keeps_open_circuits() {
        let mut g = guard();
        g.circ_attempts = 110.0;
        g.circ_successes = 90.0;
        g.successful_circuits_closed = 80.0;
        let open = |from: PathState, to: PathState| match (from, to) {
            (PathState::BuildAttempted, PathState::BuildAttempted) => 4,
            (PathState::BuildSucceeded, PathState::UseFailed) => 10,
            _ => 0,
        };
        scale_close_rates(&mut g, &params(), &open);
        // (110 - 14) / 2 + 14 and (90 - 10) / 2 + 10
        assert_eq!(g.circ_attempts, 62.0);
        assert_eq!(g.circ_successes, 50.0);
        assert_eq!(g.successful_circuits_closed, 40.0);
    }

    #[test]
    fn test_use_scaling() {
        let mut g = guard();
        g.use_attempts = 60.0;
        g.use_successes = 40.0;
        let open = |from: PathState, _: PathState| {
            if from == PathState::UseAttempted {
                2
            } else {
                0
            }
        };
        inc_use_attempt(&mut g, &params(), &open);
        assert_eq!(g.use_attempts, 32.0);
        assert_eq!(g.use_successes, 20.0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Attempt,
        Build(usize),
        Use(usize),
        UseSucceed(usize),
        Close(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Attempt),
            3 => any::<usize>().prop_map(Op::Build),
            2 => any::<usize>().prop_map(Op::Use),
            2 => any::<usize>().prop_map(Op::UseSucceed),
            3 => any::<usize>().prop_map(Op::Close),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_successes_never_exceed_attempts(
            ops in proptest::collection::vec(op(), 1..400),
            denominator in 2i32..6,
            numerator_seed in 0i32..6,
        ) {
            let numerator = 1 + numerator_seed % (denominator - 1);
            let p = PathBiasParams {
                min_circs: 10,
                scale_threshold: 20,
                min_use: 5,
                scale_use_threshold: 10,
                scale_ratio: numerator as f64 / denominator as f64,
                ..PathBiasParams::default()
            };
            let mut g = guard();
            let mut live: Vec<PathState> = Vec::new();

            for op in ops {
                match op {
                    Op::Attempt => {
                        live.push(PathState::BuildAttempted);
                        let snapshot = live.clone();
                        let open = |from: PathState, to: PathState| {
                            snapshot.iter().filter(|s| **s >= from && **s <= to).count()
                        };
                        inc_circ_attempt(&mut g, &p, &open);
                    }
                    Op::Build(i) if !live.is_empty() => {
                        let i = i % live.len();
                        if live[i] == PathState::BuildAttempted {
                            live[i] = PathState::BuildSucceeded;
                            g.circ_successes += 1.0;
                        }
                    }
                    Op::Use(i) if !live.is_empty() => {
                        let i = i % live.len();
                        if live[i] == PathState::BuildSucceeded {
                            let snapshot = live.clone();
                            let open = |from: PathState, to: PathState| {
                                snapshot.iter().filter(|s| **s >= from && **s <= to).count()
                            };
                            inc_use_attempt(&mut g, &p, &open);
                            live[i] = PathState::UseAttempted;
                        }
                    }
                    Op::UseSucceed(i) if !live.is_empty() => {
                        let i = i % live.len();
                        if live[i] == PathState::UseAttempted {
                            live[i] = PathState::UseSucceeded;
                        }
                    }
                    Op::Close(i) if !live.is_empty() => {
                        let i = i % live.len();
                        match live.remove(i) {
                            PathState::BuildSucceeded => g.successful_circuits_closed += 1.0,
                            PathState::UseSucceeded => {
                                g.successful_circuits_closed += 1.0;
                                g.use_successes += 1.0;
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
                prop_assert!(g.circ_successes <= g.circ_attempts + 1e-9);
                prop_assert!(g.use_successes <= g.use_attempts + 1e-9);
            }
        }
    }
}
