/// Loopback simulation driving a client through a batch of circuits
///
/// Every fourth circuit is left idle and closed, one is used and closed
/// through a liveness probe, one is used and proven before closing, and
/// one stays open so the API has something to show.

use onioncirc_common::{CircuitConfig, NetworkParams};
use onioncirc_core::{
    BuildFlags, CircuitId, CircuitPurpose, CloseReason, EndReason, Faults, LoopbackNetwork,
};
use tracing::{debug, info, warn};

/// Settings for one simulation run
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub relays: usize,
    pub circuits: usize,
    /// Relays that refuse every connection
    pub unreachable: usize,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            relays: 8,
            circuits: 12,
            unreachable: 1,
        }
    }
}

/// What happened to the circuits of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimReport {
    pub launched: usize,
    pub launch_failed: usize,
    pub opened: usize,
    pub build_failed: usize,
    pub closed_idle: usize,
    pub probed: usize,
    pub proven: usize,
    pub left_open: usize,
}

/// Stand up a loopback network for `options`
pub fn build_network(options: &SimOptions, client: CircuitConfig, params: NetworkParams) -> LoopbackNetwork {
    let mut network = LoopbackNetwork::new(options.relays, client, params);
    let unreachable: Vec<_> = network
        .consensus()
        .iter()
        .rev()
        .take(options.unreachable)
        .map(|relay| relay.identity)
        .collect();
    for identity in &unreachable {
        network.set_faults(
            identity,
            Faults {
                refuse_connections: true,
                ..Faults::default()
            },
        );
    }
    network
}

/// Build and exercise `circuits` circuits from the network's client
pub fn run(network: &mut LoopbackNetwork, circuits: usize) -> SimReport {
    let mut report = SimReport::default();

    for round in 0..circuits {
        let launched = network
            .client_mut()
            .launch_circuit(CircuitPurpose::General, None, BuildFlags::default());
        let id = match launched {
            Ok(id) => id,
            Err(e) => {
                warn!("Circuit launch {} failed: {}", round, e);
                report.launch_failed += 1;
                continue;
            }
        };
        report.launched += 1;
        network.run_until_idle();

        let open = network
            .client()
            .circuits()
            .origin(id)
            .map_or(false, |circ| circ.is_open());
        if !open {
            debug!("Circuit {} did not open", id);
            report.build_failed += 1;
            continue;
        }
        report.opened += 1;
        exercise(network, id, round, &mut report);
    }

    info!(
        "Simulation finished: {} launched, {} opened, {} failed to build",
        report.launched, report.opened, report.build_failed
    );
    report
}

fn exercise(network: &mut LoopbackNetwork, id: CircuitId, round: usize, report: &mut SimReport) {
    let client = network.client_mut();
    match round % 4 {
        0 => {
            client.close_circuit(id, CloseReason::local(EndReason::Finished));
            report.closed_idle += 1;
        }
        1 => {
            client.count_use_attempt(id);
            client.close_circuit(id, CloseReason::local(EndReason::Requested));
            report.probed += 1;
        }
        2 => {
            client.count_use_attempt(id);
            client.mark_use_success(id);
            client.close_circuit(id, CloseReason::local(EndReason::Finished));
            report.proven += 1;
        }
        _ => report.left_open += 1,
    }
    network.run_until_idle();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(circuits: usize, unreachable: usize) -> SimOptions {
        SimOptions {
            relays: 6,
            circuits,
            unreachable,
        }
    }

    #[test]
    fn test_reliable_network_opens_everything() {
        let options = options(8, 0);
        let mut network = build_network(&options, CircuitConfig::new(), NetworkParams::new());
        let report = run(&mut network, options.circuits);

        assert_eq!(report.launched, 8);
        assert_eq!(report.opened, 8);
        assert_eq!(report.closed_idle + report.probed + report.proven + report.left_open, 8);
        assert_eq!(network.client().circuits().origin_count(), report.left_open);
    }

    #[test]
    fn test_use_is_credited_to_guards() {
        let options = options(4, 0);
        let mut network = build_network(&options, CircuitConfig::new(), NetworkParams::new());
        run(&mut network, options.circuits);

        let client = network.client();
        let use_successes: f64 = client.guards().iter().map(|g| g.use_successes).sum();
        let circ_successes: f64 = client.guards().iter().map(|g| g.circ_successes).sum();
        assert_eq!(circ_successes, 4.0);
        // The probed and the proven circuit both count as used
        assert_eq!(use_successes, 2.0);
    }

    #[test]
    fn test_unreachable_network_opens_nothing() {
        let options = options(3, 6);
        let mut network = build_network(&options, CircuitConfig::new(), NetworkParams::new());
        let report = run(&mut network, options.circuits);

        assert_eq!(report.opened, 0);
        assert_eq!(report.launched + report.launch_failed, 3);
        assert_eq!(report.build_failed, report.launched);
        assert!(!network.client().has_completed_circuit());
    }
}
