use super::select::{choose_by_bandwidth, choose_random_node, NodeFlags};
use super::PathContext;
use crate::circuit::CircuitPurpose;
use onioncirc_common::RelayInfo;
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{info, warn};

/// Destination of an application stream waiting for a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTarget {
    /// Known only when the stream names a literal address
    pub addr: Option<IpAddr>,
    pub port: u16,
}

impl StreamTarget {
    pub fn new(addr: Option<IpAddr>, port: u16) -> Self {
        Self { addr, port }
    }
}

/// What the exit of a general-purpose circuit should be able to serve
#[derive(Debug, Clone, Default)]
pub struct ExitDemand {
    pub pending_streams: Vec<StreamTarget>,
    /// Ports we expect to need soon that no open circuit handles
    pub predicted_ports: Vec<u16>,
}

/// Pick the last hop for a circuit of `purpose`
pub fn choose_good_exit<'a>(
    ctx: &PathContext<'a>,
    purpose: CircuitPurpose,
    need_uptime: bool,
    need_capacity: bool,
    is_internal: bool,
    demand: &ExitDemand,
) -> Option<&'a RelayInfo> {
    let flags = NodeFlags::new()
        .with_uptime(need_uptime)
        .with_capacity(need_capacity)
        .with_desc();

    match purpose {
        CircuitPurpose::General | CircuitPurpose::MeasureTimeout => {
            if is_internal {
                // Internal circuits end wherever a middle hop could
                choose_random_node(ctx, &HashSet::new(), flags)
            } else {
                choose_exit_general(ctx, need_uptime, need_capacity, demand)
            }
        }
        CircuitPurpose::EstablishRend => choose_random_node(ctx, &HashSet::new(), flags),
        other => {
            warn!("Bug: Unhandled purpose {:?} when choosing an exit", other);
            None
        }
    }
}

/// Exit policy support of one relay. `None` means the relay can't be an
/// exit at all.
fn stream_support(ctx: &PathContext<'_>, relay: &RelayInfo, need_uptime: bool, need_capacity: bool, demand: &ExitDemand) -> Option<usize> {
    let config = ctx.config;
    if ctx.is_me(&relay.identity) || !relay.has_descriptor || !relay.is_running || relay.is_bad_exit {
        return None;
    }
    if (need_uptime && !relay.is_stable) || (need_capacity && !relay.is_fast) {
        return None;
    }
    if !relay.is_valid {
        return None;
    }
    if config.exclude_single_hop_relays && relay.allows_single_hop_exits {
        return None;
    }
    if relay.exit_policy.rejects_all() {
        return None;
    }
    if config.exclude_nodes.contains(&relay.identity)
        || config.exclude_exit_nodes.contains(&relay.identity)
    {
        return None;
    }
    if !config.exit_nodes.is_empty() && !config.exit_nodes.contains(&relay.identity) {
        return None;
    }

    Some(
        demand
            .pending_streams
            .iter()
            .filter(|target| relay.exit_policy.evaluate(target.addr, target.port).allows_stream())
            .count(),
    )
}

fn handles_some_port(relay: &RelayInfo, ports: &[u16]) -> bool {
    ports
        .iter()
        .any(|port| relay.exit_policy.evaluate(None, *port).allows_stream())
}

/// Choose the exit that can serve the most pending streams, weighting ties
/// by bandwidth. With nothing pending, prefer relays that handle a
/// predicted port.
fn choose_exit_general<'a>(
    ctx: &PathContext<'a>,
    need_uptime: bool,
    need_capacity: bool,
    demand: &ExitDemand,
) -> Option<&'a RelayInfo> {
    let n_pending = demand.pending_streams.len();
    let support: Vec<Option<usize>> = ctx
        .relays
        .iter()
        .map(|relay| stream_support(ctx, relay, need_uptime, need_capacity, demand))
        .collect();

    // -1 until some relay is eligible at all
    let mut best_support: i64 = -1;
    for supported in support.iter().flatten() {
        if n_pending > 0 && *supported == 0 {
            continue;
        }
        best_support = best_support.max(*supported as i64);
    }

    let chosen = if best_support > 0 {
        let best: Vec<&RelayInfo> = ctx
            .relays
            .iter()
            .zip(&support)
            .filter(|(_, s)| **s == Some(best_support as usize))
            .map(|(relay, _)| relay)
            .collect();
        choose_by_bandwidth(&best)
    } else {
        if best_support == -1 {
            if need_uptime || need_capacity {
                info!(
                    "We couldn't find any live{}{} routers; falling back to list of all routers.",
                    if need_capacity { ", fast" } else { "" },
                    if need_uptime { ", stable" } else { "" }
                );
                return choose_exit_general(ctx, false, false, demand);
            }
            info!(
                "All routers are down or won't exit{} -- choosing a doomed exit at random.",
                if ctx.config.exclude_exit_nodes.is_empty() { "" } else { " or are Excluded" }
            );
        }

        // Relays handling a needed port first, then any eligible relay
        let mut chosen = None;
        for attempt in 0..2 {
            let candidates: Vec<&RelayInfo> = ctx
                .relays
                .iter()
                .zip(&support)
                .filter(|(_, s)| s.is_some())
                .filter(|(relay, _)| attempt > 0 || handles_some_port(relay, &demand.predicted_ports))
                .map(|(relay, _)| relay)
                .collect();
            chosen = choose_by_bandwidth(&candidates);
            if chosen.is_some() {
                break;
            }
        }
        chosen
    };

    match chosen {
        Some(relay) => {
            info!("Chose exit server {}~{}", relay.identity, relay.nickname);
            Some(relay)
        }
        None => {
            if !ctx.config.exit_nodes.is_empty() {
                warn!("No specified exit routers seem to be running: can't choose an exit.");
            }
            None
        }
    }
}
