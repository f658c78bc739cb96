/// Path selection: how long a circuit should be and which relays fill
/// each position.
///
/// Selectors never return a relay that is excluded by configuration, that
/// is this node itself, or that shares a family with a relay already on
/// the path. Ties are broken by bandwidth-weighted random choice.
mod exit;
mod select;

pub use exit::{choose_good_exit, ExitDemand, StreamTarget};
pub use select::{choose_by_bandwidth, choose_entry, choose_middle, choose_random_node, NodeFlags};

use crate::circuit::CircuitPurpose;
use crate::extend_info::ExtendInfo;
use onioncirc_common::{routing, same_subnet_16, CircuitConfig, RelayId, RelayInfo};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

/// The relay list and options a selection runs against
#[derive(Debug, Clone, Copy)]
pub struct PathContext<'a> {
    pub relays: &'a [RelayInfo],
    pub config: &'a CircuitConfig,
    /// Our own identity when running as a relay
    pub me: Option<RelayId>,
}

impl<'a> PathContext<'a> {
    pub fn new(relays: &'a [RelayInfo], config: &'a CircuitConfig) -> Self {
        Self {
            relays,
            config,
            me: None,
        }
    }

    pub fn with_me(mut self, me: Option<RelayId>) -> Self {
        self.me = me;
        self
    }

    pub fn relay(&self, id: &RelayId) -> Option<&'a RelayInfo> {
        self.relays.iter().find(|relay| relay.identity == *id)
    }

    pub fn is_me(&self, id: &RelayId) -> bool {
        self.me.as_ref() == Some(id)
    }

    /// Add `relay` and every relay in its family to `set`
    pub fn add_relay_and_family(&self, relay: &RelayInfo, set: &mut HashSet<RelayId>) {
        set.insert(relay.identity);
        let enforce_subnets = self.config.enforce_distinct_subnets;
        for other in self.relays {
            if other.identity == relay.identity {
                continue;
            }
            if relay.declares_mutual_family(other)
                || (enforce_subnets && same_subnet_16(&relay.or_addr.ip(), &other.or_addr.ip()))
            {
                set.insert(other.identity);
            }
        }
    }

    /// Add the relay named by `info` and its family, if we know it
    pub fn add_info_and_family(&self, info: &ExtendInfo, set: &mut HashSet<RelayId>) {
        match self.relay(&info.identity) {
            Some(relay) => self.add_relay_and_family(relay, set),
            None => {
                set.insert(info.identity);
            }
        }
    }

    /// Whether our firewall lets us reach `relay` directly
    pub fn firewall_allows(&self, relay: &RelayInfo) -> bool {
        let ports = &self.config.reachable_or_ports;
        ports.is_empty() || ports.contains(&relay.or_port())
    }

    /// Exclusions every selection honors: configured ExcludeNodes, plus
    /// this node and its family
    pub fn base_exclusions(&self) -> HashSet<RelayId> {
        let mut excluded: HashSet<RelayId> = self.config.exclude_nodes.iter().copied().collect();
        if let Some(me) = self.me {
            match self.relay(&me) {
                Some(relay) => self.add_relay_and_family(relay, &mut excluded),
                None => {
                    excluded.insert(me);
                }
            }
        }
        excluded
    }
}

/// Relays that could appear on a path at all
pub fn count_acceptable_relays(relays: &[RelayInfo]) -> usize {
    relays.iter().filter(|relay| relay.is_acceptable()).count()
}

/// Number of hops for a new circuit. A chosen exit adds a hop unless the
/// purpose makes the exit choice harmless.
pub fn choose_path_length(
    purpose: CircuitPurpose,
    exit: Option<&ExtendInfo>,
    relays: &[RelayInfo],
) -> Result<usize, PathSelectionError> {
    let mut route_len = routing::DEFAULT_ROUTE_LEN;
    if exit.is_some() && !purpose.exit_leaks_nothing() {
        route_len += 1;
    }

    let acceptable = count_acceptable_relays(relays);
    if acceptable < routing::MIN_ACCEPTABLE_RELAYS {
        warn!(
            "Not enough acceptable routers ({}/{}). Discarding this circuit.",
            acceptable,
            relays.len()
        );
        return Err(PathSelectionError::NotEnoughRelays { acceptable });
    }

    if acceptable < route_len {
        info!(
            "Not enough acceptable routers ({}). Cutting path length from {} to {}.",
            acceptable, route_len, acceptable
        );
        route_len = acceptable;
    }
    Ok(route_len)
}

/// Errors that abort path selection for one circuit attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathSelectionError {
    #[error("Not enough acceptable routers ({acceptable})")]
    NotEnoughRelays { acceptable: usize },

    #[error("No suitable exit relay")]
    NoExit,

    #[error("No suitable entry relay")]
    NoEntry,

    #[error("No suitable relay for hop {hop}")]
    NoMiddle { hop: usize },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use onioncirc_common::{Bandwidth, ExitPolicy};
    use std::net::SocketAddr;

    /// `count` running, valid, fast, stable guard-capable exits on
    /// distinct /16s
    pub(crate) fn create_test_relays(count: u8) -> Vec<RelayInfo> {
        (1..=count)
            .map(|n| {
                let addr: SocketAddr = format!("{}.{}.0.1:9001", 10 + n, n).parse().unwrap();
                let mut relay = RelayInfo::new(RelayId::from([n; 20]), format!("relay{}", n), addr);
                relay.bandwidth = Bandwidth::from_kb(100 * n as u64);
                relay.is_running = true;
                relay.is_valid = true;
                relay.is_fast = true;
                relay.is_stable = true;
                relay.is_possible_guard = true;
                relay.has_descriptor = true;
                relay.onion_key = Some([n; 32]);
                relay.ntor_onion_key = Some([n.wrapping_add(100); 32]);
                relay.exit_policy = ExitPolicy::accept_all();
                relay
            })
            .collect()
    }

    #[test]
    fn test_path_length_defaults() {
        let relays = create_test_relays(10);
        assert_eq!(choose_path_length(CircuitPurpose::General, None, &relays), Ok(3));
    }

    #[test]
    fn test_path_length_degrades() {
        let relays = create_test_relays(2);
        assert_eq!(choose_path_length(CircuitPurpose::General, None, &relays), Ok(2));

        let relays = create_test_relays(1);
        assert_eq!(
            choose_path_length(CircuitPurpose::General, None, &relays),
            Err(PathSelectionError::NotEnoughRelays { acceptable: 1 })
        );
    }

    #[test]
    fn test_chosen_exit_adds_hop() {
        let relays = create_test_relays(10);
        let exit = ExtendInfo::from_relay(&relays[0], false, false);
        assert_eq!(
            choose_path_length(CircuitPurpose::General, Some(&exit), &relays),
            Ok(4)
        );
        assert_eq!(
            choose_path_length(CircuitPurpose::Testing, Some(&exit), &relays),
            Ok(3)
        );
    }

    #[test]
    fn test_unacceptable_relays_do_not_count() {
        let mut relays = create_test_relays(4);
        relays[0].is_running = false;
        relays[1].has_descriptor = false;
        assert_eq!(count_acceptable_relays(&relays), 2);
        assert_eq!(choose_path_length(CircuitPurpose::General, None, &relays), Ok(2));
    }

    #[test]
    fn test_family_and_subnets() {
        let mut relays = create_test_relays(4);
        relays[0].family = vec![relays[1].identity];
        relays[1].family = vec![relays[0].identity];
        relays[2].family = vec![relays[0].identity];
        relays[3].or_addr = "11.1.9.9:9001".parse().unwrap();

        let mut config = CircuitConfig::default();
        config.enforce_distinct_subnets = false;
        let ctx = PathContext::new(&relays, &config);
        let mut family = HashSet::new();
        ctx.add_relay_and_family(&relays[0], &mut family);
        assert!(family.contains(&relays[1].identity));
        // One-sided declarations do not make a family
        assert!(!family.contains(&relays[2].identity));
        assert!(!family.contains(&relays[3].identity));

        config.enforce_distinct_subnets = true;
        let ctx = PathContext::new(&relays, &config);
        let mut family = HashSet::new();
        ctx.add_relay_and_family(&relays[0], &mut family);
        assert!(family.contains(&relays[3].identity));
    }

    #[test]
    fn test_base_exclusions() {
        let relays = create_test_relays(3);
        let mut config = CircuitConfig::default();
        config.exclude_nodes = vec![relays[2].identity];
        let ctx = PathContext::new(&relays, &config).with_me(Some(relays[0].identity));
        let excluded = ctx.base_exclusions();
        assert!(excluded.contains(&relays[0].identity));
        assert!(excluded.contains(&relays[2].identity));
        assert!(!excluded.contains(&relays[1].identity));
    }
}
