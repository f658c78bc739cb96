/// Entry guards: the small, long-lived set of relays this client enters
/// the network through, with the path-bias statistics kept for each.
use crate::circuit::BuildState;
use crate::path::{choose_entry, PathContext};
use onioncirc_common::{RelayId, RelayInfo, Timestamp};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

/// One entry guard and its path-bias record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryGuard {
    pub identity: RelayId,
    pub nickname: String,
    pub added_at: Timestamp,
    /// Set when the guard became unusable, including when path bias
    /// disabled it
    pub bad_since: Option<Timestamp>,
    /// We have completed a first hop through this guard
    pub made_contact: bool,

    // One-shot log flags
    pub path_bias_noticed: bool,
    pub path_bias_warned: bool,
    pub path_bias_extreme: bool,
    pub path_bias_disabled: bool,
    pub path_bias_use_noticed: bool,
    pub path_bias_use_extreme: bool,

    // Counters are fractional because scaling multiplies them down
    pub circ_attempts: f64,
    pub circ_successes: f64,
    pub successful_circuits_closed: f64,
    pub collapsed_circuits: f64,
    pub unusable_circuits: f64,
    pub timeouts: f64,
    pub use_attempts: f64,
    pub use_successes: f64,
}

impl EntryGuard {
    pub fn new(identity: RelayId, nickname: impl Into<String>) -> Self {
        Self {
            identity,
            nickname: nickname.into(),
            added_at: Timestamp::now(),
            bad_since: None,
            made_contact: false,
            path_bias_noticed: false,
            path_bias_warned: false,
            path_bias_extreme: false,
            path_bias_disabled: false,
            path_bias_use_noticed: false,
            path_bias_use_extreme: false,
            circ_attempts: 0.0,
            circ_successes: 0.0,
            successful_circuits_closed: 0.0,
            collapsed_circuits: 0.0,
            unusable_circuits: 0.0,
            timeouts: 0.0,
            use_attempts: 0.0,
            use_successes: 0.0,
        }
    }

    /// Relay for this guard if it can carry a circuit right now
    pub fn live_relay<'a>(
        &self,
        ctx: &PathContext<'a>,
        need_uptime: bool,
        need_capacity: bool,
    ) -> Option<&'a RelayInfo> {
        if self.bad_since.is_some() || self.path_bias_disabled {
            return None;
        }
        let relay = ctx.relay(&self.identity)?;
        if !relay.has_descriptor || !relay.is_running {
            return None;
        }
        if (need_uptime && !relay.is_stable) || (need_capacity && !relay.is_fast) {
            return None;
        }
        if !ctx.firewall_allows(relay) {
            return None;
        }
        Some(relay)
    }
}

/// Ordered list of entry guards, most preferred first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardRegistry {
    guards: Vec<EntryGuard>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Append a guard unless it is already known
    pub fn add(&mut self, guard: EntryGuard) -> bool {
        if self.get(&guard.identity).is_some() {
            return false;
        }
        info!("Chose {}~{} as new entry guard.", guard.identity, guard.nickname);
        self.guards.push(guard);
        true
    }

    pub fn get(&self, identity: &RelayId) -> Option<&EntryGuard> {
        self.guards.iter().find(|g| g.identity == *identity)
    }

    pub fn get_mut(&mut self, identity: &RelayId) -> Option<&mut EntryGuard> {
        self.guards.iter_mut().find(|g| g.identity == *identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryGuard> {
        self.guards.iter()
    }

    pub fn identities(&self) -> Vec<RelayId> {
        self.guards.iter().map(|g| g.identity).collect()
    }

    /// Guards that are live with capacity required
    pub fn num_live(&self, ctx: &PathContext<'_>) -> usize {
        self.guards
            .iter()
            .filter(|g| g.live_relay(ctx, false, true).is_some())
            .count()
    }

    /// Choose a new guard from the consensus and append it
    pub fn add_an_entry_guard<'a>(&mut self, ctx: &PathContext<'a>) -> Option<&'a RelayInfo> {
        let relay = choose_entry(ctx, None, &self.identities())?;
        self.add(EntryGuard::new(relay.identity, relay.nickname.clone()));
        Some(relay)
    }

    /// Top the list up until `num_entry_guards` guards are live
    pub fn pick_entry_guards(&mut self, ctx: &PathContext<'_>) {
        while self.num_live(ctx) < ctx.config.num_entry_guards {
            if self.add_an_entry_guard(ctx).is_none() {
                break;
            }
        }
    }

    /// Pick the entry for a circuit. The first live guard we have never
    /// reached wins outright; otherwise choose among the first
    /// `num_entry_guards` live guards, avoiding the exit and its family.
    pub fn choose_random_entry<'a>(
        &mut self,
        ctx: &PathContext<'a>,
        state: Option<&BuildState>,
    ) -> Option<&'a RelayInfo> {
        let mut exit_family = HashSet::new();
        let chosen_exit = state.and_then(|s| s.chosen_exit.as_ref());
        if let Some(exit) = chosen_exit {
            ctx.add_info_and_family(exit, &mut exit_family);
        }
        let mut need_uptime = state.map_or(false, |s| s.need_uptime);
        let mut need_capacity = state.map_or(false, |s| s.need_capacity);

        if self.guards.len() < ctx.config.num_entry_guards {
            self.pick_entry_guards(ctx);
        }

        loop {
            let mut live: Vec<&'a RelayInfo> = Vec::new();
            let mut fresh = None;
            for guard in &self.guards {
                let relay = match guard.live_relay(ctx, need_uptime, need_capacity) {
                    Some(relay) => relay,
                    None => continue,
                };
                if exit_family.contains(&relay.identity) {
                    continue;
                }
                live.push(relay);
                if !guard.made_contact {
                    fresh = Some(relay);
                    break;
                }
                if live.len() >= ctx.config.num_entry_guards {
                    break;
                }
            }

            if let Some(relay) = fresh {
                return Some(relay);
            }
            if live.len() >= 2 || live.len() >= ctx.config.num_entry_guards {
                return live.choose(&mut rand::thread_rng()).copied();
            }

            // Too few choices: grow the list, then relax requirements
            if self.add_an_entry_guard(ctx).is_some() {
                continue;
            }
            if need_uptime {
                need_uptime = false;
                continue;
            }
            if need_capacity {
                need_capacity = false;
                continue;
            }
            debug!("Only {} live entry guards available", live.len());
            return live.choose(&mut rand::thread_rng()).copied();
        }
    }

    /// Mark that a first hop through `identity` completed
    pub fn note_contact(&mut self, identity: &RelayId) {
        if let Some(guard) = self.get_mut(identity) {
            if !guard.made_contact {
                debug!("Made first contact with entry guard {}", identity);
                guard.made_contact = true;
            }
        }
    }
}
