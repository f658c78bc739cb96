use super::PathContext;
use crate::circuit::{BuildState, CircuitPurpose};
use crate::extend_info::ExtendInfo;
use onioncirc_common::{RelayId, RelayInfo};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use tracing::{debug, info};

/// Requirements a randomly chosen relay must meet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    pub need_uptime: bool,
    pub need_capacity: bool,
    pub need_guard: bool,
    pub need_desc: bool,
    pub allow_invalid: bool,
}

impl NodeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uptime(mut self, needed: bool) -> Self {
        self.need_uptime = needed;
        self
    }

    pub fn with_capacity(mut self, needed: bool) -> Self {
        self.need_capacity = needed;
        self
    }

    pub fn guard(mut self) -> Self {
        self.need_guard = true;
        self
    }

    pub fn with_desc(mut self) -> Self {
        self.need_desc = true;
        self
    }

    fn admits(&self, relay: &RelayInfo) -> bool {
        if !relay.is_running {
            return false;
        }
        if self.need_desc && !relay.has_descriptor {
            return false;
        }
        if self.need_uptime && !relay.is_stable {
            return false;
        }
        if self.need_capacity && !relay.is_fast {
            return false;
        }
        if self.need_guard && !relay.is_possible_guard {
            return false;
        }
        self.allow_invalid || relay.is_valid
    }

    fn relaxed(self) -> Self {
        Self {
            need_uptime: false,
            need_capacity: false,
            ..self
        }
    }
}

/// Bandwidth-weighted random choice. Relays that advertise no bandwidth
/// still get a minimal weight.
pub fn choose_by_bandwidth<'a>(candidates: &[&'a RelayInfo]) -> Option<&'a RelayInfo> {
    let mut rng = rand::thread_rng();
    candidates
        .choose_weighted(&mut rng, |relay| relay.bandwidth.weight().max(1))
        .ok()
        .copied()
}

/// Pick a random relay that meets `flags` and is not in `excluded`. When
/// nothing qualifies and uptime or capacity was required, try once more
/// without them.
pub fn choose_random_node<'a>(
    ctx: &PathContext<'a>,
    excluded: &HashSet<RelayId>,
    flags: NodeFlags,
) -> Option<&'a RelayInfo> {
    let mut excluded_all = ctx.base_exclusions();
    excluded_all.extend(excluded.iter().copied());

    let pick = |flags: NodeFlags| {
        let candidates: Vec<&RelayInfo> = ctx
            .relays
            .iter()
            .filter(|relay| !excluded_all.contains(&relay.identity))
            .filter(|relay| flags.admits(relay))
            .collect();
        choose_by_bandwidth(&candidates)
    };

    let choice = pick(flags);
    if choice.is_none() && (flags.need_uptime || flags.need_capacity) {
        info!(
            "We couldn't find any live{}{} routers; falling back to list of all routers.",
            if flags.need_capacity { ", fast" } else { "" },
            if flags.need_uptime { ", stable" } else { "" }
        );
        return pick(flags.relaxed());
    }
    choice
}

/// Pick a middle hop for position `cur_len`, avoiding the chosen exit,
/// every hop already on the path, and all of their families
pub fn choose_middle<'a>(
    ctx: &PathContext<'a>,
    purpose: CircuitPurpose,
    state: &BuildState,
    hops: &[&ExtendInfo],
    cur_len: usize,
) -> Option<&'a RelayInfo> {
    debug!("Contemplating intermediate hop {}: {}", cur_len, purpose);

    let mut excluded = HashSet::new();
    if let Some(exit) = &state.chosen_exit {
        ctx.add_info_and_family(exit, &mut excluded);
    }
    for hop in hops {
        ctx.add_info_and_family(hop, &mut excluded);
    }

    let flags = NodeFlags::new()
        .with_uptime(state.need_uptime)
        .with_capacity(state.need_capacity)
        .with_desc();
    choose_random_node(ctx, &excluded, flags)
}

/// Pick an entry without consulting the guard list. Current guards and
/// their families are avoided, since this is how new guards are found.
pub fn choose_entry<'a>(
    ctx: &PathContext<'a>,
    state: Option<&BuildState>,
    guards: &[RelayId],
) -> Option<&'a RelayInfo> {
    let mut excluded = HashSet::new();
    if let Some(exit) = state.and_then(|s| s.chosen_exit.as_ref()) {
        ctx.add_info_and_family(exit, &mut excluded);
    }

    for relay in ctx.relays {
        if !ctx.firewall_allows(relay) {
            excluded.insert(relay.identity);
        }
    }

    if ctx.config.use_entry_guards {
        for guard in guards {
            match ctx.relay(guard) {
                Some(relay) => ctx.add_relay_and_family(relay, &mut excluded),
                None => {
                    excluded.insert(*guard);
                }
            }
        }
    }

    let mut flags = NodeFlags::new().guard().with_desc();
    if let Some(state) = state {
        flags = flags
            .with_uptime(state.need_uptime)
            .with_capacity(state.need_capacity);
    }
    choose_random_node(ctx, &excluded, flags)
}
