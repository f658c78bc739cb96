/// Origin-side circuit construction
///
/// A circuit is built one hop at a time:
/// 1. Choose the whole path up front (exit first, then entry, then middles)
/// 2. Get a channel to the entry and send CREATE or CREATE_FAST
/// 3. On each CREATED/EXTENDED, finish that hop's handshake and send an
///    EXTEND through the path built so far
/// 4. Once every hop is open, record the build time and count the success
use super::build_times::BuildTimeOutcome;
use super::cpath::HopState;
use super::crypto::{CryptoSide, HopCrypto};
use super::origin::OriginCircuit;
use super::types::{BuildFlags, CircuitError, CircuitId, CircuitPurpose, CircuitState, CloseReason};
use crate::cell::{CreateCell, CreateCellType, EndReason, ExtendCell, HandshakeType, RelayMsg};
use crate::channel::{ChannelId, ChannelLayer, ChannelLookup};
use crate::extend_info::ExtendInfo;
use crate::handshake::{circuits_can_use_ntor, pick_extend_handshake, pick_handshake, should_use_create_fast, ClientHandshake};
use crate::node::Node;
use crate::path::{choose_entry, choose_good_exit, choose_middle, choose_path_length, PathContext, PathSelectionError};
use onioncirc_common::routing;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One-line rendering of a circuit's hops and their handshake progress
fn describe_path(circ: &OriginCircuit) -> String {
    let hops: Vec<String> = circ
        .cpath
        .iter()
        .map(|hop| {
            let state = match hop.state {
                HopState::Open => "open",
                HopState::AwaitingKeys => "waiting for keys",
                HopState::Closed => "closed",
            };
            format!("{}({})", hop.extend_info.identity, state)
        })
        .collect();
    format!(
        "circ {} (length {}): {}",
        circ.id,
        circ.build_state.desired_path_len,
        hops.join(" ")
    )
}

impl<C: ChannelLayer> Node<C> {
    /// Launch a circuit for `purpose`, optionally ending at `exit`.
    ///
    /// Returns once the first step is under way; the build continues as
    /// channel and cell events arrive. On failure the circuit is already
    /// closed when this returns.
    pub fn launch_circuit(
        &mut self,
        purpose: CircuitPurpose,
        exit: Option<ExtendInfo>,
        flags: BuildFlags,
    ) -> Result<CircuitId, CircuitError> {
        let id = self.circuits.next_id();
        self.circuits.insert_origin(OriginCircuit::new(id, purpose, flags));

        let picked = self
            .onion_pick_cpath_exit(id, exit)
            .and_then(|()| self.onion_populate_cpath(id));
        if let Err(e) = picked {
            info!("Generating cpath hop failed: {}", e);
            self.close_circuit(id, CloseReason::local(EndReason::NoPath));
            return Err(e);
        }

        if let Err(e) = self.handle_first_hop(id) {
            self.close_circuit(id, CloseReason::local(e.end_reason()));
            return Err(e);
        }
        Ok(id)
    }

    /// Decide the path length and the exit
    fn onion_pick_cpath_exit(&mut self, id: CircuitId, exit: Option<ExtendInfo>) -> Result<(), CircuitError> {
        let me = self.identity();
        let circ = self
            .circuits
            .origin(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;
        let purpose = circ.purpose;
        let state = circ.build_state.clone();

        let desired_path_len = if state.onehop_tunnel {
            debug!("Launching a one-hop circuit for dir tunnel.");
            1
        } else {
            choose_path_length(purpose, exit.as_ref(), &self.relays)?
        };

        let chosen_exit = match exit {
            Some(exit) => {
                info!("Using requested exit node '{}'", exit);
                exit.dup()
            }
            None => {
                let ctx = PathContext::new(&self.relays, &self.config).with_me(me);
                let relay = choose_good_exit(
                    &ctx,
                    purpose,
                    state.need_uptime,
                    state.need_capacity,
                    state.is_internal,
                    &self.demand,
                )
                .ok_or(PathSelectionError::NoExit)?;
                ExtendInfo::from_relay(relay, false, false)
            }
        };

        if let Some(circ) = self.circuits.origin_mut(id) {
            circ.build_state.desired_path_len = desired_path_len;
            circ.build_state.chosen_exit = Some(chosen_exit);
        }
        Ok(())
    }

    /// Choose hops until the path has its desired length
    fn onion_populate_cpath(&mut self, id: CircuitId) -> Result<(), CircuitError> {
        while !self.onion_extend_cpath(id)? {}
        Ok(())
    }

    /// Append one more chosen hop. Returns true once the path is complete.
    fn onion_extend_cpath(&mut self, id: CircuitId) -> Result<bool, CircuitError> {
        let me = self.identity();
        let circ = self
            .circuits
            .origin(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;
        let purpose = circ.purpose;
        let state = circ.build_state.clone();
        let cur_len = circ.cpath.len();

        if cur_len >= state.desired_path_len {
            debug!(
                "Path is complete: {} steps long",
                state.desired_path_len
            );
            return Ok(true);
        }

        let info = if cur_len + 1 == state.desired_path_len {
            state
                .chosen_exit
                .as_ref()
                .map(ExtendInfo::dup)
                .ok_or(CircuitError::BadState("no exit chosen"))?
        } else if cur_len == 0 {
            let ctx = PathContext::new(&self.relays, &self.config).with_me(me);
            let use_guards = self.config.use_entry_guards
                && (purpose != CircuitPurpose::Testing || self.config.bridge_relay);
            let relay = if use_guards {
                self.guards.choose_random_entry(&ctx, Some(&state))
            } else {
                choose_entry(&ctx, Some(&state), &self.guards.identities())
            };
            let relay = relay.ok_or(PathSelectionError::NoEntry)?;
            ExtendInfo::from_relay(relay, true, self.config.client_prefer_ipv6_orport)
        } else {
            let ctx = PathContext::new(&self.relays, &self.config).with_me(me);
            let hops: Vec<&ExtendInfo> = circ.cpath.extend_infos().collect();
            let relay = choose_middle(&ctx, purpose, &state, &hops, cur_len);
            match relay {
                Some(relay) => ExtendInfo::from_relay(relay, false, false),
                None => {
                    warn!(
                        "Failed to find node for hop {} of our path. Discarding this circuit.",
                        cur_len
                    );
                    return Err(PathSelectionError::NoMiddle { hop: cur_len }.into());
                }
            }
        };

        debug!(
            "Chose router {} for hop {} (exit is {:?})",
            info,
            cur_len,
            state.chosen_exit.as_ref().map(|exit| exit.identity)
        );
        if let Some(circ) = self.circuits.origin_mut(id) {
            circ.cpath.append(&info);
        }
        Ok(false)
    }

    /// Get a channel to the entry. If one is open the CREATE goes out now;
    /// otherwise the circuit waits for `channel_ready`.
    fn handle_first_hop(&mut self, id: CircuitId) -> Result<(), CircuitError> {
        let first = self
            .circuits
            .origin(id)
            .and_then(|circ| circ.cpath.first())
            .map(|hop| hop.extend_info.dup())
            .ok_or(CircuitError::BadState("circuit has no first hop"))?;

        debug!("Looking for firsthop '{}'", first.addr);
        match self.channels.get_for_extend(&first.identity, first.addr) {
            ChannelLookup::Usable(chan) => {
                debug!("Conn open. Delivering first onion skin.");
                if let Some(circ) = self.circuits.origin_mut(id) {
                    circ.n_chan = Some(chan);
                }
                self.send_next_onion_skin(id)
            }
            ChannelLookup::Pending { reason } => {
                debug!("Next router is {}: {}", first, reason);
                if let Some(circ) = self.circuits.origin_mut(id) {
                    circ.n_hop = Some(first);
                }
                Ok(())
            }
            ChannelLookup::Launch { reason } => {
                debug!("Next router is {}: {}", first, reason);
                if self.channels.connect(first.addr, &first.identity).is_none() {
                    info!("connect to firsthop failed. Closing.");
                    return Err(CircuitError::ChannelLaunch(first.to_string()));
                }
                if let Some(circ) = self.circuits.origin_mut(id) {
                    circ.n_hop = Some(first);
                }
                Ok(())
            }
        }
    }

    /// Send the handshake for the next hop that needs one, or finish the
    /// build if every hop is open
    pub(crate) fn send_next_onion_skin(&mut self, id: CircuitId) -> Result<(), CircuitError> {
        let ntor_allowed = circuits_can_use_ntor(&self.config, &self.params);
        let circ = self
            .circuits
            .origin(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;
        let first = circ
            .cpath
            .first()
            .ok_or(CircuitError::BadState("circuit has no first hop"))?;

        if first.state == HopState::Closed {
            debug!("First skin; sending create cell.");
            let target = first.extend_info.dup();
            let chan = circ
                .n_chan
                .ok_or(CircuitError::BadState("no channel to the first hop"))?;
            let fast = should_use_create_fast(&self.config, &target);
            let (cell_type, handshake_type) = if fast {
                (CreateCellType::CreateFast, HandshakeType::Fast)
            } else {
                pick_handshake(&target, ntor_allowed)
            };

            let (handshake, onionskin) = ClientHandshake::start(handshake_type, &target).map_err(|e| {
                warn!("onion_skin_create (first hop) failed: {}", e);
                CircuitError::BadState("could not create onion skin")
            })?;
            let create = CreateCell::new(cell_type, handshake_type, onionskin)?;
            self.deliver_create_cell(id, chan, &create)?;

            if let Some(circ) = self.circuits.origin_mut(id) {
                if let Some(hop) = circ.cpath.get_mut(0) {
                    hop.handshake = Some(handshake);
                    hop.state = HopState::AwaitingKeys;
                }
                circ.state = CircuitState::Building;
            }
            info!(
                "First hop: finished sending {} cell to '{}'",
                if fast { "CREATE_FAST" } else { "CREATE" },
                target
            );
            return Ok(());
        }

        debug!("starting to send subsequent skin.");
        let index = match circ.cpath.first_unopened() {
            Some(index) => index,
            None => {
                self.circuit_built(id);
                return Ok(());
            }
        };

        let target = circ
            .cpath
            .get(index)
            .map(|hop| hop.extend_info.dup())
            .ok_or(CircuitError::BadState("hop vanished"))?;
        let prev_identity = circ
            .cpath
            .get(circ.cpath.prev_index(index))
            .map(|hop| hop.extend_info.identity)
            .ok_or(CircuitError::BadState("hop vanished"))?;

        let orport_ipv4 = match target.addr {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                warn!("Bug: Trying to extend to a non-IPv4 address.");
                return Err(CircuitError::BadState("extend target has no IPv4 address"));
            }
        };

        let prev_supports_extend2 = self
            .relays
            .iter()
            .find(|relay| relay.identity == prev_identity)
            .map_or(false, |relay| relay.ntor_onion_key.is_some() || relay.supports_extend2);
        let (extend_type, create_type, handshake_type) =
            pick_extend_handshake(&target, prev_supports_extend2, ntor_allowed);

        let (handshake, onionskin) = ClientHandshake::start(handshake_type, &target).map_err(|e| {
            warn!("onion_skin_create failed: {}", e);
            CircuitError::BadState("could not create onion skin")
        })?;
        let create = CreateCell::new(create_type, handshake_type, onionskin)?;
        let extend = ExtendCell::new(extend_type, Some(orport_ipv4), None, target.identity, create)?;
        let (command, body) = extend.format()?;

        info!("Sending extend relay cell.");
        self.send_relay_from_origin(id, index - 1, &RelayMsg::new(command, 0, body))?;

        if let Some(hop) = self.circuits.origin_mut(id).and_then(|circ| circ.cpath.get_mut(index)) {
            hop.handshake = Some(handshake);
            hop.state = HopState::AwaitingKeys;
        }
        Ok(())
    }

    /// Every hop is open
    fn circuit_built(&mut self, id: CircuitId) {
        let (onehop, began_at, purpose, first_open_of_full_path) = match self.circuits.origin_mut(id) {
            Some(circ) => {
                circ.state = CircuitState::Open;
                let counts = !circ.has_opened
                    && circ.build_state.desired_path_len == routing::DEFAULT_ROUTE_LEN;
                (circ.build_state.onehop_tunnel, circ.began_at, circ.purpose, counts)
            }
            None => return,
        };

        // Only the first open of a default-length path is a build time
        if first_open_of_full_path {
            let elapsed_ms = began_at.elapsed().as_millis() as i64;
            if self.build_times.note_build(elapsed_ms) == BuildTimeOutcome::Outlier {
                info!(
                    "Strange value for circuit build time: {}msec. Assuming clock jump. Purpose {}",
                    elapsed_ms, purpose
                );
            }
        }
        info!("circuit built!");

        self.pathbias_count_build_success(id);
        if let Some(circ) = self.circuits.origin_mut(id) {
            circ.has_opened = true;
        }

        if !self.has_completed_circuit && !onehop {
            self.has_completed_circuit = true;
            info!("Tor has successfully opened a circuit. Looks like client functionality is working.");
        }

        if purpose == CircuitPurpose::MeasureTimeout {
            self.close_circuit(id, CloseReason::local(EndReason::Finished));
        }
    }

    /// Pick a circuit id on `chan`, bind circuit `id` to it and send
    /// `create`
    pub(crate) fn deliver_create_cell(
        &mut self,
        id: CircuitId,
        chan: ChannelId,
        create: &CreateCell,
    ) -> Result<(), CircuitError> {
        let circ_id = self.allocate_circ_id(chan).ok_or_else(|| {
            warn!("failed to get unique circID on {}.", chan);
            CircuitError::NoCircId
        })?;
        debug!("Chosen circID {}.", circ_id);
        self.circuits.set_n_binding(id, chan, circ_id);
        self.channels.send_cell(chan, create.to_cell(circ_id)?)?;
        Ok(())
    }

    /// A CREATED or EXTENDED reply arrived for the hop we are waiting on
    pub(crate) fn finish_handshake(&mut self, id: CircuitId, reply: &[u8]) -> Result<(), CircuitError> {
        self.pathbias_count_build_attempt(id)?;

        let circ = self
            .circuits
            .origin_mut(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;
        let index = circ.cpath.first_unopened().ok_or_else(|| {
            warn!("got extended when circ already built? Closing.");
            CircuitError::Protocol("handshake reply on a built circuit".into())
        })?;
        let hop = circ
            .cpath
            .get_mut(index)
            .ok_or(CircuitError::BadState("hop vanished"))?;
        if hop.state != HopState::AwaitingKeys {
            return Err(CircuitError::Protocol(
                "handshake reply for a hop that sent no handshake".into(),
            ));
        }
        let handshake = hop
            .handshake
            .take()
            .ok_or(CircuitError::BadState("hop has no pending handshake"))?;
        let keys = handshake.complete(reply).map_err(|e| {
            warn!("onion_skin_client_handshake failed: {}", e);
            CircuitError::Handshake(e)
        })?;
        hop.crypto = Some(HopCrypto::new(&keys, CryptoSide::Client));
        hop.state = HopState::Open;
        let identity = hop.extend_info.identity;

        info!("Finished building circuit hop: {}", describe_path(circ));
        if index == 0 {
            self.guards.note_contact(&identity);
        }
        Ok(())
    }

    /// A hop reported that the rest of the circuit is gone. Partial paths
    /// are not salvaged.
    pub(crate) fn circuit_truncated(&mut self, id: CircuitId, hop: usize, reason: EndReason) {
        info!("Circuit {} truncated at hop {}: {}", id, hop, reason);
        self.close_circuit(id, CloseReason::remote(reason));
    }

    /// Resume circuits that were waiting on `chan`
    pub(crate) fn n_chan_done(&mut self, chan: ChannelId, ok: bool) {
        let identity = self.channels.remote_identity(chan);
        let addr = self.channels.remote_addr(chan);
        debug!("{} to {:?} done, status={}", chan, identity, ok);

        for id in self.circuits.waiting_for(identity, addr) {
            if !ok {
                info!("Channel failed; closing circ {}.", id);
                self.close_circuit(id, CloseReason::local(EndReason::ChannelClosed));
                continue;
            }
            debug!("Found circ {}, sending create cell.", id);

            if let Some(circ) = self.circuits.origin_mut(id) {
                circ.n_hop = None;
                circ.n_chan = Some(chan);
                if let Err(e) = self.send_next_onion_skin(id) {
                    info!("send_next_onion_skin failed: {}", e);
                    self.close_circuit(id, CloseReason::local(e.end_reason()));
                }
                continue;
            }

            let create = match self.circuits.relay_mut(id) {
                Some(circ) => {
                    circ.n_hop = None;
                    circ.pending_create.take()
                }
                None => continue,
            };
            let forwarded = match create {
                Some(create) => self.deliver_create_cell(id, chan, &create),
                None => Err(CircuitError::BadState("no CREATE waiting to be forwarded")),
            };
            match forwarded {
                Ok(()) => {
                    if let Some(circ) = self.circuits.relay_mut(id) {
                        circ.state = CircuitState::Open;
                    }
                }
                Err(e) => {
                    info!("Failed to forward create on circuit {}: {}", id, e);
                    self.close_circuit(id, CloseReason::local(EndReason::ResourceLimit));
                }
            }
        }
    }

    /// Tear down circuits that have spent too long building, and probes
    /// that never came back
    pub fn expire_building(&mut self, now: Instant) {
        let close_after = Duration::from_millis(self.build_times.close_ms());
        let probe_after = self.config.probe_timeout();

        let mut timed_out = Vec::new();
        let mut probes = Vec::new();
        for circ in self.circuits.origins() {
            let age = now.saturating_duration_since(circ.began_at);
            if circ.purpose == CircuitPurpose::PathBiasTesting && circ.probe.is_some() {
                if age > probe_after {
                    probes.push(circ.id);
                }
            } else if circ.state != CircuitState::Open && age > close_after {
                timed_out.push(circ.id);
            }
        }

        for id in timed_out {
            info!("Abandoning circuit {} after {} ms of building", id, close_after.as_millis());
            self.pathbias_count_timeout(id);
            self.close_circuit(id, CloseReason::local(EndReason::Timeout));
        }
        for id in probes {
            info!("Path bias probe on circuit {} timed out", id);
            self.close_circuit(id, CloseReason::local(EndReason::Timeout));
        }
    }

    /// The wall clock jumped by `seconds`. Forget that circuits have ever
    /// worked and close the ones nobody has used.
    pub fn note_clock_jumped(&mut self, seconds: i64) {
        warn!(
            "Your system clock just jumped {} seconds {}; assuming established circuits no longer work.",
            seconds.abs(),
            if seconds > 0 { "forward" } else { "backward" }
        );
        self.has_completed_circuit = false;

        let unused: Vec<CircuitId> = self
            .circuits
            .origins()
            .filter(|circ| circ.dirty_at.is_none())
            .map(|circ| circ.id)
            .collect();
        for id in unused {
            self.close_circuit(id, CloseReason::local(EndReason::Finished));
        }
    }

    /// Add `exit` as a new last hop of circuit `id` without sending
    /// anything
    pub fn append_new_exit(&mut self, id: CircuitId, exit: &ExtendInfo) -> Result<(), CircuitError> {
        let circ = self
            .circuits
            .origin_mut(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;
        circ.build_state.chosen_exit = Some(exit.dup());
        circ.build_state.desired_path_len += 1;
        circ.cpath.append(exit);
        Ok(())
    }

    /// Lengthen open circuit `id` by one hop ending at `exit`
    pub fn extend_to_new_exit(&mut self, id: CircuitId, exit: &ExtendInfo) -> Result<(), CircuitError> {
        if !self.circuits.origin(id).map_or(false, OriginCircuit::is_open) {
            return Err(CircuitError::BadState("only open circuits can be extended"));
        }
        self.append_new_exit(id, exit)?;
        if let Some(circ) = self.circuits.origin_mut(id) {
            circ.state = CircuitState::Building;
        }
        if let Err(e) = self.send_next_onion_skin(id) {
            warn!("Couldn't extend circuit to new point {}: {}", exit, e);
            self.close_circuit(id, CloseReason::local(e.end_reason()));
            return Err(e);
        }
        Ok(())
    }
}
