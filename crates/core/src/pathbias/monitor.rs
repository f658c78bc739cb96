use super::probe::{PathBiasProbe, ProbeVerdict, PROBE_PORT};
use super::rates;
use crate::cell::{EndReason, RelayMsg};
use crate::channel::{ChannelCloseReason, ChannelLayer, ChannelState};
use crate::circuit::{CircuitError, CircuitId, CircuitPurpose, CloseReason, HopState, OriginCircuit, PathState};
use crate::guard::EntryGuard;
use crate::node::Node;
use onioncirc_common::RelayId;
use std::time::Instant;
use tracing::{debug, info};

/// What closing a circuit should do once path bias has looked at it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Go ahead and close
    Close,
    /// A liveness probe went out; the circuit stays up until it answers
    Probing,
}

/// A build attempt is counted once the second hop starts its handshake,
/// so failures at the guard itself are not held against it
fn is_new_circ_attempt(circ: &OriginCircuit) -> bool {
    circ.cpath.len() > 1 && circ.cpath.get(1).map_or(false, |hop| hop.state == HopState::AwaitingKeys)
}

impl<C: ChannelLayer> Node<C> {
    /// Whether circuit `id` takes part in path-bias accounting. Purposes
    /// whose endpoints could be chosen by someone else, and one-hop
    /// circuits, are left out.
    pub(crate) fn pathbias_should_count(&mut self, id: CircuitId) -> bool {
        let use_entry_guards = self.config.use_entry_guards;
        let circ = match self.circuits.origin_mut(id) {
            Some(circ) => circ,
            None => return false,
        };

        let ignored_purpose = matches!(
            circ.purpose,
            CircuitPurpose::Testing
                | CircuitPurpose::Controller
                | CircuitPurpose::SConnectRend
                | CircuitPurpose::SRendJoined
        ) || circ.purpose.is_client_intro();

        if !use_entry_guards || ignored_purpose {
            if circ.pathbias_counted == Some(true) && circ.path_state != PathState::AlreadyCounted {
                info!(
                    "Bug: Circuit {} is now being ignored despite being counted in the past. Purpose is {}, path state {}",
                    circ.id, circ.purpose, circ.path_state
                );
            }
            circ.pathbias_counted = Some(false);
            return false;
        }

        let onehop = circ.build_state.onehop_tunnel;
        let desired = circ.build_state.desired_path_len;
        if onehop || desired == 1 {
            if desired != 1 || !onehop {
                info!(
                    "Bug: One-hop circuit {} has length {}. Path state is {}. Circuit is a {} currently {}.",
                    circ.id, desired, circ.path_state, circ.purpose, circ.state
                );
            }
            if circ.pathbias_counted == Some(true) {
                info!(
                    "Bug: One-hop circuit {} is now being ignored despite being counted in the past. Purpose is {}, path state {}",
                    circ.id, circ.purpose, circ.path_state
                );
            }
            circ.pathbias_counted = Some(false);
            return false;
        }

        if circ.pathbias_counted == Some(false) {
            info!(
                "Bug: Circuit {} is now being counted despite being ignored in the past. Purpose is {}, path state {}",
                circ.id, circ.purpose, circ.path_state
            );
        }
        circ.pathbias_counted = Some(true);
        true
    }

    /// Guard behind circuit `id`, if it is one we track
    fn known_guard(&self, id: CircuitId) -> Option<RelayId> {
        self.circuits
            .origin(id)
            .and_then(OriginCircuit::guard_identity)
            .filter(|gid| self.guards.get(gid).is_some())
    }

    /// Count a build attempt as the second hop starts its handshake. Fails
    /// when the count pushes the guard over the edge and it gets disabled.
    pub(crate) fn pathbias_count_build_attempt(&mut self, id: CircuitId) -> Result<(), CircuitError> {
        if !self.pathbias_should_count(id) {
            return Ok(());
        }
        let (purpose, state, path_state, has_opened) = match self.circuits.origin(id) {
            Some(circ) if is_new_circ_attempt(circ) => (circ.purpose, circ.state, circ.path_state, circ.has_opened),
            _ => return Ok(()),
        };

        if has_opened {
            if path_state != PathState::BuildAttempted {
                if let Some(suppressed) = self.pathbias_log.attempt.check(Instant::now()) {
                    info!(
                        "Bug: Opened circuit {} is in strange path state {}. Circuit is a {} currently {}.{}",
                        id, path_state, purpose, state, suppressed
                    );
                }
            }
            return Ok(());
        }

        let gid = match self.known_guard(id) {
            Some(gid) => gid,
            None => {
                info!(
                    "Unopened circuit {} has no known guard. Circuit is a {} currently {}.",
                    id, purpose, state
                );
                return Ok(());
            }
        };

        if path_state != PathState::NewCirc {
            if let Some(suppressed) = self.pathbias_log.attempt.check(Instant::now()) {
                info!(
                    "Bug: Unopened circuit {} has strange path state {}. Circuit is a {} currently {}.{}",
                    id, path_state, purpose, state, suppressed
                );
            }
            return Ok(());
        }

        if let Some(circ) = self.circuits.origin_mut(id) {
            circ.path_state = PathState::BuildAttempted;
        }
        let circuits = &self.circuits;
        let open = |from: PathState, to: PathState| circuits.count_in_states(&gid, from, to);
        if let Some(guard) = self.guards.get_mut(&gid) {
            if !rates::inc_circ_attempt(guard, &self.path_bias, &open) {
                return Err(CircuitError::GuardDisabled(gid.to_string()));
            }
        }
        Ok(())
    }

    /// Count a completed build. Runs just before the circuit is marked as
    /// having opened, so a reused circuit is never counted twice.
    pub(crate) fn pathbias_count_build_success(&mut self, id: CircuitId) {
        if !self.pathbias_should_count(id) {
            return;
        }
        let (purpose, state, path_state, has_opened) = match self.circuits.origin(id) {
            Some(circ) => (circ.purpose, circ.state, circ.path_state, circ.has_opened),
            None => return,
        };

        if has_opened {
            if path_state < PathState::BuildSucceeded {
                if let Some(suppressed) = self.pathbias_log.success.check(Instant::now()) {
                    info!(
                        "Bug: Opened circuit {} is in strange path state {}. Circuit is a {} currently {}.{}",
                        id, path_state, purpose, state, suppressed
                    );
                }
            }
            return;
        }

        let gid = match self.known_guard(id) {
            Some(gid) => gid,
            None => {
                if purpose != CircuitPurpose::MeasureTimeout {
                    info!(
                        "Completed circuit {} has no known guard. Circuit is a {} currently {}.",
                        id, purpose, state
                    );
                }
                return;
            }
        };

        if path_state != PathState::BuildAttempted {
            if let Some(suppressed) = self.pathbias_log.success.check(Instant::now()) {
                info!(
                    "Bug: Succeeded circuit {} is in strange path state {}. Circuit is a {} currently {}.{}",
                    id, path_state, purpose, state, suppressed
                );
            }
            return;
        }

        if let Some(circ) = self.circuits.origin_mut(id) {
            circ.path_state = PathState::BuildSucceeded;
        }
        if let Some(guard) = self.guards.get_mut(&gid) {
            guard.circ_successes += 1.0;
            info!(
                "Got success count {}/{} for guard {} ({})",
                guard.circ_successes, guard.circ_attempts, guard.nickname, guard.identity
            );
            if guard.circ_attempts < guard.circ_successes {
                info!(
                    "Bug: Unexpectedly high successes counts ({}/{}) for guard {} ({})",
                    guard.circ_successes, guard.circ_attempts, guard.nickname, guard.identity
                );
            }
        }
    }

    /// Note that a stream was attached to circuit `id`
    pub fn count_use_attempt(&mut self, id: CircuitId) {
        if !self.pathbias_should_count(id) {
            return;
        }
        let (purpose, state, path_state) = match self.circuits.origin(id) {
            Some(circ) => (circ.purpose, circ.state, circ.path_state),
            None => return,
        };

        if path_state < PathState::BuildSucceeded {
            info!(
                "Bug: Used circuit {} is in strange path state {}. Circuit is a {} currently {}.",
                id, path_state, purpose, state
            );
        } else if path_state < PathState::UseAttempted {
            if let Some(gid) = self.known_guard(id) {
                let circuits = &self.circuits;
                let open = |from: PathState, to: PathState| circuits.count_in_states(&gid, from, to);
                if let Some(guard) = self.guards.get_mut(&gid) {
                    rates::inc_use_attempt(guard, &self.path_bias, &open);
                    debug!(
                        "Marked circuit {} ({}/{}) as used for guard {} ({}).",
                        id, guard.use_successes, guard.use_attempts, guard.nickname, guard.identity
                    );
                }
            }
            if let Some(circ) = self.circuits.origin_mut(id) {
                circ.path_state = PathState::UseAttempted;
            }
        } else {
            debug!("Used circuit {} is already in path state {}.", id, path_state);
        }
    }

    /// Note that circuit `id` carried traffic successfully. Only counted
    /// against the guard when the circuit closes.
    pub fn mark_use_success(&mut self, id: CircuitId) {
        if !self.pathbias_should_count(id) {
            return;
        }
        let (purpose, state, path_state) = match self.circuits.origin(id) {
            Some(circ) => (circ.purpose, circ.state, circ.path_state),
            None => return,
        };
        if path_state < PathState::UseAttempted {
            info!(
                "Bug: Used circuit {} is in strange path state {}. Circuit is a {} currently {}.",
                id, path_state, purpose, state
            );
            self.count_use_attempt(id);
        }
        if let Some(circ) = self.circuits.origin_mut(id) {
            circ.path_state = PathState::UseSucceeded;
        }
    }

    /// Undo a use success after a stream detached before it was confirmed
    pub fn mark_use_rollback(&mut self, id: CircuitId) {
        if let Some(circ) = self.circuits.origin_mut(id) {
            if circ.path_state == PathState::UseSucceeded {
                info!("Rolling back pathbias use state to 'attempted' for detached circuit {}", id);
                circ.path_state = PathState::UseAttempted;
            }
        }
    }

    fn pathbias_count_use_success(&mut self, id: CircuitId) {
        if !self.pathbias_should_count(id) {
            return;
        }
        let (purpose, state, path_state) = match self.circuits.origin(id) {
            Some(circ) => (circ.purpose, circ.state, circ.path_state),
            None => return,
        };
        if path_state != PathState::UseSucceeded {
            info!(
                "Bug: Successfully used circuit {} is in strange path state {}. Circuit is a {} currently {}.",
                id, path_state, purpose, state
            );
            return;
        }
        if let Some(guard) = self.known_guard(id).and_then(|gid| self.guards.get_mut(&gid)) {
            guard.use_successes += 1.0;
            debug!(
                "Marked circuit {} ({}/{}) as used successfully for guard {} ({}).",
                id, guard.use_successes, guard.use_attempts, guard.nickname, guard.identity
            );
            if guard.use_attempts < guard.use_successes {
                info!(
                    "Bug: Unexpectedly high use successes counts ({}/{}) for guard {} ({})",
                    guard.use_successes, guard.use_attempts, guard.nickname, guard.identity
                );
            }
        }
    }

    /// Bump one close-time counter on the guard behind circuit `id`
    fn pathbias_count_close(&mut self, id: CircuitId, what: &str, bump: impl FnOnce(&mut EntryGuard)) {
        if !self.pathbias_should_count(id) {
            return;
        }
        let (purpose, state) = match self.circuits.origin(id) {
            Some(circ) => (circ.purpose, circ.state),
            None => return,
        };
        match self.known_guard(id).and_then(|gid| self.guards.get_mut(&gid)) {
            Some(guard) => bump(guard),
            None if purpose != CircuitPurpose::MeasureTimeout => {
                info!(
                    "{} circuit {} has no known guard. Circuit is a {} currently {}",
                    what, id, purpose, state
                );
            }
            None => {}
        }
    }

    fn pathbias_count_successful_close(&mut self, id: CircuitId) {
        self.pathbias_count_close(id, "Successfully closed", |guard| {
            guard.successful_circuits_closed += 1.0;
        });
    }

    fn pathbias_count_collapse(&mut self, id: CircuitId) {
        self.pathbias_count_close(id, "Destroyed", |guard| {
            guard.collapsed_circuits += 1.0;
        });
    }

    fn pathbias_count_use_failed(&mut self, id: CircuitId) {
        self.pathbias_count_close(id, "Stream-failing", |guard| {
            guard.unusable_circuits += 1.0;
        });
    }

    /// Count a build that ran past its timeout
    pub(crate) fn pathbias_count_timeout(&mut self, id: CircuitId) {
        if !self.pathbias_should_count(id) {
            return;
        }
        // A circuit that already proved itself is not a timeout
        if self.circuits.origin(id).map_or(true, |c| c.path_state == PathState::UseSucceeded) {
            return;
        }
        if let Some(guard) = self.known_guard(id).and_then(|gid| self.guards.get_mut(&gid)) {
            guard.timeouts += 1.0;
        }
    }

    /// Settle path-bias accounting for circuit `id` as it closes. A circuit
    /// that was used but never proven gets a liveness probe instead, and
    /// stays open until the probe answers or times out.
    pub(crate) fn pathbias_check_close(&mut self, id: CircuitId, reason: CloseReason) -> CloseDecision {
        if !self.pathbias_should_count(id) {
            return CloseDecision::Close;
        }
        let (purpose, state, path_state, n_chan, len, guard) = match self.circuits.origin(id) {
            Some(circ) => (
                circ.purpose,
                circ.state,
                circ.path_state,
                circ.n_chan,
                circ.cpath.len(),
                circ.guard_identity().unwrap_or(RelayId::ZERO),
            ),
            None => return CloseDecision::Close,
        };

        match path_state {
            PathState::BuildSucceeded => {
                let chan_dropped = reason.reason == EndReason::ChannelClosed
                    && n_chan.map_or(false, |chan| self.channels.close_reason(chan) != Some(ChannelCloseReason::Requested));
                if reason.remote || chan_dropped {
                    if let Some(suppressed) = self.pathbias_log.close_notice(guard, Instant::now()) {
                        info!(
                            "Circuit {} remote-closed without successful use for reason {}. Circuit purpose {} currently {},{}. Len {}.{}",
                            id, reason.reason, purpose, path_state, state, len, suppressed
                        );
                    }
                    self.pathbias_count_collapse(id);
                } else {
                    self.pathbias_count_successful_close(id);
                }
            }
            PathState::UseAttempted => {
                if self.pathbias_send_usable_probe(id) {
                    return CloseDecision::Probing;
                }
                self.pathbias_count_use_failed(id);
                if let Some(suppressed) = self.pathbias_log.close_notice(guard, Instant::now()) {
                    info!(
                        "Circuit {} closed without successful use for reason {}. Circuit purpose {} currently {},{}. Len {}.{}",
                        id, reason.reason, purpose, path_state, state, len, suppressed
                    );
                }
            }
            PathState::UseSucceeded => {
                self.pathbias_count_successful_close(id);
                self.pathbias_count_use_success(id);
            }
            PathState::UseFailed => self.pathbias_count_use_failed(id),
            _ => {}
        }

        if let Some(circ) = self.circuits.origin_mut(id) {
            circ.path_state = PathState::AlreadyCounted;
        }
        CloseDecision::Close
    }

    /// Send a BEGIN the exit must refuse, echoing our nonce. Returns
    /// whether the probe went out.
    fn pathbias_send_usable_probe(&mut self, id: CircuitId) -> bool {
        let (last, chan_open) = {
            let circ = match self.circuits.origin(id) {
                Some(circ) => circ,
                None => return false,
            };
            let last_open = circ.cpath.last().map_or(false, |hop| hop.state == HopState::Open);
            if !last_open {
                info!(
                    "Got pathbias probe request for unopened circuit {}. Opened {}, len {}",
                    id,
                    circ.has_opened,
                    circ.cpath.len()
                );
                return false;
            }
            if circ.purpose == CircuitPurpose::PathBiasTesting && circ.probe.is_some() {
                info!("Got pathbias probe request for circuit {} with outstanding probe", id);
                return false;
            }
            let chan_open = circ
                .n_chan
                .map_or(false, |chan| self.channels.state(chan) == ChannelState::Open);
            (circ.cpath.len() - 1, chan_open)
        };
        if !chan_open {
            info!("Skipping pathbias probe for circuit {}: Channel is not open.", id);
            return false;
        }

        let probe = PathBiasProbe::generate();
        if let Some(circ) = self.circuits.origin_mut(id) {
            circ.purpose = CircuitPurpose::PathBiasTesting;
            circ.began_at = Instant::now();
            circ.probe = Some(probe);
        }
        info!(
            "Sending pathbias testing cell to {}:{} on stream {} for circ {}.",
            probe.target(),
            PROBE_PORT,
            probe.stream_id,
            id
        );

        if let Err(e) = self.send_relay_from_origin(id, last, &probe.begin_msg()) {
            info!("Failed to send pathbias probe cell on circuit {}: {}", id, e);
            return false;
        }
        if let Some(circ) = self.circuits.origin_mut(id) {
            circ.dirty_at = Some(Instant::now());
        }
        true
    }

    /// Handle a relay cell arriving on a circuit that is being probed. A
    /// valid echo proves the circuit and closes it; anything else is an
    /// error that closes it as a use failure.
    pub(crate) fn pathbias_check_probe_response(&mut self, id: CircuitId, msg: &RelayMsg) -> Result<(), CircuitError> {
        let probe = self
            .circuits
            .origin(id)
            .and_then(|circ| circ.probe)
            .ok_or(CircuitError::BadState("relay cell on probe circuit with no probe"))?;

        match probe.check_response(msg) {
            ProbeVerdict::Valid => {
                self.mark_use_success(id);
                info!("Got valid path bias probe back for circ {}, stream {}.", id, probe.stream_id);
                self.close_circuit(id, CloseReason::local(EndReason::Finished));
                Ok(())
            }
            ProbeVerdict::Short { length } => {
                info!("Short path bias probe response length field ({}).", length);
                Err(CircuitError::Protocol("short path bias probe response".into()))
            }
            ProbeVerdict::Mismatch { echoed } => {
                info!(
                    "Got strange probe value 0x{:x} vs 0x{:x} back for circ {}, stream {}.",
                    echoed, probe.nonce, id, probe.stream_id
                );
                Err(CircuitError::Protocol("path bias probe echo mismatch".into()))
            }
            ProbeVerdict::Unrelated {
                command,
                reason,
                stream_id,
            } => {
                info!(
                    "Got another cell back back on pathbias probe circuit {}: Command: {:?}, Reason: {:?}, Stream-id: {}",
                    id, command, reason, stream_id
                );
                Err(CircuitError::Protocol("unexpected cell on path bias probe circuit".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{BuildFlags, CircuitState};
    use crate::extend_info::ExtendInfo;
    use crate::node::tests::{test_node, StubChannels};
    use onioncirc_common::CircuitConfig;

    const GUARD: [u8; 20] = [7u8; 20];

    /// An open three-hop circuit through GUARD in `path_state`
    fn open_circuit(node: &mut Node<StubChannels>, path_state: PathState) -> CircuitId {
        let guard = RelayId::from(GUARD);
        node.guards.add(EntryGuard::new(guard, "guard"));
        let id = node.circuits.next_id();
        let mut circ = OriginCircuit::new(id, CircuitPurpose::General, BuildFlags::default());
        circ.build_state.desired_path_len = 3;
        for n in [GUARD, [8u8; 20], [9u8; 20]] {
            circ.cpath.append(&ExtendInfo::new(None, RelayId::from(n), None, None, "10.0.0.1:9001".parse().unwrap()));
        }
        for hop in circ.cpath.iter_mut() {
            hop.state = HopState::Open;
        }
        circ.state = CircuitState::Open;
        circ.has_opened = true;
        circ.path_state = path_state;
        node.circuits.insert_origin(circ);
        id
    }

    fn guard(node: &Node<StubChannels>) -> &EntryGuard {
        node.guards.get(&RelayId::from(GUARD)).unwrap()
    }

    #[test]
    fn test_should_count_excludes_purposes() {
        let mut node = test_node(CircuitConfig::default());
        let id = open_circuit(&mut node, PathState::BuildSucceeded);
        assert!(node.pathbias_should_count(id));

        for purpose in [
            CircuitPurpose::Testing,
            CircuitPurpose::Controller,
            CircuitPurpose::SConnectRend,
            CircuitPurpose::Introducing,
        ] {
            node.circuits.origin_mut(id).unwrap().purpose = purpose;
            assert!(!node.pathbias_should_count(id));
        }
    }

    #[test]
    fn test_should_count_excludes_one_hop_and_no_guards() {
        let mut node = test_node(CircuitConfig::default());
        let id = open_circuit(&mut node, PathState::BuildSucceeded);
        node.circuits.origin_mut(id).unwrap().build_state.desired_path_len = 1;
        assert!(!node.pathbias_should_count(id));

        let mut node = test_node(CircuitConfig::default().with_entry_guards(false));
        let id = open_circuit(&mut node, PathState::BuildSucceeded);
        assert!(!node.pathbias_should_count(id));
        assert_eq!(node.circuits.origin(id).unwrap().pathbias_counted, Some(false));
    }

    #[test]
    fn test_use_attempt_counted_once() {
        let mut node = test_node(CircuitConfig::default());
        let id = open_circuit(&mut node, PathState::BuildSucceeded);
        node.count_use_attempt(id);
        node.count_use_attempt(id);
        assert_eq!(guard(&node).use_attempts, 1.0);
        assert_eq!(node.circuits.origin(id).unwrap().path_state, PathState::UseAttempted);
    }

    #[test]
    fn test_use_success_and_rollback() {
        let mut node = test_node(CircuitConfig::default());
        let id = open_circuit(&mut node, PathState::BuildSucceeded);
        node.count_use_attempt(id);
        node.mark_use_success(id);
        assert_eq!(node.circuits.origin(id).unwrap().path_state, PathState::UseSucceeded);

        node.mark_use_rollback(id);
        assert_eq!(node.circuits.origin(id).unwrap().path_state, PathState::UseAttempted);

        // Only a success rolls back
        node.mark_use_rollback(id);
        assert_eq!(node.circuits.origin(id).unwrap().path_state, PathState::UseAttempted);
    }

    #[test]
    fn test_mark_use_success_implies_attempt() {
        let mut node = test_node(CircuitConfig::default());
        let id = open_circuit(&mut node, PathState::BuildSucceeded);
        node.mark_use_success(id);
        assert_eq!(guard(&node).use_attempts, 1.0);
        assert_eq!(node.circuits.origin(id).unwrap().path_state, PathState::UseSucceeded);
    }

    #[test]
    fn test_check_close_build_succeeded() {
        let mut node = test_node(CircuitConfig::default());
        let local = open_circuit(&mut node, PathState::BuildSucceeded);
        let remote = open_circuit(&mut node, PathState::BuildSucceeded);

        assert_eq!(
            node.pathbias_check_close(local, CloseReason::local(EndReason::Finished)),
            CloseDecision::Close
        );
        assert_eq!(
            node.pathbias_check_close(remote, CloseReason::remote(EndReason::Destroyed)),
            CloseDecision::Close
        );
        assert_eq!(guard(&node).successful_circuits_closed, 1.0);
        assert_eq!(guard(&node).collapsed_circuits, 1.0);
        assert_eq!(node.circuits.origin(local).unwrap().path_state, PathState::AlreadyCounted);
    }

    #[test]
    fn test_check_close_counts_once() {
        let mut node = test_node(CircuitConfig::default());
        let id = open_circuit(&mut node, PathState::UseSucceeded);
        node.pathbias_check_close(id, CloseReason::local(EndReason::Finished));
        node.pathbias_check_close(id, CloseReason::local(EndReason::Finished));
        assert_eq!(guard(&node).successful_circuits_closed, 1.0);
        assert_eq!(guard(&node).use_successes, 1.0);
    }

    #[test]
    fn test_check_close_use_attempted_without_channel() {
        let mut node = test_node(CircuitConfig::default());
        let id = open_circuit(&mut node, PathState::UseAttempted);

        // No channel to send a probe on
        assert_eq!(
            node.pathbias_check_close(id, CloseReason::remote(EndReason::ChannelClosed)),
            CloseDecision::Close
        );
        assert_eq!(guard(&node).unusable_circuits, 1.0);
        assert!(node.circuits.origin(id).unwrap().probe.is_none());
    }

    #[test]
    fn test_close_notices_limited_per_guard() {
        let mut node = test_node(CircuitConfig::default());
        let first = open_circuit(&mut node, PathState::UseAttempted);
        node.pathbias_check_close(first, CloseReason::remote(EndReason::ChannelClosed));
        let second = open_circuit(&mut node, PathState::UseAttempted);
        node.pathbias_check_close(second, CloseReason::remote(EndReason::ChannelClosed));

        // Both closes are counted, only the first notice went out
        assert_eq!(guard(&node).unusable_circuits, 2.0);
        assert!(node.pathbias_log.close_notice(RelayId::from(GUARD), Instant::now()).is_none());
        assert!(node.pathbias_log.close_notice(RelayId::from([8u8; 20]), Instant::now()).is_some());
    }

    #[test]
    fn test_timeout_skips_proven_circuits() {
        let mut node = test_node(CircuitConfig::default());
        let proven = open_circuit(&mut node, PathState::UseSucceeded);
        let building = open_circuit(&mut node, PathState::BuildAttempted);
        node.pathbias_count_timeout(proven);
        node.pathbias_count_timeout(building);
        assert_eq!(guard(&node).timeouts, 1.0);
    }
}
