/// The circuit node: every circuit this process originates or relays, the
/// guard registry, and the events that drive them.
///
/// All state changes happen through `&mut self` from one event loop, fed
/// by cell arrivals, channel notifications and timer ticks. Nothing here
/// waits on the network.
use crate::cell::{Cell, CellCommand, CellError, CircId, EndReason, RelayCommand, RelayMsg};
use crate::channel::{ChannelCloseReason, ChannelId, ChannelLayer, ChannelState, CircIdAllocator};
use crate::circuit::{
    BuildTimes, BuildTimesSummary, CircuitError, CircuitId, CircuitList, CircuitPurpose, CircuitSummary,
    CloseReason, PathState, RemovedCircuit,
};
use crate::guard::{EntryGuard, GuardRegistry};
use crate::identity::RelayKeys;
use crate::path::ExitDemand;
use crate::pathbias::{CloseDecision, PathBiasLogLimits, PathBiasParams};
use onioncirc_common::{CircuitConfig, NetworkParams, RelayId, RelayInfo};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// How many closed circuits are remembered for inspection
const CLOSED_HISTORY: usize = 256;

/// Record of a circuit that has been torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedCircuit {
    pub id: CircuitId,
    /// `None` for circuits relayed on behalf of someone else
    pub purpose: Option<CircuitPurpose>,
    pub path_state: Option<PathState>,
    pub reached_open: bool,
    pub reason: CloseReason,
}

pub struct Node<C: ChannelLayer> {
    pub(crate) config: CircuitConfig,
    pub(crate) params: NetworkParams,
    pub(crate) path_bias: PathBiasParams,
    pub(crate) relays: Vec<RelayInfo>,
    pub(crate) keys: Option<RelayKeys>,
    pub(crate) channels: C,
    pub(crate) circuits: CircuitList,
    pub(crate) guards: GuardRegistry,
    pub(crate) build_times: BuildTimes,
    pub(crate) demand: ExitDemand,
    /// Set once any circuit has opened since startup or the last clock jump
    pub(crate) has_completed_circuit: bool,
    pub(crate) pathbias_log: PathBiasLogLimits,
    allocators: HashMap<ChannelId, CircIdAllocator>,
    closed: VecDeque<ClosedCircuit>,
}

impl<C: ChannelLayer> Node<C> {
    /// Create a node with the given configuration, relay list and
    /// consensus parameters
    pub fn new(config: CircuitConfig, relays: Vec<RelayInfo>, params: NetworkParams, channels: C) -> Self {
        let path_bias = PathBiasParams::resolve(&config.path_bias, &params);
        let build_times = BuildTimes::new(config.learn_circuit_build_timeout);
        debug!(
            "Initializing circuit node with {} relays, server mode {}",
            relays.len(),
            config.server_mode
        );
        Self {
            config,
            params,
            path_bias,
            relays,
            keys: None,
            channels,
            circuits: CircuitList::new(),
            guards: GuardRegistry::new(),
            build_times,
            demand: ExitDemand::default(),
            has_completed_circuit: false,
            pathbias_log: PathBiasLogLimits::new(),
            allocators: HashMap::new(),
            closed: VecDeque::new(),
        }
    }

    /// Give the node onion keys so it can answer CREATE cells
    pub fn with_keys(mut self, keys: RelayKeys) -> Self {
        info!("Relay identity: {}", keys.identity_digest());
        self.keys = Some(keys);
        self
    }

    /// Our identity, when running with keys
    pub fn identity(&self) -> Option<RelayId> {
        self.keys.as_ref().map(RelayKeys::identity_digest)
    }

    /// Install a new relay list and parameter set
    pub fn set_consensus(&mut self, relays: Vec<RelayInfo>, params: NetworkParams) {
        info!("New consensus with {} relays", relays.len());
        self.relays = relays;
        self.path_bias = PathBiasParams::resolve(&self.config.path_bias, &params);
        self.params = params;
    }

    pub fn set_exit_demand(&mut self, demand: ExitDemand) {
        self.demand = demand;
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn path_bias_params(&self) -> &PathBiasParams {
        &self.path_bias
    }

    pub fn relays(&self) -> &[RelayInfo] {
        &self.relays
    }

    pub fn channels(&self) -> &C {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut C {
        &mut self.channels
    }

    pub fn circuits(&self) -> &CircuitList {
        &self.circuits
    }

    pub fn guards(&self) -> &GuardRegistry {
        &self.guards
    }

    pub fn guards_mut(&mut self) -> &mut GuardRegistry {
        &mut self.guards
    }

    pub fn guard(&self, identity: &RelayId) -> Option<&EntryGuard> {
        self.guards.get(identity)
    }

    pub fn build_times(&self) -> &BuildTimes {
        &self.build_times
    }

    pub fn build_times_summary(&self) -> BuildTimesSummary {
        self.build_times.summary()
    }

    pub fn has_completed_circuit(&self) -> bool {
        self.has_completed_circuit
    }

    pub fn circuit_summaries(&self) -> Vec<CircuitSummary> {
        self.circuits.origins().map(|circ| circ.summary()).collect()
    }

    /// Most recent close record for circuit `id`
    pub fn last_close(&self, id: CircuitId) -> Option<&ClosedCircuit> {
        self.closed.iter().rev().find(|closed| closed.id == id)
    }

    pub fn closed_circuits(&self) -> impl Iterator<Item = &ClosedCircuit> {
        self.closed.iter()
    }

    /// Process one cell that arrived on `chan`
    pub fn handle_cell(&mut self, chan: ChannelId, cell: Cell) {
        if cell.command.is_create() {
            self.handle_create(chan, &cell);
            return;
        }

        let id = match self.circuits.lookup(chan, cell.circ_id) {
            Some(id) => id,
            None => {
                debug!(
                    "Dropping {:?} cell for unknown circuit {} on {}",
                    cell.command, cell.circ_id, chan
                );
                return;
            }
        };

        let result = match cell.command {
            command if command.is_created() => self.handle_created(id, chan, &cell),
            command if command.is_relay() => self.handle_relay(id, chan, &cell),
            CellCommand::Destroy => {
                self.handle_destroy(id, chan, cell.circ_id, cell.destroy_reason());
                Ok(())
            }
            CellCommand::Padding => Ok(()),
            other => Err(CellError::UnexpectedCommand(other).into()),
        };

        if let Err(e) = result {
            warn!("Closing circuit {} after error: {}", id, e);
            self.close_circuit(id, CloseReason::local(e.end_reason()));
        }
    }

    fn handle_created(&mut self, id: CircuitId, chan: ChannelId, cell: &Cell) -> Result<(), CircuitError> {
        if self.circuits.is_origin(id) {
            let reply = crate::cell::CreatedCell::parse(cell.command, &cell.payload)?;
            self.finish_handshake(id, &reply.reply)?;
            return self.send_next_onion_skin(id);
        }
        self.relay_created(id, chan, cell)
    }

    fn handle_relay(&mut self, id: CircuitId, chan: ChannelId, cell: &Cell) -> Result<(), CircuitError> {
        if self.circuits.is_origin(id) {
            return self.origin_relay_cell(id, cell);
        }
        let from_origin = self
            .circuits
            .relay(id)
            .map_or(false, |circ| circ.is_p_side(chan, cell.circ_id));
        if from_origin {
            self.relay_cell_forward(id, cell)
        } else {
            self.relay_cell_backward(id, cell)
        }
    }

    /// Peel backward layers hop by hop until one recognizes the cell
    fn origin_relay_cell(&mut self, id: CircuitId, cell: &Cell) -> Result<(), CircuitError> {
        let circ = self
            .circuits
            .origin_mut(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;

        let mut payload = cell.payload.clone();
        let mut recognized_at = None;
        for (index, hop) in circ.cpath.iter_mut().enumerate() {
            let crypto = match hop.crypto.as_mut() {
                Some(crypto) => crypto,
                None => break,
            };
            crypto.apply_inbound(&mut payload);
            if crypto.is_recognized(&payload) {
                recognized_at = Some(index);
                break;
            }
        }

        let hop = match recognized_at {
            Some(hop) => hop,
            None => {
                warn!("Dropping unrecognized inbound cell on origin circuit {}.", id);
                if circ.purpose == CircuitPurpose::PathBiasTesting {
                    return Err(CircuitError::Protocol(
                        "unrecognized cell on path bias probe circuit".into(),
                    ));
                }
                return Ok(());
            }
        };

        let purpose = circ.purpose;
        let msg = RelayMsg::decode(&payload)?;
        match msg.command {
            RelayCommand::Extended | RelayCommand::Extended2 => {
                let extended = crate::cell::ExtendedCell::parse(msg.command, &msg.body)?;
                self.finish_handshake(id, &extended.created.reply)?;
                self.send_next_onion_skin(id)
            }
            RelayCommand::Truncated => {
                let reason = EndReason::from_wire(msg.body.first().copied().unwrap_or(0));
                self.circuit_truncated(id, hop, reason);
                Ok(())
            }
            _ if purpose == CircuitPurpose::PathBiasTesting => {
                self.pathbias_check_probe_response(id, &msg)
            }
            command => {
                debug!("Ignoring relay {:?} cell from hop {} on circuit {}", command, hop, id);
                Ok(())
            }
        }
    }

    fn handle_destroy(&mut self, id: CircuitId, chan: ChannelId, circ_id: CircId, reason: EndReason) {
        debug!("Received DESTROY for circuit {} on {}: {}", id, chan, reason);
        if self.circuits.is_origin(id) {
            // The first hop is gone; nothing more can be sent on it
            self.circuits.clear_n_binding(id);
            self.close_circuit(id, CloseReason::remote(reason));
            return;
        }

        let from_origin = self
            .circuits
            .relay(id)
            .map_or(false, |circ| circ.is_p_side(chan, circ_id));
        if from_origin {
            self.close_circuit_from(id, CloseReason::remote(reason), Some(chan));
        } else {
            self.circuits.clear_n_binding(id);
            if let Err(e) = self.relay_send_backward(id, &RelayMsg::truncated(reason)) {
                warn!("Could not send TRUNCATED on circuit {}: {}", id, e);
                self.close_circuit(id, CloseReason::local(e.end_reason()));
            }
        }
    }

    /// Close circuit `id`, settling path-bias accounting first. A circuit
    /// that needs a liveness probe stays open until the probe resolves.
    pub fn close_circuit(&mut self, id: CircuitId, reason: CloseReason) {
        self.close_circuit_from(id, reason, None);
    }

    /// Close, sending DESTROY on every attached side except `from`
    fn close_circuit_from(&mut self, id: CircuitId, reason: CloseReason, from: Option<ChannelId>) {
        if self.circuits.is_origin(id) && self.pathbias_check_close(id, reason) == CloseDecision::Probing {
            debug!("Holding circuit {} open for its path bias probe", id);
            return;
        }

        let record = match self.circuits.remove(id) {
            Some(RemovedCircuit::Origin(circ)) => {
                if let (Some(chan), Some(circ_id)) = (circ.n_chan, circ.n_circ_id) {
                    self.send_destroy(chan, circ_id, reason.reason);
                }
                debug!("Closed origin circuit {} ({}): {}", id, circ.purpose, reason);
                ClosedCircuit {
                    id,
                    purpose: Some(circ.purpose),
                    path_state: Some(circ.path_state),
                    reached_open: circ.has_opened,
                    reason,
                }
            }
            Some(RemovedCircuit::Relay(circ)) => {
                if from != Some(circ.p_chan) {
                    self.send_destroy(circ.p_chan, circ.p_circ_id, reason.reason);
                }
                if let (Some(chan), Some(circ_id)) = (circ.n_chan, circ.n_circ_id) {
                    if from != Some(chan) {
                        self.send_destroy(chan, circ_id, reason.reason);
                    }
                }
                debug!("Closed relay circuit {}: {}", id, reason);
                ClosedCircuit {
                    id,
                    purpose: None,
                    path_state: None,
                    reached_open: false,
                    reason,
                }
            }
            None => return,
        };

        if self.closed.len() == CLOSED_HISTORY {
            self.closed.pop_front();
        }
        self.closed.push_back(record);
    }

    fn send_destroy(&mut self, chan: ChannelId, circ_id: CircId, reason: EndReason) {
        if self.channels.state(chan) != ChannelState::Open {
            return;
        }
        if let Err(e) = self.channels.send_cell(chan, Cell::destroy(circ_id, reason)) {
            debug!("Could not send DESTROY on {}: {}", chan, e);
        }
    }

    /// A channel we were waiting on finished opening
    pub fn channel_ready(&mut self, chan: ChannelId) {
        self.n_chan_done(chan, true);
    }

    /// A channel we were waiting on could not be opened
    pub fn channel_failed(&mut self, chan: ChannelId) {
        self.n_chan_done(chan, false);
    }

    /// A channel went away. Every circuit on it is closed; the close is
    /// remote unless we asked for the channel to be closed.
    pub fn channel_closed(&mut self, chan: ChannelId) {
        self.allocators.remove(&chan);
        let requested = self.channels.close_reason(chan) == Some(ChannelCloseReason::Requested);
        let reason = if requested {
            CloseReason::local(EndReason::ChannelClosed)
        } else {
            CloseReason::remote(EndReason::ChannelClosed)
        };

        for id in self.circuits.on_channel(chan) {
            let n_side = match (self.circuits.origin(id), self.circuits.relay(id)) {
                (Some(circ), _) => circ.n_chan == Some(chan),
                (_, Some(circ)) => circ.n_chan == Some(chan),
                _ => false,
            };
            if n_side {
                self.circuits.clear_n_binding(id);
            }
            self.close_circuit_from(id, reason, Some(chan));
        }
    }

    /// Fresh circuit id for a circuit we are creating on `chan`
    pub(crate) fn allocate_circ_id(&mut self, chan: ChannelId) -> Option<CircId> {
        let channels = &self.channels;
        let allocator = self
            .allocators
            .entry(chan)
            .or_insert_with(|| CircIdAllocator::new(channels.circ_id_type(chan), channels.wide_circ_ids(chan)));
        let circuits = &self.circuits;
        allocator.allocate(|circ_id| circuits.id_in_use(chan, circ_id))
    }

    /// Whether `circ_id` is in the half of the id space we allocate from
    /// on `chan`
    pub(crate) fn circ_id_is_ours(&mut self, chan: ChannelId, circ_id: CircId) -> bool {
        let channels = &self.channels;
        self.allocators
            .entry(chan)
            .or_insert_with(|| CircIdAllocator::new(channels.circ_id_type(chan), channels.wide_circ_ids(chan)))
            .belongs_to_us(circ_id)
    }

    /// Package `msg` for hop `hop` of origin circuit `id` and send it.
    /// EXTEND cells go out as RELAY_EARLY.
    pub(crate) fn send_relay_from_origin(&mut self, id: CircuitId, hop: usize, msg: &RelayMsg) -> Result<(), CircuitError> {
        let circ = self
            .circuits
            .origin_mut(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;
        let (chan, circ_id) = match (circ.n_chan, circ.n_circ_id) {
            (Some(chan), Some(circ_id)) => (chan, circ_id),
            _ => return Err(CircuitError::BadState("no channel to the first hop")),
        };

        let mut payload = circ
            .cpath
            .get_mut(hop)
            .and_then(|h| h.crypto.as_mut())
            .ok_or(CircuitError::BadState("relay cell for a hop with no keys"))?
            .seal(msg)?;
        for index in (0..hop).rev() {
            let crypto = circ
                .cpath
                .get_mut(index)
                .and_then(|h| h.crypto.as_mut())
                .ok_or(CircuitError::BadState("relay cell through a hop with no keys"))?;
            crypto.apply_outbound(&mut payload);
        }

        let command = if matches!(msg.command, RelayCommand::Extend | RelayCommand::Extend2) {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        self.channels.send_cell(chan, Cell::new(circ_id, command, &payload)?)?;
        Ok(())
    }
}
