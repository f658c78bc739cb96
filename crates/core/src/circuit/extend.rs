/// Relay side of circuit construction: answering CREATE, passing EXTEND
/// on to the next hop, and moving relay cells through the circuits we
/// carry for others.
use super::crypto::{CryptoSide, HopCrypto};
use super::or_circuit::OrCircuit;
use super::types::{CircuitError, CircuitId, CircuitState, CloseReason};
use crate::cell::{
    Cell, CellCommand, CreateCell, CreatedCell, EndReason, EndStreamReason, ExtendCell, ExtendedCell,
    RelayCommand, RelayMsg,
};
use crate::channel::{ChannelId, ChannelLayer, ChannelLookup};
use crate::extend_info::ExtendInfo;
use crate::handshake::server_handshake;
use crate::node::Node;
use onioncirc_common::{is_internal_addr, PolicyResult};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why an EXTEND was refused. Every refusal closes the circuit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtendError {
    #[error("circuit already has a next hop")]
    AlreadyExtended,

    #[error("connection to the next hop already launched")]
    AlreadyLaunching,

    #[error("not running as a relay")]
    ClientMode,

    #[error("zero destination address or port")]
    ZeroDestination,

    #[error("private destination address {0}")]
    PrivateAddress(Ipv4Addr),

    #[error("no identity digest given")]
    ZeroIdentity,

    #[error("destination is the previous hop")]
    LoopBack,
}

/// TTL echoed in END cells that refuse a stream by exit policy
const END_ECHO_TTL: u32 = 60;

impl<C: ChannelLayer> Node<C> {
    /// A CREATE, CREATE_FAST or CREATE2 arrived on `chan`
    pub(crate) fn handle_create(&mut self, chan: ChannelId, cell: &Cell) {
        if !self.config.server_mode {
            warn!(
                "Received create cell ({:?}) from {}, but we're not running as a relay. Closing.",
                cell.command, chan
            );
            self.reject_create(chan, cell, EndReason::TorProtocol);
            return;
        }
        if self.circ_id_is_ours(chan, cell.circ_id) {
            warn!("Received create cell with unexpected circ_id {}. Closing.", cell.circ_id);
            self.reject_create(chan, cell, EndReason::TorProtocol);
            return;
        }
        if self.circuits.id_in_use(chan, cell.circ_id) {
            warn!(
                "Received CREATE cell (circID {}) for known circ. Dropping.",
                cell.circ_id
            );
            return;
        }

        let answered = CreateCell::parse(cell.command, &cell.payload)
            .map_err(CircuitError::from)
            .and_then(|create| self.answer_create(chan, cell, &create));
        if let Err(e) = answered {
            warn!("Failed to answer create cell on {}: {}", chan, e);
            self.reject_create(chan, cell, e.end_reason());
        }
    }

    fn answer_create(&mut self, chan: ChannelId, cell: &Cell, create: &CreateCell) -> Result<(), CircuitError> {
        let (reply, keys) = server_handshake(create.handshake_type, &create.onionskin, self.keys.as_ref())?;
        let created = CreatedCell::new(create.cell_type.created(), reply)?;
        let response = created.to_cell(cell.circ_id)?;

        let id = self.circuits.next_id();
        let crypto = HopCrypto::new(&keys, CryptoSide::Relay);
        self.circuits.insert_relay(OrCircuit::new(id, chan, cell.circ_id, crypto));
        self.channels.send_cell(chan, response)?;
        debug!(
            "Answered {:?} on {} circID {} as circuit {}",
            create.handshake_type, chan, cell.circ_id, id
        );
        Ok(())
    }

    fn reject_create(&mut self, chan: ChannelId, cell: &Cell, reason: EndReason) {
        if let Err(e) = self.channels.send_cell(chan, Cell::destroy(cell.circ_id, reason)) {
            debug!("Could not refuse create on {}: {}", chan, e);
        }
    }

    /// The next hop answered the CREATE we forwarded; pass it back to the
    /// origin as EXTENDED
    pub(crate) fn relay_created(&mut self, id: CircuitId, chan: ChannelId, cell: &Cell) -> Result<(), CircuitError> {
        let circ = self
            .circuits
            .relay(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;
        if circ.n_chan != Some(chan) {
            return Err(CircuitError::Protocol("CREATED from the origin side".into()));
        }
        debug!("Converting created cell to extended relay cell, sending.");
        let created = CreatedCell::parse(cell.command, &cell.payload)?;
        let (command, body) = ExtendedCell::from_created(created)?.format();
        self.relay_send_backward(id, &RelayMsg::new(command, 0, body))
    }

    /// A relay cell from the origin side
    pub(crate) fn relay_cell_forward(&mut self, id: CircuitId, cell: &Cell) -> Result<(), CircuitError> {
        let circ = self
            .circuits
            .relay_mut(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;
        let mut payload = cell.payload.clone();
        circ.crypto.apply_inbound(&mut payload);

        if circ.crypto.is_recognized(&payload) {
            let msg = RelayMsg::decode(&payload)?;
            return match msg.command {
                RelayCommand::Extend | RelayCommand::Extend2 => self.circuit_extend(id, &msg),
                RelayCommand::Begin => self.refuse_begin(id, &msg),
                command => {
                    debug!("Ignoring relay {:?} cell addressed to us on circuit {}", command, id);
                    Ok(())
                }
            };
        }

        match (circ.n_chan, circ.n_circ_id) {
            (Some(chan), Some(circ_id)) => {
                self.channels.send_cell(chan, Cell::new(circ_id, cell.command, &payload)?)?;
                Ok(())
            }
            _ => {
                warn!("Unrecognized relay cell on circuit {} with no next hop. Closing.", id);
                Err(CircuitError::Protocol("unrecognized cell at the last hop".into()))
            }
        }
    }

    /// A relay cell from the next hop: add our layer and send it towards
    /// the origin
    pub(crate) fn relay_cell_backward(&mut self, id: CircuitId, cell: &Cell) -> Result<(), CircuitError> {
        let circ = self
            .circuits
            .relay_mut(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;
        let mut payload = cell.payload.clone();
        circ.crypto.apply_outbound(&mut payload);
        let (chan, circ_id) = (circ.p_chan, circ.p_circ_id);
        self.channels.send_cell(chan, Cell::new(circ_id, cell.command, &payload)?)?;
        Ok(())
    }

    /// Originate `msg` at this hop towards the origin
    pub(crate) fn relay_send_backward(&mut self, id: CircuitId, msg: &RelayMsg) -> Result<(), CircuitError> {
        let circ = self
            .circuits
            .relay_mut(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;
        let payload = circ.crypto.seal(msg)?;
        let (chan, circ_id) = (circ.p_chan, circ.p_circ_id);
        self.channels
            .send_cell(chan, Cell::new(circ_id, CellCommand::Relay, &payload)?)?;
        Ok(())
    }

    /// Carry the circuit one hop further on the origin's behalf
    fn circuit_extend(&mut self, id: CircuitId, msg: &RelayMsg) -> Result<(), CircuitError> {
        let circ = self
            .circuits
            .relay(id)
            .ok_or(CircuitError::UnknownCircuit(id))?;
        if circ.n_chan.is_some() {
            warn!("n_chan already set. Bug/attack. Closing.");
            return Err(ExtendError::AlreadyExtended.into());
        }
        if circ.n_hop.is_some() {
            warn!("conn to next hop already launched. Bug/attack. Closing.");
            return Err(ExtendError::AlreadyLaunching.into());
        }
        let p_chan = circ.p_chan;

        if !self.config.server_mode {
            warn!("Got an extend cell, but running as a client. Closing.");
            return Err(ExtendError::ClientMode.into());
        }

        let extend = ExtendCell::parse(msg.command, &msg.body).map_err(|e| {
            warn!("Can't parse extend cell. Closing circuit.");
            CircuitError::Cell(e)
        })?;

        let target = match extend.orport_ipv4 {
            Some(addr) if addr.port() != 0 && !addr.ip().is_unspecified() => addr,
            _ => {
                warn!("Client asked me to extend to zero destination port or addr.");
                return Err(ExtendError::ZeroDestination.into());
            }
        };

        if is_internal_addr(&IpAddr::V4(*target.ip())) && !self.config.extend_allow_private_addresses {
            warn!("Client asked me to extend to a private address");
            return Err(ExtendError::PrivateAddress(*target.ip()).into());
        }

        if extend.node_id.is_zero() {
            warn!("Client asked me to extend without specifying an id_digest.");
            return Err(ExtendError::ZeroIdentity.into());
        }

        if self.channels.remote_identity(p_chan) == Some(extend.node_id) {
            warn!("Client asked me to extend back to the previous hop.");
            return Err(ExtendError::LoopBack.into());
        }

        let addr = SocketAddr::V4(target);
        let (reason, launch) = match self.channels.get_for_extend(&extend.node_id, addr) {
            ChannelLookup::Usable(chan) => {
                debug!("n_chan is {}", chan);
                return self.deliver_create_cell(id, chan, &extend.create);
            }
            ChannelLookup::Pending { reason } => (reason, false),
            ChannelLookup::Launch { reason } => (reason, true),
        };

        debug!("Next router ({}): {}", addr, reason);
        if let Some(circ) = self.circuits.relay_mut(id) {
            circ.n_hop = Some(ExtendInfo::new(None, extend.node_id, None, None, addr));
            circ.pending_create = Some(extend.create);
            circ.state = CircuitState::ChanWait;
        }
        if launch && self.channels.connect(addr, &extend.node_id).is_none() {
            info!("Launching n_chan failed. Closing circuit.");
            self.close_circuit(id, CloseReason::local(EndReason::ConnectFailed));
        }
        Ok(())
    }

    /// Answer a BEGIN. Streams are not carried, so every BEGIN is refused;
    /// an IPv4 target our exit policy rejects gets its address echoed.
    fn refuse_begin(&mut self, id: CircuitId, msg: &RelayMsg) -> Result<(), CircuitError> {
        let target = msg.begin_target().ok().and_then(|(host, port)| {
            host.parse::<Ipv4Addr>().ok().map(|addr| (addr, port))
        });

        let reply = match target {
            Some((addr, port)) if self.exit_policy_rejects(addr, port) => {
                debug!("Refusing BEGIN to {}:{} by exit policy on circuit {}", addr, port, id);
                RelayMsg::end_exit_policy(msg.stream_id, addr, END_ECHO_TTL)
            }
            _ => RelayMsg::end(msg.stream_id, EndStreamReason::Misc),
        };
        self.relay_send_backward(id, &reply)
    }

    fn exit_policy_rejects(&self, addr: Ipv4Addr, port: u16) -> bool {
        if addr.octets()[0] == 0 {
            return true;
        }
        let me = self.identity();
        let policy = self
            .relays
            .iter()
            .find(|relay| Some(relay.identity) == me)
            .map(|relay| &relay.exit_policy);
        match policy {
            Some(policy) => policy.evaluate(Some(IpAddr::V4(addr)), port) == PolicyResult::Rejected,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CircId, CreateCellType, CreatedCellType, ExtendCellType, HandshakeType};
    use crate::handshake::ClientHandshake;
    use crate::identity::RelayKeys;
    use crate::node::tests::{test_node, StubChannels};
    use onioncirc_common::cells::TAP_ONIONSKIN_CHALLENGE_LEN;
    use onioncirc_common::{CircuitConfig, RelayId};
    use std::net::SocketAddrV4;

    const INBOUND: CircId = CircId(5);

    fn relay_node() -> Node<StubChannels> {
        test_node(CircuitConfig::relay()).with_keys(RelayKeys::generate())
    }

    fn fast_target() -> ExtendInfo {
        ExtendInfo::new(None, RelayId::ZERO, None, None, "11.9.0.1:9001".parse().unwrap())
    }

    /// Open a circuit into `node` from a client on a fresh channel,
    /// returning the channel and the client's layer crypto
    fn open_from_client(node: &mut Node<StubChannels>) -> (ChannelId, HopCrypto) {
        let chan = node.channels.open_to(RelayId::from([0xC1; 20]));
        let (handshake, onionskin) = ClientHandshake::start(HandshakeType::Fast, &fast_target()).unwrap();
        let create = CreateCell::new(CreateCellType::CreateFast, HandshakeType::Fast, onionskin).unwrap();
        node.handle_cell(chan, create.to_cell(INBOUND).unwrap());

        let (_, reply) = node.channels.sent.pop().unwrap();
        assert_eq!(reply.command, CellCommand::CreatedFast);
        let created = CreatedCell::parse(reply.command, &reply.payload).unwrap();
        let keys = handshake.complete(&created.reply).unwrap();
        (chan, HopCrypto::new(&keys, CryptoSide::Client))
    }

    fn send_relay(node: &mut Node<StubChannels>, chan: ChannelId, client: &mut HopCrypto, msg: &RelayMsg) {
        let payload = client.seal(msg).unwrap();
        let command = if msg.command == RelayCommand::Extend {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        node.handle_cell(chan, Cell::new(INBOUND, command, &payload).unwrap());
    }

    /// Decrypt the last cell sent back towards the client
    fn read_reply(node: &mut Node<StubChannels>, client: &mut HopCrypto) -> RelayMsg {
        let (_, cell) = node.channels.sent.pop().unwrap();
        assert_eq!(cell.command, CellCommand::Relay);
        let mut payload = cell.payload;
        client.apply_inbound(&mut payload);
        assert!(client.is_recognized(&payload));
        RelayMsg::decode(&payload).unwrap()
    }

    fn extend_msg(addr: &str, node_id: RelayId) -> RelayMsg {
        let create = CreateCell::new(CreateCellType::Create, HandshakeType::Tap, vec![7u8; TAP_ONIONSKIN_CHALLENGE_LEN]).unwrap();
        let target: SocketAddrV4 = addr.parse().unwrap();
        let extend = ExtendCell::new(ExtendCellType::Extend, Some(target), None, node_id, create).unwrap();
        let (command, body) = extend.format().unwrap();
        RelayMsg::new(command, 0, body)
    }

    #[test]
    fn test_client_refuses_create() {
        let mut node = test_node(CircuitConfig::default());
        let chan = node.channels.open_to(RelayId::from([1; 20]));
        let (_, onionskin) = ClientHandshake::start(HandshakeType::Fast, &fast_target()).unwrap();
        let create = CreateCell::new(CreateCellType::CreateFast, HandshakeType::Fast, onionskin).unwrap();
        node.handle_cell(chan, create.to_cell(INBOUND).unwrap());

        assert_eq!(node.channels.sent_commands(), vec![CellCommand::Destroy]);
        assert_eq!(node.circuits.relay_count(), 0);
    }

    #[test]
    fn test_relay_answers_create_fast() {
        let mut node = relay_node();
        let (_chan, _) = open_from_client(&mut node);
        assert_eq!(node.circuits.relay_count(), 1);
    }

    #[test]
    fn test_create_with_our_circ_id_refused() {
        let mut node = relay_node();
        let chan = node.channels.open_to(RelayId::from([1; 20]));
        let (_, onionskin) = ClientHandshake::start(HandshakeType::Fast, &fast_target()).unwrap();
        let create = CreateCell::new(CreateCellType::CreateFast, HandshakeType::Fast, onionskin).unwrap();
        node.handle_cell(chan, create.to_cell(CircId(0x8000_0005)).unwrap());

        assert_eq!(node.channels.sent_commands(), vec![CellCommand::Destroy]);
        assert_eq!(node.circuits.relay_count(), 0);
    }

    #[test]
    fn test_duplicate_create_dropped() {
        let mut node = relay_node();
        let (chan, _) = open_from_client(&mut node);
        let (_, onionskin) = ClientHandshake::start(HandshakeType::Fast, &fast_target()).unwrap();
        let create = CreateCell::new(CreateCellType::CreateFast, HandshakeType::Fast, onionskin).unwrap();
        node.handle_cell(chan, create.to_cell(INBOUND).unwrap());

        assert!(node.channels.sent.is_empty());
        assert_eq!(node.circuits.relay_count(), 1);
    }

    #[test]
    fn test_extend_to_zero_identity_rejected_before_lookup() {
        let mut node = relay_node();
        let (chan, mut client) = open_from_client(&mut node);
        send_relay(&mut node, chan, &mut client, &extend_msg("11.2.0.1:9001", RelayId::ZERO));

        assert_eq!(node.channels.lookups, 0);
        assert!(node.channels.connects.is_empty());
        assert_eq!(node.circuits.relay_count(), 0);
        let (to, destroy) = node.channels.sent.pop().unwrap();
        assert_eq!(to, chan);
        assert_eq!(destroy.command, CellCommand::Destroy);
        assert_eq!(destroy.destroy_reason(), EndReason::TorProtocol);
    }

    #[test]
    fn test_extend_to_private_address_rejected() {
        let mut node = relay_node();
        let target = node.relays[1].identity;
        let (chan, mut client) = open_from_client(&mut node);
        send_relay(&mut node, chan, &mut client, &extend_msg("10.0.0.7:9001", target));

        assert_eq!(node.channels.lookups, 0);
        assert_eq!(node.circuits.relay_count(), 0);
    }

    #[test]
    fn test_extend_back_to_previous_hop_rejected() {
        let mut node = relay_node();
        let (chan, mut client) = open_from_client(&mut node);
        let previous = node.channels.remote_identity(chan).unwrap();
        send_relay(&mut node, chan, &mut client, &extend_msg("11.2.0.1:9001", previous));

        assert_eq!(node.channels.lookups, 0);
        assert_eq!(node.circuits.relay_count(), 0);
    }

    #[test]
    fn test_extend_waits_for_channel_then_forwards_create() {
        let mut node = relay_node();
        let target = node.relays[1].identity;
        let (chan, mut client) = open_from_client(&mut node);
        send_relay(&mut node, chan, &mut client, &extend_msg("11.2.0.1:9001", target));

        let id = node.circuits.relay_ids()[0];
        let circ = node.circuits.relay(id).unwrap();
        assert_eq!(circ.state, CircuitState::ChanWait);
        assert!(circ.pending_create.is_some());
        assert_eq!(node.channels.connects.len(), 1);

        let next = node.channels.open_to(target);
        node.channel_ready(next);
        let circ = node.circuits.relay(id).unwrap();
        assert_eq!(circ.state, CircuitState::Open);
        assert_eq!(circ.n_chan, Some(next));
        assert!(circ.pending_create.is_none());
        let (to, create) = node.channels.sent.pop().unwrap();
        assert_eq!(to, next);
        assert_eq!(create.command, CellCommand::Create);
    }

    #[test]
    fn test_extend_over_open_channel_and_relay_created() {
        let mut node = relay_node();
        let target = node.relays[1].identity;
        let next = node.channels.open_to(target);
        let (chan, mut client) = open_from_client(&mut node);
        send_relay(&mut node, chan, &mut client, &extend_msg("11.2.0.1:9001", target));

        let (to, create) = node.channels.sent.pop().unwrap();
        assert_eq!(to, next);
        let n_circ_id = create.circ_id;

        let created = CreatedCell::new(CreatedCellType::Created, vec![3u8; 148]).unwrap();
        node.handle_cell(next, created.to_cell(n_circ_id).unwrap());
        let reply = read_reply(&mut node, &mut client);
        assert_eq!(reply.command, RelayCommand::Extended);
        let extended = ExtendedCell::parse(reply.command, &reply.body).unwrap();
        assert_eq!(extended.created.reply, vec![3u8; 148]);
    }

    #[test]
    fn test_destroy_from_next_hop_becomes_truncated() {
        let mut node = relay_node();
        let target = node.relays[1].identity;
        let next = node.channels.open_to(target);
        let (chan, mut client) = open_from_client(&mut node);
        send_relay(&mut node, chan, &mut client, &extend_msg("11.2.0.1:9001", target));
        let (_, create) = node.channels.sent.pop().unwrap();

        node.handle_cell(next, Cell::destroy(create.circ_id, EndReason::Hibernating));
        let reply = read_reply(&mut node, &mut client);
        assert_eq!(reply.command, RelayCommand::Truncated);
        assert_eq!(EndReason::from_wire(reply.body[0]), EndReason::Hibernating);
        assert_eq!(node.circuits.relay_count(), 1);
    }

    #[test]
    fn test_begin_echoes_zero_network_address() {
        let mut node = relay_node();
        let (chan, mut client) = open_from_client(&mut node);
        send_relay(&mut node, chan, &mut client, &RelayMsg::begin(9, "0.1.2.3", 25));

        let reply = read_reply(&mut node, &mut client);
        assert_eq!(reply, RelayMsg::end_exit_policy(9, Ipv4Addr::new(0, 1, 2, 3), END_ECHO_TTL));
    }

    #[test]
    fn test_begin_to_hostname_gets_misc() {
        let mut node = relay_node();
        let (chan, mut client) = open_from_client(&mut node);
        send_relay(&mut node, chan, &mut client, &RelayMsg::begin(9, "example.com", 80));

        let reply = read_reply(&mut node, &mut client);
        assert_eq!(reply, RelayMsg::end(9, EndStreamReason::Misc));
    }

    #[test]
    fn test_unrecognized_cell_at_last_hop_closes() {
        let mut node = relay_node();
        let (chan, _) = open_from_client(&mut node);
        node.handle_cell(chan, Cell::new(INBOUND, CellCommand::Relay, &[0xAB; 509]).unwrap());
        assert_eq!(node.circuits.relay_count(), 0);
        assert_eq!(node.channels.sent_commands(), vec![CellCommand::Destroy]);
    }
}
