/// A whole network in one process.
///
/// Every node holds a `LoopbackChannels` handle onto a shared fabric.
/// Connection attempts and cells are queued there and only reach their
/// destination when `LoopbackNetwork::run_until_idle` delivers them, so a
/// test sees exactly the event ordering a real event loop would produce.
/// Relays can be told to misbehave through `Faults`.
use crate::cell::{Cell, CellCommand};
use crate::channel::{
    ChannelCloseReason, ChannelError, ChannelId, ChannelLayer, ChannelLookup, ChannelState, CircIdType,
};
use crate::identity::RelayKeys;
use crate::node::Node;
use onioncirc_common::{
    routing, Bandwidth, CircuitConfig, ExitPolicy, NetworkParams, RelayId, RelayInfo,
};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Position of a node on the network. The client is always node 0.
pub type NodeIndex = usize;

pub const CLIENT: NodeIndex = 0;

/// Upper bound on events handled by one `run_until_idle` call
const MAX_DELIVERIES: usize = 100_000;

/// Misbehavior injected at one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    /// Connection attempts to this relay fail
    pub refuse_connections: bool,
    /// CREATED cells this relay sends are corrupted in transit
    pub corrupt_created: bool,
    /// RELAY cells this relay sends are corrupted in transit
    pub corrupt_relay_cells: bool,
}

#[derive(Debug)]
struct Endpoint {
    peer: NodeIndex,
    /// `None` while the far end never accepted the connection
    peer_chan: Option<ChannelId>,
    owner: NodeIndex,
    state: ChannelState,
    close_reason: Option<ChannelCloseReason>,
    id_type: CircIdType,
}

#[derive(Debug)]
enum Event {
    Cell { to: NodeIndex, chan: ChannelId, cell: Cell },
    Ready { to: NodeIndex, chan: ChannelId },
    Failed { to: NodeIndex, chan: ChannelId },
    Closed { to: NodeIndex, chan: ChannelId },
}

#[derive(Debug, Default)]
struct Fabric {
    next_chan: u64,
    endpoints: HashMap<ChannelId, Endpoint>,
    identities: Vec<Option<RelayId>>,
    addrs: Vec<Option<SocketAddr>>,
    faults: Vec<Faults>,
    lookups: Vec<usize>,
    queue: VecDeque<Event>,
}

impl Fabric {
    fn fresh_chan(&mut self) -> ChannelId {
        self.next_chan += 1;
        ChannelId(self.next_chan)
    }

    /// Node answering for `identity`, or for `addr` when the identity is
    /// unknown
    fn resolve(&self, identity: &RelayId, addr: SocketAddr) -> Option<NodeIndex> {
        if identity.is_zero() {
            self.addrs.iter().position(|a| *a == Some(addr))
        } else {
            self.identities.iter().position(|id| id.as_ref() == Some(identity))
        }
    }

    fn corrupt(&self, from: NodeIndex, cell: &mut Cell) {
        let faults = self.faults.get(from).copied().unwrap_or_default();
        let garble = (faults.corrupt_created && cell.command.is_created())
            || (faults.corrupt_relay_cells && cell.command == CellCommand::Relay);
        if garble {
            if let Some(byte) = cell.payload.get_mut(5) {
                *byte ^= 0xff;
            }
            trace!("Corrupted {:?} cell from node {}", cell.command, from);
        }
    }

    /// Mark every link between `a` and `b` closed and queue the
    /// notifications. Returns how many endpoints went down.
    fn cut(&mut self, a: NodeIndex, b: NodeIndex) -> usize {
        let mut cut = Vec::new();
        for (chan, ep) in self.endpoints.iter_mut() {
            let between = (ep.owner == a && ep.peer == b) || (ep.owner == b && ep.peer == a);
            if between && ep.state != ChannelState::Closed {
                ep.state = ChannelState::Closed;
                ep.close_reason = Some(ChannelCloseReason::FromBelow);
                cut.push((ep.owner, *chan));
            }
        }
        cut.sort();
        for &(to, chan) in &cut {
            self.queue.push_back(Event::Closed { to, chan });
        }
        cut.len()
    }
}

fn lock(fabric: &Mutex<Fabric>) -> MutexGuard<'_, Fabric> {
    fabric.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One node's view of the loopback fabric
#[derive(Debug, Clone)]
pub struct LoopbackChannels {
    me: NodeIndex,
    fabric: Arc<Mutex<Fabric>>,
}

impl ChannelLayer for LoopbackChannels {
    fn get_for_extend(&mut self, identity: &RelayId, addr: SocketAddr) -> ChannelLookup {
        let mut fabric = lock(&self.fabric);
        if let Some(count) = fabric.lookups.get_mut(self.me) {
            *count += 1;
        }
        let target = match fabric.resolve(identity, addr) {
            Some(target) => target,
            None => return ChannelLookup::Launch { reason: "not connected. Connecting." },
        };

        let mut usable: Option<ChannelId> = None;
        let mut pending = false;
        for (chan, ep) in &fabric.endpoints {
            if ep.owner != self.me || ep.peer != target {
                continue;
            }
            match ep.state {
                ChannelState::Open => {
                    usable = Some(usable.map_or(*chan, |best| best.min(*chan)));
                }
                ChannelState::Opening => pending = true,
                _ => {}
            }
        }

        match usable {
            Some(chan) => ChannelLookup::Usable(chan),
            None if pending => ChannelLookup::Pending {
                reason: "connection in progress; waiting.",
            },
            None => ChannelLookup::Launch { reason: "not connected. Connecting." },
        }
    }

    fn connect(&mut self, addr: SocketAddr, identity: &RelayId) -> Option<ChannelId> {
        let mut fabric = lock(&self.fabric);
        let target = fabric.resolve(identity, addr)?;
        if target == self.me {
            return None;
        }

        let ours = fabric.fresh_chan();
        let refused = fabric.faults.get(target).map_or(false, |f| f.refuse_connections);
        let peer_chan = if refused {
            fabric.queue.push_back(Event::Failed { to: self.me, chan: ours });
            None
        } else {
            let theirs = fabric.fresh_chan();
            fabric.endpoints.insert(
                theirs,
                Endpoint {
                    peer: self.me,
                    peer_chan: Some(ours),
                    owner: target,
                    state: ChannelState::Open,
                    close_reason: None,
                    id_type: CircIdType::Lower,
                },
            );
            fabric.queue.push_back(Event::Ready { to: self.me, chan: ours });
            Some(theirs)
        };
        fabric.endpoints.insert(
            ours,
            Endpoint {
                peer: target,
                peer_chan,
                owner: self.me,
                state: ChannelState::Opening,
                close_reason: None,
                id_type: CircIdType::Higher,
            },
        );
        debug!("Node {} connecting to node {} on {}", self.me, target, ours);
        Some(ours)
    }

    fn send_cell(&mut self, chan: ChannelId, mut cell: Cell) -> Result<(), ChannelError> {
        let mut fabric = lock(&self.fabric);
        let ep = fabric
            .endpoints
            .get(&chan)
            .ok_or(ChannelError::UnknownChannel(chan))?;
        if ep.state != ChannelState::Open {
            return Err(ChannelError::NotOpen(chan));
        }
        let peer_chan = ep.peer_chan.ok_or(ChannelError::NotOpen(chan))?;
        let to = ep.peer;

        fabric.corrupt(self.me, &mut cell);
        fabric.queue.push_back(Event::Cell {
            to,
            chan: peer_chan,
            cell,
        });
        Ok(())
    }

    fn remote_identity(&self, chan: ChannelId) -> Option<RelayId> {
        let fabric = lock(&self.fabric);
        let peer = fabric.endpoints.get(&chan)?.peer;
        fabric.identities.get(peer).copied().flatten()
    }

    fn remote_addr(&self, chan: ChannelId) -> Option<SocketAddr> {
        let fabric = lock(&self.fabric);
        let peer = fabric.endpoints.get(&chan)?.peer;
        fabric.addrs.get(peer).copied().flatten()
    }

    fn state(&self, chan: ChannelId) -> ChannelState {
        lock(&self.fabric)
            .endpoints
            .get(&chan)
            .map_or(ChannelState::Closed, |ep| ep.state)
    }

    fn close_reason(&self, chan: ChannelId) -> Option<ChannelCloseReason> {
        lock(&self.fabric).endpoints.get(&chan).and_then(|ep| ep.close_reason)
    }

    fn circ_id_type(&self, chan: ChannelId) -> CircIdType {
        lock(&self.fabric)
            .endpoints
            .get(&chan)
            .map_or(CircIdType::Neither, |ep| ep.id_type)
    }

    fn wide_circ_ids(&self, _chan: ChannelId) -> bool {
        true
    }
}

/// Directory entry for loopback relay `index`. Each relay sits in its
/// own /16.
fn loopback_relay(keys: &RelayKeys, index: usize) -> RelayInfo {
    let ip = Ipv4Addr::new(11, (index % 250) as u8 + 1, (index / 250) as u8, 1);
    let mut relay = keys.describe(format!("loop{}", index), SocketAddr::new(IpAddr::V4(ip), routing::DEFAULT_OR_PORT));
    relay.bandwidth = Bandwidth::from_kb(100 * (index as u64 % 10 + 1));
    relay.is_fast = true;
    relay.is_stable = true;
    relay.is_possible_guard = true;
    relay.exit_policy = ExitPolicy::accept_all();
    relay
}

/// A client and a set of relays joined by loopback channels
pub struct LoopbackNetwork {
    fabric: Arc<Mutex<Fabric>>,
    nodes: Vec<Node<LoopbackChannels>>,
    consensus: Vec<RelayInfo>,
}

impl LoopbackNetwork {
    /// Build a network of one client and `relays` relays that all share
    /// the same consensus
    pub fn new(relays: usize, client: CircuitConfig, params: NetworkParams) -> Self {
        Self::with_relay_config(relays, client, CircuitConfig::relay(), params)
    }

    pub fn with_relay_config(
        relays: usize,
        client: CircuitConfig,
        relay_config: CircuitConfig,
        params: NetworkParams,
    ) -> Self {
        let keys: Vec<RelayKeys> = (0..relays).map(|_| RelayKeys::generate()).collect();
        let consensus: Vec<RelayInfo> = keys
            .iter()
            .enumerate()
            .map(|(index, keys)| loopback_relay(keys, index))
            .collect();

        let mut fabric = Fabric::default();
        fabric.identities.push(None);
        fabric.addrs.push(None);
        for relay in &consensus {
            fabric.identities.push(Some(relay.identity));
            fabric.addrs.push(Some(relay.or_addr));
        }
        fabric.faults = vec![Faults::default(); relays + 1];
        fabric.lookups = vec![0; relays + 1];
        let fabric = Arc::new(Mutex::new(fabric));

        let channels = |me| LoopbackChannels {
            me,
            fabric: Arc::clone(&fabric),
        };
        let mut nodes = Vec::with_capacity(relays + 1);
        nodes.push(Node::new(client, consensus.clone(), params.clone(), channels(CLIENT)));
        for (index, keys) in keys.into_iter().enumerate() {
            let node = Node::new(relay_config.clone(), consensus.clone(), params.clone(), channels(index + 1))
                .with_keys(keys);
            nodes.push(node);
        }
        debug!("Built loopback network with {} relays", relays);

        Self {
            fabric,
            nodes,
            consensus,
        }
    }

    pub fn consensus(&self) -> &[RelayInfo] {
        &self.consensus
    }

    pub fn client(&self) -> &Node<LoopbackChannels> {
        &self.nodes[CLIENT]
    }

    pub fn client_mut(&mut self) -> &mut Node<LoopbackChannels> {
        &mut self.nodes[CLIENT]
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node<LoopbackChannels>> {
        self.nodes.get(index)
    }

    pub fn index_of(&self, identity: &RelayId) -> Option<NodeIndex> {
        lock(&self.fabric)
            .identities
            .iter()
            .position(|id| id.as_ref() == Some(identity))
    }

    pub fn relay(&self, identity: &RelayId) -> Option<&Node<LoopbackChannels>> {
        self.index_of(identity).and_then(|index| self.nodes.get(index))
    }

    pub fn relay_mut(&mut self, identity: &RelayId) -> Option<&mut Node<LoopbackChannels>> {
        let index = self.index_of(identity)?;
        self.nodes.get_mut(index)
    }

    /// Make relay `identity` misbehave from now on
    pub fn set_faults(&mut self, identity: &RelayId, faults: Faults) -> bool {
        let index = match self.index_of(identity) {
            Some(index) => index,
            None => return false,
        };
        let mut fabric = lock(&self.fabric);
        match fabric.faults.get_mut(index) {
            Some(slot) => {
                *slot = faults;
                true
            }
            None => false,
        }
    }

    /// How many times relay `identity` has looked for a channel to extend
    /// over
    pub fn lookups(&self, identity: &RelayId) -> usize {
        match self.index_of(identity) {
            Some(index) => lock(&self.fabric).lookups.get(index).copied().unwrap_or(0),
            None => 0,
        }
    }

    /// Tear down every link between two nodes as if the network dropped it
    pub fn drop_link(&mut self, a: NodeIndex, b: NodeIndex) -> usize {
        let cut = lock(&self.fabric).cut(a, b);
        debug!("Dropped {} channel endpoints between node {} and node {}", cut, a, b);
        cut
    }

    /// Deliver queued events until none are left. Returns how many were
    /// delivered.
    pub fn run_until_idle(&mut self) -> usize {
        let mut delivered = 0;
        while delivered < MAX_DELIVERIES {
            let event = match self.next_event() {
                Some(event) => event,
                None => return delivered,
            };
            delivered += 1;
            self.dispatch(event);
        }
        warn!("Loopback network still busy after {} deliveries", delivered);
        delivered
    }

    /// Run the build-timeout and probe-timeout checks on every node
    pub fn expire_building(&mut self, now: Instant) {
        for node in &mut self.nodes {
            node.expire_building(now);
        }
    }

    fn next_event(&self) -> Option<Event> {
        lock(&self.fabric).queue.pop_front()
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Cell { to, chan, cell } => {
                let open = lock(&self.fabric)
                    .endpoints
                    .get(&chan)
                    .map_or(false, |ep| ep.state == ChannelState::Open);
                if !open {
                    trace!("Dropping {:?} cell for closed {}", cell.command, chan);
                    return;
                }
                if let Some(node) = self.nodes.get_mut(to) {
                    node.handle_cell(chan, cell);
                }
            }
            Event::Ready { to, chan } => {
                if let Some(ep) = lock(&self.fabric).endpoints.get_mut(&chan) {
                    ep.state = ChannelState::Open;
                }
                if let Some(node) = self.nodes.get_mut(to) {
                    node.channel_ready(chan);
                }
            }
            Event::Failed { to, chan } => {
                if let Some(ep) = lock(&self.fabric).endpoints.get_mut(&chan) {
                    ep.state = ChannelState::Closed;
                    ep.close_reason = Some(ChannelCloseReason::ForError);
                }
                if let Some(node) = self.nodes.get_mut(to) {
                    node.channel_failed(chan);
                }
            }
            Event::Closed { to, chan } => {
                if let Some(node) = self.nodes.get_mut(to) {
                    node.channel_closed(chan);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(relays: usize) -> LoopbackNetwork {
        LoopbackNetwork::new(relays, CircuitConfig::new(), NetworkParams::new())
    }

    #[test]
    fn test_relays_get_distinct_subnets() {
        let net = network(5);
        let consensus = net.consensus();
        for (i, a) in consensus.iter().enumerate() {
            for b in &consensus[i + 1..] {
                assert!(!onioncirc_common::same_subnet_16(&a.or_addr.ip(), &b.or_addr.ip()));
            }
        }
    }

    #[test]
    fn test_connect_reports_ready() {
        let mut net = network(3);
        let target = net.consensus()[0].clone();
        let chan = net.nodes[CLIENT]
            .channels_mut()
            .connect(target.or_addr, &target.identity)
            .unwrap();
        assert_eq!(net.client().channels().state(chan), ChannelState::Opening);

        net.run_until_idle();
        assert_eq!(net.client().channels().state(chan), ChannelState::Open);
        assert_eq!(net.client().channels().remote_identity(chan), Some(target.identity));
        assert_eq!(net.client().channels().circ_id_type(chan), CircIdType::Higher);
    }

    #[test]
    fn test_refused_connection_keeps_expected_identity() {
        let mut net = network(3);
        let target = net.consensus()[1].clone();
        net.set_faults(
            &target.identity,
            Faults {
                refuse_connections: true,
                ..Faults::default()
            },
        );
        let chan = net.nodes[CLIENT]
            .channels_mut()
            .connect(target.or_addr, &target.identity)
            .unwrap();
        net.run_until_idle();

        let channels = net.client().channels();
        assert_eq!(channels.state(chan), ChannelState::Closed);
        assert_eq!(channels.close_reason(chan), Some(ChannelCloseReason::ForError));
        assert_eq!(channels.remote_identity(chan), Some(target.identity));
    }

    #[test]
    fn test_lookup_prefers_open_channel() {
        let mut net = network(3);
        let target = net.consensus()[2].clone();
        let channels = net.nodes[CLIENT].channels_mut();
        assert!(matches!(
            channels.get_for_extend(&target.identity, target.or_addr),
            ChannelLookup::Launch { .. }
        ));
        let chan = channels.connect(target.or_addr, &target.identity).unwrap();
        assert!(matches!(
            channels.get_for_extend(&target.identity, target.or_addr),
            ChannelLookup::Pending { .. }
        ));

        net.run_until_idle();
        let channels = net.nodes[CLIENT].channels_mut();
        assert_eq!(
            channels.get_for_extend(&target.identity, target.or_addr),
            ChannelLookup::Usable(chan)
        );
        assert_eq!(lock(&net.fabric).lookups[CLIENT], 3);
    }

    #[test]
    fn test_unknown_relay_cannot_connect() {
        let mut net = network(2);
        let addr: SocketAddr = "192.0.2.1:9001".parse().unwrap();
        assert_eq!(net.nodes[CLIENT].channels_mut().connect(addr, &RelayId::from([9; 20])), None);
    }

    #[test]
    fn test_send_requires_open_channel() {
        let mut net = network(2);
        let target = net.consensus()[0].clone();
        let chan = net.nodes[CLIENT]
            .channels_mut()
            .connect(target.or_addr, &target.identity)
            .unwrap();
        let cell = Cell::destroy(crate::cell::CircId(0x8000_0001), crate::cell::EndReason::Requested);
        assert_eq!(
            net.nodes[CLIENT].channels_mut().send_cell(chan, cell),
            Err(ChannelError::NotOpen(chan))
        );
    }

    #[test]
    fn test_drop_link_closes_both_ends() {
        let mut net = network(2);
        let target = net.consensus()[0].clone();
        let chan = net.nodes[CLIENT]
            .channels_mut()
            .connect(target.or_addr, &target.identity)
            .unwrap();
        net.run_until_idle();

        assert_eq!(net.drop_link(CLIENT, 1), 2);
        assert_eq!(net.client().channels().state(chan), ChannelState::Closed);
        assert_eq!(
            net.client().channels().close_reason(chan),
            Some(ChannelCloseReason::FromBelow)
        );
        assert_eq!(net.run_until_idle(), 2);
    }
}
