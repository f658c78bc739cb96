use super::or_circuit::OrCircuit;
use super::origin::OriginCircuit;
use super::types::{CircuitId, CircuitState, PathState};
use crate::cell::CircId;
use crate::channel::ChannelId;
use onioncirc_common::RelayId;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// A circuit removed from the list
#[derive(Debug)]
pub enum RemovedCircuit {
    Origin(OriginCircuit),
    Relay(OrCircuit),
}

/// Every live circuit, indexed by id and by `(channel, circuit id)`
#[derive(Debug, Default)]
pub struct CircuitList {
    next_id: u64,
    origin: BTreeMap<CircuitId, OriginCircuit>,
    relay: BTreeMap<CircuitId, OrCircuit>,
    by_chan: HashMap<(ChannelId, CircId), CircuitId>,
}

impl CircuitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> CircuitId {
        self.next_id += 1;
        CircuitId(self.next_id)
    }

    pub fn insert_origin(&mut self, circ: OriginCircuit) {
        self.origin.insert(circ.id, circ);
    }

    pub fn insert_relay(&mut self, circ: OrCircuit) {
        self.by_chan.insert((circ.p_chan, circ.p_circ_id), circ.id);
        self.relay.insert(circ.id, circ);
    }

    pub fn origin(&self, id: CircuitId) -> Option<&OriginCircuit> {
        self.origin.get(&id)
    }

    pub fn origin_mut(&mut self, id: CircuitId) -> Option<&mut OriginCircuit> {
        self.origin.get_mut(&id)
    }

    pub fn relay(&self, id: CircuitId) -> Option<&OrCircuit> {
        self.relay.get(&id)
    }

    pub fn relay_mut(&mut self, id: CircuitId) -> Option<&mut OrCircuit> {
        self.relay.get_mut(&id)
    }

    pub fn is_origin(&self, id: CircuitId) -> bool {
        self.origin.contains_key(&id)
    }

    pub fn contains(&self, id: CircuitId) -> bool {
        self.origin.contains_key(&id) || self.relay.contains_key(&id)
    }

    /// Circuit using `circ_id` on `chan`
    pub fn lookup(&self, chan: ChannelId, circ_id: CircId) -> Option<CircuitId> {
        self.by_chan.get(&(chan, circ_id)).copied()
    }

    pub fn id_in_use(&self, chan: ChannelId, circ_id: CircId) -> bool {
        self.by_chan.contains_key(&(chan, circ_id))
    }

    /// Attach the next-hop side of circuit `id` to `(chan, circ_id)`
    pub fn set_n_binding(&mut self, id: CircuitId, chan: ChannelId, circ_id: CircId) {
        if let Some(previous) = self.by_chan.insert((chan, circ_id), id) {
            if previous != id {
                warn!(
                    "Bug: circuit id {} on {} was bound to {}, rebinding to {}",
                    circ_id, chan, previous, id
                );
            }
        }
        if let Some(circ) = self.origin.get_mut(&id) {
            circ.n_chan = Some(chan);
            circ.n_circ_id = Some(circ_id);
        } else if let Some(circ) = self.relay.get_mut(&id) {
            circ.n_chan = Some(chan);
            circ.n_circ_id = Some(circ_id);
        }
    }

    /// Drop the next-hop binding of circuit `id` after its next hop went
    /// away, so nothing is sent there again
    pub fn clear_n_binding(&mut self, id: CircuitId) {
        let binding = if let Some(circ) = self.origin.get_mut(&id) {
            (circ.n_chan.take(), circ.n_circ_id.take())
        } else if let Some(circ) = self.relay.get_mut(&id) {
            (circ.n_chan.take(), circ.n_circ_id.take())
        } else {
            (None, None)
        };
        if let (Some(chan), Some(circ_id)) = binding {
            self.by_chan.remove(&(chan, circ_id));
        }
    }

    pub fn remove(&mut self, id: CircuitId) -> Option<RemovedCircuit> {
        if let Some(circ) = self.origin.remove(&id) {
            if let (Some(chan), Some(circ_id)) = (circ.n_chan, circ.n_circ_id) {
                self.by_chan.remove(&(chan, circ_id));
            }
            return Some(RemovedCircuit::Origin(circ));
        }
        if let Some(circ) = self.relay.remove(&id) {
            self.by_chan.remove(&(circ.p_chan, circ.p_circ_id));
            if let (Some(chan), Some(circ_id)) = (circ.n_chan, circ.n_circ_id) {
                self.by_chan.remove(&(chan, circ_id));
            }
            return Some(RemovedCircuit::Relay(circ));
        }
        None
    }

    pub fn origins(&self) -> impl Iterator<Item = &OriginCircuit> {
        self.origin.values()
    }

    pub fn relays(&self) -> impl Iterator<Item = &OrCircuit> {
        self.relay.values()
    }

    pub fn relay_ids(&self) -> Vec<CircuitId> {
        self.relay.keys().copied().collect()
    }

    /// Circuits waiting in ChanWait for a channel to `identity` at `addr`.
    /// A pending hop with no known identity matches on address alone.
    pub fn waiting_for(&self, identity: Option<RelayId>, addr: Option<std::net::SocketAddr>) -> Vec<CircuitId> {
        let matches = |hop: &crate::extend_info::ExtendInfo| {
            if hop.has_identity() {
                Some(hop.identity) == identity
            } else {
                Some(hop.addr) == addr
            }
        };
        let origin = self
            .origin
            .values()
            .filter(|c| c.state == CircuitState::ChanWait)
            .filter(|c| c.n_hop.as_ref().map_or(false, matches))
            .map(|c| c.id);
        let relay = self
            .relay
            .values()
            .filter(|c| c.state == CircuitState::ChanWait)
            .filter(|c| c.n_hop.as_ref().map_or(false, matches))
            .map(|c| c.id);
        origin.chain(relay).collect()
    }

    /// Circuits with either side on `chan`
    pub fn on_channel(&self, chan: ChannelId) -> Vec<CircuitId> {
        let mut ids: Vec<CircuitId> = self
            .by_chan
            .iter()
            .filter(|((c, _), _)| *c == chan)
            .map(|(_, id)| *id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Live origin circuits through `guard` whose path state lies in
    /// `from..=to` and that path bias counts
    pub fn count_in_states(&self, guard: &RelayId, from: PathState, to: PathState) -> usize {
        self.origin
            .values()
            .filter(|c| c.path_state >= from && c.path_state <= to)
            .filter(|c| c.pathbias_counted == Some(true))
            .filter(|c| c.guard_identity().as_ref() == Some(guard))
            .count()
    }

    pub fn origin_count(&self) -> usize {
        self.origin.len()
    }

    pub fn relay_count(&self) -> usize {
        self.relay.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::types::{BuildFlags, CircuitPurpose};
    use crate::extend_info::ExtendInfo;

    fn origin(list: &mut CircuitList) -> CircuitId {
        let id = list.next_id();
        list.insert_origin(OriginCircuit::new(id, CircuitPurpose::General, BuildFlags::default()));
        id
    }

    #[test]
    fn test_binding_and_removal() {
        let mut list = CircuitList::new();
        let id = origin(&mut list);
        let chan = ChannelId(3);
        list.set_n_binding(id, chan, CircId(0x8001));

        assert_eq!(list.lookup(chan, CircId(0x8001)), Some(id));
        assert!(list.id_in_use(chan, CircId(0x8001)));
        assert_eq!(list.on_channel(chan), vec![id]);

        assert!(matches!(list.remove(id), Some(RemovedCircuit::Origin(_))));
        assert!(!list.id_in_use(chan, CircId(0x8001)));
        assert!(list.remove(id).is_none());
    }

    #[test]
    fn test_waiting_for() {
        let mut list = CircuitList::new();
        let id = origin(&mut list);
        let relay = RelayId::from([2u8; 20]);
        let addr: std::net::SocketAddr = "2.2.2.2:9001".parse().unwrap();
        list.origin_mut(id).unwrap().n_hop =
            Some(ExtendInfo::new(None, relay, None, None, addr));

        assert_eq!(list.waiting_for(Some(relay), Some(addr)), vec![id]);
        assert!(list.waiting_for(Some(RelayId::from([3u8; 20])), Some(addr)).is_empty());
    }

    #[test]
    fn test_count_in_states() {
        let mut list = CircuitList::new();
        let guard = RelayId::from([9u8; 20]);
        for state in [PathState::BuildSucceeded, PathState::UseAttempted, PathState::NewCirc] {
            let id = origin(&mut list);
            let circ = list.origin_mut(id).unwrap();
            circ.cpath.append(&ExtendInfo::new(None, guard, None, None, "9.9.9.9:1".parse().unwrap()));
            circ.path_state = state;
            circ.pathbias_counted = Some(true);
        }
        assert_eq!(
            list.count_in_states(&guard, PathState::BuildSucceeded, PathState::UseSucceeded),
            2
        );
        assert_eq!(
            list.count_in_states(&guard, PathState::UseAttempted, PathState::UseAttempted),
            1
        );
    }
}
