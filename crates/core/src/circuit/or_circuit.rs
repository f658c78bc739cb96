use super::crypto::HopCrypto;
use super::types::{CircuitId, CircuitState};
use crate::cell::{CircId, CreateCell};
use crate::channel::ChannelId;
use crate::extend_info::ExtendInfo;

/// A circuit passing through this relay
#[derive(Debug)]
pub struct OrCircuit {
    pub id: CircuitId,
    pub state: CircuitState,
    /// Channel towards the origin
    pub p_chan: ChannelId,
    pub p_circ_id: CircId,
    /// Channel towards the next hop, once extended
    pub n_chan: Option<ChannelId>,
    pub n_circ_id: Option<CircId>,
    /// Next hop we are waiting on a channel for
    pub n_hop: Option<ExtendInfo>,
    /// CREATE to forward once that channel opens
    pub pending_create: Option<CreateCell>,
    pub crypto: HopCrypto,
}

impl OrCircuit {
    pub fn new(id: CircuitId, p_chan: ChannelId, p_circ_id: CircId, crypto: HopCrypto) -> Self {
        Self {
            id,
            state: CircuitState::Open,
            p_chan,
            p_circ_id,
            n_chan: None,
            n_circ_id: None,
            n_hop: None,
            pending_create: None,
            crypto,
        }
    }

    /// Whether `(chan, circ_id)` names our side towards the origin
    pub fn is_p_side(&self, chan: ChannelId, circ_id: CircId) -> bool {
        self.p_chan == chan && self.p_circ_id == circ_id
    }
}
