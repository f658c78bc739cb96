use super::cpath::{CryptPath, HopState};
use super::types::{BuildFlags, BuildState, CircuitId, CircuitPurpose, CircuitState, PathState};
use crate::cell::CircId;
use crate::channel::ChannelId;
use crate::extend_info::ExtendInfo;
use crate::pathbias::PathBiasProbe;
use onioncirc_common::{RelayId, Timestamp};
use serde::Serialize;
use std::time::Instant;

/// A circuit this node built, or is building, for its own use
#[derive(Debug)]
pub struct OriginCircuit {
    pub id: CircuitId,
    pub purpose: CircuitPurpose,
    pub state: CircuitState,
    pub build_state: BuildState,
    pub cpath: CryptPath,
    /// Channel to the first hop, once known
    pub n_chan: Option<ChannelId>,
    pub n_circ_id: Option<CircId>,
    /// First hop we are waiting on a channel for
    pub n_hop: Option<ExtendInfo>,
    pub path_state: PathState,
    /// Set once the circuit first reached Open
    pub has_opened: bool,
    /// Start of the current build (or probe)
    pub began_at: Instant,
    /// When the circuit was first used for a stream
    pub dirty_at: Option<Instant>,
    pub probe: Option<PathBiasProbe>,
    /// Last path-bias eligibility answer, to catch it changing mid-life
    pub pathbias_counted: Option<bool>,
    pub created_at: Timestamp,
}

impl OriginCircuit {
    pub fn new(id: CircuitId, purpose: CircuitPurpose, flags: BuildFlags) -> Self {
        Self {
            id,
            purpose,
            state: CircuitState::ChanWait,
            build_state: BuildState::from_flags(flags),
            cpath: CryptPath::new(),
            n_chan: None,
            n_circ_id: None,
            n_hop: None,
            path_state: PathState::NewCirc,
            has_opened: false,
            began_at: Instant::now(),
            dirty_at: None,
            probe: None,
            pathbias_counted: None,
            created_at: Timestamp::now(),
        }
    }

    /// Identity of the entry hop, which is the guard being measured
    pub fn guard_identity(&self) -> Option<RelayId> {
        self.cpath.first().map(|hop| hop.extend_info.identity)
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    pub fn summary(&self) -> CircuitSummary {
        CircuitSummary {
            id: self.id.as_u64(),
            purpose: self.purpose,
            state: self.state,
            path_state: self.path_state,
            desired_len: self.build_state.desired_path_len,
            hops: self
                .cpath
                .iter()
                .map(|hop| HopSummary {
                    identity: hop.extend_info.identity.to_hex(),
                    nickname: hop.extend_info.nickname.clone(),
                    state: hop.state,
                })
                .collect(),
            created_at: self.created_at.as_secs(),
        }
    }
}

/// Serializable view of an origin circuit
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSummary {
    pub id: u64,
    pub purpose: CircuitPurpose,
    pub state: CircuitState,
    pub path_state: PathState,
    pub desired_len: usize,
    pub hops: Vec<HopSummary>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HopSummary {
    pub identity: String,
    pub nickname: Option<String>,
    pub state: HopState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_circuit_defaults() {
        let circ = OriginCircuit::new(CircuitId(1), CircuitPurpose::General, BuildFlags::default());
        assert_eq!(circ.state, CircuitState::ChanWait);
        assert_eq!(circ.path_state, PathState::NewCirc);
        assert!(circ.guard_identity().is_none());
        assert!(!circ.has_opened);
    }

    #[test]
    fn test_summary() {
        let mut circ =
            OriginCircuit::new(CircuitId(7), CircuitPurpose::Testing, BuildFlags::internal());
        circ.cpath.append(&ExtendInfo::new(
            Some("a".into()),
            RelayId::from([1u8; 20]),
            None,
            None,
            "1.1.1.1:1".parse().unwrap(),
        ));
        let summary = circ.summary();
        assert_eq!(summary.id, 7);
        assert_eq!(summary.hops.len(), 1);
        assert_eq!(summary.hops[0].state, HopState::Closed);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"Testing\""));
    }
}
