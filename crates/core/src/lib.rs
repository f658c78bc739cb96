pub mod cell;
pub mod channel;
pub mod circuit;
pub mod extend_info;
pub mod guard;
pub mod handshake;
pub mod identity;
pub mod loopback;
pub mod node;
pub mod path;
pub mod pathbias;
pub mod service;

pub use node::{ClosedCircuit, Node};

// Re-export circuit types
pub use circuit::{
    BuildFlags, BuildState, BuildTimeOutcome, BuildTimes, BuildTimesSummary, CircuitError, CircuitId,
    CircuitList, CircuitPurpose, CircuitState, CircuitSummary, CloseReason, CryptPath, ExtendError, Hop,
    HopState, HopSummary, OriginCircuit, OrCircuit, PathState,
};

// Re-export channel seam
pub use channel::{
    ChannelCloseReason, ChannelError, ChannelId, ChannelLayer, ChannelLookup, ChannelState, CircIdType,
};

pub use cell::{Cell, CellCommand, CellError, CircId, EndReason};
pub use extend_info::ExtendInfo;
pub use guard::{EntryGuard, GuardRegistry};
pub use handshake::HandshakeError;
pub use identity::RelayKeys;
pub use loopback::{Faults, LoopbackChannels, LoopbackNetwork, NodeIndex, CLIENT};
pub use path::{ExitDemand, PathSelectionError, StreamTarget};
pub use pathbias::{PathBiasParams, PathBiasProbe};
pub use service::{NodeEvent, NodeHandle};
