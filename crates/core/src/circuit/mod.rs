/// Circuits: the origin-side build state machine, the relay-side handling
/// of circuits we carry, and the bookkeeping shared by both.
mod build_times;
mod builder;
mod cpath;
mod crypto;
mod extend;
mod list;
mod or_circuit;
mod origin;
mod types;

pub use build_times::{BuildTimeOutcome, BuildTimes, BuildTimesSummary};
pub use cpath::{CryptPath, Hop, HopState};
pub use crypto::{CryptoSide, HopCrypto};
pub use extend::ExtendError;
pub use list::{CircuitList, RemovedCircuit};
pub use or_circuit::OrCircuit;
pub use origin::{CircuitSummary, HopSummary, OriginCircuit};
pub use types::{
    BuildFlags, BuildState, CircuitError, CircuitId, CircuitPurpose, CircuitState, CloseReason, PathState,
};
