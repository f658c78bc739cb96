use super::extend::ExtendError;
use crate::cell::{CellError, EndReason};
use crate::channel::ChannelError;
use crate::extend_info::ExtendInfo;
use crate::handshake::HandshakeError;
use crate::path::PathSelectionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Process-wide identifier for a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitId(pub u64);

impl CircuitId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Circuit({})", self.0)
    }
}

/// What an origin circuit is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitPurpose {
    /// Ordinary exit traffic
    General,
    /// Client: talking to an introduction point
    Introducing,
    /// Client: sent INTRODUCE1, waiting for the ack
    IntroduceAckWait,
    /// Client: introduction acknowledged
    IntroduceAcked,
    /// Client: establishing a rendezvous point
    EstablishRend,
    RendReady,
    RendReadyIntroAcked,
    RendJoined,
    /// Built only to learn how long builds take
    MeasureTimeout,
    /// Service: establishing an introduction point
    SEstablishIntro,
    SIntro,
    /// Service: connecting to a client's rendezvous point
    SConnectRend,
    SRendJoined,
    /// Reachability self-test
    Testing,
    /// Built on behalf of a controller
    Controller,
    /// Being probed before teardown to see whether it still works
    PathBiasTesting,
}

impl CircuitPurpose {
    /// A pre-chosen exit at the end of such a circuit says nothing about
    /// the user, so it does not lengthen the path
    pub fn exit_leaks_nothing(self) -> bool {
        matches!(self, CircuitPurpose::Testing | CircuitPurpose::SEstablishIntro)
    }

    /// Client-side introduction purposes
    pub fn is_client_intro(self) -> bool {
        matches!(
            self,
            CircuitPurpose::Introducing
                | CircuitPurpose::IntroduceAckWait
                | CircuitPurpose::IntroduceAcked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitPurpose::General => "General-purpose client",
            CircuitPurpose::Introducing => "Hidden service client: Connecting to intro point",
            CircuitPurpose::IntroduceAckWait => {
                "Hidden service client: Waiting for ack from intro point"
            }
            CircuitPurpose::IntroduceAcked => {
                "Hidden service client: Received ack from intro point"
            }
            CircuitPurpose::EstablishRend => "Hidden service client: Establishing rendezvous point",
            CircuitPurpose::RendReady => "Hidden service client: Pending rendezvous point",
            CircuitPurpose::RendReadyIntroAcked => {
                "Hidden service client: Pending rendezvous point (ack received)"
            }
            CircuitPurpose::RendJoined => "Hidden service client: Active rendezvous point",
            CircuitPurpose::MeasureTimeout => "Measuring circuit timeout",
            CircuitPurpose::SEstablishIntro => "Hidden service: Establishing introduction point",
            CircuitPurpose::SIntro => "Hidden service: Introduction point",
            CircuitPurpose::SConnectRend => "Hidden service: Connecting to rendezvous point",
            CircuitPurpose::SRendJoined => "Hidden service: Active rendezvous point",
            CircuitPurpose::Testing => "Testing circuit",
            CircuitPurpose::Controller => "Circuit made by controller",
            CircuitPurpose::PathBiasTesting => "Path-bias testing circuit",
        }
    }
}

impl fmt::Display for CircuitPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build progress of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Waiting for a channel to the next hop
    ChanWait,
    /// Handshakes in flight
    Building,
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::ChanWait => "connecting to server",
            CircuitState::Building => "doing handshakes",
            CircuitState::Open => "open",
        })
    }
}

/// Path-bias accounting state. Ordered: accounting only ever moves forward,
/// except for the explicit use-success rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathState {
    NewCirc,
    BuildAttempted,
    BuildSucceeded,
    UseAttempted,
    UseSucceeded,
    UseFailed,
    AlreadyCounted,
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PathState::NewCirc => "new",
            PathState::BuildAttempted => "build attempted",
            PathState::BuildSucceeded => "build succeeded",
            PathState::UseAttempted => "use attempted",
            PathState::UseSucceeded => "use succeeded",
            PathState::UseFailed => "use failed",
            PathState::AlreadyCounted => "already counted",
        })
    }
}

/// Why a circuit is being closed, and whether the other side asked for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub reason: EndReason,
    pub remote: bool,
}

impl CloseReason {
    pub fn local(reason: EndReason) -> Self {
        Self {
            reason,
            remote: false,
        }
    }

    pub fn remote(reason: EndReason) -> Self {
        Self {
            reason,
            remote: true,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.remote {
            write!(f, "{} (remote)", self.reason)
        } else {
            write!(f, "{}", self.reason)
        }
    }
}

/// Caller-supplied launch options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildFlags {
    pub onehop_tunnel: bool,
    pub need_uptime: bool,
    pub need_capacity: bool,
    pub is_internal: bool,
}

impl BuildFlags {
    pub fn internal() -> Self {
        Self {
            is_internal: true,
            ..Self::default()
        }
    }
}

/// Path decisions made when a circuit is launched
#[derive(Debug, Clone)]
pub struct BuildState {
    pub desired_path_len: usize,
    pub chosen_exit: Option<ExtendInfo>,
    pub need_uptime: bool,
    pub need_capacity: bool,
    pub is_internal: bool,
    pub onehop_tunnel: bool,
}

impl BuildState {
    pub fn from_flags(flags: BuildFlags) -> Self {
        Self {
            desired_path_len: 0,
            chosen_exit: None,
            need_uptime: flags.need_uptime,
            need_capacity: flags.need_capacity,
            is_internal: flags.is_internal,
            onehop_tunnel: flags.onehop_tunnel,
        }
    }
}

/// Errors that end a circuit or prevent one from being launched
#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("Path selection failed: {0}")]
    NoPath(#[from] PathSelectionError),

    #[error("No unused circuit id on channel")]
    NoCircId,

    #[error("Could not launch a channel to {0}")]
    ChannelLaunch(String),

    #[error("Channel closed before the circuit was built")]
    ChannelClosed,

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Bad cell: {0}")]
    Cell(#[from] CellError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Refused to extend: {0}")]
    Extend(#[from] ExtendError),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Guard {0} is disabled for path bias")]
    GuardDisabled(String),

    #[error("Unknown circuit {0}")]
    UnknownCircuit(CircuitId),

    #[error("Circuit in wrong state: {0}")]
    BadState(&'static str),
}

impl CircuitError {
    /// Reason to close the circuit with
    pub fn end_reason(&self) -> EndReason {
        match self {
            CircuitError::NoPath(_) => EndReason::NoPath,
            CircuitError::NoCircId => EndReason::ResourceLimit,
            CircuitError::ChannelLaunch(_) => EndReason::ConnectFailed,
            CircuitError::ChannelClosed => EndReason::ChannelClosed,
            CircuitError::Handshake(_)
            | CircuitError::Cell(_)
            | CircuitError::Extend(_)
            | CircuitError::Protocol(_)
            | CircuitError::GuardDisabled(_) => EndReason::TorProtocol,
            CircuitError::Channel(_)
            | CircuitError::UnknownCircuit(_)
            | CircuitError::BadState(_) => EndReason::Internal,
        }
    }
}
