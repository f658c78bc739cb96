/// Wire formats for the cells that build circuits.
///
/// Every cell carries a fixed 509-byte payload. Framing the cell onto a
/// channel (circuit id width, link protocol) belongs to the channel layer.
mod create;
mod extend;
mod relay;

pub use create::{CreateCell, CreateCellType, CreatedCell, CreatedCellType, HandshakeType, NTOR_CREATE_MAGIC};
pub use extend::{ExtendCell, ExtendCellType, ExtendedCell};
pub use relay::{EndStreamReason, RelayCommand, RelayMsg};
pub(crate) use relay::{DIGEST_OFFSET, RECOGNIZED_OFFSET};

use onioncirc_common::cells::CELL_PAYLOAD_SIZE;
use std::fmt;

/// Channel-scoped circuit identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircId(pub u32);

impl CircId {
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CircId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    RelayEarly = 9,
    Create2 = 10,
    Created2 = 11,
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            _ => None,
        }
    }

    pub fn is_create(self) -> bool {
        matches!(
            self,
            CellCommand::Create | CellCommand::CreateFast | CellCommand::Create2
        )
    }

    pub fn is_created(self) -> bool {
        matches!(
            self,
            CellCommand::Created | CellCommand::CreatedFast | CellCommand::Created2
        )
    }

    pub fn is_relay(self) -> bool {
        matches!(self, CellCommand::Relay | CellCommand::RelayEarly)
    }
}

/// Reason codes carried in DESTROY and TRUNCATED cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
    None,
    TorProtocol,
    Internal,
    Requested,
    Hibernating,
    ResourceLimit,
    ConnectFailed,
    OrIdentity,
    ChannelClosed,
    Finished,
    Timeout,
    Destroyed,
    NoSuchService,
    /// Local only: no path could be chosen
    NoPath,
    /// Local only: a measurement circuit outlived its usefulness
    MeasurementExpired,
}

impl EndReason {
    /// Wire value; local-only reasons are sent as `None`
    pub fn to_wire(self) -> u8 {
        match self {
            EndReason::None => 0,
            EndReason::TorProtocol => 1,
            EndReason::Internal => 2,
            EndReason::Requested => 3,
            EndReason::Hibernating => 4,
            EndReason::ResourceLimit => 5,
            EndReason::ConnectFailed => 6,
            EndReason::OrIdentity => 7,
            EndReason::ChannelClosed => 8,
            EndReason::Finished => 9,
            EndReason::Timeout => 10,
            EndReason::Destroyed => 11,
            EndReason::NoSuchService => 12,
            EndReason::NoPath | EndReason::MeasurementExpired => 0,
        }
    }

    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => EndReason::TorProtocol,
            2 => EndReason::Internal,
            3 => EndReason::Requested,
            4 => EndReason::Hibernating,
            5 => EndReason::ResourceLimit,
            6 => EndReason::ConnectFailed,
            7 => EndReason::OrIdentity,
            8 => EndReason::ChannelClosed,
            9 => EndReason::Finished,
            10 => EndReason::Timeout,
            11 => EndReason::Destroyed,
            12 => EndReason::NoSuchService,
            _ => EndReason::None,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EndReason::None => "none",
            EndReason::TorProtocol => "protocol violation",
            EndReason::Internal => "internal error",
            EndReason::Requested => "requested",
            EndReason::Hibernating => "hibernating",
            EndReason::ResourceLimit => "resource limit",
            EndReason::ConnectFailed => "connect failed",
            EndReason::OrIdentity => "identity mismatch",
            EndReason::ChannelClosed => "channel closed",
            EndReason::Finished => "finished",
            EndReason::Timeout => "timeout",
            EndReason::Destroyed => "destroyed",
            EndReason::NoSuchService => "no such service",
            EndReason::NoPath => "no path",
            EndReason::MeasurementExpired => "measurement expired",
        };
        f.write_str(text)
    }
}

/// A fixed-size cell addressed to one circuit on one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circ_id: CircId,
    pub command: CellCommand,
    pub payload: Vec<u8>,
}

impl Cell {
    /// Build a cell, zero-padding the body to the fixed payload size
    pub fn new(circ_id: CircId, command: CellCommand, body: &[u8]) -> Result<Self, CellError> {
        if body.len() > CELL_PAYLOAD_SIZE {
            return Err(CellError::TooLong {
                len: body.len(),
                max: CELL_PAYLOAD_SIZE,
            });
        }
        let mut payload = vec![0u8; CELL_PAYLOAD_SIZE];
        payload[..body.len()].copy_from_slice(body);
        Ok(Self {
            circ_id,
            command,
            payload,
        })
    }

    pub fn destroy(circ_id: CircId, reason: EndReason) -> Self {
        let mut payload = vec![0u8; CELL_PAYLOAD_SIZE];
        payload[0] = reason.to_wire();
        Self {
            circ_id,
            command: CellCommand::Destroy,
            payload,
        }
    }

    /// Reason byte of a DESTROY cell
    pub fn destroy_reason(&self) -> EndReason {
        EndReason::from_wire(self.payload.first().copied().unwrap_or(0))
    }
}

/// Cell parsing and formatting errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    #[error("Cell body too long: {len} > {max}")]
    TooLong { len: usize, max: usize },

    #[error("Cell body truncated: needed {needed}, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("Unknown handshake type {0}")]
    UnknownHandshake(u16),

    #[error("Handshake {handshake:?} not allowed in {cell}")]
    HandshakeNotAllowed {
        handshake: HandshakeType,
        cell: &'static str,
    },

    #[error("Bad handshake length for {handshake:?}: {len}")]
    BadHandshakeLength { handshake: HandshakeType, len: usize },

    #[error("Unexpected cell command {0:?}")]
    UnexpectedCommand(CellCommand),

    #[error("Unknown relay command {0}")]
    UnknownRelayCommand(u8),

    #[error("Bad link specifier: {0}")]
    BadLinkSpecifier(String),

    #[error("Extend cell is missing {0}")]
    MissingField(&'static str),

    #[error("Malformed relay body: {0}")]
    Malformed(String),
}

pub(crate) fn need(body: &[u8], needed: usize) -> Result<(), CellError> {
    if body.len() < needed {
        return Err(CellError::Truncated {
            needed,
            have: body.len(),
        });
    }
    Ok(())
}
