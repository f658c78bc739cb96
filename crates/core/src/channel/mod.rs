/// The seam between circuit logic and the links that carry cells.
///
/// Nothing here does I/O. An implementation accepts requests and reports
/// their outcome later as events handed back to the node.
mod circ_id;

pub use circ_id::{CircIdAllocator, CircIdType};

use crate::cell::Cell;
use onioncirc_common::RelayId;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Handle for one link to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// How a channel came to be closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCloseReason {
    /// We asked for it
    Requested,
    /// The peer or the network closed it
    FromBelow,
    /// Closed because of an error on our side
    ForError,
}

/// Answer to "is there a channel I can use to reach this relay?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLookup {
    /// An open channel is ready
    Usable(ChannelId),
    /// A connection is already in progress; wait for it
    Pending { reason: &'static str },
    /// Nothing usable; the caller should launch a connection
    Launch { reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("Channel {0} is not open")]
    NotOpen(ChannelId),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Channel operations the circuit code needs
pub trait ChannelLayer {
    /// Find a channel suitable for reaching `identity` at `addr`
    fn get_for_extend(&mut self, identity: &RelayId, addr: SocketAddr) -> ChannelLookup;

    /// Start connecting; `None` if the attempt could not even be launched.
    /// Completion is reported later as a channel-ready event.
    fn connect(&mut self, addr: SocketAddr, identity: &RelayId) -> Option<ChannelId>;

    fn send_cell(&mut self, chan: ChannelId, cell: Cell) -> Result<(), ChannelError>;

    /// Identity the peer proved, once the channel is open
    fn remote_identity(&self, chan: ChannelId) -> Option<RelayId>;

    fn remote_addr(&self, chan: ChannelId) -> Option<SocketAddr>;

    fn state(&self, chan: ChannelId) -> ChannelState;

    fn close_reason(&self, chan: ChannelId) -> Option<ChannelCloseReason>;

    fn circ_id_type(&self, chan: ChannelId) -> CircIdType;

    fn wide_circ_ids(&self, chan: ChannelId) -> bool;
}
