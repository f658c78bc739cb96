use super::{need, CellError, EndReason};
use onioncirc_common::cells::{CELL_PAYLOAD_SIZE, RELAY_HEADER_SIZE, RELAY_PAYLOAD_SIZE};
use std::net::Ipv4Addr;

/// Offsets inside a relay cell header
pub(crate) const RECOGNIZED_OFFSET: usize = 1;
pub(crate) const DIGEST_OFFSET: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Extend = 6,
    Extended = 7,
    Truncate = 8,
    Truncated = 9,
    Drop = 10,
    Resolve = 11,
    Resolved = 12,
    BeginDir = 13,
    Extend2 = 14,
    Extended2 = 15,
}

impl RelayCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// Why a stream ended, as carried in RELAY_END
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStreamReason {
    Misc,
    ResolveFailed,
    ConnectRefused,
    ExitPolicy,
    Destroy,
    Done,
    Timeout,
    NoRoute,
    Hibernating,
    Internal,
    ResourceLimit,
    ConnReset,
    TorProtocol,
    NotDirectory,
}

impl EndStreamReason {
    pub fn to_wire(self) -> u8 {
        match self {
            EndStreamReason::Misc => 1,
            EndStreamReason::ResolveFailed => 2,
            EndStreamReason::ConnectRefused => 3,
            EndStreamReason::ExitPolicy => 4,
            EndStreamReason::Destroy => 5,
            EndStreamReason::Done => 6,
            EndStreamReason::Timeout => 7,
            EndStreamReason::NoRoute => 8,
            EndStreamReason::Hibernating => 9,
            EndStreamReason::Internal => 10,
            EndStreamReason::ResourceLimit => 11,
            EndStreamReason::ConnReset => 12,
            EndStreamReason::TorProtocol => 13,
            EndStreamReason::NotDirectory => 14,
        }
    }

    pub fn from_wire(value: u8) -> Self {
        match value {
            2 => EndStreamReason::ResolveFailed,
            3 => EndStreamReason::ConnectRefused,
            4 => EndStreamReason::ExitPolicy,
            5 => EndStreamReason::Destroy,
            6 => EndStreamReason::Done,
            7 => EndStreamReason::Timeout,
            8 => EndStreamReason::NoRoute,
            9 => EndStreamReason::Hibernating,
            10 => EndStreamReason::Internal,
            11 => EndStreamReason::ResourceLimit,
            12 => EndStreamReason::ConnReset,
            13 => EndStreamReason::TorProtocol,
            14 => EndStreamReason::NotDirectory,
            _ => EndStreamReason::Misc,
        }
    }
}

/// Decrypted content of a relay cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMsg {
    pub command: RelayCommand,
    pub stream_id: u16,
    pub body: Vec<u8>,
}

impl RelayMsg {
    pub fn new(command: RelayCommand, stream_id: u16, body: Vec<u8>) -> Self {
        Self {
            command,
            stream_id,
            body,
        }
    }

    /// BEGIN for `host:port`
    pub fn begin(stream_id: u16, host: &str, port: u16) -> Self {
        let mut body = format!("{}:{}", host, port).into_bytes();
        body.push(0);
        Self::new(RelayCommand::Begin, stream_id, body)
    }

    /// END refusing a stream by exit policy, echoing the refused address
    pub fn end_exit_policy(stream_id: u16, addr: Ipv4Addr, ttl: u32) -> Self {
        let mut body = vec![EndStreamReason::ExitPolicy.to_wire()];
        body.extend_from_slice(&addr.octets());
        body.extend_from_slice(&ttl.to_be_bytes());
        Self::new(RelayCommand::End, stream_id, body)
    }

    pub fn end(stream_id: u16, reason: EndStreamReason) -> Self {
        Self::new(RelayCommand::End, stream_id, vec![reason.to_wire()])
    }

    pub fn truncated(reason: EndReason) -> Self {
        Self::new(RelayCommand::Truncated, 0, vec![reason.to_wire()])
    }

    /// Target of a BEGIN cell as (host, port)
    pub fn begin_target(&self) -> Result<(String, u16), CellError> {
        let text_end = self.body.iter().position(|b| *b == 0).unwrap_or(self.body.len());
        let text = std::str::from_utf8(&self.body[..text_end])
            .map_err(|_| CellError::Malformed("BEGIN target is not UTF-8".into()))?;
        let (host, port) = text
            .rsplit_once(':')
            .ok_or_else(|| CellError::Malformed(format!("BEGIN target {:?}", text)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| CellError::Malformed(format!("BEGIN port {:?}", port)))?;
        Ok((host.to_string(), port))
    }

    /// Payload with zeroed `recognized` and digest fields
    pub fn encode(&self) -> Result<Vec<u8>, CellError> {
        if self.body.len() > RELAY_PAYLOAD_SIZE {
            return Err(CellError::TooLong {
                len: self.body.len(),
                max: RELAY_PAYLOAD_SIZE,
            });
        }
        let mut payload = vec![0u8; CELL_PAYLOAD_SIZE];
        payload[0] = self.command as u8;
        payload[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        payload[9..11].copy_from_slice(&(self.body.len() as u16).to_be_bytes());
        payload[RELAY_HEADER_SIZE..RELAY_HEADER_SIZE + self.body.len()].copy_from_slice(&self.body);
        Ok(payload)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CellError> {
        need(payload, RELAY_HEADER_SIZE)?;
        let command =
            RelayCommand::from_u8(payload[0]).ok_or(CellError::UnknownRelayCommand(payload[0]))?;
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let length = u16::from_be_bytes([payload[9], payload[10]]) as usize;
        if length > RELAY_PAYLOAD_SIZE {
            return Err(CellError::TooLong {
                len: length,
                max: RELAY_PAYLOAD_SIZE,
            });
        }
        need(payload, RELAY_HEADER_SIZE + length)?;
        Ok(Self {
            command,
            stream_id,
            body: payload[RELAY_HEADER_SIZE..RELAY_HEADER_SIZE + length].to_vec(),
        })
    }
}
