use super::{need, Cell, CellCommand, CellError, CircId};
use onioncirc_common::cells::{
    CELL_PAYLOAD_SIZE, CREATED_FAST_LEN, CREATE_FAST_LEN, NTOR_ONIONSKIN_LEN,
    TAP_ONIONSKIN_CHALLENGE_LEN, TAP_ONIONSKIN_REPLY_LEN,
};

/// Prefix marking a modern handshake carried in a legacy CREATE cell
pub const NTOR_CREATE_MAGIC: &[u8; 16] = b"ntorNTORntorNTOR";

/// Key-agreement protocol used for one hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeType {
    /// Legacy public-key handshake
    Tap,
    /// No public-key material; first hop only
    Fast,
    /// Modern curve25519 handshake
    Ntor,
}

impl HandshakeType {
    pub fn to_wire(self) -> u16 {
        match self {
            HandshakeType::Tap => 0,
            HandshakeType::Fast => 1,
            HandshakeType::Ntor => 2,
        }
    }

    pub fn from_wire(value: u16) -> Result<Self, CellError> {
        match value {
            0 => Ok(HandshakeType::Tap),
            1 => Ok(HandshakeType::Fast),
            2 => Ok(HandshakeType::Ntor),
            other => Err(CellError::UnknownHandshake(other)),
        }
    }

    /// Size of the client's first message
    pub fn onionskin_len(self) -> usize {
        match self {
            HandshakeType::Tap => TAP_ONIONSKIN_CHALLENGE_LEN,
            HandshakeType::Fast => CREATE_FAST_LEN,
            HandshakeType::Ntor => NTOR_ONIONSKIN_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateCellType {
    Create,
    CreateFast,
    Create2,
}

impl CreateCellType {
    pub fn command(self) -> CellCommand {
        match self {
            CreateCellType::Create => CellCommand::Create,
            CreateCellType::CreateFast => CellCommand::CreateFast,
            CreateCellType::Create2 => CellCommand::Create2,
        }
    }

    /// Response type paired with this request
    pub fn created(self) -> CreatedCellType {
        match self {
            CreateCellType::Create => CreatedCellType::Created,
            CreateCellType::CreateFast => CreatedCellType::CreatedFast,
            CreateCellType::Create2 => CreatedCellType::Created2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            CreateCellType::Create => "CREATE",
            CreateCellType::CreateFast => "CREATE_FAST",
            CreateCellType::Create2 => "CREATE2",
        }
    }
}

/// A request to open a hop, carrying one handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCell {
    pub cell_type: CreateCellType,
    pub handshake_type: HandshakeType,
    pub onionskin: Vec<u8>,
}

impl CreateCell {
    pub fn new(
        cell_type: CreateCellType,
        handshake_type: HandshakeType,
        onionskin: Vec<u8>,
    ) -> Result<Self, CellError> {
        let cell = Self {
            cell_type,
            handshake_type,
            onionskin,
        };
        cell.check()?;
        Ok(cell)
    }

    fn check(&self) -> Result<(), CellError> {
        let allowed = match self.cell_type {
            CreateCellType::CreateFast => self.handshake_type == HandshakeType::Fast,
            CreateCellType::Create | CreateCellType::Create2 => {
                self.handshake_type != HandshakeType::Fast
            }
        };
        if !allowed {
            return Err(CellError::HandshakeNotAllowed {
                handshake: self.handshake_type,
                cell: self.cell_type.name(),
            });
        }
        if self.onionskin.len() != self.handshake_type.onionskin_len() {
            return Err(CellError::BadHandshakeLength {
                handshake: self.handshake_type,
                len: self.onionskin.len(),
            });
        }
        Ok(())
    }

    /// Body as it appears in the cell payload
    pub fn body(&self) -> Vec<u8> {
        match self.cell_type {
            CreateCellType::CreateFast => self.onionskin.clone(),
            CreateCellType::Create => {
                if self.handshake_type == HandshakeType::Ntor {
                    let mut body = NTOR_CREATE_MAGIC.to_vec();
                    body.extend_from_slice(&self.onionskin);
                    body
                } else {
                    self.onionskin.clone()
                }
            }
            CreateCellType::Create2 => {
                let mut body = Vec::with_capacity(4 + self.onionskin.len());
                body.extend_from_slice(&self.handshake_type.to_wire().to_be_bytes());
                body.extend_from_slice(&(self.onionskin.len() as u16).to_be_bytes());
                body.extend_from_slice(&self.onionskin);
                body
            }
        }
    }

    pub fn to_cell(&self, circ_id: CircId) -> Result<Cell, CellError> {
        Cell::new(circ_id, self.cell_type.command(), &self.body())
    }

    pub fn parse(command: CellCommand, payload: &[u8]) -> Result<Self, CellError> {
        match command {
            CellCommand::CreateFast => {
                need(payload, CREATE_FAST_LEN)?;
                Self::new(
                    CreateCellType::CreateFast,
                    HandshakeType::Fast,
                    payload[..CREATE_FAST_LEN].to_vec(),
                )
            }
            CellCommand::Create => Self::parse_legacy(payload),
            CellCommand::Create2 => Self::parse_create2(payload),
            other => Err(CellError::UnexpectedCommand(other)),
        }
    }

    /// Legacy onionskin area: either a TAP message or the ntor marker
    /// followed by an ntor message
    pub(crate) fn parse_legacy(payload: &[u8]) -> Result<Self, CellError> {
        if payload.starts_with(NTOR_CREATE_MAGIC) {
            let start = NTOR_CREATE_MAGIC.len();
            need(payload, start + NTOR_ONIONSKIN_LEN)?;
            Self::new(
                CreateCellType::Create,
                HandshakeType::Ntor,
                payload[start..start + NTOR_ONIONSKIN_LEN].to_vec(),
            )
        } else {
            need(payload, TAP_ONIONSKIN_CHALLENGE_LEN)?;
            Self::new(
                CreateCellType::Create,
                HandshakeType::Tap,
                payload[..TAP_ONIONSKIN_CHALLENGE_LEN].to_vec(),
            )
        }
    }

    pub(crate) fn parse_create2(body: &[u8]) -> Result<Self, CellError> {
        need(body, 4)?;
        let htype = HandshakeType::from_wire(u16::from_be_bytes([body[0], body[1]]))?;
        let hlen = u16::from_be_bytes([body[2], body[3]]) as usize;
        if hlen > CELL_PAYLOAD_SIZE - 4 {
            return Err(CellError::BadHandshakeLength {
                handshake: htype,
                len: hlen,
            });
        }
        need(body, 4 + hlen)?;
        Self::new(CreateCellType::Create2, htype, body[4..4 + hlen].to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatedCellType {
    Created,
    CreatedFast,
    Created2,
}

impl CreatedCellType {
    pub fn command(self) -> CellCommand {
        match self {
            CreatedCellType::Created => CellCommand::Created,
            CreatedCellType::CreatedFast => CellCommand::CreatedFast,
            CreatedCellType::Created2 => CellCommand::Created2,
        }
    }
}

/// The answer to a CREATE, carrying the server's handshake reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedCell {
    pub cell_type: CreatedCellType,
    pub reply: Vec<u8>,
}

impl CreatedCell {
    /// Wrap a server reply. Legacy CREATED replies occupy a fixed area.
    pub fn new(cell_type: CreatedCellType, mut reply: Vec<u8>) -> Result<Self, CellError> {
        match cell_type {
            CreatedCellType::Created => {
                if reply.len() > TAP_ONIONSKIN_REPLY_LEN {
                    return Err(CellError::TooLong {
                        len: reply.len(),
                        max: TAP_ONIONSKIN_REPLY_LEN,
                    });
                }
                reply.resize(TAP_ONIONSKIN_REPLY_LEN, 0);
            }
            CreatedCellType::CreatedFast => {
                if reply.len() != CREATED_FAST_LEN {
                    return Err(CellError::BadHandshakeLength {
                        handshake: HandshakeType::Fast,
                        len: reply.len(),
                    });
                }
            }
            CreatedCellType::Created2 => {
                if reply.len() > CELL_PAYLOAD_SIZE - 2 {
                    return Err(CellError::TooLong {
                        len: reply.len(),
                        max: CELL_PAYLOAD_SIZE - 2,
                    });
                }
            }
        }
        Ok(Self { cell_type, reply })
    }

    pub fn body(&self) -> Vec<u8> {
        match self.cell_type {
            CreatedCellType::Created | CreatedCellType::CreatedFast => self.reply.clone(),
            CreatedCellType::Created2 => {
                let mut body = Vec::with_capacity(2 + self.reply.len());
                body.extend_from_slice(&(self.reply.len() as u16).to_be_bytes());
                body.extend_from_slice(&self.reply);
                body
            }
        }
    }

    pub fn to_cell(&self, circ_id: CircId) -> Result<Cell, CellError> {
        Cell::new(circ_id, self.cell_type.command(), &self.body())
    }

    pub fn parse(command: CellCommand, payload: &[u8]) -> Result<Self, CellError> {
        match command {
            CellCommand::Created => {
                need(payload, TAP_ONIONSKIN_REPLY_LEN)?;
                Self::new(
                    CreatedCellType::Created,
                    payload[..TAP_ONIONSKIN_REPLY_LEN].to_vec(),
                )
            }
            CellCommand::CreatedFast => {
                need(payload, CREATED_FAST_LEN)?;
                Self::new(
                    CreatedCellType::CreatedFast,
                    payload[..CREATED_FAST_LEN].to_vec(),
                )
            }
            CellCommand::Created2 => Self::parse_created2(payload),
            other => Err(CellError::UnexpectedCommand(other)),
        }
    }

    pub(crate) fn parse_created2(body: &[u8]) -> Result<Self, CellError> {
        need(body, 2)?;
        let hlen = u16::from_be_bytes([body[0], body[1]]) as usize;
        if hlen > CELL_PAYLOAD_SIZE - 2 {
            return Err(CellError::TooLong {
                len: hlen,
                max: CELL_PAYLOAD_SIZE - 2,
            });
        }
        need(body, 2 + hlen)?;
        Self::new(CreatedCellType::Created2, body[2..2 + hlen].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onioncirc_common::cells::NTOR_REPLY_LEN;

    #[test]
    fn test_create2_layout() {
        let create = CreateCell::new(
            CreateCellType::Create2,
            HandshakeType::Ntor,
            vec![0xAB; NTOR_ONIONSKIN_LEN],
        )
        .unwrap();
        let cell = create.to_cell(CircId(0x8000_0001)).unwrap();
        assert_eq!(cell.command, CellCommand::Create2);
        assert_eq!(&cell.payload[..4], &[0, 2, 0, 84]);

        let parsed = CreateCell::parse(cell.command, &cell.payload).unwrap();
        assert_eq!(parsed, create);
    }

    #[test]
    fn test_ntor_in_legacy_create_uses_marker() {
        let create = CreateCell::new(
            CreateCellType::Create,
            HandshakeType::Ntor,
            vec![7; NTOR_ONIONSKIN_LEN],
        )
        .unwrap();
        let cell = create.to_cell(CircId(1)).unwrap();
        assert!(cell.payload.starts_with(NTOR_CREATE_MAGIC));

        let parsed = CreateCell::parse(CellCommand::Create, &cell.payload).unwrap();
        assert_eq!(parsed.handshake_type, HandshakeType::Ntor);
        assert_eq!(parsed.onionskin, vec![7; NTOR_ONIONSKIN_LEN]);
    }

    #[test]
    fn test_legacy_create_defaults_to_tap() {
        let payload = vec![3u8; CELL_PAYLOAD_SIZE];
        let parsed = CreateCell::parse(CellCommand::Create, &payload).unwrap();
        assert_eq!(parsed.handshake_type, HandshakeType::Tap);
        assert_eq!(parsed.onionskin.len(), TAP_ONIONSKIN_CHALLENGE_LEN);
    }

    #[test]
    fn test_fast_only_in_create_fast() {
        let err = CreateCell::new(
            CreateCellType::Create2,
            HandshakeType::Fast,
            vec![0; CREATE_FAST_LEN],
        )
        .unwrap_err();
        assert!(matches!(err, CellError::HandshakeNotAllowed { .. }));
    }

    #[test]
    fn test_wrong_onionskin_length() {
        let err = CreateCell::new(CreateCellType::Create2, HandshakeType::Ntor, vec![0; 10])
            .unwrap_err();
        assert!(matches!(err, CellError::BadHandshakeLength { .. }));
    }

    #[test]
    fn test_create2_unknown_handshake() {
        let mut payload = vec![0u8; CELL_PAYLOAD_SIZE];
        payload[1] = 9;
        let err = CreateCell::parse(CellCommand::Create2, &payload).unwrap_err();
        assert_eq!(err, CellError::UnknownHandshake(9));
    }

    #[test]
    fn test_created_legacy_is_padded() {
        let created = CreatedCell::new(CreatedCellType::Created, vec![1; NTOR_REPLY_LEN]).unwrap();
        assert_eq!(created.reply.len(), TAP_ONIONSKIN_REPLY_LEN);
        assert_eq!(&created.reply[..NTOR_REPLY_LEN], &[1; NTOR_REPLY_LEN][..]);
    }

    #[test]
    fn test_created2_truncated() {
        let err = CreatedCell::parse_created2(&[0, 64, 1, 2]).unwrap_err();
        assert!(matches!(err, CellError::Truncated { .. }));
    }
}
