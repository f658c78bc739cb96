use super::create::{CreateCell, CreateCellType, CreatedCell, CreatedCellType};
use super::relay::RelayCommand;
use super::{need, CellError};
use onioncirc_common::cells::{TAP_ONIONSKIN_CHALLENGE_LEN, TAP_ONIONSKIN_REPLY_LEN};
use onioncirc_common::{RelayId, DIGEST_LEN};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

const LS_IPV4: u8 = 0;
const LS_IPV6: u8 = 1;
const LS_LEGACY_ID: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendCellType {
    /// One IPv4 target, legacy CREATE embedded
    Extend,
    /// Link specifiers, CREATE2 embedded
    Extend2,
}

impl ExtendCellType {
    pub fn command(self) -> RelayCommand {
        match self {
            ExtendCellType::Extend => RelayCommand::Extend,
            ExtendCellType::Extend2 => RelayCommand::Extend2,
        }
    }
}

/// Request to a relay to add one more hop to the circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendCell {
    pub cell_type: ExtendCellType,
    pub orport_ipv4: Option<SocketAddrV4>,
    pub orport_ipv6: Option<SocketAddrV6>,
    pub node_id: RelayId,
    pub create: CreateCell,
}

impl ExtendCell {
    pub fn new(
        cell_type: ExtendCellType,
        orport_ipv4: Option<SocketAddrV4>,
        orport_ipv6: Option<SocketAddrV6>,
        node_id: RelayId,
        create: CreateCell,
    ) -> Result<Self, CellError> {
        match cell_type {
            ExtendCellType::Extend => {
                if create.cell_type != CreateCellType::Create {
                    return Err(CellError::Malformed(
                        "EXTEND can only carry a legacy CREATE".into(),
                    ));
                }
                if orport_ipv4.is_none() {
                    return Err(CellError::MissingField("an IPv4 address"));
                }
            }
            ExtendCellType::Extend2 => {
                if create.cell_type != CreateCellType::Create2 {
                    return Err(CellError::Malformed("EXTEND2 must carry a CREATE2".into()));
                }
                if orport_ipv4.is_none() && orport_ipv6.is_none() {
                    return Err(CellError::MissingField("an address"));
                }
            }
        }
        Ok(Self {
            cell_type,
            orport_ipv4,
            orport_ipv6,
            node_id,
            create,
        })
    }

    pub fn format(&self) -> Result<(RelayCommand, Vec<u8>), CellError> {
        let body = match self.cell_type {
            ExtendCellType::Extend => {
                let target = self
                    .orport_ipv4
                    .ok_or(CellError::MissingField("an IPv4 address"))?;
                let mut body = Vec::with_capacity(6 + TAP_ONIONSKIN_CHALLENGE_LEN + DIGEST_LEN);
                body.extend_from_slice(&target.ip().octets());
                body.extend_from_slice(&target.port().to_be_bytes());
                let mut onionskin = self.create.body();
                onionskin.resize(TAP_ONIONSKIN_CHALLENGE_LEN, 0);
                body.extend_from_slice(&onionskin);
                body.extend_from_slice(self.node_id.as_bytes());
                body
            }
            ExtendCellType::Extend2 => {
                let mut specs: Vec<(u8, Vec<u8>)> = Vec::new();
                if let Some(v4) = self.orport_ipv4 {
                    let mut data = v4.ip().octets().to_vec();
                    data.extend_from_slice(&v4.port().to_be_bytes());
                    specs.push((LS_IPV4, data));
                }
                if let Some(v6) = self.orport_ipv6 {
                    let mut data = v6.ip().octets().to_vec();
                    data.extend_from_slice(&v6.port().to_be_bytes());
                    specs.push((LS_IPV6, data));
                }
                specs.push((LS_LEGACY_ID, self.node_id.as_bytes().to_vec()));

                let mut body = vec![specs.len() as u8];
                for (ls_type, data) in specs {
                    body.push(ls_type);
                    body.push(data.len() as u8);
                    body.extend_from_slice(&data);
                }
                body.extend_from_slice(&self.create.body());
                body
            }
        };
        Ok((self.cell_type.command(), body))
    }

    pub fn parse(command: RelayCommand, body: &[u8]) -> Result<Self, CellError> {
        match command {
            RelayCommand::Extend => Self::parse_extend(body),
            RelayCommand::Extend2 => Self::parse_extend2(body),
            other => Err(CellError::Malformed(format!(
                "{:?} is not an extend command",
                other
            ))),
        }
    }

    fn parse_extend(body: &[u8]) -> Result<Self, CellError> {
        let total = 6 + TAP_ONIONSKIN_CHALLENGE_LEN + DIGEST_LEN;
        need(body, total)?;
        let addr = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
        let port = u16::from_be_bytes([body[4], body[5]]);
        let create = CreateCell::parse_legacy(&body[6..6 + TAP_ONIONSKIN_CHALLENGE_LEN])?;
        let node_id = RelayId::from_slice(&body[6 + TAP_ONIONSKIN_CHALLENGE_LEN..total])
            .map_err(|e| CellError::Malformed(e.to_string()))?;
        Self::new(
            ExtendCellType::Extend,
            Some(SocketAddrV4::new(addr, port)),
            None,
            node_id,
            create,
        )
    }

    fn parse_extend2(body: &[u8]) -> Result<Self, CellError> {
        need(body, 1)?;
        let n_spec = body[0] as usize;
        let mut pos = 1;
        let mut ipv4 = None;
        let mut ipv6 = None;
        let mut node_id = None;

        for _ in 0..n_spec {
            need(body, pos + 2)?;
            let ls_type = body[pos];
            let ls_len = body[pos + 1] as usize;
            pos += 2;
            need(body, pos + ls_len)?;
            let data = &body[pos..pos + ls_len];
            match ls_type {
                LS_IPV4 => {
                    if ls_len != 6 {
                        return Err(CellError::BadLinkSpecifier(format!("IPv4 length {}", ls_len)));
                    }
                    let addr = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
                    ipv4 = Some(SocketAddrV4::new(addr, u16::from_be_bytes([data[4], data[5]])));
                }
                LS_IPV6 => {
                    if ls_len != 18 {
                        return Err(CellError::BadLinkSpecifier(format!("IPv6 length {}", ls_len)));
                    }
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&data[..16]);
                    let port = u16::from_be_bytes([data[16], data[17]]);
                    ipv6 = Some(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0));
                }
                LS_LEGACY_ID => {
                    let id = RelayId::from_slice(data)
                        .map_err(|e| CellError::BadLinkSpecifier(e.to_string()))?;
                    node_id = Some(id);
                }
                _ => {}
            }
            pos += ls_len;
        }

        let node_id = node_id.ok_or(CellError::MissingField("a legacy identity"))?;
        let create = CreateCell::parse_create2(&body[pos..])?;
        Self::new(ExtendCellType::Extend2, ipv4, ipv6, node_id, create)
    }
}

/// Answer relayed back to the origin once the new hop replied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedCell {
    pub created: CreatedCell,
}

impl ExtendedCell {
    /// Wrap a CREATED answer from the next hop
    pub fn from_created(created: CreatedCell) -> Result<Self, CellError> {
        if created.cell_type == CreatedCellType::CreatedFast {
            return Err(CellError::Malformed(
                "CREATED_FAST cannot be relayed as EXTENDED".into(),
            ));
        }
        Ok(Self { created })
    }

    pub fn format(&self) -> (RelayCommand, Vec<u8>) {
        match self.created.cell_type {
            CreatedCellType::Created2 => (RelayCommand::Extended2, self.created.body()),
            _ => (RelayCommand::Extended, self.created.body()),
        }
    }

    pub fn parse(command: RelayCommand, body: &[u8]) -> Result<Self, CellError> {
        let created = match command {
            RelayCommand::Extended => {
                need(body, TAP_ONIONSKIN_REPLY_LEN)?;
                CreatedCell::new(
                    CreatedCellType::Created,
                    body[..TAP_ONIONSKIN_REPLY_LEN].to_vec(),
                )?
            }
            RelayCommand::Extended2 => CreatedCell::parse_created2(body)?,
            other => {
                return Err(CellError::Malformed(format!(
                    "{:?} is not an extended command",
                    other
                )))
            }
        };
        Ok(Self { created })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::HandshakeType;
    use onioncirc_common::cells::NTOR_ONIONSKIN_LEN;

    fn ntor_create2() -> CreateCell {
        CreateCell::new(
            CreateCellType::Create2,
            HandshakeType::Ntor,
            vec![9; NTOR_ONIONSKIN_LEN],
        )
        .unwrap()
    }

    #[test]
    fn test_extend2_with_both_families() {
        let v4: SocketAddrV4 = "1.2.3.4:9001".parse().unwrap();
        let v6: SocketAddrV6 = "[2001:db8::1]:443".parse().unwrap();
        let id = RelayId::from([4u8; 20]);
        let extend = ExtendCell::new(ExtendCellType::Extend2, Some(v4), Some(v6), id, ntor_create2())
            .unwrap();

        let (command, body) = extend.format().unwrap();
        assert_eq!(command, RelayCommand::Extend2);
        assert_eq!(body[0], 3);

        let parsed = ExtendCell::parse(command, &body).unwrap();
        assert_eq!(parsed, extend);
    }

    #[test]
    fn test_legacy_extend_layout() {
        let v4: SocketAddrV4 = "5.6.7.8:443".parse().unwrap();
        let create = CreateCell::new(
            CreateCellType::Create,
            HandshakeType::Tap,
            vec![1; TAP_ONIONSKIN_CHALLENGE_LEN],
        )
        .unwrap();
        let extend = ExtendCell::new(
            ExtendCellType::Extend,
            Some(v4),
            None,
            RelayId::from([2u8; 20]),
            create,
        )
        .unwrap();
        let (command, body) = extend.format().unwrap();
        assert_eq!(command, RelayCommand::Extend);
        assert_eq!(body.len(), 6 + TAP_ONIONSKIN_CHALLENGE_LEN + DIGEST_LEN);
        assert_eq!(&body[..6], &[5, 6, 7, 8, 1, 187]);
        assert_eq!(ExtendCell::parse(command, &body).unwrap(), extend);
    }

    #[test]
    fn test_legacy_extend_requires_ipv4() {
        let v6: SocketAddrV6 = "[2001:db8::1]:443".parse().unwrap();
        let create = CreateCell::new(
            CreateCellType::Create,
            HandshakeType::Ntor,
            vec![0; NTOR_ONIONSKIN_LEN],
        )
        .unwrap();
        let err = ExtendCell::new(ExtendCellType::Extend, None, Some(v6), RelayId::ZERO, create)
            .unwrap_err();
        assert!(matches!(err, CellError::MissingField(_)));
    }

    #[test]
    fn test_extend2_requires_identity() {
        let body = [1u8, LS_IPV4, 6, 1, 2, 3, 4, 0, 80, 0, 2, 0, 0];
        let err = ExtendCell::parse(RelayCommand::Extend2, &body).unwrap_err();
        assert_eq!(err, CellError::MissingField("a legacy identity"));
    }

    #[test]
    fn test_extended2_from_created2() {
        let created = CreatedCell::new(CreatedCellType::Created2, vec![5; 64]).unwrap();
        let extended = ExtendedCell::from_created(created.clone()).unwrap();
        let (command, body) = extended.format();
        assert_eq!(command, RelayCommand::Extended2);
        let parsed = ExtendedCell::parse(command, &body).unwrap();
        assert_eq!(parsed.created, created);
    }

    #[test]
    fn test_created_fast_not_relayable() {
        let created = CreatedCell::new(CreatedCellType::CreatedFast, vec![0; 40]).unwrap();
        assert!(ExtendedCell::from_created(created).is_err());
    }
}
