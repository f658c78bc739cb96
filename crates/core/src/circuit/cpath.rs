use super::crypto::HopCrypto;
use crate::extend_info::ExtendInfo;
use crate::handshake::ClientHandshake;
use serde::Serialize;

/// Handshake progress of one hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HopState {
    Closed,
    AwaitingKeys,
    Open,
}

/// One hop of an origin circuit
#[derive(Debug)]
pub struct Hop {
    pub extend_info: ExtendInfo,
    pub state: HopState,
    /// Pending handshake while AwaitingKeys
    pub handshake: Option<ClientHandshake>,
    /// Layer crypto once Open
    pub crypto: Option<HopCrypto>,
}

impl Hop {
    fn new(extend_info: ExtendInfo) -> Self {
        Self {
            extend_info,
            state: HopState::Closed,
            handshake: None,
            crypto: None,
        }
    }
}

/// The ordered hops of an origin circuit, entry first. Treated as a ring:
/// the hop after the last is the first.
#[derive(Debug, Default)]
pub struct CryptPath {
    hops: Vec<Hop>,
}

impl CryptPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Append a hop holding its own copy of `info`
    pub fn append(&mut self, info: &ExtendInfo) {
        self.hops.push(Hop::new(info.dup()));
    }

    pub fn get(&self, index: usize) -> Option<&Hop> {
        self.hops.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Hop> {
        self.hops.get_mut(index)
    }

    pub fn first(&self) -> Option<&Hop> {
        self.hops.first()
    }

    pub fn last(&self) -> Option<&Hop> {
        self.hops.last()
    }

    pub fn next_index(&self, index: usize) -> usize {
        if self.hops.is_empty() {
            0
        } else {
            (index + 1) % self.hops.len()
        }
    }

    pub fn prev_index(&self, index: usize) -> usize {
        if self.hops.is_empty() {
            0
        } else {
            (index + self.hops.len() - 1) % self.hops.len()
        }
    }

    /// Index of the first hop that is not yet open
    pub fn first_unopened(&self) -> Option<usize> {
        self.hops.iter().position(|hop| hop.state != HopState::Open)
    }

    pub fn all_open(&self) -> bool {
        self.first_unopened().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hop> {
        self.hops.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Hop> {
        self.hops.iter_mut()
    }

    pub fn extend_infos(&self) -> impl Iterator<Item = &ExtendInfo> {
        self.hops.iter().map(|hop| &hop.extend_info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onioncirc_common::RelayId;

    fn info(n: u8) -> ExtendInfo {
        ExtendInfo::new(
            None,
            RelayId::from([n; 20]),
            None,
            None,
            format!("10.0.0.{}:9001", n).parse().unwrap(),
        )
    }

    #[test]
    fn test_ring_indices() {
        let mut cpath = CryptPath::new();
        for n in 1..=3 {
            cpath.append(&info(n));
        }
        assert_eq!(cpath.next_index(2), 0);
        assert_eq!(cpath.prev_index(0), 2);
        assert_eq!(cpath.next_index(0), 1);
    }

    #[test]
    fn test_first_unopened() {
        let mut cpath = CryptPath::new();
        cpath.append(&info(1));
        cpath.append(&info(2));
        assert_eq!(cpath.first_unopened(), Some(0));

        cpath.get_mut(0).unwrap().state = HopState::Open;
        assert_eq!(cpath.first_unopened(), Some(1));

        cpath.get_mut(1).unwrap().state = HopState::Open;
        assert!(cpath.all_open());
    }

    #[test]
    fn test_hops_own_their_info() {
        let mut cpath = CryptPath::new();
        {
            let source = info(4);
            cpath.append(&source);
        }
        assert_eq!(cpath.first().unwrap().extend_info.identity, RelayId::from([4u8; 20]));
    }
}
