use onioncirc_common::{RelayId, RelayInfo};
use std::fmt;
use std::net::SocketAddr;

/// Everything needed to extend a circuit to one relay.
///
/// Built once and never mutated afterwards. A hop keeps its own copy, so
/// the copy attached to a circuit outlives whatever it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendInfo {
    /// Identity digest; all-zero when only the address is known
    pub identity: RelayId,
    pub nickname: Option<String>,
    pub addr: SocketAddr,
    /// Legacy onion key
    pub onion_key: Option<[u8; 32]>,
    /// curve25519 onion key
    pub ntor_onion_key: Option<[u8; 32]>,
}

impl ExtendInfo {
    pub fn new(
        nickname: Option<String>,
        identity: RelayId,
        onion_key: Option<[u8; 32]>,
        ntor_onion_key: Option<[u8; 32]>,
        addr: SocketAddr,
    ) -> Self {
        Self {
            identity,
            nickname,
            addr,
            onion_key,
            ntor_onion_key,
        }
    }

    /// Extend info for a relay from the consensus. When the relay will be
    /// our first hop, `prefer_ipv6` selects its IPv6 address if it has one.
    pub fn from_relay(relay: &RelayInfo, for_direct_connect: bool, prefer_ipv6: bool) -> Self {
        let addr = match relay.ipv6_or_addr {
            Some(v6) if for_direct_connect && prefer_ipv6 => v6,
            _ => relay.or_addr,
        };
        Self::new(
            Some(relay.nickname.clone()),
            relay.identity,
            relay.onion_key,
            relay.ntor_onion_key,
            addr,
        )
    }

    /// Deep copy, used whenever a hop takes its own reference
    pub fn dup(&self) -> Self {
        self.clone()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn has_identity(&self) -> bool {
        !self.identity.is_zero()
    }
}

impl fmt::Display for ExtendInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.nickname {
            Some(nick) => write!(f, "{}~{} at {}", self.identity, nick, self.addr),
            None => write!(f, "{} at {}", self.identity, self.addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExtendInfo {
        ExtendInfo::new(
            Some("guardy".into()),
            RelayId::from([3u8; 20]),
            Some([1u8; 32]),
            Some([2u8; 32]),
            "1.2.3.4:9001".parse().unwrap(),
        )
    }

    #[test]
    fn test_dup_is_field_equal() {
        let original = sample();
        let copy = original.dup();
        assert_eq!(copy, original);
        assert_eq!(copy.onion_key, Some([1u8; 32]));
        assert_eq!(copy.ntor_onion_key, Some([2u8; 32]));
    }

    #[test]
    fn test_dup_outlives_original() {
        let copy = {
            let original = sample();
            original.dup()
        };
        assert_eq!(copy.nickname.as_deref(), Some("guardy"));
        assert_eq!(copy.identity, RelayId::from([3u8; 20]));
    }

    #[test]
    fn test_from_relay_address_choice() {
        let mut relay = RelayInfo::new(
            RelayId::from([9u8; 20]),
            "dual",
            "5.5.5.5:443".parse().unwrap(),
        );
        relay.ipv6_or_addr = Some("[2001:db8::5]:443".parse().unwrap());

        let direct = ExtendInfo::from_relay(&relay, true, true);
        assert!(direct.addr.is_ipv6());

        let extended = ExtendInfo::from_relay(&relay, false, true);
        assert!(extended.addr.is_ipv4());
    }

    #[test]
    fn test_display() {
        let text = sample().to_string();
        assert!(text.contains("~guardy at 1.2.3.4:9001"));
    }
}
