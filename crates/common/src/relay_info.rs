use crate::policy::ExitPolicy;
use crate::types::Bandwidth;
use crate::RelayId;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// A relay as described by the current consensus and its descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    /// Identity fingerprint
    pub identity: RelayId,

    pub nickname: String,

    /// Primary (IPv4) OR address
    pub or_addr: SocketAddr,

    /// Optional IPv6 OR address
    #[serde(default)]
    pub ipv6_or_addr: Option<SocketAddr>,

    /// Measured bandwidth used for weighting
    #[serde(default)]
    pub bandwidth: Bandwidth,

    #[serde(default = "default_true")]
    pub is_running: bool,

    #[serde(default = "default_true")]
    pub is_valid: bool,

    #[serde(default)]
    pub is_fast: bool,

    #[serde(default)]
    pub is_stable: bool,

    /// Flagged "Guard" by the authorities
    #[serde(default)]
    pub is_possible_guard: bool,

    #[serde(default)]
    pub is_bad_exit: bool,

    /// Whether we hold a full descriptor for this relay
    #[serde(default = "default_true")]
    pub has_descriptor: bool,

    /// Legacy onion key (32 bytes, hex)
    #[serde(default, with = "opt_key_hex")]
    pub onion_key: Option<[u8; 32]>,

    /// curve25519 onion key for the modern handshake
    #[serde(default, with = "opt_key_hex")]
    pub ntor_onion_key: Option<[u8; 32]>,

    /// Relay understands EXTEND2 cells
    #[serde(default)]
    pub supports_extend2: bool,

    /// Relay would accept being the only hop of a circuit
    #[serde(default)]
    pub allows_single_hop_exits: bool,

    #[serde(default)]
    pub exit_policy: ExitPolicy,

    /// Declared family members
    #[serde(default)]
    pub family: Vec<RelayId>,
}

fn default_true() -> bool {
    true
}

impl RelayInfo {
    pub fn new(identity: RelayId, nickname: impl Into<String>, or_addr: SocketAddr) -> Self {
        Self {
            identity,
            nickname: nickname.into(),
            or_addr,
            ipv6_or_addr: None,
            bandwidth: Bandwidth::from_kb(100),
            is_running: true,
            is_valid: true,
            is_fast: false,
            is_stable: false,
            is_possible_guard: false,
            is_bad_exit: false,
            has_descriptor: true,
            onion_key: None,
            ntor_onion_key: None,
            supports_extend2: false,
            allows_single_hop_exits: false,
            exit_policy: ExitPolicy::reject_all(),
            family: Vec::new(),
        }
    }

    /// Usable for any position in a path at all
    pub fn is_acceptable(&self) -> bool {
        self.is_running && self.is_valid && self.has_descriptor
    }

    /// Both relays list each other as family
    pub fn declares_mutual_family(&self, other: &RelayInfo) -> bool {
        self.family.contains(&other.identity) && other.family.contains(&self.identity)
    }

    pub fn or_port(&self) -> u16 {
        self.or_addr.port()
    }
}

/// Addresses that must not be the target of an extension unless explicitly allowed
pub fn is_internal_addr(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => is_internal_v6(v6),
    }
}

fn is_internal_v4(addr: &Ipv4Addr) -> bool {
    let o = addr.octets();
    o[0] == 0
        || o[0] == 10
        || o[0] == 127
        || (o[0] == 100 && (o[1] & 0xc0) == 64)
        || (o[0] == 169 && o[1] == 254)
        || (o[0] == 172 && (o[1] & 0xf0) == 16)
        || (o[0] == 192 && o[1] == 168)
}

fn is_internal_v6(addr: &Ipv6Addr) -> bool {
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_internal_v4(&v4);
    }
    let seg = addr.segments();
    addr.is_unspecified()
        || addr.is_loopback()
        || (seg[0] & 0xfe00) == 0xfc00
        || (seg[0] & 0xffc0) == 0xfe80
        || (seg[0] & 0xffc0) == 0xfec0
}

/// Same /16 (IPv4) or /32 (IPv6) network
pub fn same_subnet_16(a: &IpAddr, b: &IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..2] == b.octets()[..2],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.segments()[..2] == b.segments()[..2],
        _ => false,
    }
}

mod opt_key_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
        match key {
            Some(k) => s.serialize_some(&hex::encode(k)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        match text {
            None => Ok(None),
            Some(t) => {
                let bytes = hex::decode(&t).map_err(serde::de::Error::custom)?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("onion key must be 32 bytes"))?;
                Ok(Some(key))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(byte: u8, ip: [u8; 4]) -> RelayInfo {
        RelayInfo::new(
            RelayId::from([byte; 20]),
            format!("relay{}", byte),
            SocketAddr::from((ip, 9001)),
        )
    }

    #[test]
    fn test_acceptable() {
        let mut r = relay(1, [1, 2, 3, 4]);
        assert!(r.is_acceptable());
        r.has_descriptor = false;
        assert!(!r.is_acceptable());
    }

    #[test]
    fn test_mutual_family() {
        let mut a = relay(1, [1, 2, 3, 4]);
        let mut b = relay(2, [5, 6, 7, 8]);
        a.family.push(b.identity);
        assert!(!a.declares_mutual_family(&b));
        b.family.push(a.identity);
        assert!(a.declares_mutual_family(&b));
    }

    #[test]
    fn test_internal_addresses() {
        for ip in ["10.0.0.1", "127.0.0.1", "192.168.1.1", "172.16.0.1", "169.254.3.3", "::1", "fe80::1"] {
            let addr: IpAddr = ip.parse().unwrap();
            assert!(is_internal_addr(&addr), "{} should be internal", ip);
        }
        for ip in ["8.8.8.8", "172.32.0.1", "2001:db8::1"] {
            let addr: IpAddr = ip.parse().unwrap();
            assert!(!is_internal_addr(&addr), "{} should be public", ip);
        }
    }

    #[test]
    fn test_same_subnet() {
        let a: IpAddr = "18.9.1.1".parse().unwrap();
        let b: IpAddr = "18.9.200.3".parse().unwrap();
        let c: IpAddr = "18.10.1.1".parse().unwrap();
        assert!(same_subnet_16(&a, &b));
        assert!(!same_subnet_16(&a, &c));
    }

    #[test]
    fn test_relay_json_roundtrip() {
        let mut r = relay(3, [9, 9, 9, 9]);
        r.ntor_onion_key = Some([5u8; 32]);
        let json = serde_json::to_string(&r).unwrap();
        let back: RelayInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.identity, r.identity);
        assert_eq!(back.ntor_onion_key, Some([5u8; 32]));
        assert_eq!(back.onion_key, None);
    }

    #[test]
    fn test_relay_defaults_from_minimal_json() {
        let json = format!(
            r#"{{"identity":"{}","nickname":"m","or_addr":"1.2.3.4:443"}}"#,
            "11".repeat(20)
        );
        let r: RelayInfo = serde_json::from_str(&json).unwrap();
        assert!(r.is_running && r.is_valid && r.has_descriptor);
        assert!(r.exit_policy.rejects_all());
    }
}
