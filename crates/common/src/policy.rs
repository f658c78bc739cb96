use crate::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAction {
    Accept,
    Reject,
}

/// Outcome of testing a destination against an exit policy.
///
/// The "probably" variants are returned when the destination address is not
/// yet known and rules on specific addresses could change the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyResult {
    Accepted,
    Rejected,
    ProbablyAccepted,
    ProbablyRejected,
}

impl PolicyResult {
    /// Whether a stream to this destination may be attached to the relay
    pub fn allows_stream(self) -> bool {
        matches!(self, PolicyResult::Accepted | PolicyResult::ProbablyAccepted)
    }
}

/// A single `accept|reject addr[/bits]:port[-port]` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub action: PolicyAction,
    /// `None` matches every address
    pub network: Option<(IpAddr, u8)>,
    pub port_min: u16,
    pub port_max: u16,
}

impl PolicyRule {
    pub fn accept_all() -> Self {
        Self {
            action: PolicyAction::Accept,
            network: None,
            port_min: 1,
            port_max: u16::MAX,
        }
    }

    pub fn reject_all() -> Self {
        Self {
            action: PolicyAction::Reject,
            network: None,
            port_min: 1,
            port_max: u16::MAX,
        }
    }

    fn covers_port(&self, port: u16) -> bool {
        port >= self.port_min && port <= self.port_max
    }

    fn covers_addr(&self, addr: &IpAddr) -> bool {
        match self.network {
            None => true,
            Some((net, bits)) => prefix_matches(&net, addr, bits),
        }
    }
}

fn prefix_matches(net: &IpAddr, addr: &IpAddr, bits: u8) -> bool {
    match (net, addr) {
        (IpAddr::V4(n), IpAddr::V4(a)) => {
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - u32::from(bits.min(32)));
            (u32::from(*n) & mask) == (u32::from(*a) & mask)
        }
        (IpAddr::V6(n), IpAddr::V6(a)) => {
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - u32::from(bits.min(128)));
            (u128::from(*n) & mask) == (u128::from(*a) & mask)
        }
        _ => false,
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            PolicyAction::Accept => "accept",
            PolicyAction::Reject => "reject",
        };
        let addr = match self.network {
            None => "*".to_string(),
            Some((IpAddr::V4(a), 32)) => a.to_string(),
            Some((IpAddr::V6(a), 128)) => format!("[{}]", a),
            Some((IpAddr::V4(a), bits)) => format!("{}/{}", a, bits),
            Some((IpAddr::V6(a), bits)) => format!("[{}]/{}", a, bits),
        };
        let ports = if self.port_min == 1 && self.port_max == u16::MAX {
            "*".to_string()
        } else if self.port_min == self.port_max {
            self.port_min.to_string()
        } else {
            format!("{}-{}", self.port_min, self.port_max)
        };
        write!(f, "{} {}:{}", action, addr, ports)
    }
}

impl FromStr for PolicyRule {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DomainError::InvalidPolicy(s.to_string());
        let (action, rest) = s.trim().split_once(' ').ok_or_else(bad)?;
        let action = match action {
            "accept" => PolicyAction::Accept,
            "reject" => PolicyAction::Reject,
            _ => return Err(bad()),
        };
        let (addr_part, port_part) = rest.trim().rsplit_once(':').ok_or_else(bad)?;

        let network = if addr_part == "*" {
            None
        } else {
            let (addr_text, bits_text) = match addr_part.split_once('/') {
                Some((a, b)) => (a, Some(b)),
                None => (addr_part, None),
            };
            let addr_text = addr_text.trim_start_matches('[').trim_end_matches(']');
            let addr: IpAddr = addr_text.parse().map_err(|_| bad())?;
            let max_bits = if addr.is_ipv4() { 32 } else { 128 };
            let bits = match bits_text {
                Some(b) => b.parse::<u8>().map_err(|_| bad())?,
                None => max_bits,
            };
            if bits > max_bits {
                return Err(bad());
            }
            Some((addr, bits))
        };

        let (port_min, port_max) = if port_part == "*" {
            (1, u16::MAX)
        } else if let Some((lo, hi)) = port_part.split_once('-') {
            let lo = lo.parse::<u16>().map_err(|_| bad())?;
            let hi = hi.parse::<u16>().map_err(|_| bad())?;
            if lo > hi {
                return Err(bad());
            }
            (lo, hi)
        } else {
            let p = port_part.parse::<u16>().map_err(|_| bad())?;
            (p, p)
        };

        Ok(Self {
            action,
            network,
            port_min,
            port_max,
        })
    }
}

/// Ordered exit policy; the first matching rule decides
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ExitPolicy {
    rules: Vec<PolicyRule>,
}

impl ExitPolicy {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    pub fn accept_all() -> Self {
        Self::new(vec![PolicyRule::accept_all()])
    }

    pub fn reject_all() -> Self {
        Self::new(vec![PolicyRule::reject_all()])
    }

    pub fn parse_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Self, DomainError> {
        let rules = lines
            .into_iter()
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// True when no destination at all can be reached through this relay
    pub fn rejects_all(&self) -> bool {
        !self
            .rules
            .iter()
            .any(|r| r.action == PolicyAction::Accept)
    }

    /// Test a destination. `addr` is `None` when the hostname is unresolved.
    pub fn evaluate(&self, addr: Option<IpAddr>, port: u16) -> PolicyResult {
        match addr {
            Some(addr) => {
                for rule in &self.rules {
                    if rule.covers_port(port) && rule.covers_addr(&addr) {
                        return match rule.action {
                            PolicyAction::Accept => PolicyResult::Accepted,
                            PolicyAction::Reject => PolicyResult::Rejected,
                        };
                    }
                }
                PolicyResult::Rejected
            }
            None => self.evaluate_unknown(port),
        }
    }

    fn evaluate_unknown(&self, port: u16) -> PolicyResult {
        let mut maybe_accept = false;
        let mut maybe_reject = false;

        for rule in self.rules.iter().filter(|r| r.covers_port(port)) {
            match (rule.network, rule.action) {
                (None, PolicyAction::Accept) => {
                    return if maybe_reject {
                        PolicyResult::ProbablyAccepted
                    } else {
                        PolicyResult::Accepted
                    };
                }
                (None, PolicyAction::Reject) => {
                    return if maybe_accept {
                        PolicyResult::ProbablyRejected
                    } else {
                        PolicyResult::Rejected
                    };
                }
                (Some(_), PolicyAction::Accept) => maybe_accept = true,
                (Some(_), PolicyAction::Reject) => maybe_reject = true,
            }
        }

        if maybe_accept {
            PolicyResult::ProbablyAccepted
        } else {
            PolicyResult::Rejected
        }
    }
}

impl TryFrom<Vec<String>> for ExitPolicy {
    type Error = DomainError;

    fn try_from(lines: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse_lines(lines.iter().map(String::as_str))
    }
}

impl From<ExitPolicy> for Vec<String> {
    fn from(policy: ExitPolicy) -> Self {
        policy.rules.iter().map(|r| r.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn web_only() -> ExitPolicy {
        ExitPolicy::parse_lines(["reject 10.0.0.0/8:*", "accept *:80", "accept *:443", "reject *:*"])
            .unwrap()
    }

    #[test]
    fn test_known_address() {
        let policy = web_only();
        let public = Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        let private = Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));

        assert_eq!(policy.evaluate(public, 80), PolicyResult::Accepted);
        assert_eq!(policy.evaluate(public, 25), PolicyResult::Rejected);
        assert_eq!(policy.evaluate(private, 80), PolicyResult::Rejected);
    }

    #[test]
    fn test_unknown_address_is_probable() {
        let policy = web_only();
        assert_eq!(policy.evaluate(None, 80), PolicyResult::ProbablyAccepted);
        assert_eq!(policy.evaluate(None, 22), PolicyResult::Rejected);
        assert!(policy.evaluate(None, 443).allows_stream());
    }

    #[test]
    fn test_rejects_all() {
        assert!(ExitPolicy::reject_all().rejects_all());
        assert!(ExitPolicy::default().rejects_all());
        assert!(!web_only().rejects_all());
    }

    #[test]
    fn test_rule_display_roundtrip() {
        for line in ["accept *:80", "reject 10.0.0.0/8:*", "accept 1.2.3.4:1-1024", "reject [::1]:*"] {
            let rule: PolicyRule = line.parse().unwrap();
            assert_eq!(rule.to_string(), line);
        }
    }

    #[test]
    fn test_bad_rules() {
        assert!("allow *:80".parse::<PolicyRule>().is_err());
        assert!("accept *:90-80".parse::<PolicyRule>().is_err());
        assert!("accept 1.2.3.4/33:80".parse::<PolicyRule>().is_err());
    }

    #[test]
    fn test_policy_serde_as_strings() {
        let json = serde_json::to_string(&web_only()).unwrap();
        assert!(json.contains("accept *:443"));
        let back: ExitPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, web_only());
    }
}
