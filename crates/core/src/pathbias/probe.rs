use crate::cell::{EndStreamReason, RelayCommand, RelayMsg};
use rand::Rng;
use std::net::Ipv4Addr;

/// Port the probe asks the exit to connect to
pub const PROBE_PORT: u16 = 25;

/// A liveness probe outstanding on a circuit. The nonce travels as an IPv4
/// address in 0.0.0.0/8, which every exit refuses by policy and echoes
/// back in its END cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathBiasProbe {
    pub nonce: u32,
    pub stream_id: u16,
}

/// How a cell answers an outstanding probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The exit echoed our nonce
    Valid,
    /// An END for the probe stream too short to hold an address
    Short { length: usize },
    /// An END for the probe stream with the wrong address
    Mismatch { echoed: u32 },
    /// Anything else arriving on the probe circuit
    Unrelated {
        command: RelayCommand,
        reason: EndStreamReason,
        stream_id: u16,
    },
}

impl PathBiasProbe {
    /// Fresh probe with a random 24-bit nonce and a non-zero stream id
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            nonce: rng.gen::<u32>() & 0x00ff_ffff,
            stream_id: rng.gen_range(1..=u16::MAX),
        }
    }

    pub fn target(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.nonce)
    }

    pub fn begin_msg(&self) -> RelayMsg {
        RelayMsg::begin(self.stream_id, &self.target().to_string(), PROBE_PORT)
    }

    pub fn check_response(&self, msg: &RelayMsg) -> ProbeVerdict {
        let reason = msg
            .body
            .first()
            .map_or(EndStreamReason::Misc, |b| EndStreamReason::from_wire(*b));

        if msg.command == RelayCommand::End
            && reason == EndStreamReason::ExitPolicy
            && msg.stream_id == self.stream_id
        {
            // reason, IPv4 address, TTL
            if msg.body.len() < 9 {
                return ProbeVerdict::Short {
                    length: msg.body.len(),
                };
            }
            let echoed = u32::from_be_bytes([msg.body[1], msg.body[2], msg.body[3], msg.body[4]]);
            if echoed == self.nonce {
                return ProbeVerdict::Valid;
            }
            return ProbeVerdict::Mismatch { echoed };
        }

        ProbeVerdict::Unrelated {
            command: msg.command,
            reason,
            stream_id: msg.stream_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> PathBiasProbe {
        PathBiasProbe {
            nonce: 0x00ab_cdef,
            stream_id: 77,
        }
    }

    #[test]
    fn test_generate_bounds() {
        for _ in 0..100 {
            let probe = PathBiasProbe::generate();
            assert_eq!(probe.nonce & 0xff00_0000, 0);
            assert_ne!(probe.stream_id, 0);
            assert_eq!(probe.target().octets()[0], 0);
        }
    }

    #[test]
    fn test_begin_targets_nonce() {
        let msg = probe().begin_msg();
        assert_eq!(msg.command, RelayCommand::Begin);
        assert_eq!(msg.stream_id, 77);
        assert_eq!(msg.begin_target().unwrap(), ("0.171.205.239".to_string(), 25));
    }

    #[test]
    fn test_echo_verdicts() {
        let p = probe();
        assert_eq!(
            p.check_response(&RelayMsg::end_exit_policy(77, p.target(), 0)),
            ProbeVerdict::Valid
        );
        assert_eq!(
            p.check_response(&RelayMsg::end_exit_policy(77, Ipv4Addr::new(0, 1, 2, 3), 0)),
            ProbeVerdict::Mismatch { echoed: 0x0001_0203 }
        );

        let mut short = RelayMsg::end_exit_policy(77, p.target(), 0);
        short.body.truncate(5);
        assert_eq!(p.check_response(&short), ProbeVerdict::Short { length: 5 });
    }

    #[test]
    fn test_unrelated_cells() {
        let p = probe();
        assert!(matches!(
            p.check_response(&RelayMsg::end_exit_policy(78, p.target(), 0)),
            ProbeVerdict::Unrelated { stream_id: 78, .. }
        ));
        assert!(matches!(
            p.check_response(&RelayMsg::end(77, EndStreamReason::Misc)),
            ProbeVerdict::Unrelated {
                reason: EndStreamReason::Misc,
                ..
            }
        ));
    }
}
