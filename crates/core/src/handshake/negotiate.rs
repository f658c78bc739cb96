use crate::cell::{CreateCellType, ExtendCellType, HandshakeType};
use crate::extend_info::ExtendInfo;
use onioncirc_common::{CircuitConfig, NetworkParams};

/// Whether circuits may use the ntor handshake: the local setting when one
/// is configured, otherwise the consensus parameter.
pub fn circuits_can_use_ntor(config: &CircuitConfig, params: &NetworkParams) -> bool {
    match config.use_ntor_handshake {
        Some(enabled) => enabled,
        None => params.get("UseNTorHandshake", 0, 0, 1) != 0,
    }
}

/// Whether the first hop should be opened with CREATE_FAST
pub fn should_use_create_fast(config: &CircuitConfig, target: &ExtendInfo) -> bool {
    if target.onion_key.is_none() {
        // No legacy key to run the public-key handshake with
        return true;
    }
    if !config.fast_first_hop_pk {
        return false;
    }
    // A relay's first hop must not be distinguishable from a client's
    !config.server_mode
}

/// Cell and handshake for a CREATE sent directly to `target`
pub fn pick_handshake(target: &ExtendInfo, ntor_allowed: bool) -> (CreateCellType, HandshakeType) {
    if target.ntor_onion_key.is_some() && ntor_allowed {
        (CreateCellType::Create2, HandshakeType::Ntor)
    } else {
        (CreateCellType::Create, HandshakeType::Tap)
    }
}

/// Cells and handshake for extending to `target` through the hop that
/// currently ends the circuit. `prev_supports_extend2` says whether that
/// hop is known to understand EXTEND2.
pub fn pick_extend_handshake(
    target: &ExtendInfo,
    prev_supports_extend2: bool,
    ntor_allowed: bool,
) -> (ExtendCellType, CreateCellType, HandshakeType) {
    let (_, handshake) = pick_handshake(target, ntor_allowed);
    if handshake != HandshakeType::Tap && prev_supports_extend2 {
        (ExtendCellType::Extend2, CreateCellType::Create2, handshake)
    } else {
        // The previous hop only speaks legacy EXTEND; ntor, if chosen,
        // travels inside a marked legacy CREATE.
        (ExtendCellType::Extend, CreateCellType::Create, handshake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onioncirc_common::RelayId;

    fn target(onion: bool, ntor: bool) -> ExtendInfo {
        ExtendInfo::new(
            None,
            RelayId::from([5u8; 20]),
            onion.then_some([1u8; 32]),
            ntor.then_some([2u8; 32]),
            "10.1.1.1:9001".parse().unwrap(),
        )
    }

    #[test]
    fn test_ntor_from_consensus() {
        let config = CircuitConfig::default();
        assert!(!circuits_can_use_ntor(&config, &NetworkParams::new()));
        let params = NetworkParams::new().with("UseNTorHandshake", 1);
        assert!(circuits_can_use_ntor(&config, &params));
        let config = config.with_ntor(false);
        assert!(!circuits_can_use_ntor(&config, &params));
    }

    #[test]
    fn test_create_fast_choice() {
        let config = CircuitConfig::default();
        assert!(should_use_create_fast(&config, &target(false, true)));
        assert!(should_use_create_fast(&config, &target(true, true)));

        let relay = CircuitConfig::default().with_server_mode(true);
        assert!(!should_use_create_fast(&relay, &target(true, true)));

        let no_fast = CircuitConfig::default().with_fast_first_hop(false);
        assert!(!should_use_create_fast(&no_fast, &target(true, false)));
    }

    #[test]
    fn test_pick_handshake() {
        assert_eq!(
            pick_handshake(&target(true, true), true),
            (CreateCellType::Create2, HandshakeType::Ntor)
        );
        assert_eq!(
            pick_handshake(&target(true, true), false),
            (CreateCellType::Create, HandshakeType::Tap)
        );
        assert_eq!(
            pick_handshake(&target(true, false), true),
            (CreateCellType::Create, HandshakeType::Tap)
        );
    }

    #[test]
    fn test_extend_downgrades_without_extend2() {
        let t = target(true, true);
        assert_eq!(
            pick_extend_handshake(&t, true, true),
            (ExtendCellType::Extend2, CreateCellType::Create2, HandshakeType::Ntor)
        );
        assert_eq!(
            pick_extend_handshake(&t, false, true),
            (ExtendCellType::Extend, CreateCellType::Create, HandshakeType::Ntor)
        );
        assert_eq!(
            pick_extend_handshake(&t, true, false),
            (ExtendCellType::Extend, CreateCellType::Create, HandshakeType::Tap)
        );
    }
}
