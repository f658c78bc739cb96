/// Per-hop key agreement.
///
/// Three protocols share one interface: a client starts a handshake and
/// gets an onionskin, the relay answers with a reply and its copy of the
/// key block, and the client completes with that reply.
mod fast;
pub mod kdf;
mod negotiate;
mod ntor;
mod tap;

pub use kdf::KeyMaterial;
pub use negotiate::{circuits_can_use_ntor, pick_extend_handshake, pick_handshake, should_use_create_fast};

use crate::cell::HandshakeType;
use crate::extend_info::ExtendInfo;
use crate::identity::RelayKeys;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Reply too short: expected {expected}, got {actual}")]
    BadReplyLength { expected: usize, actual: usize },

    #[error("Onionskin has wrong length: expected {expected}, got {actual}")]
    BadOnionskinLength { expected: usize, actual: usize },

    #[error("Derived key hash does not match")]
    KeyMismatch,

    #[error("Server authentication failed")]
    AuthFailed,

    #[error("Key agreement was not contributory")]
    NonContributory,

    #[error("Onionskin is addressed to a different relay")]
    WrongRecipient,

    #[error("Target has no onion key for {0:?}")]
    MissingOnionKey(HandshakeType),

    #[error("This node has no onion keys")]
    NoServerKeys,

    #[error("Internal handshake error: {0}")]
    Internal(String),
}

/// Client side of a handshake that is waiting for its reply
pub enum ClientHandshake {
    Fast(fast::FastClient),
    Tap(tap::TapClient),
    Ntor(ntor::NtorClient),
}

impl ClientHandshake {
    /// Begin a handshake with `target`, returning the state to keep on the
    /// hop and the onionskin to send.
    pub fn start(
        handshake_type: HandshakeType,
        target: &ExtendInfo,
    ) -> Result<(Self, Vec<u8>), HandshakeError> {
        match handshake_type {
            HandshakeType::Fast => {
                let (state, onionskin) = fast::FastClient::start();
                Ok((ClientHandshake::Fast(state), onionskin))
            }
            HandshakeType::Tap => {
                let key = target
                    .onion_key
                    .ok_or(HandshakeError::MissingOnionKey(HandshakeType::Tap))?;
                let (state, onionskin) = tap::TapClient::start(key);
                Ok((ClientHandshake::Tap(state), onionskin))
            }
            HandshakeType::Ntor => {
                let key = target
                    .ntor_onion_key
                    .ok_or(HandshakeError::MissingOnionKey(HandshakeType::Ntor))?;
                let (state, onionskin) = ntor::NtorClient::start(target.identity, key);
                Ok((ClientHandshake::Ntor(state), onionskin))
            }
        }
    }

    pub fn handshake_type(&self) -> HandshakeType {
        match self {
            ClientHandshake::Fast(_) => HandshakeType::Fast,
            ClientHandshake::Tap(_) => HandshakeType::Tap,
            ClientHandshake::Ntor(_) => HandshakeType::Ntor,
        }
    }

    /// Finish with the server's reply and derive the hop's key block
    pub fn complete(self, reply: &[u8]) -> Result<KeyMaterial, HandshakeError> {
        match self {
            ClientHandshake::Fast(state) => state.complete(reply),
            ClientHandshake::Tap(state) => state.complete(reply),
            ClientHandshake::Ntor(state) => state.complete(reply),
        }
    }
}

impl std::fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientHandshake({:?})", self.handshake_type())
    }
}

/// Relay side: answer `onionskin`, returning the reply and the key block
pub fn server_handshake(
    handshake_type: HandshakeType,
    onionskin: &[u8],
    keys: Option<&RelayKeys>,
) -> Result<(Vec<u8>, KeyMaterial), HandshakeError> {
    match handshake_type {
        HandshakeType::Fast => fast::server(onionskin),
        HandshakeType::Tap => {
            let keys = keys.ok_or(HandshakeError::NoServerKeys)?;
            tap::server(onionskin, keys.legacy_onion_secret())
        }
        HandshakeType::Ntor => {
            let keys = keys.ok_or(HandshakeError::NoServerKeys)?;
            ntor::server(onionskin, &keys.identity_digest(), keys.ntor_onion_secret())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onioncirc_common::cells::TAP_ONIONSKIN_REPLY_LEN;

    fn relay_target(keys: &RelayKeys) -> ExtendInfo {
        let info = keys.describe("relay", "127.0.0.1:9001".parse().unwrap());
        ExtendInfo::from_relay(&info, true, false)
    }

    #[test]
    fn test_all_handshakes_agree() {
        let keys = RelayKeys::generate();
        let target = relay_target(&keys);

        for handshake_type in [HandshakeType::Fast, HandshakeType::Tap, HandshakeType::Ntor] {
            let (client, onionskin) = ClientHandshake::start(handshake_type, &target).unwrap();
            assert_eq!(onionskin.len(), handshake_type.onionskin_len());
            assert_eq!(client.handshake_type(), handshake_type);

            let (mut reply, server_keys) =
                server_handshake(handshake_type, &onionskin, Some(&keys)).unwrap();
            if handshake_type == HandshakeType::Tap {
                reply.resize(TAP_ONIONSKIN_REPLY_LEN, 0);
            }
            let client_keys = client.complete(&reply).unwrap();
            assert_eq!(&client_keys[..], &server_keys[..]);
        }
    }

    #[test]
    fn test_missing_key() {
        let mut target = relay_target(&RelayKeys::generate());
        target.ntor_onion_key = None;
        assert!(matches!(
            ClientHandshake::start(HandshakeType::Ntor, &target),
            Err(HandshakeError::MissingOnionKey(HandshakeType::Ntor))
        ));
    }

    #[test]
    fn test_client_cannot_answer_tap() {
        let target = relay_target(&RelayKeys::generate());
        let (_, onionskin) = ClientHandshake::start(HandshakeType::Tap, &target).unwrap();
        assert!(matches!(
            server_handshake(HandshakeType::Tap, &onionskin, None),
            Err(HandshakeError::NoServerKeys)
        ));
    }
}
