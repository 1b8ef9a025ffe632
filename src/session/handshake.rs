//! Key agreement.
//!
//! Each side contributes a 32 byte nonce and an ephemeral ECDH key on the
//! client's curve. The session key is HKDF-SHA256 over the ECDH shared
//! secret, salted with both nonces, with both certificate keys and both
//! ephemeral keys in the info string. Both hellos are signed by the
//! long-term certificate keys, so only the two certificate holders can end
//! up with the same session.
use elliptic_curve::sec1::ToEncodedPoint;
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha2::Sha256;
use time::OffsetDateTime;
use zeroize::Zeroizing;

use super::{SessionId, SessionKey};
use crate::cbor;
use crate::definitions::{Certificate, Curve, PublicKey};

pub const NONCE_LEN: usize = 32;

/// Per-attempt handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
pub enum HandshakeState {
    Idle,
    NonceExchanged,
    KeyDerived,
    Established,
    Failed,
}

impl HandshakeState {
    fn can_transition(self, to: HandshakeState) -> bool {
        use HandshakeState::*;
        matches!(
            (self, to),
            (Idle, NonceExchanged)
                | (NonceExchanged, KeyDerived)
                | (KeyDerived, Established)
                | (Idle | NonceExchanged | KeyDerived, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("no server hello within the handshake window")]
    HandshakeTimeout,
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),
    #[error("peer hello is not signed by its certificate key")]
    PeerSignatureInvalid,
    #[error("vehicle rejected the handshake: {0}")]
    Rejected(String),
    #[error("no handshake in progress for session {0}")]
    UnknownHandshake(SessionId),
    #[error("handshake cannot move from {from} to {to}")]
    InvalidState {
        from: HandshakeState,
        to: HandshakeState,
    },
    #[error("session manager is inactive")]
    Inactive,
    #[error("unable to encode handshake message: {0}")]
    Encoding(String),
}

impl From<cbor::CborError> for HandshakeError {
    fn from(e: cbor::CborError) -> Self {
        HandshakeError::Encoding(e.to_string())
    }
}

/// An ephemeral ECDH secret, zeroized on drop.
pub enum EphemeralSecrets {
    P256(p256::ecdh::EphemeralSecret),
    K256(k256::ecdh::EphemeralSecret),
}

impl EphemeralSecrets {
    pub fn generate(curve: Curve) -> (Self, PublicKey) {
        match curve {
            Curve::Secp256r1 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let sec1 = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (Self::P256(secret), PublicKey { curve, sec1 })
            }
            Curve::Secp256k1 => {
                let secret = k256::ecdh::EphemeralSecret::random(&mut OsRng);
                let sec1 = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (Self::K256(secret), PublicKey { curve, sec1 })
            }
        }
    }

    pub fn curve(&self) -> Curve {
        match self {
            Self::P256(_) => Curve::Secp256r1,
            Self::K256(_) => Curve::Secp256k1,
        }
    }

    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; 32]>, HandshakeError> {
        if peer.curve != self.curve() {
            return Err(HandshakeError::KeyDerivationFailed(format!(
                "peer key is on {}, expected {}",
                peer.curve,
                self.curve()
            )));
        }
        let invalid_point =
            || HandshakeError::KeyDerivationFailed(format!("peer key is not a valid {} point", peer.curve));
        let mut out = Zeroizing::new([0u8; 32]);
        match self {
            Self::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(&peer.sec1).map_err(|_| invalid_point())?;
                out.copy_from_slice(secret.diffie_hellman(&peer).raw_secret_bytes());
            }
            Self::K256(secret) => {
                let peer = k256::PublicKey::from_sec1_bytes(&peer.sec1).map_err(|_| invalid_point())?;
                out.copy_from_slice(secret.diffie_hellman(&peer).raw_secret_bytes());
            }
        }
        Ok(out)
    }
}

pub fn generate_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Everything the session key is bound to besides the nonces.
pub struct KeyContext<'a> {
    pub session_id: &'a SessionId,
    pub user_key: &'a PublicKey,
    pub vehicle_key: &'a PublicKey,
    pub client_ephemeral: &'a PublicKey,
    pub server_ephemeral: &'a PublicKey,
}

#[derive(Serialize)]
struct KeyInfo<'a> {
    label: &'static str,
    session_id: &'a SessionId,
    user_key: &'a PublicKey,
    vehicle_key: &'a PublicKey,
    client_ephemeral: &'a PublicKey,
    server_ephemeral: &'a PublicKey,
}

pub fn derive_session_key(
    shared_secret: &[u8; 32],
    client_nonce: &[u8],
    server_nonce: &[u8],
    context: &KeyContext<'_>,
) -> Result<SessionKey, HandshakeError> {
    for nonce in [client_nonce, server_nonce] {
        if nonce.len() != NONCE_LEN {
            return Err(HandshakeError::KeyDerivationFailed(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
    }
    let salt = [client_nonce, server_nonce].concat();
    let info = cbor::to_vec(&KeyInfo {
        label: "vehicle-key session key",
        session_id: context.session_id,
        user_key: context.user_key,
        vehicle_key: context.vehicle_key,
        client_ephemeral: context.client_ephemeral,
        server_ephemeral: context.server_ephemeral,
    })?;

    let mut okm = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(Some(salt.as_slice()), &shared_secret[..])
        .expand(&info, okm.as_mut_slice())
        .map_err(|e| HandshakeError::KeyDerivationFailed(format!("unable to perform HKDF: {e}")))?;
    Ok(SessionKey::new(*okm))
}

/// One in-progress handshake on the client side.
pub(crate) struct Handshake {
    pub(crate) state: HandshakeState,
    pub(crate) session_id: SessionId,
    pub(crate) user_certificate: Certificate,
    pub(crate) vehicle_certificate: Certificate,
    pub(crate) client_nonce: Vec<u8>,
    pub(crate) ephemeral: Option<EphemeralSecrets>,
    pub(crate) ephemeral_key: Option<PublicKey>,
    pub(crate) started_at: OffsetDateTime,
}

impl Handshake {
    pub(crate) fn new(
        user_certificate: Certificate,
        vehicle_certificate: Certificate,
        started_at: OffsetDateTime,
    ) -> Self {
        Self {
            state: HandshakeState::Idle,
            session_id: SessionId::new(),
            user_certificate,
            vehicle_certificate,
            client_nonce: vec![],
            ephemeral: None,
            ephemeral_key: None,
            started_at,
        }
    }

    pub(crate) fn transition(&mut self, to: HandshakeState) -> Result<(), HandshakeError> {
        if !self.state.can_transition(to) {
            return Err(HandshakeError::InvalidState {
                from: self.state,
                to,
            });
        }
        tracing::debug!("handshake {}: {} -> {}", self.session_id, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Move to `Failed`, dropping the ephemeral secret.
    pub(crate) fn fail(&mut self, error: HandshakeError) -> HandshakeError {
        self.ephemeral = None;
        if self.state.can_transition(HandshakeState::Failed) {
            self.state = HandshakeState::Failed;
        }
        tracing::warn!("handshake {} failed: {error}", self.session_id);
        error
    }

    pub(crate) fn vehicle_id(&self) -> Option<&str> {
        self.vehicle_certificate.vehicle().map(|v| v.vehicle_id.as_str())
    }

    pub(crate) fn user_id(&self) -> Option<&str> {
        self.user_certificate.user().map(|u| u.user_id.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_machine_rejects_skips() {
        assert!(HandshakeState::Idle.can_transition(HandshakeState::NonceExchanged));
        assert!(!HandshakeState::Idle.can_transition(HandshakeState::Established));
        assert!(!HandshakeState::Established.can_transition(HandshakeState::Failed));
        assert!(!HandshakeState::Failed.can_transition(HandshakeState::NonceExchanged));
    }

    #[test]
    fn both_sides_agree_and_curves_must_match() {
        let (client, client_key) = EphemeralSecrets::generate(Curve::Secp256k1);
        let (server, server_key) = EphemeralSecrets::generate(Curve::Secp256k1);
        assert_eq!(
            *client.diffie_hellman(&server_key).unwrap(),
            *server.diffie_hellman(&client_key).unwrap()
        );

        let (_, p256_key) = EphemeralSecrets::generate(Curve::Secp256r1);
        assert!(matches!(
            client.diffie_hellman(&p256_key),
            Err(HandshakeError::KeyDerivationFailed(_))
        ));
    }

    #[test]
    fn invalid_point() {
        let (client, _) = EphemeralSecrets::generate(Curve::Secp256r1);
        let bogus = PublicKey {
            curve: Curve::Secp256r1,
            sec1: vec![4; 65],
        };
        assert!(matches!(
            client.diffie_hellman(&bogus),
            Err(HandshakeError::KeyDerivationFailed(_))
        ));
    }

    #[test]
    fn key_depends_on_nonces() {
        let (client, client_key) = EphemeralSecrets::generate(Curve::Secp256r1);
        let (_, server_key) = EphemeralSecrets::generate(Curve::Secp256r1);
        let shared = client.diffie_hellman(&server_key).unwrap();
        let session_id = SessionId::new();
        let context = KeyContext {
            session_id: &session_id,
            user_key: &client_key,
            vehicle_key: &server_key,
            client_ephemeral: &client_key,
            server_ephemeral: &server_key,
        };
        let a = derive_session_key(&shared, &[1; 32], &[2; 32], &context).unwrap();
        let b = derive_session_key(&shared, &[1; 32], &[3; 32], &context).unwrap();
        let a_again = derive_session_key(&shared, &[1; 32], &[2; 32], &context).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes(), a_again.as_bytes());
        assert!(derive_session_key(&shared, &[1; 16], &[2; 32], &context).is_err());
    }
}
