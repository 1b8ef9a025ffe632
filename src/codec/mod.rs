//! Command and response packets.
//!
//! Payloads are sealed with AES-256-GCM under the session key. The 96 bit
//! AEAD nonce is the direction tag, three zero bytes, then the packet's 64
//! bit counter, so a nonce never repeats under one key. The associated data
//! binds the session id, direction and counter. The whole packet is then
//! signed with the sender's certificate key.
//!
//! Decoding checks, in order: signature, session id, nonce freshness,
//! decryption. The counter is only recorded once the packet decrypts.
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cbor::{self, CborError};
use crate::definitions::{
    Command, CommandPacket, CommandResult, EccKeyPair, PublicKey, ResponsePacket,
};
use crate::session::{Direction, PkiSession, Role, SessionId, SessionKey};

pub mod replay;

pub use replay::{ReplayError, ReplayWindow};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("session is expired or invalidated")]
    SessionExpired,
    #[error("packet signature does not verify against the expected signer")]
    SignatureInvalid,
    #[error("packet belongs to session {found}, not {expected}")]
    SessionMismatch {
        expected: SessionId,
        found: SessionId,
    },
    #[error("replay detected: {0}")]
    ReplayDetected(#[from] ReplayError),
    #[error("payload does not decrypt under the session key")]
    DecryptionFailed,
    #[error("unable to encrypt payload")]
    EncryptionFailed,
    #[error("packet carries a certificate other than the session's")]
    CertificateMismatch,
    #[error("signing key does not belong to this end of the session")]
    WrongSigner,
    #[error("{0}")]
    Encoding(String),
}

impl From<CborError> for CodecError {
    fn from(e: CborError) -> Self {
        CodecError::Encoding(e.to_string())
    }
}

/// What the vehicle said about a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Completed(CommandResult),
    Refused(String),
}

pub const AEAD_NONCE_LEN: usize = 12;

fn aead_nonce(direction: Direction, counter: u64) -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce[0] = direction as u8;
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn associated_data(session_id: &SessionId, direction: Direction, counter: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + 1 + 8);
    aad.extend_from_slice(session_id.as_bytes());
    aad.push(direction as u8);
    aad.extend_from_slice(&counter.to_be_bytes());
    aad
}

fn cipher(key: &SessionKey) -> Aes256Gcm {
    Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

fn seal(
    session: &PkiSession,
    counter: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let key = session.key().ok_or(CodecError::SessionExpired)?;
    let direction = session.outbound();
    let aad = associated_data(&session.id(), direction, counter);
    cipher(key)
        .encrypt(
            Nonce::from_slice(&aead_nonce(direction, counter)),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| CodecError::EncryptionFailed)
}

fn open(session: &PkiSession, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let key = session.key().ok_or(CodecError::SessionExpired)?;
    let direction = session.inbound();
    let aad = associated_data(&session.id(), direction, counter);
    cipher(key)
        .decrypt(
            Nonce::from_slice(&aead_nonce(direction, counter)),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CodecError::DecryptionFailed)
}

fn check_signer(session: &PkiSession, signer: &EccKeyPair) -> Result<(), CodecError> {
    let own = match session.role() {
        Role::Key => session.user_key(),
        Role::Vehicle => session.vehicle_key(),
    };
    if &signer.public_key() != own {
        return Err(CodecError::WrongSigner);
    }
    Ok(())
}

/// Shared freshness gate for inbound packets.
fn admit(
    session: &PkiSession,
    packet_session: &SessionId,
    counter: u64,
    now: OffsetDateTime,
) -> Result<(), CodecError> {
    if !session.is_valid(now) {
        return Err(CodecError::SessionExpired);
    }
    if packet_session != &session.id() {
        return Err(CodecError::SessionMismatch {
            expected: session.id(),
            found: *packet_session,
        });
    }
    session.replay_window().check(counter)?;
    Ok(())
}

/// Seal a command for the vehicle.
pub fn encode(
    command: &Command,
    session: &mut PkiSession,
    sender: &EccKeyPair,
    now: OffsetDateTime,
) -> Result<CommandPacket, CodecError> {
    if !session.is_valid(now) {
        return Err(CodecError::SessionExpired);
    }
    check_signer(session, sender)?;

    let nonce = session.take_nonce();
    let payload = seal(session, nonce, &cbor::to_vec(command)?)?;
    let mut packet = CommandPacket {
        certificate: session.user_certificate().clone(),
        payload,
        nonce,
        session_id: session.id(),
        timestamp: now.unix_timestamp(),
        signature: vec![],
    };
    packet.signature = sender.sign(&packet.tbs_bytes()?);
    tracing::debug!(
        "encoded {} as nonce {nonce} in session {}",
        command.kind,
        session.id()
    );
    Ok(packet)
}

/// Verify and open a command packet.
pub fn decode(
    packet: &CommandPacket,
    session: &mut PkiSession,
    expected_signer: &PublicKey,
    now: OffsetDateTime,
) -> Result<Command, CodecError> {
    if expected_signer
        .verify(&packet.tbs_bytes()?, &packet.signature)
        .is_err()
    {
        tracing::warn!("command packet for session {} has a bad signature", packet.session_id);
        return Err(CodecError::SignatureInvalid);
    }
    admit(session, &packet.session_id, packet.nonce, now)?;
    if &packet.certificate != session.user_certificate() {
        return Err(CodecError::CertificateMismatch);
    }

    let plaintext = open(session, packet.nonce, &packet.payload)?;
    session.replay_window_mut().mark(packet.nonce);
    Ok(cbor::from_slice(&plaintext)?)
}

/// Seal the vehicle's reply to the command numbered `request_nonce`.
pub fn encode_response(
    reply: &Reply,
    request_nonce: u64,
    session: &mut PkiSession,
    sender: &EccKeyPair,
    now: OffsetDateTime,
) -> Result<ResponsePacket, CodecError> {
    if !session.is_valid(now) {
        return Err(CodecError::SessionExpired);
    }
    check_signer(session, sender)?;

    let nonce = session.take_nonce();
    let payload = seal(session, nonce, &cbor::to_vec(reply)?)?;
    let (success, error) = match reply {
        Reply::Completed(_) => (true, None),
        Reply::Refused(reason) => (false, Some(reason.clone())),
    };
    let mut packet = ResponsePacket {
        success,
        session_id: session.id(),
        request_nonce,
        nonce,
        payload,
        timestamp: now.unix_timestamp(),
        error,
        signature: vec![],
    };
    packet.signature = sender.sign(&packet.tbs_bytes()?);
    Ok(packet)
}

/// Verify and open a response packet.
pub fn decode_response(
    packet: &ResponsePacket,
    session: &mut PkiSession,
    expected_signer: &PublicKey,
    now: OffsetDateTime,
) -> Result<Reply, CodecError> {
    if expected_signer
        .verify(&packet.tbs_bytes()?, &packet.signature)
        .is_err()
    {
        tracing::warn!("response packet for session {} has a bad signature", packet.session_id);
        return Err(CodecError::SignatureInvalid);
    }
    admit(session, &packet.session_id, packet.nonce, now)?;

    let plaintext = open(session, packet.nonce, &packet.payload)?;
    session.replay_window_mut().mark(packet.nonce);
    let reply: Reply = cbor::from_slice(&plaintext)?;

    // The cleartext flag is signed, the sealed body is authoritative; they
    // must agree.
    if matches!(reply, Reply::Completed(_)) != packet.success {
        return Err(CodecError::Encoding(
            "response success flag disagrees with its payload".to_string(),
        ));
    }
    Ok(reply)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::{CommandKind, VehicleStatus};
    use crate::session::SessionParts;
    use crate::test_support::{all_permissions, Pki, NOW, VIN};
    use time::Duration;

    fn session(pki: &Pki, id: SessionId, role: Role, key: [u8; 32]) -> PkiSession {
        PkiSession::new(SessionParts {
            id,
            role,
            key: SessionKey::new(key),
            user_certificate: pki.user.clone(),
            vehicle_id: VIN.to_string(),
            vehicle_key: pki.vehicle.public_key.clone(),
            client_nonce: vec![1; 32],
            server_nonce: vec![2; 32],
            created_at: NOW,
            duration: Duration::seconds(300),
        })
    }

    fn pair(pki: &Pki) -> (PkiSession, PkiSession) {
        let id = SessionId::new();
        (
            session(pki, id, Role::Key, [7; 32]),
            session(pki, id, Role::Vehicle, [7; 32]),
        )
    }

    #[test]
    fn command_and_response_round_trip() {
        let pki = Pki::new(all_permissions());
        let (mut key_side, mut vehicle_side) = pair(&pki);
        let command = Command::new(CommandKind::Unlock);

        let packet = encode(&command, &mut key_side, &pki.user_key, NOW).unwrap();
        assert_ne!(packet.payload, cbor::to_vec(&command).unwrap());
        let decoded = decode(&packet, &mut vehicle_side, &pki.user.public_key, NOW).unwrap();
        assert_eq!(decoded, command);

        let reply = Reply::Completed(CommandResult {
            kind: CommandKind::Unlock,
            status: VehicleStatus::default(),
        });
        let response =
            encode_response(&reply, packet.nonce, &mut vehicle_side, &pki.vehicle_key, NOW).unwrap();
        assert!(response.success);
        let decoded =
            decode_response(&response, &mut key_side, &pki.vehicle.public_key, NOW).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn nonces_strictly_increase() {
        let pki = Pki::new(all_permissions());
        let (mut key_side, _) = pair(&pki);
        let nonces: Vec<u64> = (0..5)
            .map(|_| {
                encode(&CommandKind::Lock.into(), &mut key_side, &pki.user_key, NOW)
                    .unwrap()
                    .nonce
            })
            .collect();
        assert_eq!(nonces, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn replayed_packet_is_rejected() {
        let pki = Pki::new(all_permissions());
        let (mut key_side, mut vehicle_side) = pair(&pki);
        let packet = encode(&CommandKind::Unlock.into(), &mut key_side, &pki.user_key, NOW).unwrap();
        decode(&packet, &mut vehicle_side, &pki.user.public_key, NOW).unwrap();
        assert_eq!(
            decode(&packet, &mut vehicle_side, &pki.user.public_key, NOW),
            Err(CodecError::ReplayDetected(ReplayError::Duplicate(1)))
        );
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let pki = Pki::new(all_permissions());
        let (mut key_side, mut vehicle_side) = pair(&pki);
        let mut packet =
            encode(&CommandKind::Unlock.into(), &mut key_side, &pki.user_key, NOW).unwrap();
        packet.payload[0] ^= 1;
        assert_eq!(
            decode(&packet, &mut vehicle_side, &pki.user.public_key, NOW),
            Err(CodecError::SignatureInvalid)
        );

        let packet = encode(&CommandKind::Unlock.into(), &mut key_side, &pki.user_key, NOW).unwrap();
        assert_eq!(
            decode(&packet, &mut vehicle_side, &pki.vehicle.public_key, NOW),
            Err(CodecError::SignatureInvalid)
        );
    }

    #[test]
    fn undecryptable_packet_does_not_consume_its_nonce() {
        let pki = Pki::new(all_permissions());
        let (mut key_side, mut vehicle_side) = pair(&pki);
        let good = encode(&CommandKind::Lock.into(), &mut key_side, &pki.user_key, NOW).unwrap();

        // Correctly signed, but sealed under a different key.
        let mut other = session(&pki, key_side.id(), Role::Key, [9; 32]);
        let bad = encode(&CommandKind::Lock.into(), &mut other, &pki.user_key, NOW).unwrap();
        assert_eq!(bad.nonce, good.nonce);
        assert_eq!(
            decode(&bad, &mut vehicle_side, &pki.user.public_key, NOW),
            Err(CodecError::DecryptionFailed)
        );
        decode(&good, &mut vehicle_side, &pki.user.public_key, NOW).unwrap();
    }

    #[test]
    fn packet_from_another_session() {
        let pki = Pki::new(all_permissions());
        let (mut key_side, _) = pair(&pki);
        let (_, mut unrelated) = pair(&pki);
        let packet = encode(&CommandKind::Lock.into(), &mut key_side, &pki.user_key, NOW).unwrap();
        assert!(matches!(
            decode(&packet, &mut unrelated, &pki.user.public_key, NOW),
            Err(CodecError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn expired_or_invalidated_session() {
        let pki = Pki::new(all_permissions());
        let (mut key_side, _) = pair(&pki);
        let later = NOW + Duration::seconds(301);
        assert_eq!(
            encode(&CommandKind::Lock.into(), &mut key_side, &pki.user_key, later),
            Err(CodecError::SessionExpired)
        );
        key_side.invalidate();
        assert_eq!(
            encode(&CommandKind::Lock.into(), &mut key_side, &pki.user_key, NOW),
            Err(CodecError::SessionExpired)
        );
    }

    #[test]
    fn own_direction_is_not_accepted_back() {
        let pki = Pki::new(all_permissions());
        let (mut key_side, _) = pair(&pki);
        let mut mirror = session(&pki, key_side.id(), Role::Key, [7; 32]);
        let packet = encode(&CommandKind::Lock.into(), &mut key_side, &pki.user_key, NOW).unwrap();
        // A reflected packet is sealed for the other direction.
        assert_eq!(
            decode(&packet, &mut mirror, &pki.user.public_key, NOW),
            Err(CodecError::DecryptionFailed)
        );
    }

    #[test]
    fn nonce_layout() {
        assert_eq!(
            hex::encode(aead_nonce(Direction::VehicleToKey, 0x0102)),
            "020000000000000000000102"
        );
    }

    #[test]
    fn success_flag_must_match_the_sealed_reply() {
        let pki = Pki::new(all_permissions());
        let (mut key_side, mut vehicle_side) = pair(&pki);
        let packet = encode(&CommandKind::Lock.into(), &mut key_side, &pki.user_key, NOW).unwrap();
        decode(&packet, &mut vehicle_side, &pki.user.public_key, NOW).unwrap();

        let reply = Reply::Refused("trunk jammed".into());
        let mut response =
            encode_response(&reply, packet.nonce, &mut vehicle_side, &pki.vehicle_key, NOW).unwrap();
        assert!(!response.success);
        response.success = true;
        response.signature = pki.vehicle_key.sign(&response.tbs_bytes().unwrap());

        assert!(matches!(
            decode_response(&response, &mut key_side, &pki.vehicle.public_key, NOW),
            Err(CodecError::Encoding(_))
        ));
    }

    #[test]
    fn wrong_signer_is_refused() {
        let pki = Pki::new(all_permissions());
        let (mut key_side, _) = pair(&pki);
        assert_eq!(
            encode(&CommandKind::Lock.into(), &mut key_side, &pki.vehicle_key, NOW),
            Err(CodecError::WrongSigner)
        );
    }
}
