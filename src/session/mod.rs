//! Session establishment and lifetime.
//!
//! The [SessionManager] runs the client side of the handshake and owns every
//! [PkiSession] it produces. A session stays usable until it expires, the
//! link drops, or it is invalidated explicitly; after that a new handshake is
//! needed.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::authority::{validate_chain, TrustAnchorRegistry};
use crate::codec::replay::ReplayWindow;
use crate::config::Config;
use crate::definitions::{
    Certificate, ClientHello, EccKeyPair, HandshakeRejected, PublicKey, ServerHello,
};

pub mod handshake;

pub use handshake::{HandshakeError, HandshakeState};
use handshake::{derive_session_key, generate_nonce, EphemeralSecrets, Handshake, KeyContext};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Symmetric session secret. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub(crate) fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Which end of the session this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The phone holding the user certificate.
    Key,
    /// The vehicle's onboard unit.
    Vehicle,
}

/// Direction tag mixed into nonces and associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    KeyToVehicle = 1,
    VehicleToKey = 2,
}

#[derive(Debug)]
pub struct PkiSession {
    id: SessionId,
    role: Role,
    key: Option<SessionKey>,
    user_certificate: Certificate,
    vehicle_id: String,
    user_key: PublicKey,
    vehicle_key: PublicKey,
    client_nonce: Vec<u8>,
    server_nonce: Vec<u8>,
    created_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    valid: bool,
    next_nonce: u64,
    inbound: ReplayWindow,
}

/// Inputs for [PkiSession::new], produced by either end of a handshake.
pub(crate) struct SessionParts {
    pub id: SessionId,
    pub role: Role,
    pub key: SessionKey,
    pub user_certificate: Certificate,
    pub vehicle_id: String,
    pub vehicle_key: PublicKey,
    pub client_nonce: Vec<u8>,
    pub server_nonce: Vec<u8>,
    pub created_at: OffsetDateTime,
    pub duration: Duration,
}

impl PkiSession {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            id: parts.id,
            role: parts.role,
            key: Some(parts.key),
            user_key: parts.user_certificate.public_key.clone(),
            user_certificate: parts.user_certificate,
            vehicle_id: parts.vehicle_id,
            vehicle_key: parts.vehicle_key,
            client_nonce: parts.client_nonce,
            server_nonce: parts.server_nonce,
            created_at: parts.created_at,
            expires_at: parts.created_at + parts.duration,
            valid: true,
            next_nonce: 1,
            inbound: ReplayWindow::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// `now < expires_at` and not invalidated.
    pub fn is_valid(&self, now: OffsetDateTime) -> bool {
        self.valid && now < self.expires_at
    }

    /// Mark the session unusable and zeroize its key. Idempotent.
    pub fn invalidate(&mut self) {
        if self.valid {
            tracing::info!("session {} invalidated", self.id);
        }
        self.valid = false;
        self.key = None;
    }

    pub fn user_certificate(&self) -> &Certificate {
        &self.user_certificate
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_certificate.user().map(|u| u.user_id.as_str())
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub fn user_key(&self) -> &PublicKey {
        &self.user_key
    }

    pub fn vehicle_key(&self) -> &PublicKey {
        &self.vehicle_key
    }

    /// The certificate key of the other end.
    pub fn peer_key(&self) -> &PublicKey {
        match self.role {
            Role::Key => &self.vehicle_key,
            Role::Vehicle => &self.user_key,
        }
    }

    pub fn client_nonce(&self) -> &[u8] {
        &self.client_nonce
    }

    pub fn server_nonce(&self) -> &[u8] {
        &self.server_nonce
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    pub(crate) fn key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    pub(crate) fn outbound(&self) -> Direction {
        match self.role {
            Role::Key => Direction::KeyToVehicle,
            Role::Vehicle => Direction::VehicleToKey,
        }
    }

    pub(crate) fn inbound(&self) -> Direction {
        match self.role {
            Role::Key => Direction::VehicleToKey,
            Role::Vehicle => Direction::KeyToVehicle,
        }
    }

    pub(crate) fn take_nonce(&mut self) -> u64 {
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        nonce
    }

    pub(crate) fn replay_window(&self) -> &ReplayWindow {
        &self.inbound
    }

    pub(crate) fn replay_window_mut(&mut self) -> &mut ReplayWindow {
        &mut self.inbound
    }
}

/// Client-side handshake driver and session owner.
pub struct SessionManager {
    session_duration: Duration,
    handshake_timeout: Duration,
    trust_anchors: TrustAnchorRegistry,
    pending: HashMap<SessionId, Handshake>,
    sessions: HashMap<SessionId, PkiSession>,
    active: bool,
}

impl SessionManager {
    pub fn new(config: &Config, trust_anchors: TrustAnchorRegistry) -> Self {
        Self {
            session_duration: config.session_duration,
            handshake_timeout: config.handshake_timeout,
            trust_anchors,
            pending: HashMap::new(),
            sessions: HashMap::new(),
            active: true,
        }
    }

    pub fn trust_anchors(&self) -> &TrustAnchorRegistry {
        &self.trust_anchors
    }

    /// Validate both certificates and produce the client hello.
    ///
    /// Any live session or pending handshake between the same user and
    /// vehicle is ended first.
    pub fn begin_handshake(
        &mut self,
        user_certificate: &Certificate,
        chain: &[Certificate],
        vehicle_certificate: &Certificate,
        key_pair: &EccKeyPair,
        now: OffsetDateTime,
    ) -> Result<ClientHello, HandshakeError> {
        if !self.active {
            return Err(HandshakeError::Inactive);
        }

        let mut handshake =
            Handshake::new(user_certificate.clone(), vehicle_certificate.clone(), now);

        if let Err(e) = self.check_certificates(
            user_certificate,
            chain,
            vehicle_certificate,
            key_pair,
            now,
        ) {
            return Err(handshake.fail(e));
        }

        self.end_pair(handshake.user_id(), handshake.vehicle_id());

        let (ephemeral, ephemeral_key) = EphemeralSecrets::generate(key_pair.curve());
        let mut hello = ClientHello {
            session_id: handshake.session_id,
            certificate: user_certificate.clone(),
            chain: chain.to_vec(),
            nonce: generate_nonce(),
            ephemeral_key: ephemeral_key.clone(),
            signature: vec![],
        };
        hello.signature = key_pair.sign(&hello.tbs_bytes()?);

        handshake.client_nonce = hello.nonce.clone();
        handshake.ephemeral = Some(ephemeral);
        handshake.ephemeral_key = Some(ephemeral_key);
        handshake.transition(HandshakeState::NonceExchanged)?;

        tracing::info!(
            "handshake {} started with vehicle {}",
            hello.session_id,
            handshake.vehicle_id().unwrap_or("<unknown>")
        );
        self.pending.insert(handshake.session_id, handshake);
        Ok(hello)
    }

    fn check_certificates(
        &self,
        user_certificate: &Certificate,
        chain: &[Certificate],
        vehicle_certificate: &Certificate,
        key_pair: &EccKeyPair,
        now: OffsetDateTime,
    ) -> Result<(), HandshakeError> {
        let Some(user) = user_certificate.user() else {
            return Err(HandshakeError::InvalidCertificate(format!(
                "'{}' is a {} certificate, not a user certificate",
                user_certificate.subject,
                user_certificate.kind_name()
            )));
        };
        let Some(vehicle) = vehicle_certificate.vehicle() else {
            return Err(HandshakeError::InvalidCertificate(format!(
                "'{}' is a {} certificate, not a vehicle certificate",
                vehicle_certificate.subject,
                vehicle_certificate.kind_name()
            )));
        };

        // The vehicle certificate may itself be the user certificate's issuer.
        let mut intermediates = chain.to_vec();
        intermediates.push(vehicle_certificate.clone());

        for certificate in [user_certificate, vehicle_certificate] {
            let outcome = validate_chain(certificate, &intermediates, &self.trust_anchors, now);
            if !outcome.success() {
                let reasons: Vec<String> = outcome.errors.iter().map(ToString::to_string).collect();
                return Err(HandshakeError::InvalidCertificate(reasons.join("; ")));
            }
        }

        if !user.valid_for_vehicle(&vehicle.vehicle_id) {
            return Err(HandshakeError::InvalidCertificate(format!(
                "user certificate '{}' is not valid for vehicle {}",
                user_certificate.subject, vehicle.vehicle_id
            )));
        }
        if key_pair.public_key() != user_certificate.public_key {
            return Err(HandshakeError::InvalidCertificate(
                "key pair does not belong to the user certificate".to_string(),
            ));
        }
        Ok(())
    }

    /// Verify the server hello and derive the session.
    pub fn complete_handshake(
        &mut self,
        hello: &ServerHello,
        now: OffsetDateTime,
    ) -> Result<&PkiSession, HandshakeError> {
        let mut handshake = self
            .pending
            .remove(&hello.session_id)
            .ok_or(HandshakeError::UnknownHandshake(hello.session_id))?;

        if now - handshake.started_at > self.handshake_timeout {
            return Err(handshake.fail(HandshakeError::HandshakeTimeout));
        }

        let key = match Self::derive(&mut handshake, hello) {
            Ok(key) => key,
            Err(e) => return Err(handshake.fail(e)),
        };

        let vehicle_id = handshake
            .vehicle_id()
            .map(str::to_owned)
            .unwrap_or_default();
        let session = PkiSession::new(SessionParts {
            id: handshake.session_id,
            role: Role::Key,
            key,
            vehicle_key: handshake.vehicle_certificate.public_key.clone(),
            user_certificate: handshake.user_certificate.clone(),
            vehicle_id,
            client_nonce: std::mem::take(&mut handshake.client_nonce),
            server_nonce: hello.nonce.clone(),
            created_at: now,
            duration: self.session_duration,
        });
        tracing::info!(
            "session {} established, expires at {}",
            session.id,
            session.expires_at
        );

        let id = session.id;
        Ok(self.sessions.entry(id).or_insert(session))
    }

    fn derive(
        handshake: &mut Handshake,
        hello: &ServerHello,
    ) -> Result<SessionKey, HandshakeError> {
        let (Some(ephemeral), Some(client_ephemeral)) =
            (handshake.ephemeral.take(), handshake.ephemeral_key.clone())
        else {
            return Err(HandshakeError::InvalidState {
                from: handshake.state,
                to: HandshakeState::KeyDerived,
            });
        };

        let tbs = hello.tbs_bytes(&handshake.client_nonce, &client_ephemeral)?;
        handshake
            .vehicle_certificate
            .public_key
            .verify(&tbs, &hello.signature)
            .map_err(|_| HandshakeError::PeerSignatureInvalid)?;

        let shared = ephemeral.diffie_hellman(&hello.ephemeral_key)?;
        handshake.transition(HandshakeState::KeyDerived)?;

        let key = derive_session_key(
            &shared,
            &handshake.client_nonce,
            &hello.nonce,
            &KeyContext {
                session_id: &handshake.session_id,
                user_key: &handshake.user_certificate.public_key,
                vehicle_key: &handshake.vehicle_certificate.public_key,
                client_ephemeral: &client_ephemeral,
                server_ephemeral: &hello.ephemeral_key,
            },
        )?;
        handshake.transition(HandshakeState::Established)?;
        Ok(key)
    }

    /// The vehicle refused the handshake.
    pub fn reject_handshake(&mut self, rejected: &HandshakeRejected) -> HandshakeError {
        let error = HandshakeError::Rejected(rejected.reason.clone());
        match self.pending.remove(&rejected.session_id) {
            Some(mut handshake) => handshake.fail(error),
            None => HandshakeError::UnknownHandshake(rejected.session_id),
        }
    }

    /// Fail every pending handshake older than the handshake window.
    pub fn expire_handshakes(&mut self, now: OffsetDateTime) -> Vec<(SessionId, HandshakeError)> {
        let timeout = self.handshake_timeout;
        let expired: Vec<SessionId> = self
            .pending
            .iter()
            .filter(|(_, h)| now - h.started_at > timeout)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|mut handshake| {
                let id = handshake.session_id;
                (id, handshake.fail(HandshakeError::HandshakeTimeout))
            })
            .collect()
    }

    /// Forget one pending handshake, e.g. because its hello never left.
    pub fn cancel_handshake(&mut self, id: &SessionId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Drop every pending handshake, e.g. because the link went away.
    pub fn abort_handshakes(&mut self) -> Vec<SessionId> {
        self.pending.drain().map(|(id, _)| id).collect()
    }

    pub fn is_pending(&self, id: &SessionId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn session(&self, id: &SessionId) -> Option<&PkiSession> {
        self.sessions.get(id)
    }

    pub(crate) fn session_mut(&mut self, id: &SessionId) -> Option<&mut PkiSession> {
        self.sessions.get_mut(id)
    }

    pub fn is_valid(&self, id: &SessionId, now: OffsetDateTime) -> bool {
        self.sessions.get(id).is_some_and(|s| s.is_valid(now))
    }

    /// Idempotent; unknown ids are ignored.
    pub fn invalidate(&mut self, id: &SessionId) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.invalidate();
        }
    }

    pub fn invalidate_all(&mut self) {
        self.sessions.values_mut().for_each(PkiSession::invalidate);
    }

    /// Remove sessions that can no longer be used.
    pub fn prune(&mut self, now: OffsetDateTime) -> Vec<SessionId> {
        let dead: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| !s.is_valid(now))
            .map(|s| s.id)
            .collect();
        for id in &dead {
            if let Some(mut session) = self.sessions.remove(id) {
                session.invalidate();
            }
        }
        dead
    }

    /// The live session between a user and a vehicle, if any.
    pub fn live_session(
        &self,
        user_id: &str,
        vehicle_id: &str,
        now: OffsetDateTime,
    ) -> Option<&PkiSession> {
        self.sessions.values().find(|s| {
            s.is_valid(now) && s.vehicle_id == vehicle_id && s.user_id() == Some(user_id)
        })
    }

    fn end_pair(&mut self, user_id: Option<&str>, vehicle_id: Option<&str>) {
        for session in self.sessions.values_mut() {
            if session.valid
                && session.user_id() == user_id
                && Some(session.vehicle_id.as_str()) == vehicle_id
            {
                tracing::info!("replacing session {} with a new handshake", session.id);
                session.invalidate();
            }
        }
        self.pending.retain(|_, h| !(h.user_id() == user_id && h.vehicle_id() == vehicle_id));
    }

    /// The host application came to the foreground.
    pub fn become_active(&mut self) {
        self.active = true;
    }

    /// The host application went away; nothing may stay live meanwhile.
    pub fn become_inactive(&mut self) {
        self.active = false;
        self.pending.clear();
        self.invalidate_all();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{all_permissions, Pki, NOW};
    use crate::vehicle::VehicleUnit;

    fn manager(pki: &Pki) -> SessionManager {
        SessionManager::new(&Config::default(), pki.anchors.clone())
    }

    fn vehicle(pki: &Pki) -> VehicleUnit {
        VehicleUnit::new(
            pki.vehicle.clone(),
            EccKeyPair::from_secret_bytes(pki.vehicle_key.curve(), &pki.vehicle_key.to_secret_bytes())
                .unwrap(),
            pki.anchors.clone(),
            Config::default().session_duration,
        )
    }

    fn handshake(
        pki: &Pki,
        manager: &mut SessionManager,
        unit: &mut VehicleUnit,
        now: OffsetDateTime,
    ) -> SessionId {
        let hello = manager
            .begin_handshake(&pki.user, &[], &pki.vehicle, &pki.user_key, now)
            .unwrap();
        let server = unit.accept_handshake(&hello, now).unwrap();
        manager.complete_handshake(&server, now).unwrap().id()
    }

    #[test]
    fn handshake_establishes_matching_keys() {
        let pki = Pki::new(all_permissions());
        let mut manager = manager(&pki);
        let mut unit = vehicle(&pki);
        let id = handshake(&pki, &mut manager, &mut unit, NOW);

        let client = manager.session(&id).unwrap();
        let server = unit.session(&id).unwrap();
        assert_eq!(
            client.key().unwrap().as_bytes(),
            server.key().unwrap().as_bytes()
        );
        assert_eq!(client.expires_at(), NOW + Duration::seconds(300));
    }

    #[test]
    fn independent_handshakes_never_share_a_key() {
        let pki = Pki::new(all_permissions());
        let mut manager = manager(&pki);
        let mut unit = vehicle(&pki);
        let mut keys = Vec::new();
        for _ in 0..16 {
            let id = handshake(&pki, &mut manager, &mut unit, NOW);
            keys.push(*manager.session(&id).unwrap().key().unwrap().as_bytes());
            // The previous session was replaced by the new handshake.
            manager.invalidate(&id);
        }
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 16);
    }

    #[test]
    fn new_handshake_replaces_live_session() {
        let pki = Pki::new(all_permissions());
        let mut manager = manager(&pki);
        let mut unit = vehicle(&pki);
        let first = handshake(&pki, &mut manager, &mut unit, NOW);
        let second = handshake(&pki, &mut manager, &mut unit, NOW);
        assert!(!manager.is_valid(&first, NOW));
        assert!(manager.is_valid(&second, NOW));
        assert_eq!(manager.live_session("alice", crate::test_support::VIN, NOW).unwrap().id(), second);
    }

    #[test]
    fn expiry_at_session_duration() {
        let pki = Pki::new(all_permissions());
        let mut manager = manager(&pki);
        let mut unit = vehicle(&pki);
        let id = handshake(&pki, &mut manager, &mut unit, NOW);
        assert!(manager.is_valid(&id, NOW + Duration::seconds(299)));
        assert!(!manager.is_valid(&id, NOW + Duration::seconds(300)));
        assert!(!manager.is_valid(&id, NOW + Duration::seconds(301)));
    }

    #[test]
    fn invalidate_is_idempotent() {
        let pki = Pki::new(all_permissions());
        let mut manager = manager(&pki);
        let mut unit = vehicle(&pki);
        let id = handshake(&pki, &mut manager, &mut unit, NOW);
        manager.invalidate(&id);
        manager.invalidate(&id);
        let session = manager.session(&id).unwrap();
        assert!(!session.is_valid(NOW));
        assert!(session.key().is_none());
    }

    #[test]
    fn invalid_certificate_short_circuits() {
        let pki = Pki::new(all_permissions());
        let mut manager = manager(&pki);
        let late = pki.user.not_after + Duration::seconds(1);
        let err = manager
            .begin_handshake(&pki.user, &[], &pki.vehicle, &pki.user_key, late)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidCertificate(_)));
        assert!(manager.pending.is_empty());

        // Vehicle certificate where the user certificate belongs.
        let err = manager
            .begin_handshake(&pki.vehicle, &[], &pki.vehicle, &pki.vehicle_key, NOW)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidCertificate(_)));
    }

    #[test]
    fn foreign_key_pair_is_rejected() {
        let pki = Pki::new(all_permissions());
        let mut manager = manager(&pki);
        let err = manager
            .begin_handshake(&pki.user, &[], &pki.vehicle, &pki.root_key, NOW)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidCertificate(_)));
    }

    #[test]
    fn late_server_hello_times_out() {
        let pki = Pki::new(all_permissions());
        let mut manager = manager(&pki);
        let mut unit = vehicle(&pki);
        let hello = manager
            .begin_handshake(&pki.user, &[], &pki.vehicle, &pki.user_key, NOW)
            .unwrap();
        let server = unit.accept_handshake(&hello, NOW).unwrap();
        let late = NOW + Config::default().handshake_timeout + Duration::seconds(1);
        assert_eq!(
            manager.complete_handshake(&server, late).unwrap_err(),
            HandshakeError::HandshakeTimeout
        );
        // The attempt is gone; a retry with the same hello is unknown.
        assert!(matches!(
            manager.complete_handshake(&server, NOW).unwrap_err(),
            HandshakeError::UnknownHandshake(_)
        ));
    }

    #[test]
    fn pending_handshakes_expire() {
        let pki = Pki::new(all_permissions());
        let mut manager = manager(&pki);
        let hello = manager
            .begin_handshake(&pki.user, &[], &pki.vehicle, &pki.user_key, NOW)
            .unwrap();
        assert!(manager.expire_handshakes(NOW).is_empty());
        let expired = manager.expire_handshakes(NOW + Duration::seconds(11));
        assert_eq!(expired, vec![(hello.session_id, HandshakeError::HandshakeTimeout)]);
    }

    #[test]
    fn forged_server_hello() {
        let pki = Pki::new(all_permissions());
        let mut manager = manager(&pki);
        let mut unit = vehicle(&pki);
        let hello = manager
            .begin_handshake(&pki.user, &[], &pki.vehicle, &pki.user_key, NOW)
            .unwrap();
        let mut server = unit.accept_handshake(&hello, NOW).unwrap();
        server.nonce[0] ^= 1;
        assert_eq!(
            manager.complete_handshake(&server, NOW).unwrap_err(),
            HandshakeError::PeerSignatureInvalid
        );
    }

    #[test]
    fn inactive_manager_refuses_handshakes() {
        let pki = Pki::new(all_permissions());
        let mut manager = manager(&pki);
        let mut unit = vehicle(&pki);
        let id = handshake(&pki, &mut manager, &mut unit, NOW);
        manager.become_inactive();
        assert!(!manager.is_valid(&id, NOW));
        assert_eq!(
            manager
                .begin_handshake(&pki.user, &[], &pki.vehicle, &pki.user_key, NOW)
                .unwrap_err(),
            HandshakeError::Inactive
        );
        manager.become_active();
        handshake(&pki, &mut manager, &mut unit, NOW);
    }
}
