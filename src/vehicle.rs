//! The vehicle end of the protocol.
//!
//! [VehicleUnit] answers handshakes and executes commands against a
//! simulated lock, engine and trunk. It re-checks everything the key
//! already checked: the key is not trusted to enforce its own permissions.
//! [SimulatedVehicle] exposes a unit as a [Radio] so a dispatcher can talk
//! to it in-process.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use time::{Duration, OffsetDateTime};

use crate::authority::{check_permission, validate_chain, TrustAnchorRegistry};
use crate::clock::Clock;
use crate::codec::{self, CodecError, Reply};
use crate::definitions::{
    Certificate, ClientHello, Command, CommandKind, CommandPacket, CommandResult, EccKeyPair,
    Frame, HandshakeRejected, ResponsePacket, ServerHello, VehicleStatus,
};
use crate::session::handshake::{
    derive_session_key, generate_nonce, EphemeralSecrets, HandshakeError, KeyContext,
};
use crate::session::{PkiSession, Role, SessionId, SessionParts};
use crate::transport::{DiscoveredDevice, LinkError, LinkEvent, Radio};

pub struct VehicleUnit {
    certificate: Certificate,
    key_pair: EccKeyPair,
    trust_anchors: TrustAnchorRegistry,
    session_duration: Duration,
    sessions: HashMap<SessionId, PkiSession>,
    status: VehicleStatus,
}

impl VehicleUnit {
    pub fn new(
        certificate: Certificate,
        key_pair: EccKeyPair,
        trust_anchors: TrustAnchorRegistry,
        session_duration: Duration,
    ) -> Self {
        Self {
            certificate,
            key_pair,
            trust_anchors,
            session_duration,
            sessions: HashMap::new(),
            status: VehicleStatus {
                locked: true,
                ..Default::default()
            },
        }
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn status(&self) -> VehicleStatus {
        self.status
    }

    pub fn session(&self, id: &SessionId) -> Option<&PkiSession> {
        self.sessions.get(id)
    }

    /// The key went out of range; nothing survives the link.
    pub fn link_lost(&mut self) {
        self.sessions.values_mut().for_each(PkiSession::invalidate);
        self.sessions.clear();
    }

    /// Validate a client hello and answer it, establishing a session.
    pub fn accept_handshake(
        &mut self,
        hello: &ClientHello,
        now: OffsetDateTime,
    ) -> Result<ServerHello, HandshakeError> {
        let Some(vehicle) = self.certificate.vehicle() else {
            return Err(HandshakeError::InvalidCertificate(
                "unit holds no vehicle certificate".to_string(),
            ));
        };
        let vehicle_id = vehicle.vehicle_id.clone();

        if self.sessions.contains_key(&hello.session_id) {
            tracing::warn!("client hello reuses session id {}", hello.session_id);
            return Err(HandshakeError::Rejected("session id already in use".to_string()));
        }

        let mut intermediates = hello.chain.clone();
        intermediates.push(self.certificate.clone());
        let outcome = validate_chain(&hello.certificate, &intermediates, &self.trust_anchors, now);
        if !outcome.success() {
            let reasons: Vec<String> = outcome.errors.iter().map(ToString::to_string).collect();
            return Err(HandshakeError::InvalidCertificate(reasons.join("; ")));
        }
        let Some(user) = hello.certificate.user() else {
            return Err(HandshakeError::InvalidCertificate(format!(
                "'{}' is not a user certificate",
                hello.certificate.subject
            )));
        };
        if !user.valid_for_vehicle(&vehicle_id) {
            return Err(HandshakeError::InvalidCertificate(format!(
                "user certificate '{}' is not valid for vehicle {vehicle_id}",
                hello.certificate.subject
            )));
        }
        hello
            .certificate
            .public_key
            .verify(&hello.tbs_bytes()?, &hello.signature)
            .map_err(|_| HandshakeError::PeerSignatureInvalid)?;

        let (ephemeral, server_key) = EphemeralSecrets::generate(hello.ephemeral_key.curve);
        let shared = ephemeral.diffie_hellman(&hello.ephemeral_key)?;
        let server_nonce = generate_nonce();
        let key = derive_session_key(
            &shared,
            &hello.nonce,
            &server_nonce,
            &KeyContext {
                session_id: &hello.session_id,
                user_key: &hello.certificate.public_key,
                vehicle_key: &self.certificate.public_key,
                client_ephemeral: &hello.ephemeral_key,
                server_ephemeral: &server_key,
            },
        )?;

        let mut reply = ServerHello {
            session_id: hello.session_id,
            nonce: server_nonce.clone(),
            ephemeral_key: server_key,
            signature: vec![],
        };
        reply.signature = self
            .key_pair
            .sign(&reply.tbs_bytes(&hello.nonce, &hello.ephemeral_key)?);

        // One session per user.
        let user_id = user.user_id.clone();
        self.sessions.retain(|_, s| s.user_id() != Some(user_id.as_str()));
        self.sessions.insert(
            hello.session_id,
            PkiSession::new(SessionParts {
                id: hello.session_id,
                role: Role::Vehicle,
                key,
                user_certificate: hello.certificate.clone(),
                vehicle_id,
                vehicle_key: self.certificate.public_key.clone(),
                client_nonce: hello.nonce.clone(),
                server_nonce,
                created_at: now,
                duration: self.session_duration,
            }),
        );
        tracing::info!("accepted session {} for user {user_id}", hello.session_id);
        Ok(reply)
    }

    /// Verify, execute and answer one command. Packets that fail
    /// verification get no answer.
    pub fn handle_command(
        &mut self,
        packet: &CommandPacket,
        now: OffsetDateTime,
    ) -> Option<ResponsePacket> {
        let Some(session) = self.sessions.get_mut(&packet.session_id) else {
            tracing::warn!("command for unknown session {}", packet.session_id);
            return None;
        };
        let signer = session.user_key().clone();
        let command = match codec::decode(packet, session, &signer, now) {
            Ok(command) => command,
            Err(e @ (CodecError::SignatureInvalid | CodecError::ReplayDetected(_))) => {
                tracing::warn!("dropping session {}: {e}", packet.session_id);
                session.invalidate();
                return None;
            }
            Err(e) => {
                tracing::warn!("ignoring command in session {}: {e}", packet.session_id);
                return None;
            }
        };

        let reply = execute(
            &mut self.status,
            &self.certificate,
            session.user_certificate(),
            &command,
        );
        match codec::encode_response(&reply, packet.nonce, session, &self.key_pair, now) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::error!("unable to answer command in session {}: {e}", packet.session_id);
                None
            }
        }
    }

    /// Process one inbound frame, returning the encoded answer if any.
    pub fn handle_frame(&mut self, bytes: &[u8], now: OffsetDateTime) -> Option<Vec<u8>> {
        let frame = match Frame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("undecodable frame: {e}");
                return None;
            }
        };
        let answer = match frame {
            Frame::ClientHello(hello) => match self.accept_handshake(&hello, now) {
                Ok(reply) => Frame::ServerHello(reply),
                Err(e) => {
                    tracing::warn!("rejecting handshake {}: {e}", hello.session_id);
                    Frame::HandshakeRejected(HandshakeRejected {
                        session_id: hello.session_id,
                        reason: e.to_string(),
                    })
                }
            },
            Frame::Command(packet) => Frame::Response(self.handle_command(&packet, now)?),
            other => {
                tracing::debug!("ignoring unexpected {}", other.name());
                return None;
            }
        };
        match answer.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::error!("unable to encode {}: {e}", answer.name());
                None
            }
        }
    }

    /// Re-sign a response frame with its success flag inverted.
    fn flip_outcome(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let Ok(Frame::Response(mut packet)) = Frame::from_bytes(bytes) else {
            return None;
        };
        packet.success = !packet.success;
        packet.signature = self.key_pair.sign(&packet.tbs_bytes().ok()?);
        Frame::Response(packet).to_bytes().ok()
    }
}

fn execute(
    status: &mut VehicleStatus,
    vehicle: &Certificate,
    user: &Certificate,
    command: &Command,
) -> Reply {
    let supported = vehicle
        .vehicle()
        .is_some_and(|v| v.capabilities.contains(&command.kind));
    if !supported {
        return Reply::Refused(format!("vehicle does not support {}", command.kind));
    }
    if !check_permission(user, command) {
        tracing::warn!("user '{}' may not {}", user.subject, command.kind);
        return Reply::Refused(format!("permission denied for {}", command.kind));
    }

    match command.kind {
        CommandKind::Unlock => status.locked = false,
        CommandKind::Lock => status.locked = true,
        CommandKind::StartEngine => status.engine_running = true,
        CommandKind::StopEngine => status.engine_running = false,
        CommandKind::OpenTrunk => status.trunk_open = true,
        CommandKind::Status => {}
    }
    tracing::info!("executed {} for '{}'", command.kind, user.subject);
    Reply::Completed(CommandResult {
        kind: command.kind,
        status: *status,
    })
}

struct Simulation<C> {
    unit: VehicleUnit,
    clock: C,
    advertisement: DiscoveredDevice,
    scanning: bool,
    advertised: bool,
    connected: bool,
    refuse: Option<LinkError>,
    silent: bool,
    outbox: VecDeque<LinkEvent>,
    last_answer: Option<Vec<u8>>,
    received: usize,
    misreport: bool,
}

/// A [VehicleUnit] behind an in-process radio.
///
/// Clones share the same vehicle, so a test can keep a handle for fault
/// injection while a dispatcher owns the radio.
pub struct SimulatedVehicle<C> {
    inner: Arc<Mutex<Simulation<C>>>,
}

impl<C> Clone for SimulatedVehicle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Clock> SimulatedVehicle<C> {
    pub fn new(unit: VehicleUnit, clock: C) -> Self {
        let advertisement = DiscoveredDevice {
            id: unit
                .certificate()
                .vehicle()
                .map(|v| v.device_id.clone())
                .unwrap_or_default(),
            name: Some(unit.certificate().subject.clone()),
            rssi: -55,
        };
        Self {
            inner: Arc::new(Mutex::new(Simulation {
                unit,
                clock,
                advertisement,
                scanning: false,
                advertised: false,
                connected: false,
                refuse: None,
                silent: false,
                outbox: VecDeque::new(),
                last_answer: None,
                received: 0,
                misreport: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Simulation<C>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn advertisement(&self) -> DiscoveredDevice {
        self.lock().advertisement.clone()
    }

    pub fn with_unit<T>(&self, f: impl FnOnce(&mut VehicleUnit) -> T) -> T {
        f(&mut self.lock().unit)
    }

    pub fn status(&self) -> VehicleStatus {
        self.lock().unit.status()
    }

    /// Frames the vehicle has received so far.
    pub fn received(&self) -> usize {
        self.lock().received
    }

    /// Swallow inbound frames without answering.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    pub fn refuse_next_connect(&self, error: LinkError) {
        self.lock().refuse = Some(error);
    }

    /// Deliver the previous answer again, as an attacker replaying it would.
    pub fn replay_last_answer(&self) {
        let mut sim = self.lock();
        if let Some(bytes) = sim.last_answer.clone() {
            sim.outbox.push_back(LinkEvent::Frame(bytes));
        }
    }

    /// Flip the success flag of the next response and sign it again, as a
    /// faulty vehicle firmware would.
    pub fn misreport_next_outcome(&self) {
        self.lock().misreport = true;
    }

    /// Deliver arbitrary bytes to the key.
    pub fn inject(&self, bytes: Vec<u8>) {
        self.lock().outbox.push_back(LinkEvent::Frame(bytes));
    }

    pub fn report_rssi(&self, rssi: i16) {
        self.lock().outbox.push_back(LinkEvent::Rssi(rssi));
    }

    /// Drop the link from the vehicle side.
    pub fn lose_link(&self) {
        let mut sim = self.lock();
        sim.connected = false;
        sim.unit.link_lost();
        sim.outbox.clear();
        sim.outbox.push_back(LinkEvent::Lost);
    }
}

impl<C: Clock> Radio for SimulatedVehicle<C> {
    fn start_scan(&mut self) -> Result<(), LinkError> {
        let mut sim = self.lock();
        sim.scanning = true;
        sim.advertised = false;
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.lock().scanning = false;
    }

    fn next_discovery(&mut self) -> Option<DiscoveredDevice> {
        let mut sim = self.lock();
        if !sim.scanning || sim.advertised {
            return None;
        }
        sim.advertised = true;
        Some(sim.advertisement.clone())
    }

    fn connect(&mut self, device: &DiscoveredDevice, _timeout: Duration) -> Result<(), LinkError> {
        let mut sim = self.lock();
        if let Some(error) = sim.refuse.take() {
            return Err(error);
        }
        if device.id != sim.advertisement.id {
            return Err(LinkError::Timeout);
        }
        sim.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut sim = self.lock();
        sim.connected = false;
        sim.unit.link_lost();
        sim.outbox.clear();
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut sim = self.lock();
        if !sim.connected {
            return Err(LinkError::Io("link is down".to_string()));
        }
        sim.received += 1;
        if sim.silent {
            return Ok(());
        }
        let now = sim.clock.now();
        if let Some(mut answer) = sim.unit.handle_frame(bytes, now) {
            if sim.misreport {
                if let Some(flipped) = sim.unit.flip_outcome(&answer) {
                    sim.misreport = false;
                    answer = flipped;
                }
            }
            sim.last_answer = Some(answer.clone());
            sim.outbox.push_back(LinkEvent::Frame(answer));
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        self.lock().outbox.pop_front()
    }
}
