//! Command dispatch over an established session.
//!
//! The [Dispatcher] owns the link and the session manager. Everything that
//! can wait (a server hello, a response) is bounded by a deadline that is
//! checked in [Dispatcher::poll]; nothing blocks and nothing is retried
//! automatically. A command whose outcome is unknown is reported as failed,
//! never assumed applied.
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::authority::check_permission;
use crate::codec::{self, CodecError, Reply};
use crate::config::Config;
use crate::definitions::{
    Certificate, Command, CommandKind, CommandResult, EccKeyPair, Frame, HandshakeRejected,
    ResponsePacket, ServerHello,
};
use crate::session::{HandshakeError, SessionId, SessionManager};
use crate::transport::{BleConnectionState, Connection, Radio, TransportError, TransportEvent};

/// Finished commands kept for [Dispatcher::command] lookups; older ones are
/// evicted first.
pub const FINISHED_COMMAND_LIMIT: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("certificate does not permit {0}")]
    PermissionDenied(CommandKind),
    #[error("not connected to the vehicle")]
    NotConnected,
    #[error("session expired")]
    SessionExpired,
    #[error("another command is already in flight on this session")]
    CommandInFlight,
    #[error("no response from the vehicle in time")]
    CommandTimeout,
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("vehicle refused the command: {0}")]
    VehicleRejected(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CommandHandle(pub Uuid);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Sent,
    Success(CommandResult),
    Failed(DispatchError),
}

impl CommandStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, CommandStatus::Success(_) | CommandStatus::Failed(_))
    }
}

/// A submitted command and its progress.
#[derive(Debug, Clone)]
pub struct BleCommand {
    pub handle: CommandHandle,
    pub session_id: SessionId,
    pub command: Command,
    /// Packet nonce, once encoded.
    pub nonce: Option<u64>,
    pub status: CommandStatus,
    pub submitted_at: OffsetDateTime,
    pub deadline: Option<OffsetDateTime>,
    /// The vehicle's answer to this command, once one arrived, whatever
    /// the outcome.
    pub response: Option<ResponsePacket>,
}

/// What the user interface needs to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notice", rename_all = "camelCase")]
pub enum Notice {
    #[serde(rename_all = "camelCase")]
    SessionEstablished {
        session_id: SessionId,
        #[serde(with = "time::serde::timestamp")]
        expires_at: OffsetDateTime,
    },
    #[serde(rename_all = "camelCase")]
    SessionNeedsReestablishment { session_id: SessionId, reason: String },
    #[serde(rename_all = "camelCase")]
    CommandSucceeded {
        handle: CommandHandle,
        result: CommandResult,
    },
    #[serde(rename_all = "camelCase")]
    CommandFailed {
        handle: CommandHandle,
        kind: CommandKind,
        reason: String,
    },
    ConnectionLost,
}

pub struct Dispatcher<R> {
    connection: Connection<R>,
    sessions: SessionManager,
    command_timeout: Duration,
    commands: HashMap<CommandHandle, BleCommand>,
    /// Finished commands, oldest first.
    finished: VecDeque<CommandHandle>,
    in_flight: HashMap<SessionId, CommandHandle>,
    /// Sessions and handshakes carried by the current link.
    on_link: HashSet<SessionId>,
    /// Sessions announced as established and not yet retired.
    live: HashSet<SessionId>,
    notices: Vec<Notice>,
}

impl<R: Radio> Dispatcher<R> {
    pub fn new(connection: Connection<R>, sessions: SessionManager, config: &Config) -> Self {
        Self {
            connection,
            sessions,
            command_timeout: config.command_timeout,
            commands: HashMap::new(),
            finished: VecDeque::new(),
            in_flight: HashMap::new(),
            on_link: HashSet::new(),
            live: HashSet::new(),
            notices: Vec::new(),
        }
    }

    pub fn connection(&self) -> &Connection<R> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection<R> {
        &mut self.connection
    }

    pub fn connection_state(&self) -> BleConnectionState {
        self.connection.state()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn command(&self, handle: &CommandHandle) -> Option<&BleCommand> {
        self.commands.get(handle)
    }

    pub fn in_flight(&self, session_id: &SessionId) -> Option<&BleCommand> {
        self.in_flight
            .get(session_id)
            .and_then(|handle| self.commands.get(handle))
    }

    /// Send a client hello. The session becomes usable once the answer
    /// arrives through [Dispatcher::poll].
    pub fn establish_session(
        &mut self,
        user_certificate: &Certificate,
        chain: &[Certificate],
        vehicle_certificate: &Certificate,
        key_pair: &EccKeyPair,
        now: OffsetDateTime,
    ) -> Result<SessionId, DispatchError> {
        if !self.connection.is_connected() {
            return Err(DispatchError::NotConnected);
        }
        let hello = self.sessions.begin_handshake(
            user_certificate,
            chain,
            vehicle_certificate,
            key_pair,
            now,
        )?;
        let session_id = hello.session_id;
        // The handshake may have replaced an older session.
        self.retire_dead_sessions(now, "replaced by a new session");

        let bytes = Frame::ClientHello(hello).to_bytes().map_err(CodecError::from)?;
        if let Err(e) = self.connection.send(&bytes) {
            self.sessions.cancel_handshake(&session_id);
            return Err(e.into());
        }
        self.on_link.insert(session_id);
        Ok(session_id)
    }

    /// Encode and send one command.
    ///
    /// Checks run in a fixed order: permission, link, session validity,
    /// in-flight slot. Nothing is sent unless all pass.
    pub fn submit(
        &mut self,
        command: Command,
        session_id: SessionId,
        signer: &EccKeyPair,
        now: OffsetDateTime,
    ) -> Result<CommandHandle, DispatchError> {
        let session = self
            .sessions
            .session(&session_id)
            .ok_or(DispatchError::UnknownSession(session_id))?;
        if !check_permission(session.user_certificate(), &command) {
            tracing::info!("{} refused locally: no permission", command.kind);
            return Err(DispatchError::PermissionDenied(command.kind));
        }
        if !self.connection.is_connected() {
            return Err(DispatchError::NotConnected);
        }
        if !session.is_valid(now) {
            return Err(DispatchError::SessionExpired);
        }
        if self.in_flight.contains_key(&session_id) {
            return Err(DispatchError::CommandInFlight);
        }

        let handle = CommandHandle(Uuid::new_v4());
        let mut record = BleCommand {
            handle,
            session_id,
            command,
            nonce: None,
            status: CommandStatus::Pending,
            submitted_at: now,
            deadline: None,
            response: None,
        };

        let session = self
            .sessions
            .session_mut(&session_id)
            .ok_or(DispatchError::UnknownSession(session_id))?;
        let packet = codec::encode(&record.command, session, signer, now)?;
        let bytes = Frame::Command(packet.clone())
            .to_bytes()
            .map_err(CodecError::from)?;

        record.nonce = Some(packet.nonce);
        record.status = CommandStatus::Sent;
        self.connection.send(&bytes)?;
        record.deadline = Some(now + self.command_timeout);

        tracing::info!(
            "sent {} as nonce {} in session {session_id}",
            record.command.kind,
            packet.nonce
        );
        self.in_flight.insert(session_id, handle);
        self.commands.insert(handle, record);
        Ok(handle)
    }

    /// Pump the link and enforce deadlines.
    pub fn poll(&mut self, now: OffsetDateTime) -> Vec<Notice> {
        while let Some(event) = self.connection.poll() {
            match event {
                TransportEvent::Frame(bytes) => self.handle_frame(&bytes, now),
                TransportEvent::QualityChanged(quality) => {
                    tracing::debug!("signal quality now {quality}");
                }
                TransportEvent::LinkLost => self.link_down("link lost"),
            }
        }

        for (session_id, error) in self.sessions.expire_handshakes(now) {
            self.on_link.remove(&session_id);
            self.notices.push(Notice::SessionNeedsReestablishment {
                session_id,
                reason: error.to_string(),
            });
        }

        let timed_out: Vec<CommandHandle> = self
            .in_flight
            .values()
            .filter(|handle| {
                self.commands
                    .get(*handle)
                    .and_then(|c| c.deadline)
                    .is_some_and(|deadline| now >= deadline)
            })
            .copied()
            .collect();
        for handle in timed_out {
            tracing::warn!("command {} timed out", handle.0);
            self.finish(handle, CommandStatus::Failed(DispatchError::CommandTimeout));
        }

        self.retire_dead_sessions(now, "session expired");
        for session_id in self.sessions.prune(now) {
            self.on_link.remove(&session_id);
        }
        std::mem::take(&mut self.notices)
    }

    /// Close the link. Everything bound to it is invalidated.
    pub fn disconnect(&mut self) {
        if self.connection.disconnect() {
            self.link_down("disconnected");
        }
    }

    /// End a session on request; its outstanding command fails.
    pub fn end_session(&mut self, session_id: &SessionId) {
        self.sessions.invalidate(session_id);
        self.live.remove(session_id);
        self.on_link.remove(session_id);
        if let Some(handle) = self.in_flight.get(session_id).copied() {
            self.finish(handle, CommandStatus::Failed(DispatchError::SessionExpired));
        }
    }

    pub fn become_active(&mut self) {
        self.sessions.become_active();
    }

    pub fn become_inactive(&mut self) {
        self.disconnect();
        for session_id in self.live.drain().collect::<Vec<_>>() {
            if let Some(handle) = self.in_flight.get(&session_id).copied() {
                self.finish(handle, CommandStatus::Failed(DispatchError::SessionExpired));
            }
        }
        self.sessions.become_inactive();
    }

    fn handle_frame(&mut self, bytes: &[u8], now: OffsetDateTime) {
        match Frame::from_bytes(bytes) {
            Ok(Frame::ServerHello(hello)) => self.on_server_hello(&hello, now),
            Ok(Frame::HandshakeRejected(rejected)) => self.on_rejected(&rejected),
            Ok(Frame::Response(packet)) => self.on_response(&packet, now),
            Ok(other) => tracing::debug!("ignoring unexpected {}", other.name()),
            Err(e) => tracing::warn!("undecodable frame: {e}"),
        }
    }

    fn on_server_hello(&mut self, hello: &ServerHello, now: OffsetDateTime) {
        match self.sessions.complete_handshake(hello, now) {
            Ok(session) => {
                let (session_id, expires_at) = (session.id(), session.expires_at());
                self.live.insert(session_id);
                self.notices.push(Notice::SessionEstablished {
                    session_id,
                    expires_at,
                });
            }
            Err(HandshakeError::UnknownHandshake(id)) => {
                tracing::debug!("server hello for unknown handshake {id}");
            }
            Err(e) => {
                self.on_link.remove(&hello.session_id);
                self.notices.push(Notice::SessionNeedsReestablishment {
                    session_id: hello.session_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_rejected(&mut self, rejected: &HandshakeRejected) {
        let error = self.sessions.reject_handshake(rejected);
        if let HandshakeError::UnknownHandshake(_) = error {
            return;
        }
        self.on_link.remove(&rejected.session_id);
        self.notices.push(Notice::SessionNeedsReestablishment {
            session_id: rejected.session_id,
            reason: error.to_string(),
        });
    }

    fn on_response(&mut self, packet: &ResponsePacket, now: OffsetDateTime) {
        let session_id = packet.session_id;
        let Some(session) = self.sessions.session_mut(&session_id) else {
            tracing::debug!("response for unknown session {session_id}");
            return;
        };
        let signer = session.vehicle_key().clone();
        let reply = codec::decode_response(packet, session, &signer, now);

        let waiting = self
            .in_flight
            .get(&session_id)
            .copied()
            .filter(|handle| {
                self.commands
                    .get(handle)
                    .is_some_and(|c| c.nonce == Some(packet.request_nonce))
            });

        match reply {
            Err(e @ (CodecError::ReplayDetected(_) | CodecError::SignatureInvalid)) => {
                tracing::warn!("invalidating session {session_id}: {e}");
                self.sessions.invalidate(&session_id);
                if let Some(handle) = self.in_flight.get(&session_id).copied() {
                    self.finish(handle, CommandStatus::Failed(e.clone().into()));
                }
                self.retire(session_id, e.to_string());
            }
            Err(CodecError::DecryptionFailed) => {
                tracing::warn!("dropping undecryptable response in session {session_id}");
            }
            reply => {
                let Some(handle) = waiting else {
                    tracing::warn!(
                        "unsolicited response to nonce {} in session {session_id}",
                        packet.request_nonce
                    );
                    return;
                };
                if let Some(record) = self.commands.get_mut(&handle) {
                    record.response = Some(packet.clone());
                }
                let status = match reply {
                    Ok(Reply::Completed(result)) => CommandStatus::Success(result),
                    Ok(Reply::Refused(reason)) => {
                        CommandStatus::Failed(DispatchError::VehicleRejected(reason))
                    }
                    Err(e) => {
                        tracing::warn!("unusable response in session {session_id}: {e}");
                        CommandStatus::Failed(e.into())
                    }
                };
                self.finish(handle, status);
            }
        }
    }

    fn finish(&mut self, handle: CommandHandle, status: CommandStatus) {
        let Some(record) = self.commands.get_mut(&handle) else {
            return;
        };
        if record.status.is_finished() {
            return;
        }
        self.in_flight.remove(&record.session_id);
        let notice = match &status {
            CommandStatus::Success(result) => Notice::CommandSucceeded {
                handle,
                result: result.clone(),
            },
            CommandStatus::Failed(error) => Notice::CommandFailed {
                handle,
                kind: record.command.kind,
                reason: error.to_string(),
            },
            CommandStatus::Pending | CommandStatus::Sent => return,
        };
        record.status = status;
        self.notices.push(notice);

        self.finished.push_back(handle);
        while self.finished.len() > FINISHED_COMMAND_LIMIT {
            if let Some(oldest) = self.finished.pop_front() {
                self.commands.remove(&oldest);
            }
        }
    }

    fn retire(&mut self, session_id: SessionId, reason: String) {
        self.on_link.remove(&session_id);
        if self.live.remove(&session_id) {
            self.notices
                .push(Notice::SessionNeedsReestablishment { session_id, reason });
        }
    }

    fn retire_dead_sessions(&mut self, now: OffsetDateTime, reason: &str) {
        let dead: Vec<SessionId> = self
            .live
            .iter()
            .filter(|id| !self.sessions.is_valid(id, now))
            .copied()
            .collect();
        for session_id in dead {
            if let Some(handle) = self.in_flight.get(&session_id).copied() {
                self.finish(handle, CommandStatus::Failed(DispatchError::SessionExpired));
            }
            self.retire(session_id, reason.to_string());
        }
    }

    fn link_down(&mut self, reason: &str) {
        let outstanding: Vec<CommandHandle> = self.in_flight.values().copied().collect();
        for handle in outstanding {
            self.finish(handle, CommandStatus::Failed(DispatchError::NotConnected));
        }
        self.sessions.abort_handshakes();
        for session_id in self.on_link.drain().collect::<Vec<_>>() {
            self.sessions.invalidate(&session_id);
            if self.live.remove(&session_id) {
                self.notices.push(Notice::SessionNeedsReestablishment {
                    session_id,
                    reason: reason.to_string(),
                });
            }
        }
        self.notices.push(Notice::ConnectionLost);
    }
}
