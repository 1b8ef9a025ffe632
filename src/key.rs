//! The phone-side digital key.
//!
//! [DigitalKey] wires storage, the clock and the dispatcher together so a
//! host application only deals with devices, sessions, commands and
//! notices. The private key is loaded from the store for each operation
//! that signs and dropped right after.
use time::Duration;

use crate::authority::TrustAnchorRegistry;
use crate::clock::Clock;
use crate::config::Config;
use crate::definitions::Command;
use crate::dispatch::{BleCommand, CommandHandle, DispatchError, Dispatcher, Notice};
use crate::session::{SessionId, SessionManager};
use crate::storage::{Credentials, SecureStore, StorageError};
use crate::transport::{
    BleConnectionState, Connection, DiscoveredDevice, Radio, TransportError,
};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("digital key is inactive")]
    Inactive,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct DigitalKey<R, S, C> {
    dispatcher: Dispatcher<R>,
    credentials: Credentials<S>,
    clock: C,
    config: Config,
    active: bool,
}

impl<R: Radio, S: SecureStore, C: Clock> DigitalKey<R, S, C> {
    pub fn new(
        radio: R,
        store: S,
        clock: C,
        config: Config,
        trust_anchors: TrustAnchorRegistry,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            Connection::new(radio),
            SessionManager::new(&config, trust_anchors),
            &config,
        );
        Self {
            dispatcher,
            credentials: Credentials::new(store, &config),
            clock,
            config,
            active: true,
        }
    }

    pub fn credentials(&self) -> &Credentials<S> {
        &self.credentials
    }

    pub fn dispatcher(&self) -> &Dispatcher<R> {
        &self.dispatcher
    }

    fn ensure_active(&self) -> Result<(), KeyError> {
        if self.active {
            Ok(())
        } else {
            Err(KeyError::Inactive)
        }
    }

    /// Look for advertising vehicles for up to `window`. Advertisements
    /// are collected with [DigitalKey::discoveries].
    pub fn start_scan(&mut self, window: Duration) -> Result<(), KeyError> {
        self.ensure_active()?;
        let now = self.clock.now();
        self.dispatcher.connection_mut().start_scan(window, now)?;
        Ok(())
    }

    /// Advertisements that arrived since the last call. The scan keeps
    /// running until its window elapses, [DigitalKey::stop_scan], or a
    /// connection attempt.
    pub fn discoveries(&mut self) -> Vec<DiscoveredDevice> {
        let now = self.clock.now();
        let connection = self.dispatcher.connection_mut();
        std::iter::from_fn(|| connection.poll_scan(now)).collect()
    }

    pub fn is_scanning(&self) -> bool {
        self.dispatcher.connection().is_scanning()
    }

    pub fn stop_scan(&mut self) {
        self.dispatcher.connection_mut().stop_scan();
    }

    pub fn connect(&mut self, device: &DiscoveredDevice) -> Result<(), KeyError> {
        self.ensure_active()?;
        let now = self.clock.now();
        self.dispatcher
            .connection_mut()
            .connect(device, self.config.connect_timeout, now)?;
        Ok(())
    }

    /// Start a handshake with the vehicle named in the stored certificate
    /// bundle. Watch [DigitalKey::poll] for the outcome.
    pub fn establish_session(&mut self) -> Result<SessionId, KeyError> {
        self.ensure_active()?;
        let bundle = self.credentials.load_certificates()?;
        let key_pair = self.credentials.load_key_pair()?;
        let session_id = self.dispatcher.establish_session(
            &bundle.user,
            &bundle.chain,
            &bundle.vehicle,
            &key_pair,
            self.clock.now(),
        )?;
        Ok(session_id)
    }

    pub fn send(
        &mut self,
        command: Command,
        session_id: SessionId,
    ) -> Result<CommandHandle, KeyError> {
        self.ensure_active()?;
        let key_pair = self.credentials.load_key_pair()?;
        let handle = self
            .dispatcher
            .submit(command, session_id, &key_pair, self.clock.now())?;
        Ok(handle)
    }

    pub fn poll(&mut self) -> Vec<Notice> {
        self.dispatcher.poll(self.clock.now())
    }

    pub fn command(&self, handle: &CommandHandle) -> Option<&BleCommand> {
        self.dispatcher.command(handle)
    }

    pub fn is_session_valid(&self, session_id: &SessionId) -> bool {
        self.dispatcher
            .sessions()
            .is_valid(session_id, self.clock.now())
    }

    pub fn connection_state(&self) -> BleConnectionState {
        self.dispatcher.connection_state()
    }

    pub fn disconnect(&mut self) {
        self.dispatcher.disconnect();
    }

    pub fn end_session(&mut self, session_id: &SessionId) {
        self.dispatcher.end_session(session_id);
    }

    pub fn become_active(&mut self) {
        tracing::info!("digital key active");
        self.active = true;
        self.dispatcher.become_active();
    }

    /// Drop the link and every session; operations fail until
    /// [DigitalKey::become_active].
    pub fn become_inactive(&mut self) {
        tracing::info!("digital key inactive");
        self.active = false;
        self.dispatcher.become_inactive();
    }
}
