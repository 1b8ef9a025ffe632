//! An in-memory [Radio] for tests and demos.
//!
//! Clones share state, so a test can keep a handle while the connection
//! owns the radio.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use time::Duration;

use super::{DiscoveredDevice, LinkError, LinkEvent, Radio};

#[derive(Debug, Default)]
struct State {
    advertisements: VecDeque<DiscoveredDevice>,
    scanning: bool,
    connected: Option<String>,
    next_connect: Option<LinkError>,
    sent: Vec<Vec<u8>>,
    events: VecDeque<LinkEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct MockRadio(Arc<Mutex<State>>);

impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn advertise(&self, device: DiscoveredDevice) {
        self.state().advertisements.push_back(device);
    }

    pub fn fail_next_connect(&self, error: LinkError) {
        self.state().next_connect = Some(error);
    }

    pub fn push_event(&self, event: LinkEvent) {
        self.state().events.push_back(event);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state().sent)
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    pub fn connected_to(&self) -> Option<String> {
        self.state().connected.clone()
    }
}

impl Radio for MockRadio {
    fn start_scan(&mut self) -> Result<(), LinkError> {
        self.state().scanning = true;
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.state().scanning = false;
    }

    fn next_discovery(&mut self) -> Option<DiscoveredDevice> {
        let mut state = self.state();
        if !state.scanning {
            return None;
        }
        state.advertisements.pop_front()
    }

    fn connect(&mut self, device: &DiscoveredDevice, _timeout: Duration) -> Result<(), LinkError> {
        let mut state = self.state();
        if let Some(error) = state.next_connect.take() {
            return Err(error);
        }
        state.connected = Some(device.id.clone());
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state().connected = None;
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut state = self.state();
        if state.connected.is_none() {
            return Err(LinkError::Io("not connected".into()));
        }
        state.sent.push(bytes.to_vec());
        Ok(())
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        let mut state = self.state();
        let event = state.events.pop_front();
        if event == Some(LinkEvent::Lost) {
            state.connected = None;
        }
        event
    }
}
