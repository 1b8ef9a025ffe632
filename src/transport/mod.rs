//! The link to the vehicle.
//!
//! [Connection] wraps a [Radio] byte pipe with an explicit state machine and
//! a signal quality estimate. It knows nothing about sessions; the
//! dispatcher reacts to [TransportEvent::LinkLost] by invalidating whatever
//! was bound to the link.
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::clock::Clock;

pub mod quality;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use quality::{QualitySampler, SignalQuality};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: Option<String>,
    pub rssi: i16,
}

/// Failures reported by a [Radio].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("timed out")]
    Timeout,
    #[error("refused: {0}")]
    Refused(String),
    #[error("radio error: {0}")]
    Io(String),
}

/// Something that happened on the link since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(Vec<u8>),
    Rssi(i16),
    Lost,
}

/// A radio byte pipe, e.g. a BLE GATT characteristic pair.
///
/// Calls never block past the timeout they are given; incoming data is
/// pulled with [Radio::poll_event].
pub trait Radio {
    fn start_scan(&mut self) -> Result<(), LinkError>;
    fn stop_scan(&mut self);
    /// The next advertisement seen during the current scan, if any.
    fn next_discovery(&mut self) -> Option<DiscoveredDevice>;
    fn connect(&mut self, device: &DiscoveredDevice, timeout: Duration) -> Result<(), LinkError>;
    fn disconnect(&mut self);
    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError>;
    fn poll_event(&mut self) -> Option<LinkEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    /// Still connected, but the signal is poor.
    Degraded,
}

impl ConnectionStatus {
    pub fn can_transition(self, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, to),
            (Disconnected, Scanning)
                | (Disconnected, Connecting)
                | (Scanning, Connecting)
                | (Scanning, Disconnected)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Degraded)
                | (Degraded, Connected)
                | (Connected | Degraded, Disconnected)
        )
    }

    pub fn is_linked(self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Degraded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
pub enum TransportError {
    #[error("connection attempt timed out")]
    ConnectionTimeout,
    #[error("vehicle refused the connection: {0}")]
    ConnectionRefused(String),
    #[error("not connected to a vehicle")]
    NotConnected,
    #[error("connection cannot move from {from} to {to}")]
    InvalidTransition {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    #[error("link failure: {0}")]
    Link(String),
}

/// What [Connection::poll] surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Vec<u8>),
    QualityChanged(SignalQuality),
    LinkLost,
}

/// Snapshot for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BleConnectionState {
    pub status: ConnectionStatus,
    pub device: Option<DiscoveredDevice>,
    pub rssi: Option<i16>,
    pub quality: SignalQuality,
    /// Vehicles seen by the most recent scan, one entry per device.
    pub discovered: Vec<DiscoveredDevice>,
    #[serde(with = "time::serde::timestamp::option")]
    pub last_connected: Option<OffsetDateTime>,
    pub last_error: Option<TransportError>,
}

pub struct Connection<R> {
    radio: R,
    status: ConnectionStatus,
    device: Option<DiscoveredDevice>,
    quality: QualitySampler,
    discovered: Vec<DiscoveredDevice>,
    /// Set exactly while scanning.
    scan_deadline: Option<OffsetDateTime>,
    last_connected: Option<OffsetDateTime>,
    last_error: Option<TransportError>,
}

impl<R: Radio> Connection<R> {
    pub fn new(radio: R) -> Self {
        Self {
            radio,
            status: ConnectionStatus::Disconnected,
            device: None,
            quality: QualitySampler::new(),
            discovered: Vec::new(),
            scan_deadline: None,
            last_connected: None,
            last_error: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_linked()
    }

    pub fn device(&self) -> Option<&DiscoveredDevice> {
        self.device.as_ref()
    }

    pub fn is_scanning(&self) -> bool {
        self.status == ConnectionStatus::Scanning
    }

    pub fn discovered(&self) -> &[DiscoveredDevice] {
        &self.discovered
    }

    pub fn state(&self) -> BleConnectionState {
        BleConnectionState {
            status: self.status,
            device: self.device.clone(),
            rssi: self.quality.average(),
            quality: self.quality.quality(),
            discovered: self.discovered.clone(),
            last_connected: self.last_connected,
            last_error: self.last_error.clone(),
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    fn transition(&mut self, to: ConnectionStatus) -> Result<(), TransportError> {
        if !self.status.can_transition(to) {
            return Err(TransportError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        tracing::debug!("connection: {} -> {}", self.status, to);
        self.status = to;
        Ok(())
    }

    /// Start scanning until `timeout` passes. A scan already in progress is
    /// restarted and the discovered set cleared.
    pub fn start_scan(&mut self, timeout: Duration, now: OffsetDateTime) -> Result<(), TransportError> {
        if self.is_scanning() {
            self.radio.stop_scan();
            self.scan_deadline = None;
            self.transition(ConnectionStatus::Disconnected)?;
        }
        self.transition(ConnectionStatus::Scanning)?;
        if let Err(e) = self.radio.start_scan() {
            self.status = ConnectionStatus::Disconnected;
            return Err(self.failed(TransportError::Link(e.to_string())));
        }
        self.discovered.clear();
        self.scan_deadline = Some(now + timeout);
        Ok(())
    }

    /// The next advertisement that has arrived, if any.
    ///
    /// `None` only means nothing new yet while [Connection::is_scanning]
    /// holds. The scan ends at its deadline, on [Connection::stop_scan], or
    /// when a connection attempt starts.
    pub fn poll_scan(&mut self, now: OffsetDateTime) -> Option<DiscoveredDevice> {
        let deadline = self.scan_deadline?;
        if now >= deadline {
            tracing::debug!("scan window elapsed");
            self.stop_scan();
            return None;
        }
        let device = self.radio.next_discovery()?;
        match self.discovered.iter_mut().find(|seen| seen.id == device.id) {
            Some(seen) => *seen = device.clone(),
            None => self.discovered.push(device.clone()),
        }
        Some(device)
    }

    /// Cancel a scan in progress; a no-op otherwise.
    pub fn stop_scan(&mut self) {
        self.scan_deadline = None;
        if self.is_scanning() {
            self.radio.stop_scan();
            self.status = ConnectionStatus::Disconnected;
        }
    }

    /// Scan for `timeout`, iterating over advertisements as they arrive.
    /// Dropping the iterator cancels the scan.
    pub fn scan<'a, C: Clock>(
        &'a mut self,
        timeout: Duration,
        clock: &'a C,
    ) -> Result<Scan<'a, R, C>, TransportError> {
        self.start_scan(timeout, clock.now())?;
        Ok(Scan {
            connection: self,
            clock,
        })
    }

    pub fn connect(
        &mut self,
        device: &DiscoveredDevice,
        timeout: Duration,
        now: OffsetDateTime,
    ) -> Result<(), TransportError> {
        if self.is_scanning() {
            self.radio.stop_scan();
        }
        self.scan_deadline = None;
        self.transition(ConnectionStatus::Connecting)?;
        tracing::info!("connecting to {}", device.id);

        match self.radio.connect(device, timeout) {
            Ok(()) => {
                self.quality.reset();
                self.quality.record(device.rssi);
                self.device = Some(device.clone());
                self.transition(ConnectionStatus::Connected)?;
                self.last_connected = Some(now);
                self.apply_quality();
                Ok(())
            }
            Err(e) => {
                tracing::warn!("connection to {} failed: {e}", device.id);
                self.status = ConnectionStatus::Disconnected;
                Err(self.failed(match e {
                    LinkError::Timeout => TransportError::ConnectionTimeout,
                    LinkError::Refused(reason) => TransportError::ConnectionRefused(reason),
                    LinkError::Io(reason) => TransportError::Link(reason),
                }))
            }
        }
    }

    fn failed(&mut self, error: TransportError) -> TransportError {
        self.last_error = Some(error.clone());
        error
    }

    /// Tear down whatever is in progress. Returns whether a link was up.
    pub fn disconnect(&mut self) -> bool {
        let was_linked = self.status.is_linked();
        match self.status {
            ConnectionStatus::Disconnected => return false,
            ConnectionStatus::Scanning => self.radio.stop_scan(),
            ConnectionStatus::Connecting
            | ConnectionStatus::Connected
            | ConnectionStatus::Degraded => self.radio.disconnect(),
        }
        if let Some(device) = self.device.take() {
            tracing::info!("disconnected from {}", device.id);
        }
        self.scan_deadline = None;
        self.status = ConnectionStatus::Disconnected;
        self.quality.reset();
        was_linked
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.status.is_linked() {
            return Err(TransportError::NotConnected);
        }
        self.radio
            .send(bytes)
            .map_err(|e| TransportError::Link(e.to_string()))
    }

    /// Next notable event on the link. RSSI samples that do not change the
    /// quality bucket are absorbed.
    pub fn poll(&mut self) -> Option<TransportEvent> {
        if !self.status.is_linked() {
            return None;
        }
        while let Some(event) = self.radio.poll_event() {
            match event {
                LinkEvent::Frame(bytes) => return Some(TransportEvent::Frame(bytes)),
                LinkEvent::Rssi(rssi) => {
                    if let Some(quality) = self.record_rssi(rssi) {
                        return Some(TransportEvent::QualityChanged(quality));
                    }
                }
                LinkEvent::Lost => {
                    tracing::warn!(
                        "link to {} lost",
                        self.device.as_ref().map(|d| d.id.as_str()).unwrap_or("<unknown>")
                    );
                    self.device = None;
                    self.quality.reset();
                    self.status = ConnectionStatus::Disconnected;
                    self.failed(TransportError::Link("link lost".to_string()));
                    return Some(TransportEvent::LinkLost);
                }
            }
        }
        None
    }

    /// Feed one RSSI sample. Returns the new quality if it changed bucket.
    pub fn record_rssi(&mut self, rssi: i16) -> Option<SignalQuality> {
        if !self.status.is_linked() {
            return None;
        }
        let before = self.quality.quality();
        let after = self.quality.record(rssi);
        self.apply_quality();
        (before != after).then_some(after)
    }

    /// Poor signal degrades the link but never drops it.
    fn apply_quality(&mut self) {
        let poor = self.quality.quality() == SignalQuality::Poor;
        let to = match (self.status, poor) {
            (ConnectionStatus::Connected, true) => ConnectionStatus::Degraded,
            (ConnectionStatus::Degraded, false) => ConnectionStatus::Connected,
            _ => return,
        };
        // Connected <-> Degraded is always allowed.
        let _ = self.transition(to);
    }
}

/// Advertisements seen during one scan. Dropping it stops the scan.
///
/// Not fused: `None` means nothing has arrived yet, and a later call may
/// yield more until [Scan::is_finished].
pub struct Scan<'a, R: Radio, C: Clock> {
    connection: &'a mut Connection<R>,
    clock: &'a C,
}

impl<R: Radio, C: Clock> Scan<'_, R, C> {
    pub fn is_finished(&self) -> bool {
        !self.connection.is_scanning()
    }

    pub fn cancel(&mut self) {
        self.connection.stop_scan();
    }
}

impl<R: Radio, C: Clock> Iterator for Scan<'_, R, C> {
    type Item = DiscoveredDevice;

    fn next(&mut self) -> Option<Self::Item> {
        self.connection.poll_scan(self.clock.now())
    }
}

impl<R: Radio, C: Clock> Drop for Scan<'_, R, C> {
    fn drop(&mut self) {
        self.connection.stop_scan();
    }
}

#[cfg(test)]
mod test {
    use super::testing::MockRadio;
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::NOW;

    fn device(id: &str, rssi: i16) -> DiscoveredDevice {
        DiscoveredDevice {
            id: id.into(),
            name: Some("Test Vehicle".into()),
            rssi,
        }
    }

    #[test]
    fn scan_yields_devices_and_stops_on_drop() {
        let radio = MockRadio::new();
        radio.advertise(device("a", -50));
        radio.advertise(device("b", -70));
        let clock = ManualClock::new(NOW);
        let mut connection = Connection::new(radio.clone());

        let first = connection
            .scan(Duration::seconds(5), &clock)
            .unwrap()
            .next()
            .unwrap();
        assert_eq!(first.id, "a");
        assert!(!radio.is_scanning());
        assert_eq!(connection.status(), ConnectionStatus::Disconnected);

        // Restartable.
        let rest: Vec<_> = connection.scan(Duration::seconds(5), &clock).unwrap().collect();
        assert_eq!(rest, vec![device("b", -70)]);
    }

    #[test]
    fn scan_waits_for_late_advertisements() {
        let radio = MockRadio::new();
        let clock = ManualClock::new(NOW);
        let mut connection = Connection::new(radio.clone());

        let mut scan = connection.scan(Duration::seconds(10), &clock).unwrap();
        assert!(scan.next().is_none());
        assert!(!scan.is_finished());

        radio.advertise(device("late", -60));
        clock.advance(Duration::seconds(1));
        assert_eq!(scan.next(), Some(device("late", -60)));

        clock.advance(Duration::seconds(9));
        assert!(scan.next().is_none());
        assert!(scan.is_finished());
        drop(scan);

        assert!(!radio.is_scanning());
        assert_eq!(connection.status(), ConnectionStatus::Disconnected);
        assert_eq!(connection.state().discovered, vec![device("late", -60)]);
    }

    #[test]
    fn cancelled_scan_ignores_later_advertisements() {
        let radio = MockRadio::new();
        let clock = ManualClock::new(NOW);
        let mut connection = Connection::new(radio.clone());
        let mut scan = connection.scan(Duration::seconds(10), &clock).unwrap();
        scan.cancel();
        radio.advertise(device("a", -50));
        assert!(scan.next().is_none());
        assert!(scan.is_finished());
    }

    #[test]
    fn state_records_connects_and_failures() {
        let radio = MockRadio::new();
        let mut connection = Connection::new(radio.clone());

        radio.fail_next_connect(LinkError::Refused("busy".into()));
        assert!(connection
            .connect(&device("a", -50), Duration::seconds(1), NOW)
            .is_err());
        let state = connection.state();
        assert_eq!(state.last_connected, None);
        assert_eq!(
            state.last_error,
            Some(TransportError::ConnectionRefused("busy".into()))
        );

        let later = NOW + Duration::seconds(3);
        connection
            .connect(&device("a", -50), Duration::seconds(1), later)
            .unwrap();
        assert_eq!(radio.connected_to().as_deref(), Some("a"));
        assert_eq!(connection.state().last_connected, Some(later));

        radio.push_event(LinkEvent::Lost);
        assert_eq!(connection.poll(), Some(TransportEvent::LinkLost));
        assert!(matches!(
            connection.state().last_error,
            Some(TransportError::Link(_))
        ));
        assert_eq!(connection.state().last_connected, Some(later));
    }

    #[test]
    fn scan_stops_at_deadline() {
        let radio = MockRadio::new();
        radio.advertise(device("a", -50));
        let clock = ManualClock::new(NOW);
        let mut connection = Connection::new(radio.clone());
        let mut scan = connection.scan(Duration::seconds(5), &clock).unwrap();
        clock.advance(Duration::seconds(5));
        assert!(scan.next().is_none());
        drop(scan);
        assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn failed_connect_returns_to_disconnected() {
        let radio = MockRadio::new();
        let mut connection = Connection::new(radio.clone());

        radio.fail_next_connect(LinkError::Timeout);
        assert_eq!(
            connection.connect(&device("a", -50), Duration::seconds(1), NOW),
            Err(TransportError::ConnectionTimeout)
        );
        assert_eq!(connection.status(), ConnectionStatus::Disconnected);

        radio.fail_next_connect(LinkError::Refused("busy".into()));
        assert!(matches!(
            connection.connect(&device("a", -50), Duration::seconds(1), NOW),
            Err(TransportError::ConnectionRefused(_))
        ));
        assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn send_requires_a_link() {
        let radio = MockRadio::new();
        let mut connection = Connection::new(radio.clone());
        assert_eq!(connection.send(b"x"), Err(TransportError::NotConnected));
        connection.connect(&device("a", -50), Duration::seconds(1), NOW).unwrap();
        connection.send(b"x").unwrap();
        assert_eq!(radio.take_sent(), vec![b"x".to_vec()]);
        assert!(radio.sent().is_empty());
        assert!(connection.disconnect());
        assert!(!connection.disconnect());
        assert_eq!(connection.send(b"y"), Err(TransportError::NotConnected));
    }

    #[test]
    fn poor_signal_degrades_without_disconnecting() {
        let radio = MockRadio::new();
        let mut connection = Connection::new(radio.clone());
        connection.connect(&device("a", -55), Duration::seconds(1), NOW).unwrap();
        for _ in 0..8 {
            radio.push_event(LinkEvent::Rssi(-95));
        }
        let events: Vec<_> = std::iter::from_fn(|| connection.poll()).collect();
        assert!(events.contains(&TransportEvent::QualityChanged(SignalQuality::Poor)));
        assert_eq!(connection.status(), ConnectionStatus::Degraded);
        connection.send(b"still works").unwrap();

        for _ in 0..8 {
            connection.record_rssi(-50);
        }
        assert_eq!(connection.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn link_loss_is_reported_once() {
        let radio = MockRadio::new();
        let mut connection = Connection::new(radio.clone());
        connection.connect(&device("a", -55), Duration::seconds(1), NOW).unwrap();
        radio.push_event(LinkEvent::Frame(vec![1, 2]));
        radio.push_event(LinkEvent::Lost);
        assert_eq!(connection.poll(), Some(TransportEvent::Frame(vec![1, 2])));
        assert_eq!(connection.poll(), Some(TransportEvent::LinkLost));
        assert_eq!(connection.poll(), None);
        assert_eq!(connection.status(), ConnectionStatus::Disconnected);
        assert!(connection.state().device.is_none());
    }

    #[test]
    fn transition_table() {
        use ConnectionStatus::*;
        assert!(Scanning.can_transition(Connecting));
        assert!(!Disconnected.can_transition(Connected));
        assert!(!Connecting.can_transition(Degraded));
        assert!(Degraded.can_transition(Disconnected));
    }
}
