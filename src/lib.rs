//! Phone-as-a-key vehicle access.
//!
//! A user certificate, issued under a provisioned root, is presented to the
//! vehicle in a mutually signed ECDH handshake. The resulting session key
//! protects individual commands, each signed, encrypted and numbered so it
//! can be neither forged nor replayed.
//!
//! Modules, bottom up:
//! - [definitions]: certificates, keys, commands and wire frames.
//! - [authority]: chain validation and permission checks.
//! - [session]: the handshake and session lifetime.
//! - [codec]: packet sealing, signing and replay protection.
//! - [transport]: the radio link state machine.
//! - [dispatch]: one-command-at-a-time dispatch with deadlines.
//! - [key] and [vehicle]: the two ends.
pub mod authority;
pub mod cbor;
pub mod clock;
pub mod codec;
pub mod config;
pub mod definitions;
pub mod dispatch;
pub mod key;
pub mod session;
pub mod storage;
pub mod transport;
pub mod vehicle;

#[cfg(test)]
mod test_support;

pub use authority::{TrustAnchorRegistry, ValidationOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use dispatch::{CommandHandle, CommandStatus, DispatchError, Dispatcher, Notice};
pub use key::{DigitalKey, KeyError};
pub use session::{PkiSession, SessionId, SessionManager};
