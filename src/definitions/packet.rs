//! Wire units exchanged with the vehicle.
//!
//! Every frame on the link is a CBOR encoded [Frame]. Packets carry a
//! signature over the CBOR encoding of all their other fields.
use serde::{Deserialize, Serialize};

use super::{certificate::Certificate, keys::PublicKey};
use crate::cbor::{self, CborError};
use crate::session::SessionId;

/// An outbound command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPacket {
    pub certificate: Certificate,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Per-session counter, never repeated in one direction.
    pub nonce: u64,
    pub session_id: SessionId,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// A reply to a [CommandPacket].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePacket {
    pub success: bool,
    pub session_id: SessionId,
    /// Nonce of the command this answers.
    pub request_nonce: u64,
    pub nonce: u64,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub timestamp: i64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// First handshake message, from the key to the vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHello {
    pub session_id: SessionId,
    pub certificate: Certificate,
    /// Intermediate certificates between the user certificate and a root.
    #[serde(default)]
    pub chain: Vec<Certificate>,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    pub ephemeral_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Second handshake message, from the vehicle to the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHello {
    pub session_id: SessionId,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    pub ephemeral_key: PublicKey,
    /// Vehicle certificate key signature over the transcript.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Handshake refusal, sent instead of a [ServerHello].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRejected {
    pub session_id: SessionId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Frame {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    HandshakeRejected(HandshakeRejected),
    Command(CommandPacket),
    Response(ResponsePacket),
}

#[derive(Serialize)]
struct CommandTbs<'a> {
    certificate: &'a Certificate,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
    nonce: u64,
    session_id: &'a SessionId,
    timestamp: i64,
}

#[derive(Serialize)]
struct ResponseTbs<'a> {
    success: bool,
    session_id: &'a SessionId,
    request_nonce: u64,
    nonce: u64,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
    timestamp: i64,
    error: &'a Option<String>,
}

/// Signed transcript of a handshake: both hellos minus the server's
/// signature. The client signs the prefix that it knows.
#[derive(Serialize)]
struct HelloTbs<'a> {
    label: &'static str,
    session_id: &'a SessionId,
    #[serde(with = "serde_bytes")]
    client_nonce: &'a [u8],
    client_key: &'a PublicKey,
    #[serde(with = "serde_bytes")]
    server_nonce: Option<&'a [u8]>,
    server_key: Option<&'a PublicKey>,
}

impl CommandPacket {
    pub fn tbs_bytes(&self) -> Result<Vec<u8>, CborError> {
        cbor::to_vec(&CommandTbs {
            certificate: &self.certificate,
            payload: &self.payload,
            nonce: self.nonce,
            session_id: &self.session_id,
            timestamp: self.timestamp,
        })
    }
}

impl ResponsePacket {
    pub fn tbs_bytes(&self) -> Result<Vec<u8>, CborError> {
        cbor::to_vec(&ResponseTbs {
            success: self.success,
            session_id: &self.session_id,
            request_nonce: self.request_nonce,
            nonce: self.nonce,
            payload: &self.payload,
            timestamp: self.timestamp,
            error: &self.error,
        })
    }
}

impl ClientHello {
    pub fn tbs_bytes(&self) -> Result<Vec<u8>, CborError> {
        cbor::to_vec(&HelloTbs {
            label: "vehicle-key client hello",
            session_id: &self.session_id,
            client_nonce: &self.nonce,
            client_key: &self.ephemeral_key,
            server_nonce: None,
            server_key: None,
        })
    }
}

impl ServerHello {
    /// The server signs both halves, binding its answer to this client hello.
    pub fn tbs_bytes(&self, client_nonce: &[u8], client_key: &PublicKey) -> Result<Vec<u8>, CborError> {
        cbor::to_vec(&HelloTbs {
            label: "vehicle-key server hello",
            session_id: &self.session_id,
            client_nonce,
            client_key,
            server_nonce: Some(&self.nonce),
            server_key: Some(&self.ephemeral_key),
        })
    }
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CborError> {
        cbor::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CborError> {
        cbor::from_slice(bytes)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::ClientHello(_) => "client hello",
            Frame::ServerHello(_) => "server hello",
            Frame::HandshakeRejected(_) => "handshake rejected",
            Frame::Command(_) => "command",
            Frame::Response(_) => "response",
        }
    }
}
