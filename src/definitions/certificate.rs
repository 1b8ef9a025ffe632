//! Root, vehicle and user certificates.
//!
//! All three share the same envelope; what differs is the [CertificateKind]
//! binding. Validation code matches on the kind rather than relying on any
//! per-type behaviour.
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{command::CommandKind, keys::PublicKey};
use crate::cbor::{self, CborError};

pub const CERTIFICATE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub id: Uuid,
    pub version: u8,
    pub serial_number: u64,
    pub subject: String,
    /// Identifier of the issuing certificate. Equal to `id` for roots.
    pub issuer: Uuid,
    pub public_key: PublicKey,
    #[serde(with = "time::serde::timestamp")]
    pub not_before: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub not_after: OffsetDateTime,
    pub kind: CertificateKind,
    /// Issuer's signature over [Certificate::tbs_bytes].
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CertificateKind {
    /// Self-signed trust anchor.
    Root,
    Vehicle(VehicleBinding),
    User(UserBinding),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleBinding {
    pub vehicle_id: String,
    pub device_id: String,
    /// Command kinds the onboard unit honours.
    pub capabilities: Vec<CommandKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBinding {
    pub user_id: String,
    pub vehicle_id: String,
    pub permissions: Permissions,
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub additional_vehicles: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub unlock: bool,
    pub lock: bool,
    pub start_engine: bool,
}

/// The signed portion of a certificate: every field except the signature.
#[derive(Serialize)]
struct TbsCertificate<'a> {
    id: &'a Uuid,
    version: u8,
    serial_number: u64,
    subject: &'a str,
    issuer: &'a Uuid,
    public_key: &'a PublicKey,
    not_before: i64,
    not_after: i64,
    kind: &'a CertificateKind,
}

impl Certificate {
    /// Canonical CBOR encoding of the fields covered by the signature.
    pub fn tbs_bytes(&self) -> Result<Vec<u8>, CborError> {
        cbor::to_vec(&TbsCertificate {
            id: &self.id,
            version: self.version,
            serial_number: self.serial_number,
            subject: &self.subject,
            issuer: &self.issuer,
            public_key: &self.public_key,
            not_before: self.not_before.unix_timestamp(),
            not_after: self.not_after.unix_timestamp(),
            kind: &self.kind,
        })
    }

    pub fn is_self_signed(&self) -> bool {
        self.issuer == self.id
    }

    pub fn vehicle(&self) -> Option<&VehicleBinding> {
        match &self.kind {
            CertificateKind::Vehicle(binding) => Some(binding),
            _ => None,
        }
    }

    pub fn user(&self) -> Option<&UserBinding> {
        match &self.kind {
            CertificateKind::User(binding) => Some(binding),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            CertificateKind::Root => "root",
            CertificateKind::Vehicle(_) => "vehicle",
            CertificateKind::User(_) => "user",
        }
    }
}

impl UserBinding {
    /// Whether this credential may be presented to `vehicle_id`.
    pub fn valid_for_vehicle(&self, vehicle_id: &str) -> bool {
        self.vehicle_id == vehicle_id || self.additional_vehicles.iter().any(|v| v == vehicle_id)
    }
}
