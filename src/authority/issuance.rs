//! Certificate issuance for provisioning tools and tests.
//!
//! A digital key never creates roots at runtime; this module is only
//! compiled with the `provisioning` feature.
use rand::Rng;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::definitions::{
    certificate::CERTIFICATE_VERSION, Certificate, CertificateKind, EccKeyPair, PublicKey,
    UserBinding, VehicleBinding,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("only root certificates can be self-signed")]
    NotARoot,
    #[error("a root certificate must be self-signed")]
    RootNeedsSelfSignature,
    #[error("{0} certificates cannot issue other certificates")]
    IssuerCannotSign(&'static str),
    #[error("signing key does not match the issuer certificate")]
    KeyMismatch,
    #[error("validity window ends before it starts")]
    EmptyValidity,
    #[error("unable to encode certificate: {0}")]
    Encoding(#[from] crate::cbor::CborError),
}

pub struct CertificateBuilder {
    subject: String,
    public_key: PublicKey,
    kind: CertificateKind,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    serial_number: Option<u64>,
}

impl CertificateBuilder {
    fn new(subject: impl Into<String>, public_key: PublicKey, kind: CertificateKind) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            subject: subject.into(),
            public_key,
            kind,
            not_before: now,
            not_after: now + time::Duration::days(365),
            serial_number: None,
        }
    }

    pub fn root(subject: impl Into<String>, public_key: PublicKey) -> Self {
        Self::new(subject, public_key, CertificateKind::Root)
    }

    pub fn vehicle(
        subject: impl Into<String>,
        public_key: PublicKey,
        binding: VehicleBinding,
    ) -> Self {
        Self::new(subject, public_key, CertificateKind::Vehicle(binding))
    }

    pub fn user(subject: impl Into<String>, public_key: PublicKey, binding: UserBinding) -> Self {
        Self::new(subject, public_key, CertificateKind::User(binding))
    }

    pub fn validity(mut self, not_before: OffsetDateTime, not_after: OffsetDateTime) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    pub fn serial_number(mut self, serial_number: u64) -> Self {
        self.serial_number = Some(serial_number);
        self
    }

    /// Sign a root with its own key.
    pub fn self_sign(self, key: &EccKeyPair) -> Result<Certificate, Error> {
        if !matches!(self.kind, CertificateKind::Root) {
            return Err(Error::NotARoot);
        }
        if key.public_key() != self.public_key {
            return Err(Error::KeyMismatch);
        }
        let id = Uuid::new_v4();
        self.sign(id, id, key)
    }

    /// Sign with an issuing root or vehicle certificate.
    pub fn issue(self, issuer: &Certificate, issuer_key: &EccKeyPair) -> Result<Certificate, Error> {
        if matches!(self.kind, CertificateKind::Root) {
            return Err(Error::RootNeedsSelfSignature);
        }
        if let CertificateKind::User(_) = issuer.kind {
            return Err(Error::IssuerCannotSign(issuer.kind_name()));
        }
        if issuer_key.public_key() != issuer.public_key {
            return Err(Error::KeyMismatch);
        }
        self.sign(Uuid::new_v4(), issuer.id, issuer_key)
    }

    fn sign(self, id: Uuid, issuer: Uuid, key: &EccKeyPair) -> Result<Certificate, Error> {
        if self.not_after < self.not_before {
            return Err(Error::EmptyValidity);
        }
        let mut certificate = Certificate {
            id,
            version: CERTIFICATE_VERSION,
            serial_number: self
                .serial_number
                .unwrap_or_else(|| rand::thread_rng().gen()),
            subject: self.subject,
            issuer,
            public_key: self.public_key,
            not_before: whole_seconds(self.not_before),
            not_after: whole_seconds(self.not_after),
            kind: self.kind,
            signature: vec![],
        };
        certificate.signature = key.sign(&certificate.tbs_bytes()?);
        tracing::debug!(
            "issued {} certificate '{}' ({})",
            certificate.kind_name(),
            certificate.subject,
            certificate.id
        );
        Ok(certificate)
    }
}

/// Certificates carry Unix seconds on the wire.
fn whole_seconds(at: OffsetDateTime) -> OffsetDateTime {
    at - time::Duration::nanoseconds(i64::from(at.nanosecond()))
}
