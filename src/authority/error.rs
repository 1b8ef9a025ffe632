use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::definitions::Certificate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum CertificateError {
    #[error("expired")]
    Expired,
    #[error("not yet valid")]
    NotYetValid,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("untrusted issuer")]
    UntrustedIssuer,
}

/// A [CertificateError] tagged with the certificate it was raised against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorWithContext {
    pub certificate: Uuid,
    pub subject: String,
    pub kind: &'static str,
    pub error: CertificateError,
}

impl ErrorWithContext {
    pub fn new(certificate: &Certificate, error: CertificateError) -> Self {
        Self {
            certificate: certificate.id,
            subject: certificate.subject.clone(),
            kind: certificate.kind_name(),
            error,
        }
    }
}

impl fmt::Display for ErrorWithContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} certificate '{}' error: {}",
            self.kind, self.subject, self.error
        )
    }
}
