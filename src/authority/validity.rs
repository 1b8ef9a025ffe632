use time::OffsetDateTime;

use super::CertificateError;
use crate::definitions::Certificate;

/// Check certificate validity period against a specific time.
///
/// Both ends of the window are inclusive.
pub fn check_validity_period_at(
    certificate: &Certificate,
    at: OffsetDateTime,
) -> Vec<CertificateError> {
    let mut errors: Vec<CertificateError> = vec![];

    if certificate.not_after < at {
        errors.push(CertificateError::Expired);
    }
    if certificate.not_before > at {
        errors.push(CertificateError::NotYetValid);
    }

    errors
}
