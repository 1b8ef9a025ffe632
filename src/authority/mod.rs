//! Certificate chain validation and permission checks.
//!
//! Everything here is a pure function of the supplied certificates and the
//! supplied time, so results are deterministic.
use serde::Serialize;
use time::OffsetDateTime;

use crate::definitions::{Certificate, CertificateKind, Command, CommandKind};

mod error;
#[cfg(any(test, feature = "provisioning"))]
pub mod issuance;
mod signature;
pub mod trust_anchor;
mod validity;

pub use error::{CertificateError, ErrorWithContext};
pub use signature::issuer_signed_subject;
pub use trust_anchor::TrustAnchorRegistry;
pub use validity::check_validity_period_at;

/// Longest issuer path accepted between a certificate and its root.
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Result of validating one certificate.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub errors: Vec<ErrorWithContext>,
}

pub type CertificateValidationResult = ValidationOutcome;

impl ValidationOutcome {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Whether `error` was raised against any certificate in the chain.
    pub fn has(&self, error: CertificateError) -> bool {
        self.errors.iter().any(|e| e.error == error)
    }

    pub fn into_result(self) -> Result<(), CertificateError> {
        match self.errors.first() {
            None => Ok(()),
            Some(e) => Err(e.error),
        }
    }

    fn push(&mut self, certificate: &Certificate, error: CertificateError) {
        self.errors.push(ErrorWithContext::new(certificate, error));
    }

    fn extend(&mut self, certificate: &Certificate, errors: Vec<CertificateError>) {
        for error in errors {
            self.push(certificate, error);
        }
    }
}

/// Validate a certificate whose issuer is expected to be a trusted root.
pub fn validate(
    certificate: &Certificate,
    trust_anchors: &TrustAnchorRegistry,
    now: OffsetDateTime,
) -> CertificateValidationResult {
    validate_chain(certificate, &[], trust_anchors, now)
}

/// Validate a certificate, resolving issuers through `intermediates` until a
/// trust anchor is reached.
///
/// Every certificate on the path is checked for its validity window and
/// every link for its signature. User certificates never act as issuers.
pub fn validate_chain(
    certificate: &Certificate,
    intermediates: &[Certificate],
    trust_anchors: &TrustAnchorRegistry,
    now: OffsetDateTime,
) -> CertificateValidationResult {
    let mut outcome = ValidationOutcome::default();
    let mut current = certificate;
    let mut visited = vec![certificate.id];

    for _ in 0..MAX_CHAIN_DEPTH {
        outcome.extend(current, check_validity_period_at(current, now));

        if matches!(current.kind, CertificateKind::Root) || current.is_self_signed() {
            // Only a provisioned anchor may terminate a chain.
            if !trust_anchors.contains(current) {
                outcome.push(current, CertificateError::UntrustedIssuer);
            } else if !issuer_signed_subject(current, current) {
                outcome.push(current, CertificateError::SignatureInvalid);
            }
            return outcome;
        }

        let issuer = trust_anchors
            .get(&current.issuer)
            .or_else(|| intermediates.iter().find(|c| c.id == current.issuer));

        let Some(issuer) = issuer else {
            tracing::info!("no issuer found for certificate '{}'", current.subject);
            outcome.push(current, CertificateError::UntrustedIssuer);
            return outcome;
        };

        if let CertificateKind::User(_) = issuer.kind {
            tracing::warn!(
                "certificate '{}' claims to be issued by user certificate '{}'",
                current.subject,
                issuer.subject
            );
            outcome.push(current, CertificateError::UntrustedIssuer);
            return outcome;
        }

        if !issuer_signed_subject(current, issuer) {
            outcome.push(current, CertificateError::SignatureInvalid);
        }

        if visited.contains(&issuer.id) {
            tracing::warn!("certificate chain loops back to '{}'", issuer.subject);
            outcome.push(issuer, CertificateError::UntrustedIssuer);
            return outcome;
        }
        visited.push(issuer.id);
        current = issuer;
    }

    tracing::warn!(
        "certificate chain for '{}' is longer than {MAX_CHAIN_DEPTH}",
        certificate.subject
    );
    outcome.push(certificate, CertificateError::UntrustedIssuer);
    outcome
}

/// Whether a user certificate grants `command`.
///
/// Fail-closed: anything that is not a user certificate, and any command
/// without a matching permission flag, is denied.
pub fn check_permission(certificate: &Certificate, command: &Command) -> bool {
    check_permission_kind(certificate, command.kind)
}

pub fn check_permission_kind(certificate: &Certificate, kind: CommandKind) -> bool {
    match certificate.user() {
        Some(user) => kind.permission(&user.permissions).unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::{Curve, EccKeyPair, Permissions};
    use crate::test_support::{Pki, NOW};
    use issuance::CertificateBuilder;
    use time::Duration;

    #[test]
    fn valid_user_certificate() {
        let pki = Pki::new(Permissions::default());
        let outcome = validate_chain(&pki.user, &pki.intermediates(), &pki.anchors, NOW);
        assert!(outcome.success(), "{outcome:?}");
        assert!(validate(&pki.vehicle, &pki.anchors, NOW).success());
    }

    #[test]
    fn outside_validity_window() {
        let pki = Pki::new(Permissions::default());
        let before = pki.user.not_before - Duration::seconds(1);
        let after = pki.user.not_after + Duration::seconds(1);

        let outcome = validate_chain(&pki.user, &pki.intermediates(), &pki.anchors, before);
        assert_eq!(outcome.into_result(), Err(CertificateError::NotYetValid));

        let outcome = validate_chain(&pki.user, &pki.intermediates(), &pki.anchors, after);
        assert!(outcome.has(CertificateError::Expired));

        let at_edge = validate_chain(&pki.user, &pki.intermediates(), &pki.anchors, pki.user.not_after);
        assert!(at_edge.success());
    }

    #[test]
    fn tampered_permissions_break_the_signature() {
        let pki = Pki::new(Permissions::default());
        let mut user = pki.user.clone();
        if let CertificateKind::User(binding) = &mut user.kind {
            binding.permissions.start_engine = true;
        }
        let outcome = validate_chain(&user, &pki.intermediates(), &pki.anchors, NOW);
        assert_eq!(outcome.into_result(), Err(CertificateError::SignatureInvalid));
    }

    #[test]
    fn unknown_root() {
        let pki = Pki::new(Permissions::default());
        let outcome = validate(&pki.vehicle, &TrustAnchorRegistry::default(), NOW);
        assert_eq!(outcome.into_result(), Err(CertificateError::UntrustedIssuer));

        let outcome = validate(&pki.user, &pki.anchors, NOW);
        assert_eq!(outcome.into_result(), Err(CertificateError::UntrustedIssuer));
    }

    #[test]
    fn impostor_root_with_anchor_id() {
        let pki = Pki::new(Permissions::default());
        let key = EccKeyPair::generate(Curve::Secp256r1);
        let mut impostor = CertificateBuilder::root("root", key.public_key())
            .validity(NOW - Duration::days(1), NOW + Duration::days(1))
            .self_sign(&key)
            .unwrap();
        impostor.id = pki.root.id;
        impostor.issuer = pki.root.id;
        let outcome = validate(&impostor, &pki.anchors, NOW);
        assert_eq!(outcome.into_result(), Err(CertificateError::UntrustedIssuer));
    }

    #[test]
    fn expired_intermediate_fails_the_chain() {
        let pki = Pki::new(Permissions::default());
        let later = pki.vehicle.not_after + Duration::seconds(1);
        let outcome = validate_chain(&pki.user, &pki.intermediates(), &pki.anchors, later);
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.error == CertificateError::Expired && e.certificate == pki.vehicle.id));
    }

    #[test]
    fn permission_check_is_fail_closed() {
        let pki = Pki::new(Permissions {
            unlock: false,
            lock: true,
            start_engine: false,
        });
        assert!(!check_permission(&pki.user, &CommandKind::Unlock.into()));
        assert!(check_permission(&pki.user, &CommandKind::Lock.into()));
        assert!(!check_permission(&pki.user, &CommandKind::OpenTrunk.into()));
        assert!(!check_permission(&pki.vehicle, &CommandKind::Lock.into()));
    }
}
