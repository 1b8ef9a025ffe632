use crate::definitions::Certificate;

/// Check that the issuer certificate signed the subject certificate.
pub fn issuer_signed_subject(subject: &Certificate, issuer: &Certificate) -> bool {
    if subject.issuer != issuer.id {
        tracing::debug!(
            "certificate {} names issuer {}, not {}",
            subject.id,
            subject.issuer,
            issuer.id
        );
        return false;
    }

    let tbs = match subject.tbs_bytes() {
        Ok(tbs) => tbs,
        Err(e) => {
            tracing::error!("failed to encode subject tbs: {e:?}");
            return false;
        }
    };

    match issuer.public_key.verify(&tbs, &subject.signature) {
        Ok(()) => true,
        Err(e) => {
            tracing::info!("subject certificate signature could not be validated: {e:?}");
            false
        }
    }
}
