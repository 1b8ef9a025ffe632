use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definitions::{Certificate, CertificateKind};

/// The provisioned set of root certificates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Certificate>", into = "Vec<Certificate>")]
pub struct TrustAnchorRegistry {
    certificates: Vec<Certificate>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("certificate '{0}' is not a root certificate")]
    NotARoot(String),
    #[error("root certificate '{0}' is not self-signed")]
    NotSelfSigned(String),
    #[error("root certificate {0} appears more than once")]
    Duplicate(Uuid),
    #[error("could not parse trust anchors: {0}")]
    Parse(String),
}

impl TrustAnchorRegistry {
    pub fn from_roots(certificates: Vec<Certificate>) -> Result<Self, Error> {
        let mut registry = Self::default();
        for certificate in certificates {
            registry.add(certificate)?;
        }
        Ok(registry)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Parse(e.to_string()))
    }

    fn add(&mut self, certificate: Certificate) -> Result<(), Error> {
        if !matches!(certificate.kind, CertificateKind::Root) {
            return Err(Error::NotARoot(certificate.subject));
        }
        if !certificate.is_self_signed() {
            return Err(Error::NotSelfSigned(certificate.subject));
        }
        if self.get(&certificate.id).is_some() {
            return Err(Error::Duplicate(certificate.id));
        }
        self.certificates.push(certificate);
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Option<&Certificate> {
        self.certificates.iter().find(|anchor| anchor.id == *id)
    }

    /// Whether `certificate` is exactly one of the provisioned anchors, not
    /// merely something claiming an anchor's identifier.
    pub fn contains(&self, certificate: &Certificate) -> bool {
        self.get(&certificate.id)
            .is_some_and(|anchor| anchor == certificate)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.iter()
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

impl TryFrom<Vec<Certificate>> for TrustAnchorRegistry {
    type Error = Error;

    fn try_from(certificates: Vec<Certificate>) -> Result<Self, Error> {
        Self::from_roots(certificates)
    }
}

impl From<TrustAnchorRegistry> for Vec<Certificate> {
    fn from(registry: TrustAnchorRegistry) -> Self {
        registry.certificates
    }
}
