use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use signature::{Signer, Verifier};
use std::fmt;
use zeroize::Zeroizing;

/// Named curves a key may live on.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Curve {
    /// NIST P-256.
    Secp256r1,
    Secp256k1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("public key is not a valid {0} point")]
    InvalidPoint(Curve),
    #[error("secret key is not a valid {0} scalar")]
    InvalidSecret(Curve),
    #[error("signature is not a valid {0} ECDSA signature encoding")]
    MalformedSignature(Curve),
    #[error("signature does not verify")]
    SignatureMismatch,
}

/// An uncompressed SEC1 encoded public key tagged with its curve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub curve: Curve,
    #[serde(with = "serde_bytes")]
    pub sec1: Vec<u8>,
}

impl PublicKey {
    /// Verify an ECDSA/SHA-256 signature in fixed-width `r || s` form.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), Error> {
        match self.curve {
            Curve::Secp256r1 => {
                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&self.sec1)
                    .map_err(|_| Error::InvalidPoint(self.curve))?;
                let signature = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| Error::MalformedSignature(self.curve))?;
                key.verify(message, &signature)
                    .map_err(|_| Error::SignatureMismatch)
            }
            Curve::Secp256k1 => {
                let key = k256::ecdsa::VerifyingKey::from_sec1_bytes(&self.sec1)
                    .map_err(|_| Error::InvalidPoint(self.curve))?;
                let signature = k256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| Error::MalformedSignature(self.curve))?;
                key.verify(message, &signature)
                    .map_err(|_| Error::SignatureMismatch)
            }
        }
    }

    /// Check that the encoded point actually lies on the tagged curve.
    pub fn check(&self) -> Result<(), Error> {
        let valid = match self.curve {
            Curve::Secp256r1 => p256::PublicKey::from_sec1_bytes(&self.sec1).is_ok(),
            Curve::Secp256k1 => k256::PublicKey::from_sec1_bytes(&self.sec1).is_ok(),
        };
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidPoint(self.curve))
        }
    }
}

enum SigningKeys {
    P256(p256::ecdsa::SigningKey),
    K256(k256::ecdsa::SigningKey),
}

/// A long-term signing key pair.
///
/// The secret half is zeroized when the pair is dropped. It has no
/// `Serialize` implementation and its `Debug` output is redacted, so it can
/// not end up in a packet or a log line by accident.
pub struct EccKeyPair {
    secret: SigningKeys,
}

impl EccKeyPair {
    pub fn generate(curve: Curve) -> Self {
        let secret = match curve {
            Curve::Secp256r1 => SigningKeys::P256(p256::ecdsa::SigningKey::random(&mut OsRng)),
            Curve::Secp256k1 => SigningKeys::K256(k256::ecdsa::SigningKey::random(&mut OsRng)),
        };
        Self { secret }
    }

    pub fn from_secret_bytes(curve: Curve, bytes: &[u8]) -> Result<Self, Error> {
        let secret = match curve {
            Curve::Secp256r1 => p256::ecdsa::SigningKey::from_slice(bytes)
                .map(SigningKeys::P256)
                .map_err(|_| Error::InvalidSecret(curve))?,
            Curve::Secp256k1 => k256::ecdsa::SigningKey::from_slice(bytes)
                .map(SigningKeys::K256)
                .map_err(|_| Error::InvalidSecret(curve))?,
        };
        Ok(Self { secret })
    }

    /// Raw scalar bytes, for handing to secure storage only.
    pub fn to_secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        match &self.secret {
            SigningKeys::P256(key) => Zeroizing::new(key.to_bytes().to_vec()),
            SigningKeys::K256(key) => Zeroizing::new(key.to_bytes().to_vec()),
        }
    }

    pub fn curve(&self) -> Curve {
        match self.secret {
            SigningKeys::P256(_) => Curve::Secp256r1,
            SigningKeys::K256(_) => Curve::Secp256k1,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        let sec1 = match &self.secret {
            SigningKeys::P256(key) => key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            SigningKeys::K256(key) => key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        };
        PublicKey {
            curve: self.curve(),
            sec1,
        }
    }

    /// ECDSA/SHA-256 signature in fixed-width `r || s` form.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match &self.secret {
            SigningKeys::P256(key) => {
                let signature: p256::ecdsa::Signature = key.sign(message);
                signature.to_bytes().to_vec()
            }
            SigningKeys::K256(key) => {
                let signature: k256::ecdsa::Signature = key.sign(message);
                signature.to_bytes().to_vec()
            }
        }
    }
}

impl fmt::Debug for EccKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EccKeyPair")
            .field("curve", &self.curve())
            .field("secret", &"<redacted>")
            .finish()
    }
}
