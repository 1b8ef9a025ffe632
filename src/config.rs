//! Runtime configuration.
//!
//! The network endpoints are consumed by the host application (certificate
//! issuance and revocation lookups); this crate only carries them.
use serde::{Deserialize, Serialize};
use time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(rename = "rootCAUrl")]
    pub root_ca_url: String,
    pub certificate_url: String,
    pub verification_url: String,
    /// Lifetime of a session from the moment the handshake completes.
    #[serde(with = "seconds", default = "default_session_duration")]
    pub session_duration: Duration,
    #[serde(default = "default_key_storage_key")]
    pub key_storage_key: String,
    #[serde(default = "default_certificate_storage_key")]
    pub certificate_storage_key: String,
    /// How long to wait for the vehicle's server hello.
    #[serde(with = "seconds", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    /// How long a sent command waits for its response.
    #[serde(with = "seconds", default = "default_command_timeout")]
    pub command_timeout: Duration,
    #[serde(with = "seconds", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} must be a positive duration")]
    NonPositiveDuration(&'static str),
}

fn default_session_duration() -> Duration {
    Duration::seconds(300)
}

fn default_key_storage_key() -> String {
    "vehicle-key.private-key".to_string()
}

fn default_certificate_storage_key() -> String {
    "vehicle-key.certificates".to_string()
}

fn default_handshake_timeout() -> Duration {
    Duration::seconds(10)
}

fn default_command_timeout() -> Duration {
    Duration::seconds(5)
}

fn default_connect_timeout() -> Duration {
    Duration::seconds(15)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_ca_url: String::new(),
            certificate_url: String::new(),
            verification_url: String::new(),
            session_duration: default_session_duration(),
            key_storage_key: default_key_storage_key(),
            certificate_storage_key: default_certificate_storage_key(),
            handshake_timeout: default_handshake_timeout(),
            command_timeout: default_command_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), Error> {
        let durations = [
            ("sessionDuration", self.session_duration),
            ("handshakeTimeout", self.handshake_timeout),
            ("commandTimeout", self.command_timeout),
            ("connectTimeout", self.connect_timeout),
        ];
        for (name, duration) in durations {
            if !duration.is_positive() {
                return Err(Error::NonPositiveDuration(name));
            }
        }
        Ok(())
    }
}

/// Whole-second (de)serialization of [Duration].
mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(duration.whole_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        i64::deserialize(deserializer).map(Duration::seconds)
    }
}
