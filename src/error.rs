use std::time::Duration;

use thiserror::Error;

/// Lookup failure as seen by callers of the environment.
///
/// `Clone` because one backend failure is fanned out to every caller coalesced
/// onto the same in-flight lookup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("no usable answer for {0}")]
    NoAnswer(String),
    #[error("upstream returned error code {code}")]
    UpstreamError { code: u16 },
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("entry of {size} bytes exceeds cache ceiling of {ceiling} bytes")]
    ResourceExhausted { size: u64, ceiling: u64 },
    #[error("resolution environment is not initialized")]
    NotInitialized,
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("unknown service: {0}")]
    InvalidService(String),
    #[error("io: {0}")]
    Io(String),
    #[error("in-flight lookup was abandoned")]
    Interrupted,
}

impl From<std::io::Error> for ResolveError {
    fn from(err: std::io::Error) -> Self {
        ResolveError::Io(err.to_string())
    }
}

impl From<hickory_proto::error::ProtoError> for ResolveError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        ResolveError::Malformed(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("cipher key must not be empty")]
    EmptyKey,
    #[error("token is not valid hex")]
    Encoding,
    #[error("token too short")]
    Truncated,
    #[error("decryption failed (wrong id/key or tampered token)")]
    Authentication,
    #[error("encryption failed")]
    Encrypt,
}

/// Reported by `SdnsEnv::init`, never deferred to the first lookup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {role} endpoint {value:?}")]
    InvalidEndpoint { role: &'static str, value: String },
    #[error("cache max_memory must be greater than zero")]
    ZeroMemory,
    #[error("min_ttl ({min}) is greater than max_ttl ({max})")]
    TtlRange { min: u32, max: u32 },
    #[error("prefetch threshold_percent must be in 0..=100, got {0}")]
    PrefetchThreshold(u8),
    #[error("timeout_ms must be greater than zero")]
    ZeroTimeout,
    #[error(transparent)]
    Cipher(#[from] CipherError),
}
