//! Error types for Warden.
//!
//! Two layers live here:
//!
//! - [`LicenseError`] covers faults inside the crate (network, storage,
//!   crypto, configuration). They never cross the decision engine boundary; the engine
//!   folds them into a [`Decision`](crate::client::decision::Decision).
//! - [`Rejection`] is the verifier's verdict on a fetched credential. A
//!   rejection is all-or-nothing: no claim of a rejected credential is used.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// The credential source could not be reached (DNS, TLS, timeout, HTTP status).
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// A persisted record failed MAC, chain or fingerprint verification.
    #[error("local state tampered: {0}")]
    StateTampered(String),

    /// The executable fingerprint could not be computed.
    #[error("fingerprint unavailable: {0}")]
    FingerprintUnavailable(String),

    #[error("storage error: {0}")]
    StorageError(#[from] std::io::Error),

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl From<reqwest::Error> for LicenseError {
    fn from(err: reqwest::Error) -> Self {
        LicenseError::NetworkUnavailable(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type LicenseResult<T> = Result<T, LicenseError>;

/// Why the verifier refused a credential.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Token is not three base64url segments of JSON header/payload + signature.
    #[error("malformed credential: {0}")]
    Malformed(String),

    /// Header `alg` is absent or outside the supported set.
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Header `alg` is supported but differs from the configured verifying key.
    #[error("credential algorithm {token} does not match verifying key algorithm {key}")]
    AlgorithmMismatch {
        token: &'static str,
        key: &'static str,
    },

    #[error("signature does not verify")]
    SignatureInvalid,

    #[error("missing mandatory claim `{0}`")]
    MissingClaim(&'static str),

    /// `exp` is not in the future (unix seconds).
    #[error("credential expired at {0}")]
    Expired(i64),

    /// `iat` lies beyond the clock-skew tolerance in the future (unix seconds).
    #[error("credential issued in the future at {0}")]
    NotYetValid(i64),
}

impl Rejection {
    /// Expiry is a deliberate rejection of an otherwise authentic credential.
    pub fn is_expired(&self) -> bool {
        matches!(self, Rejection::Expired(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_expiry_counts_as_expired() {
        assert!(Rejection::Expired(10).is_expired());
        assert!(!Rejection::NotYetValid(10).is_expired());
        assert!(!Rejection::MissingClaim("exp").is_expired());
    }

    #[test]
    fn io_error_maps_to_storage_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: LicenseError = io.into();
        assert!(matches!(err, LicenseError::StorageError(_)));
    }
}
