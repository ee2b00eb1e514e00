//! Signature algorithms accepted for remote credentials.
//!
//! The set is closed. A credential names its algorithm with the JWS `alg`
//! tag and the tag is matched exactly against [`SignatureAlgorithm::from_tag`];
//! there is no fallback and no "none".
//!
//! | tag     | scheme                                   | raw key encoding                  |
//! |---------|------------------------------------------|-----------------------------------|
//! | `EdDSA` | Ed25519                                  | 32-byte public key                |
//! | `ES256` | ECDSA P-256 / SHA-256, fixed `r ‖ s`     | 65-byte uncompressed SEC1 point   |
//! | `RS256` | RSA PKCS#1 v1.5 / SHA-256, 2048–8192 bit | DER `RSAPublicKey`                |
//!
//! Configured key material is either base64 of the raw encoding or a PEM
//! block (`PUBLIC KEY`, or `RSA PUBLIC KEY` for RS256). PEM decoding and the
//! signature check itself are done by `jsonwebtoken`.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{LicenseError, LicenseResult};

/// Supported credential signature schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "EdDSA")]
    EdDsa,
    #[serde(rename = "ES256")]
    Es256,
    #[serde(rename = "RS256")]
    Rs256,
}

impl SignatureAlgorithm {
    /// Resolve a JWS `alg` tag. Matching is exact and case-sensitive.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "EdDSA" => Some(Self::EdDsa),
            "ES256" => Some(Self::Es256),
            "RS256" => Some(Self::Rs256),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::EdDsa => "EdDSA",
            Self::Es256 => "ES256",
            Self::Rs256 => "RS256",
        }
    }

    fn jwt_algorithm(&self) -> Algorithm {
        match self {
            Self::EdDsa => Algorithm::EdDSA,
            Self::Es256 => Algorithm::ES256,
            Self::Rs256 => Algorithm::RS256,
        }
    }

    fn check_raw_shape(&self, key: &[u8]) -> LicenseResult<()> {
        let ok = match self {
            Self::EdDsa => key.len() == 32,
            Self::Es256 => key.len() == 65 && key[0] == 0x04,
            Self::Rs256 => key.first() == Some(&0x30),
        };
        if ok {
            Ok(())
        } else {
            Err(LicenseError::ConfigError(format!(
                "public key does not look like a {} key ({} bytes)",
                self.tag(),
                key.len()
            )))
        }
    }

    fn decoding_key_from_pem(&self, pem: &[u8]) -> LicenseResult<DecodingKey> {
        let parsed = match self {
            Self::EdDsa => DecodingKey::from_ed_pem(pem),
            Self::Es256 => DecodingKey::from_ec_pem(pem),
            Self::Rs256 => DecodingKey::from_rsa_pem(pem),
        };
        parsed.map_err(|e| {
            LicenseError::ConfigError(format!("PEM block is not a {} public key: {e}", self.tag()))
        })
    }

    fn decoding_key_from_raw(&self, raw: &[u8]) -> DecodingKey {
        match self {
            Self::EdDsa => DecodingKey::from_ed_der(raw),
            Self::Es256 => DecodingKey::from_ec_der(raw),
            Self::Rs256 => DecodingKey::from_rsa_der(raw),
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl std::str::FromStr for SignatureAlgorithm {
    type Err = LicenseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s.trim()).ok_or_else(|| {
            LicenseError::ConfigError(format!(
                "unsupported key algorithm '{s}' (expected EdDSA, ES256 or RS256)"
            ))
        })
    }
}

/// A public key pinned to exactly one algorithm.
#[derive(Clone)]
pub struct VerifyingKey {
    algorithm: SignatureAlgorithm,
    key: DecodingKey,
}

impl VerifyingKey {
    /// Wrap raw key bytes, checking they are plausible for `algorithm`.
    pub fn new(algorithm: SignatureAlgorithm, raw: Vec<u8>) -> LicenseResult<Self> {
        algorithm.check_raw_shape(&raw)?;
        Ok(Self {
            algorithm,
            key: algorithm.decoding_key_from_raw(&raw),
        })
    }

    /// Parse key material from configuration: a PEM block or base64 of the
    /// raw key encoding.
    pub fn parse(algorithm: SignatureAlgorithm, material: &str) -> LicenseResult<Self> {
        let material = material.trim();
        if material.is_empty() {
            return Err(LicenseError::ConfigError(
                "public key material is empty".to_string(),
            ));
        }

        if material.starts_with("-----BEGIN") {
            return Ok(Self {
                algorithm,
                key: algorithm.decoding_key_from_pem(material.as_bytes())?,
            });
        }

        let raw = B64.decode(material).map_err(|e| {
            LicenseError::ConfigError(format!("public key is not valid base64: {e}"))
        })?;
        Self::new(algorithm, raw)
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Check a base64url `signature` over `message` (the JWS signing input).
    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        jsonwebtoken::crypto::verify(signature, message, &self.key, self.algorithm.jwt_algorithm())
            .unwrap_or(false)
    }
}

impl fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyingKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
