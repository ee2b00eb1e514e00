//! Remote credential parsing and verification.
//!
//! Credentials use the JWS compact form:
//! `base64url(header).base64url(payload).base64url(signature)`, where the
//! signature covers the ASCII bytes `header.payload` (the encoded segments,
//! not the decoded JSON).
//!
//! The header's `alg` must be one of the supported tags *and* equal to the
//! algorithm the configured key is pinned to. Claims are decoded only after
//! the signature verifies.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::client::grace::DEFAULT_CLOCK_SKEW_SECS;
use crate::errors::Rejection;
use crate::signature::{SignatureAlgorithm, VerifyingKey};

/// A credential whose signature has been verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    /// Kill switch. `false` means the operator revoked the right to run.
    pub enabled: bool,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub edition: Option<String>,
    pub features: Vec<String>,
    pub customer: Option<String>,
    /// Informational; not enforced.
    pub machine_limit: Option<u32>,
    pub license_id: Option<String>,
    pub algorithm: SignatureAlgorithm,
}

impl Credential {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    enabled: Option<bool>,
    iat: Option<i64>,
    exp: Option<i64>,
    edition: Option<String>,
    #[serde(default)]
    features: Option<Vec<String>>,
    customer: Option<String>,
    #[serde(rename = "machineLimit", alias = "machine_limit")]
    machine_limit: Option<u32>,
    license_id: Option<String>,
}

/// Verifies fetched credential text against one pinned public key.
#[derive(Debug, Clone)]
pub struct CredentialVerifier {
    key: VerifyingKey,
    clock_skew: Duration,
}

impl CredentialVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self {
            key,
            clock_skew: Duration::seconds(DEFAULT_CLOCK_SKEW_SECS),
        }
    }

    /// Tolerance for an `iat` slightly ahead of the local clock.
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// Verify `token` as of `now`.
    ///
    /// `enabled = false` is *not* a rejection here: the claim is authentic and
    /// the engine turns it into the kill switch.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Credential, Rejection> {
        let token = token.trim();
        let mut parts = token.split('.');
        let (header_b64, payload_b64, sig_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(p), Some(s), None)
                    if !h.is_empty() && !p.is_empty() && !s.is_empty() =>
                {
                    (h, p, s)
                }
                _ => {
                    return Err(Rejection::Malformed(
                        "expected three non-empty dot-separated segments".to_string(),
                    ))
                }
            };

        let header_json = decode_segment(header_b64, "header")?;
        let header: Header = serde_json::from_slice(&header_json)
            .map_err(|e| Rejection::Malformed(format!("invalid header JSON: {e}")))?;

        let tag = header
            .alg
            .ok_or_else(|| Rejection::UnsupportedAlgorithm("absent".to_string()))?;
        let algorithm = SignatureAlgorithm::from_tag(&tag)
            .ok_or_else(|| Rejection::UnsupportedAlgorithm(tag.clone()))?;
        if algorithm != self.key.algorithm() {
            return Err(Rejection::AlgorithmMismatch {
                token: algorithm.tag(),
                key: self.key.algorithm().tag(),
            });
        }

        decode_segment(sig_b64, "signature")?;
        let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];
        if !self.key.verify(signing_input.as_bytes(), sig_b64) {
            return Err(Rejection::SignatureInvalid);
        }

        // Signature holds from here on; the payload may be trusted.
        let payload_json = decode_segment(payload_b64, "payload")?;
        let claims: Claims = serde_json::from_slice(&payload_json)
            .map_err(|e| Rejection::Malformed(format!("invalid payload JSON: {e}")))?;

        let enabled = claims.enabled.ok_or(Rejection::MissingClaim("enabled"))?;
        let exp = claims.exp.ok_or(Rejection::MissingClaim("exp"))?;
        let iat = claims.iat.ok_or(Rejection::MissingClaim("iat"))?;

        let expires_at = DateTime::from_timestamp(exp, 0)
            .ok_or_else(|| Rejection::Malformed(format!("exp out of range: {exp}")))?;
        let issued_at = DateTime::from_timestamp(iat, 0)
            .ok_or_else(|| Rejection::Malformed(format!("iat out of range: {iat}")))?;

        if expires_at <= now {
            return Err(Rejection::Expired(exp));
        }
        if issued_at > now + self.clock_skew {
            return Err(Rejection::NotYetValid(iat));
        }

        Ok(Credential {
            enabled,
            issued_at,
            expires_at,
            edition: claims.edition,
            features: claims.features.unwrap_or_default(),
            customer: claims.customer,
            machine_limit: claims.machine_limit,
            license_id: claims.license_id,
            algorithm,
        })
    }
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>, Rejection> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| Rejection::Malformed(format!("{what} is not base64url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{
        EcdsaKeyPair, Ed25519KeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING,
    };
    use serde_json::json;

    const NOW: i64 = 1_760_000_000;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(NOW, 0).unwrap()
    }

    fn ed25519() -> (Ed25519KeyPair, CredentialVerifier) {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let kp = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let key = VerifyingKey::new(
            SignatureAlgorithm::EdDsa,
            kp.public_key().as_ref().to_vec(),
        )
        .unwrap();
        (kp, CredentialVerifier::new(key))
    }

    fn encode(header: &serde_json::Value, claims: &serde_json::Value) -> String {
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        )
    }

    fn sign_ed(kp: &Ed25519KeyPair, header: serde_json::Value, claims: serde_json::Value) -> String {
        let input = encode(&header, &claims);
        let sig = kp.sign(input.as_bytes());
        format!("{input}.{}", URL_SAFE_NO_PAD.encode(sig.as_ref()))
    }

    fn good_claims() -> serde_json::Value {
        json!({
            "enabled": true,
            "iat": NOW - 60,
            "exp": NOW + 86_400 * 30,
            "edition": "pro",
            "features": ["export", "reports"],
            "customer": "ACME",
            "machineLimit": 3
        })
    }

    #[test]
    fn accepts_valid_eddsa_credential() {
        let (kp, verifier) = ed25519();
        let token = sign_ed(&kp, json!({"alg": "EdDSA", "typ": "JWT"}), good_claims());

        let cred = verifier.verify(&token, now()).expect("should verify");
        assert!(cred.enabled);
        assert_eq!(cred.edition.as_deref(), Some("pro"));
        assert!(cred.has_feature("export"));
        assert_eq!(cred.customer.as_deref(), Some("ACME"));
        assert_eq!(cred.machine_limit, Some(3));
        assert_eq!(cred.algorithm, SignatureAlgorithm::EdDsa);
        assert_eq!(cred.expires_at.timestamp(), NOW + 86_400 * 30);
    }

    #[test]
    fn accepts_valid_es256_credential() {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let kp =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .unwrap();
        let key = VerifyingKey::new(
            SignatureAlgorithm::Es256,
            kp.public_key().as_ref().to_vec(),
        )
        .unwrap();
        let verifier = CredentialVerifier::new(key);

        let input = encode(&json!({"alg": "ES256"}), &good_claims());
        let sig = kp.sign(&rng, input.as_bytes()).unwrap();
        let token = format!("{input}.{}", URL_SAFE_NO_PAD.encode(sig.as_ref()));

        let cred = verifier.verify(&token, now()).expect("should verify");
        assert_eq!(cred.algorithm, SignatureAlgorithm::Es256);
    }

    #[test]
    fn accepts_fixed_rs256_credential() {
        use crate::signature::test_vectors::{RSA_PKCS1_PEM, RSA_TOKEN};

        let key = VerifyingKey::parse(SignatureAlgorithm::Rs256, RSA_PKCS1_PEM).unwrap();
        let verifier = CredentialVerifier::new(key);

        let cred = verifier.verify(RSA_TOKEN, now()).expect("should verify");
        assert_eq!(cred.algorithm, SignatureAlgorithm::Rs256);
        assert_eq!(cred.edition.as_deref(), Some("enterprise"));
        assert_eq!(cred.customer.as_deref(), Some("ACME"));
        assert_eq!(cred.expires_at.timestamp(), 1_762_592_000);

        // Same signature, one payload character changed.
        let forged = RSA_TOKEN.replacen("eyJlbmFibGVkIjp0cnVl", "eyJlbmFibGVkIjp0cnVm", 1);
        assert_eq!(verifier.verify(&forged, now()), Err(Rejection::SignatureInvalid));
    }

    #[test]
    fn disabled_credential_is_authentic_not_rejected() {
        let (kp, verifier) = ed25519();
        let mut claims = good_claims();
        claims["enabled"] = json!(false);
        let token = sign_ed(&kp, json!({"alg": "EdDSA"}), claims);

        let cred = verifier.verify(&token, now()).unwrap();
        assert!(!cred.enabled);
    }

    #[test]
    fn rejects_malformed_structure() {
        let (_, verifier) = ed25519();
        for token in ["", "abc", "a.b", "a.b.c.d", "a..c", "!!.??.**"] {
            assert!(
                matches!(verifier.verify(token, now()), Err(Rejection::Malformed(_))),
                "token {token:?} should be malformed"
            );
        }
    }

    #[test]
    fn rejects_absent_and_unknown_algorithms() {
        let (kp, verifier) = ed25519();

        let no_alg = sign_ed(&kp, json!({"typ": "JWT"}), good_claims());
        assert_eq!(
            verifier.verify(&no_alg, now()),
            Err(Rejection::UnsupportedAlgorithm("absent".to_string()))
        );

        let none_alg = sign_ed(&kp, json!({"alg": "none"}), good_claims());
        assert_eq!(
            verifier.verify(&none_alg, now()),
            Err(Rejection::UnsupportedAlgorithm("none".to_string()))
        );

        let hs = sign_ed(&kp, json!({"alg": "HS256"}), good_claims());
        assert!(matches!(
            verifier.verify(&hs, now()),
            Err(Rejection::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn rejects_algorithm_that_differs_from_pinned_key() {
        let (kp, verifier) = ed25519();
        let token = sign_ed(&kp, json!({"alg": "RS256"}), good_claims());
        assert_eq!(
            verifier.verify(&token, now()),
            Err(Rejection::AlgorithmMismatch {
                token: "RS256",
                key: "EdDSA"
            })
        );
    }

    #[test]
    fn rejects_signature_from_other_key() {
        let (_, verifier) = ed25519();
        let (other, _) = ed25519();
        let token = sign_ed(&other, json!({"alg": "EdDSA"}), good_claims());
        assert_eq!(verifier.verify(&token, now()), Err(Rejection::SignatureInvalid));
    }

    #[test]
    fn rejects_swapped_payload() {
        let (kp, verifier) = ed25519();
        let token = sign_ed(&kp, json!({"alg": "EdDSA"}), good_claims());
        let mut forged_claims = good_claims();
        forged_claims["edition"] = json!("enterprise");
        let forged_payload = URL_SAFE_NO_PAD.encode(forged_claims.to_string());

        let parts: Vec<&str> = token.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);
        assert_eq!(verifier.verify(&forged, now()), Err(Rejection::SignatureInvalid));
    }

    #[test]
    fn every_single_bit_flip_is_rejected() {
        let (kp, verifier) = ed25519();
        let token = sign_ed(&kp, json!({"alg": "EdDSA"}), good_claims());
        assert!(verifier.verify(&token, now()).is_ok());

        let bytes = token.as_bytes();
        for i in 0..bytes.len() {
            for bit in 0..8 {
                let mut mutated = bytes.to_vec();
                mutated[i] ^= 1 << bit;
                let Ok(text) = String::from_utf8(mutated) else {
                    continue;
                };
                // Whitespace at the ends is trimmed and does not alter the token.
                if text.trim() == token {
                    continue;
                }
                assert!(
                    verifier.verify(&text, now()).is_err(),
                    "bit {bit} of byte {i} flipped but credential still verified"
                );
            }
        }
    }

    #[test]
    fn rejects_missing_mandatory_claims() {
        let (kp, verifier) = ed25519();
        for claim in ["enabled", "exp", "iat"] {
            let mut claims = good_claims();
            claims.as_object_mut().unwrap().remove(claim);
            let token = sign_ed(&kp, json!({"alg": "EdDSA"}), claims);
            assert_eq!(
                verifier.verify(&token, now()),
                Err(Rejection::MissingClaim(claim)),
                "claim {claim}"
            );
        }
    }

    #[test]
    fn rejects_non_boolean_enabled() {
        let (kp, verifier) = ed25519();
        let mut claims = good_claims();
        claims["enabled"] = json!("yes");
        let token = sign_ed(&kp, json!({"alg": "EdDSA"}), claims);
        assert!(matches!(verifier.verify(&token, now()), Err(Rejection::Malformed(_))));
    }

    #[test]
    fn rejects_expired_credential() {
        let (kp, verifier) = ed25519();
        let mut claims = good_claims();
        claims["exp"] = json!(NOW - 1);
        let token = sign_ed(&kp, json!({"alg": "EdDSA"}), claims);
        assert_eq!(verifier.verify(&token, now()), Err(Rejection::Expired(NOW - 1)));

        let mut at_boundary = good_claims();
        at_boundary["exp"] = json!(NOW);
        let token = sign_ed(&kp, json!({"alg": "EdDSA"}), at_boundary);
        assert!(verifier.verify(&token, now()).unwrap_err().is_expired());
    }

    #[test]
    fn iat_in_future_respects_skew() {
        let (kp, verifier) = ed25519();
        let verifier = verifier.with_clock_skew(Duration::seconds(300));

        let mut within = good_claims();
        within["iat"] = json!(NOW + 299);
        let token = sign_ed(&kp, json!({"alg": "EdDSA"}), within);
        assert!(verifier.verify(&token, now()).is_ok());

        let mut beyond = good_claims();
        beyond["iat"] = json!(NOW + 301);
        let token = sign_ed(&kp, json!({"alg": "EdDSA"}), beyond);
        assert_eq!(verifier.verify(&token, now()), Err(Rejection::NotYetValid(NOW + 301)));
    }

    #[test]
    fn accepts_snake_case_machine_limit_and_no_features() {
        let (kp, verifier) = ed25519();
        let claims = json!({
            "enabled": true,
            "iat": NOW,
            "exp": NOW + 10,
            "machine_limit": 2
        });
        let token = sign_ed(&kp, json!({"alg": "EdDSA"}), claims);
        let cred = verifier.verify(&token, now()).unwrap();
        assert_eq!(cred.machine_limit, Some(2));
        assert!(cred.features.is_empty());
        assert!(cred.edition.is_none());
    }

    #[test]
    fn surrounding_whitespace_is_tolerated() {
        let (kp, verifier) = ed25519();
        let token = sign_ed(&kp, json!({"alg": "EdDSA"}), good_claims());
        assert!(verifier.verify(&format!("\n{token}\r\n"), now()).is_ok());
    }
}
