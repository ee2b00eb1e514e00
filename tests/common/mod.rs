#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::{json, Value};
use tempfile::TempDir;

use warden::client::engine::{EngineSettings, LicenseDecisionEngine};
use warden::client::fetcher::{CredentialFetcher, FetchOutcome};
use warden::client::grace::GracePolicy;
use warden::client::state::StateStore;
use warden::client::storage::StorageDir;
use warden::client::verifier::CredentialVerifier;
use warden::clock::ManualClock;
use warden::config::LicenseMode;
use warden::fingerprint::FingerprintSource;
use warden::signature::{SignatureAlgorithm, VerifyingKey};

pub const TOKEN_URL: &str = "https://licenses.example.com/acme/token.jws";

/// Day 0 of every scenario.
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_760_000_000, 0).unwrap()
}

/// Signs credentials the way the publisher's tooling does.
pub struct Issuer {
    key_pair: Ed25519KeyPair,
}

impl Issuer {
    pub fn new() -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        Self {
            key_pair: Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap(),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::new(
            SignatureAlgorithm::EdDsa,
            self.key_pair.public_key().as_ref().to_vec(),
        )
        .unwrap()
    }

    pub fn mint(&self, claims: &Value) -> String {
        let header = json!({ "alg": "EdDSA", "typ": "JWT" });
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let sig = self.key_pair.sign(signing_input.as_bytes());
        format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig.as_ref()))
    }

    /// Pro credential issued at `at`, valid for `valid_for`.
    pub fn credential(&self, at: DateTime<Utc>, enabled: bool, valid_for: Duration) -> String {
        self.mint(&json!({
            "enabled": enabled,
            "iat": at.timestamp(),
            "exp": (at + valid_for).timestamp(),
            "edition": "pro",
            "features": ["export", "sync"],
            "customer": "ACME Ltd",
            "machineLimit": 3,
        }))
    }

    pub fn valid(&self, at: DateTime<Utc>) -> String {
        self.credential(at, true, Duration::days(365))
    }

    pub fn disabled(&self, at: DateTime<Utc>) -> String {
        self.credential(at, false, Duration::days(365))
    }
}

/// Fetcher whose answer the test controls. Clones share state.
#[derive(Clone)]
pub struct ScriptedFetcher {
    next: Arc<Mutex<FetchOutcome>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedFetcher {
    pub fn offline() -> Self {
        Self {
            next: Arc::new(Mutex::new(FetchOutcome::Unavailable(
                "network unreachable".to_string(),
            ))),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn serve(&self, token: impl Into<String>) {
        *self.next.lock().unwrap() = FetchOutcome::Fetched(token.into());
    }

    pub fn go_offline(&self) {
        *self.next.lock().unwrap() = FetchOutcome::Unavailable("network unreachable".to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> FetchOutcome {
        assert_eq!(url, TOKEN_URL);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.next.lock().unwrap().clone();
        next
    }
}

pub type TestEngine = LicenseDecisionEngine<ScriptedFetcher, Arc<ManualClock>>;

/// An engine wired to a temp state dir, scripted network and manual clock.
pub struct Harness {
    pub dir: TempDir,
    pub issuer: Issuer,
    pub fetcher: ScriptedFetcher,
    pub clock: Arc<ManualClock>,
    pub engine: TestEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_fingerprint(FingerprintSource::Fixed("build-1".to_string()))
    }

    pub fn with_fingerprint(fingerprint: FingerprintSource) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Issuer::new();
        let fetcher = ScriptedFetcher::offline();
        let clock = Arc::new(ManualClock::new(t0()));

        let settings = EngineSettings {
            mode: LicenseMode::Cloud,
            token_url: TOKEN_URL.to_string(),
            grace: GracePolicy::default(),
            fingerprint,
        };
        let store = StateStore::open(StorageDir::new(dir.path().join("warden"))).unwrap();
        let engine = LicenseDecisionEngine::new(
            settings,
            fetcher.clone(),
            CredentialVerifier::new(issuer.verifying_key()),
            store,
            clock.clone(),
        );

        Self {
            dir,
            issuer,
            fetcher,
            clock,
            engine,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("warden")
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    pub fn at(&self, at: DateTime<Utc>) {
        self.clock.set(at);
    }

    pub fn day(&self, days: i64) {
        self.clock.set(t0() + Duration::days(days));
    }

    /// Serve a fresh valid credential at the current clock time.
    pub fn serve_valid(&self) {
        self.fetcher.serve(self.issuer.valid(self.now()));
    }

    pub fn now(&self) -> DateTime<Utc> {
        use warden::clock::Clock;
        self.clock.now()
    }
}
