//! Retrieval of the signed credential.
//!
//! A fetch either yields the raw credential text or reports that the source
//! was unavailable. It never errors outward and never validates: whatever
//! comes back goes through [`CredentialVerifier`](crate::client::verifier::CredentialVerifier).

use std::future::Future;
use std::time::Duration;

use reqwest::Client;

use crate::errors::{LicenseError, LicenseResult};

/// Default request timeout.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 6;

/// Bodies larger than this are not credentials.
const MAX_CREDENTIAL_BYTES: usize = 64 * 1024;

/// Result of one fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Raw credential text, unverified.
    Fetched(String),
    /// DNS, TLS, timeout, non-2xx status, oversized or empty body.
    Unavailable(String),
}

/// Source of credential text.
///
/// Production code uses [`HttpsFetcher`]; tests script their own.
pub trait CredentialFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = FetchOutcome> + Send;
}

/// Fetches over HTTPS with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HttpsFetcher {
    client: Client,
}

impl HttpsFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .https_only(true)
            .timeout(timeout)
            .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpsFetcher {
    async fn fetch_text(&self, url: &str) -> LicenseResult<String> {
        let url = url.trim();
        if !url.to_ascii_lowercase().starts_with("https://") {
            return Err(LicenseError::NetworkUnavailable(format!(
                "refusing non-https credential url {url}"
            )));
        }

        let mut resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(LicenseError::NetworkUnavailable(format!(
                "HTTP status {}",
                resp.status()
            )));
        }
        if resp
            .content_length()
            .is_some_and(|len| len > MAX_CREDENTIAL_BYTES as u64)
        {
            return Err(too_large());
        }

        // Chunked bodies carry no length; stop reading once over the limit.
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            append_capped(&mut body, &chunk)?;
        }

        let text = String::from_utf8(body).map_err(|_| {
            LicenseError::NetworkUnavailable("credential body is not UTF-8".to_string())
        })?;
        let text = text.trim();
        if text.is_empty() {
            return Err(LicenseError::NetworkUnavailable(
                "empty credential body".to_string(),
            ));
        }
        Ok(text.to_string())
    }
}

fn too_large() -> LicenseError {
    LicenseError::NetworkUnavailable("credential body too large".to_string())
}

/// Append one body chunk, failing before the buffer passes the size cap.
fn append_capped(body: &mut Vec<u8>, chunk: &[u8]) -> LicenseResult<()> {
    if body.len() + chunk.len() > MAX_CREDENTIAL_BYTES {
        return Err(too_large());
    }
    body.extend_from_slice(chunk);
    Ok(())
}

impl CredentialFetcher for HttpsFetcher {
    async fn fetch(&self, url: &str) -> FetchOutcome {
        match self.fetch_text(url).await {
            Ok(text) => FetchOutcome::Fetched(text),
            Err(e) => FetchOutcome::Unavailable(e.to_string()),
        }
    }
}
