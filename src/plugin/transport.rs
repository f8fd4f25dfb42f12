//! Remote access
//!
//! [`Transport`] is the raw HTTP seam; [`RemoteClient`] wraps it with
//! per-host pacing, a bounded timeout and status handling. Every index,
//! package and icon request goes through `RemoteClient::fetch`.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::rate_limit::RateLimiter;
use super::types::CatalogRemote;
use crate::core::config::NetworkConfig;
use crate::core::error::{CatalogError, Result};

/// Requests made to a throttling host before giving up
const THROTTLE_ATTEMPTS: usize = 3;

/// Status and body of a completed request
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Raw GET access to remote hosts
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a GET. Non-2xx statuses are responses, not errors.
    async fn get(&self, url: &Url) -> Result<TransportResponse>;
}

/// [`Transport`] backed by a shared `reqwest` client
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> Result<TransportResponse> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(TransportResponse { status, body })
    }
}

/// Rate-limited, timeout-bounded client for catalog downloads
#[derive(Clone)]
pub struct RemoteClient {
    transport: Arc<dyn Transport>,
    rate_limiter: RateLimiter,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(transport: Arc<dyn Transport>, rate_limiter: RateLimiter, timeout: Duration) -> Self {
        Self { transport, rate_limiter, timeout }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// GET `url` and return the body of a 2xx response.
    ///
    /// Waits for a permit from the rate limiter first and reports the status
    /// back afterwards. Timeouts and transport failures leave pacing
    /// untouched; only real statuses adjust it. A `429` is retried at the
    /// slower pace, up to `THROTTLE_ATTEMPTS` requests in total.
    pub async fn fetch(&self, url: &str) -> Result<Bytes> {
        let url = Url::parse(url)?;
        let host = url
            .host_str()
            .ok_or_else(|| CatalogError::DownloadFailed(format!("{} has no host", url)))?
            .to_string();

        let mut attempt = 1;
        let response = loop {
            self.rate_limiter.until_permitted(&host).await;

            debug!(host = %host, url = %url, attempt, "Fetching");
            let response = tokio::time::timeout(self.timeout, self.transport.get(&url))
                .await
                .map_err(|_| CatalogError::Timeout(format!("{} after {:?}", url, self.timeout)))??;

            self.rate_limiter.on_response(&host, response.status).await;

            if response.status != 429 {
                break response;
            }
            if attempt >= THROTTLE_ATTEMPTS {
                warn!(host = %host, url = %url, attempts = attempt, "Host kept throttling");
                return Err(CatalogError::HostThrottled(format!(
                    "{} after {} attempts",
                    url, attempt
                )));
            }
            attempt += 1;
        };

        if !response.is_success() {
            warn!(host = %host, url = %url, status = response.status, "Request rejected");
            return Err(CatalogError::DownloadFailed(format!(
                "{} returned HTTP {}",
                url, response.status
            )));
        }
        Ok(response.body)
    }

    /// Fetch a remote index: a JSON array of installable catalogs
    pub async fn fetch_index(&self, index_url: &str) -> Result<Vec<CatalogRemote>> {
        let body = self.fetch(index_url).await?;
        let remotes: Vec<CatalogRemote> = serde_json::from_slice(&body)?;
        debug!(url = %index_url, count = remotes.len(), "Fetched catalog index");
        Ok(remotes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RateLimitConfig;
    use crate::plugin::testing::MockTransport;

    fn client(transport: Arc<MockTransport>) -> RemoteClient {
        RemoteClient::new(transport, RateLimiter::new(RateLimitConfig::default()), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_index() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            "https://repo.example/index.json",
            200,
            br#"[{"packageId":"demo","version":"1.0.0","packageUrl":"https://repo.example/demo.cpkg"}]"#.to_vec(),
        );

        let remotes = client(transport.clone())
            .fetch_index("https://repo.example/index.json")
            .await
            .unwrap();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].package_id, "demo");
        assert_eq!(transport.hits("https://repo.example/index.json"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_response_slows_host() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("https://slow.example/a", 429, Vec::new());
        let client = client(transport.clone());

        let err = client.fetch("https://slow.example/a").await.unwrap_err();
        assert!(matches!(err, CatalogError::HostThrottled(_)));
        assert_eq!(transport.hits("https://slow.example/a"), THROTTLE_ATTEMPTS);
        assert!(client.rate_limiter().current_rate("slow.example").await < 2.0);
        assert_eq!(client.rate_limiter().current_rate("other.example").await, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_after("https://x.example/pkg", 200, vec![1], Duration::from_secs(60));

        let err = client(transport).fetch("https://x.example/pkg").await.unwrap_err();
        assert!(matches!(err, CatalogError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unknown_url_is_404() {
        let transport = Arc::new(MockTransport::new());
        let err = client(transport).fetch("https://x.example/missing").await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}
