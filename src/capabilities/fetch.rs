//! Default `fetch` backend: an HTTP GET through reqwest.
//!
//! Only http/https URLs are accepted and the body is capped so a
//! snippet cannot pull an arbitrarily large download into memory.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use super::{FetchedResponse, Fetcher};
use crate::config::CapabilitiesConfig;

pub struct HttpFetcher {
    client: Client,
    max_response_size: usize,
}

impl HttpFetcher {
    pub fn new(config: &CapabilitiesConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.fetch_timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(
                config.fetch_connect_timeout_secs,
            ))
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            max_response_size: config.max_response_size,
        }
    }
}

/// Parses `url` and rejects anything that is not http(s).
pub fn validate_url(url: &str) -> anyhow::Result<url::Url> {
    let parsed = url::Url::parse(url).map_err(|e| anyhow::anyhow!("invalid URL '{url}': {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(anyhow::anyhow!(
            "unsupported scheme '{scheme}' (only http/https)"
        )),
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedResponse> {
        let parsed = validate_url(url)?;

        debug!("Fetching URL: {parsed}");

        let response = self.client.get(parsed).send().await.map_err(|e| {
            warn!("Fetch failed: {e}");
            anyhow::anyhow!("request failed: {e}")
        })?;

        // Check Content-Length if available
        if let Some(len) = response.content_length() {
            if len as usize > self.max_response_size {
                return Err(anyhow::anyhow!(
                    "response too large ({} bytes, limit is {} bytes)",
                    len,
                    self.max_response_size
                ));
            }
        }

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/plain")
            .to_string();

        let body = response
            .bytes()
            .await
            .map_err(|e| anyhow::anyhow!("error reading response: {e}"))?;

        if body.len() > self.max_response_size {
            return Err(anyhow::anyhow!(
                "response too large ({} bytes, limit is {} bytes)",
                body.len(),
                self.max_response_size
            ));
        }

        Ok(FetchedResponse {
            url: final_url,
            status,
            content_type,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(&CapabilitiesConfig::default())
    }

    // ── validate_url tests ──────────────────────────────

    #[test]
    fn test_validate_url_accepts_http_and_https() {
        assert!(validate_url("http://example.com").is_ok());
        assert!(validate_url("https://example.com/path?q=1").is_ok());
    }

    #[test]
    fn test_validate_url_rejects_garbage() {
        let err = validate_url("not-a-url").unwrap_err();
        assert!(err.to_string().contains("invalid URL"));
    }

    #[test]
    fn test_validate_url_rejects_file_scheme() {
        let err = validate_url("file:///etc/passwd").unwrap_err();
        assert!(err.to_string().contains("unsupported scheme 'file'"));
    }

    #[test]
    fn test_validate_url_rejects_data_scheme() {
        let err = validate_url("data:text/html,<h1>hi</h1>").unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    // ── HttpFetcher tests (no network) ──────────────────

    #[tokio::test]
    async fn test_fetch_rejects_ftp_before_sending() {
        let result = fetcher().fetch("ftp://example.com/file").await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("ftp"));
    }

    #[tokio::test]
    async fn test_fetch_rejects_invalid_url() {
        assert!(fetcher().fetch("::::").await.is_err());
    }

    #[test]
    fn test_new_does_not_panic() {
        let _fetcher = fetcher();
    }
}
