//! Upstream Provider Port
//!
//! The pipeline never talks HTTP directly. Everything that needs feed
//! data goes through [`UpstreamProvider`], so tests substitute fakes
//! and the binary wires in the reqwest-backed adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::channel::DataKind;
use crate::fetch::FetchError;

/// Source of raw feed payloads.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Fetch the payload for a single entity of the given kind.
    ///
    /// `entity_id` is `None` for kind-global data such as the full
    /// fixture list.
    async fn fetch_entity(
        &self,
        kind: DataKind,
        entity_id: Option<&str>,
    ) -> Result<Value, FetchError>;

    /// Fetch payloads for several entities of the same kind.
    ///
    /// The result pairs each requested id with its payload. Providers
    /// without a batch endpoint may loop over `fetch_entity`.
    async fn fetch_batch(
        &self,
        kind: DataKind,
        entity_ids: &[String],
    ) -> Result<Vec<(String, Value)>, FetchError> {
        let mut results = Vec::with_capacity(entity_ids.len());
        for id in entity_ids {
            let payload = self.fetch_entity(kind, Some(id)).await?;
            results.push((id.clone(), payload));
        }
        Ok(results)
    }
}

// ============================================================================
// HTTP adapter
// ============================================================================

/// Configuration for the HTTP upstream adapter.
#[derive(Debug, Clone)]
pub struct HttpUpstreamConfig {
    /// Base URL of the feed API, without a trailing slash.
    pub base_url: String,
    /// API key sent in the `x-api-key` header.
    pub api_key: String,
    /// Per-request timeout applied at the HTTP client level.
    pub request_timeout: Duration,
}

/// [`UpstreamProvider`] backed by a feed HTTP API.
#[derive(Debug, Clone)]
pub struct HttpUpstreamProvider {
    client: reqwest::Client,
    config: HttpUpstreamConfig,
}

impl HttpUpstreamProvider {
    /// Build the adapter and its connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(config: HttpUpstreamConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn url_for(&self, kind: DataKind, entity_id: Option<&str>) -> String {
        let base = &self.config.base_url;
        match (kind, entity_id) {
            (DataKind::Odds, Some(id)) => format!("{base}/v1/odds/{id}"),
            (DataKind::Odds, None) => format!("{base}/v1/odds"),
            (DataKind::Scorecard, Some(id)) => format!("{base}/v1/scorecards/{id}"),
            (DataKind::Scorecard, None) => format!("{base}/v1/scorecards"),
            (DataKind::Fixtures, _) => format!("{base}/v1/fixtures"),
        }
    }

    async fn execute(&self, url: &str) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(url)
            .header("x-api-key", &self.config.api_key)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    FetchError::Timeout {
                        elapsed: self.config.request_timeout,
                    }
                } else {
                    FetchError::Upstream {
                        status: 0,
                        message: err.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::RateLimited {
                reason: format!("429 from {url}"),
                retry_after,
            });
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FetchError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| FetchError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl UpstreamProvider for HttpUpstreamProvider {
    async fn fetch_entity(
        &self,
        kind: DataKind,
        entity_id: Option<&str>,
    ) -> Result<Value, FetchError> {
        let url = self.url_for(kind, entity_id);
        tracing::debug!(kind = %kind, entity = entity_id.unwrap_or("-"), %url, "Fetching upstream payload");
        self.execute(&url).await
    }

    async fn fetch_batch(
        &self,
        kind: DataKind,
        entity_ids: &[String],
    ) -> Result<Vec<(String, Value)>, FetchError> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let base = &self.config.base_url;
        let joined = entity_ids.join(",");
        let url = match kind {
            DataKind::Odds => format!("{base}/v1/odds?ids={joined}"),
            DataKind::Scorecard => format!("{base}/v1/scorecards?ids={joined}"),
            DataKind::Fixtures => format!("{base}/v1/fixtures"),
        };

        let payload = self.execute(&url).await?;

        // Batch endpoints answer with an object keyed by entity id.
        let map = payload
            .as_object()
            .ok_or_else(|| FetchError::Malformed("batch response is not an object".into()))?;

        Ok(entity_ids
            .iter()
            .filter_map(|id| map.get(id).map(|value| (id.clone(), value.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HttpUpstreamProvider {
        HttpUpstreamProvider::new(HttpUpstreamConfig {
            base_url: "https://feed.example.com".into(),
            api_key: "test".into(),
            request_timeout: Duration::from_secs(5),
        })
        .expect("client builds")
    }

    #[test]
    fn entity_urls() {
        let p = provider();
        assert_eq!(
            p.url_for(DataKind::Odds, Some("match-9")),
            "https://feed.example.com/v1/odds/match-9"
        );
        assert_eq!(
            p.url_for(DataKind::Scorecard, Some("match-9")),
            "https://feed.example.com/v1/scorecards/match-9"
        );
        assert_eq!(
            p.url_for(DataKind::Fixtures, None),
            "https://feed.example.com/v1/fixtures"
        );
        // Fixtures are kind-global; an entity id does not change the URL.
        assert_eq!(
            p.url_for(DataKind::Fixtures, Some("ignored")),
            "https://feed.example.com/v1/fixtures"
        );
    }
}
