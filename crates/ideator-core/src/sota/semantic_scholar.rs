use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;

use super::{CitationMetrics, CitationSource, SotaError};
use crate::ApiKey;
use crate::rate_limit::{AdaptivePacer, rate_limit_delay};

pub const SEMANTIC_SCHOLAR_API: &str = "https://api.semanticscholar.org/graph/v1";

const FIELDS: &str = "title,year,citationCount,influentialCitationCount,referenceCount,fieldsOfStudy";

pub struct SemanticScholar {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<ApiKey>,
    limiter: AdaptivePacer,
    timeout: Duration,
}

impl SemanticScholar {
    /// Requests are spaced 500 ms apart; a 429 slows the spacing down further.
    pub fn new(client: reqwest::Client, api_key: Option<ApiKey>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: SEMANTIC_SCHOLAR_API.to_string(),
            api_key,
            limiter: AdaptivePacer::new(Duration::from_millis(500)),
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl CitationSource for SemanticScholar {
    fn name(&self) -> &str {
        "Semantic Scholar"
    }

    fn metrics<'a>(
        &'a self,
        arxiv_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CitationMetrics>, SotaError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!(
                "{}/paper/arXiv:{}?fields={}",
                self.base_url,
                // Old-style ids keep their archive slash in the path.
                urlencoding::encode(strip_version(arxiv_id)).replace("%2F", "/"),
                FIELDS
            );

            self.limiter.wait().await;

            let mut req = self.client.get(&url).timeout(self.timeout);
            if let Some(key) = &self.api_key {
                req = req.header("x-api-key", key.expose());
            }

            let resp = req
                .send()
                .await
                .map_err(|e| SotaError::Search(e.to_string()))?;

            if rate_limit_delay(&resp).is_some() {
                self.limiter.throttled();
                return Err(SotaError::RateLimited {
                    service: "Semantic Scholar",
                });
            }

            let status = resp.status();
            if status.as_u16() == 404 {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(SotaError::Http {
                    service: "Semantic Scholar",
                    status: status.as_u16(),
                });
            }

            let data: Value = resp
                .json()
                .await
                .map_err(|e| SotaError::Search(e.to_string()))?;
            Ok(Some(parse_metrics(&data)))
        })
    }
}

/// `2401.01234v2` -> `2401.01234`. Semantic Scholar indexes unversioned ids.
pub fn strip_version(arxiv_id: &str) -> &str {
    let id = arxiv_id.trim().trim_start_matches("arXiv:");
    match id.rfind('v') {
        Some(pos) if pos > 0 && pos + 1 < id.len() => {
            let version = &id[pos + 1..];
            if version.chars().all(|c| c.is_ascii_digit()) {
                &id[..pos]
            } else {
                id
            }
        }
        _ => id,
    }
}

pub fn parse_metrics(data: &Value) -> CitationMetrics {
    CitationMetrics {
        semantic_scholar_id: data["paperId"].as_str().map(String::from),
        citation_count: data["citationCount"].as_u64().unwrap_or(0),
        influential_citation_count: data["influentialCitationCount"].as_u64().unwrap_or(0),
        reference_count: data["referenceCount"].as_u64().unwrap_or(0),
        fields_of_study: data["fieldsOfStudy"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|f| f.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
        year: data["year"].as_i64().and_then(|y| i32::try_from(y).ok()),
    }
}
