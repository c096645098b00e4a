//! State-of-the-art discovery for a research topic.
//!
//! Searches arXiv, ranks candidates by relevance (model-scored when a gateway
//! is available, keyword-scored otherwise), enriches the best of them with
//! Semantic Scholar citation counts, and blends relevance, citations and
//! recency into a final ranking.

pub mod arxiv;
pub mod ranking;
pub mod semantic_scholar;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;

use crate::gateway::LlmGateway;
use crate::{ApiKey, GenerationParams, PipelineConfig};

pub use arxiv::Arxiv;
pub use semantic_scholar::SemanticScholar;

pub const MAX_TOP_K: usize = 10;
pub const MAX_RESULTS: usize = 50;

#[derive(Error, Debug)]
pub enum SotaError {
    #[error("topic is empty")]
    EmptyTopic,
    #[error("invalid date window: {0}")]
    InvalidDateWindow(String),
    #[error("paper search failed: {0}")]
    Search(String),
    #[error("HTTP {status} from {service}")]
    Http { service: &'static str, status: u16 },
    #[error("{service} rate limited the request")]
    RateLimited { service: &'static str },
    #[error("XML parse error: {0}")]
    Xml(String),
}

/// One arXiv search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArxivPaper {
    /// Versioned identifier, e.g. `2401.01234v2`.
    pub arxiv_id: String,
    pub title: String,
    pub abstract_text: String,
    pub authors: Vec<String>,
    pub published: Option<NaiveDate>,
    pub updated: Option<NaiveDate>,
    pub categories: Vec<String>,
    pub url: String,
    pub pdf_url: Option<String>,
}

/// Citation metrics from Semantic Scholar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CitationMetrics {
    pub semantic_scholar_id: Option<String>,
    pub citation_count: u64,
    pub influential_citation_count: u64,
    pub reference_count: u64,
    pub fields_of_study: Vec<String>,
    pub year: Option<i32>,
}

/// Search parameters. Limits are clamped by [`SotaQuery::clamped`].
#[derive(Debug, Clone)]
pub struct SotaQuery {
    pub max_results: usize,
    pub top_k: usize,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub include_metrics: bool,
    pub explain: bool,
}

impl Default for SotaQuery {
    fn default() -> Self {
        Self {
            max_results: 20,
            top_k: 2,
            start_date: None,
            end_date: None,
            include_metrics: true,
            explain: true,
        }
    }
}

impl SotaQuery {
    pub fn clamped(mut self) -> Self {
        self.top_k = self.top_k.clamp(1, MAX_TOP_K);
        self.max_results = self.max_results.clamp(1, MAX_RESULTS);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperMetrics {
    pub citation_count: u64,
    pub influential_citations: u64,
    pub reference_count: u64,
    pub recency_score: f64,
    pub citation_score: f64,
}

/// One entry of the final ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedPaper {
    pub rank: usize,
    pub paper_id: String,
    pub arxiv_id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub authors: Vec<String>,
    pub url: String,
    pub pdf_url: Option<String>,
    pub published_date: Option<String>,
    pub categories: Vec<String>,
    pub relevance_score: f64,
    pub final_score: f64,
    pub metrics: PaperMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SotaReport {
    pub topic: String,
    pub total_found: usize,
    pub top_k: usize,
    pub papers: Vec<RankedPaper>,
}

/// A literature search backend.
pub trait PaperSearch: Send + Sync {
    fn name(&self) -> &str;

    fn search<'a>(
        &'a self,
        topic: &'a str,
        max_results: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ArxivPaper>, SotaError>> + Send + 'a>>;
}

/// A citation metrics backend. `Ok(None)` means the paper is unknown to it.
pub trait CitationSource: Send + Sync {
    fn name(&self) -> &str;

    fn metrics<'a>(
        &'a self,
        arxiv_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CitationMetrics>, SotaError>> + Send + 'a>>;
}

/// Runs discovery against a search backend and a citation backend.
#[derive(Clone)]
pub struct SotaFinder {
    search: Arc<dyn PaperSearch>,
    citations: Arc<dyn CitationSource>,
    gateway: Option<LlmGateway>,
    params: GenerationParams,
}

impl std::fmt::Debug for SotaFinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SotaFinder")
            .field("search", &self.search.name())
            .field("citations", &self.citations.name())
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl SotaFinder {
    /// arXiv plus Semantic Scholar. Model ranking is used only when `config`
    /// carries an API key.
    pub fn from_config(config: &PipelineConfig, semantic_scholar_key: Option<ApiKey>) -> Self {
        let timeout = Duration::from_secs(30);
        let client = reqwest::Client::builder()
            .user_agent(concat!("ideator/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        let gateway = config
            .api_key
            .is_some()
            .then(|| LlmGateway::from_config(config));
        Self {
            search: Arc::new(Arxiv::new(client.clone(), timeout)),
            citations: Arc::new(SemanticScholar::new(
                client,
                semantic_scholar_key,
                Duration::from_secs(10),
            )),
            gateway,
            params: config.params,
        }
    }

    pub fn with_sources(
        search: Arc<dyn PaperSearch>,
        citations: Arc<dyn CitationSource>,
        gateway: Option<LlmGateway>,
        params: GenerationParams,
    ) -> Self {
        Self {
            search,
            citations,
            gateway,
            params,
        }
    }

    /// `identify_sota(topic, query) -> SotaReport`.
    pub async fn identify_sota(
        &self,
        topic: &str,
        query: SotaQuery,
    ) -> Result<SotaReport, SotaError> {
        let today = chrono::Local::now().date_naive();
        self.identify_sota_at(topic, query, today).await
    }

    async fn identify_sota_at(
        &self,
        topic: &str,
        query: SotaQuery,
        today: NaiveDate,
    ) -> Result<SotaReport, SotaError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(SotaError::EmptyTopic);
        }
        let query = query.clamped();
        if let (Some(start), Some(end)) = (query.start_date, query.end_date)
            && start > end
        {
            return Err(SotaError::InvalidDateWindow(format!(
                "start {} is after end {}",
                start, end
            )));
        }

        tracing::info!(topic, source = self.search.name(), "searching for papers");
        let found = self.search.search(topic, query.max_results).await?;
        let papers = arxiv::filter_by_date(found, query.start_date, query.end_date);

        let mut report = SotaReport {
            topic: topic.to_string(),
            total_found: papers.len(),
            top_k: query.top_k,
            papers: Vec::new(),
        };
        if papers.is_empty() {
            tracing::warn!(topic, "no candidate papers found");
            return Ok(report);
        }

        let relevance =
            ranking::score_relevance(self.gateway.as_ref(), self.params.rank, topic, &papers).await;

        let mut candidates: Vec<(ArxivPaper, f64)> = papers.into_iter().zip(relevance).collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        candidates.truncate(query.top_k * 2);

        let mut scored = Vec::with_capacity(candidates.len());
        for (paper, relevance) in candidates {
            let metrics = if query.include_metrics {
                self.lookup_metrics(&paper.arxiv_id).await
            } else {
                None
            };
            scored.push(ranking::score_paper(paper, relevance, metrics.as_ref(), today));
        }

        let mut ranked = ranking::finalize(scored, query.top_k);
        if query.explain {
            let reasons = join_all(ranked.iter().map(|paper| {
                ranking::explain(self.gateway.as_ref(), self.params.explain, topic, paper)
            }))
            .await;
            for (paper, reason) in ranked.iter_mut().zip(reasons) {
                paper.relevance_reason = Some(reason);
            }
        }

        tracing::info!(topic, returned = ranked.len(), "ranking complete");
        report.papers = ranked;
        Ok(report)
    }

    async fn lookup_metrics(&self, arxiv_id: &str) -> Option<CitationMetrics> {
        match self.citations.metrics(arxiv_id).await {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(arxiv_id, source = self.citations.name(), error = %e, "metrics lookup failed");
                None
            }
        }
    }
}

/// Convenience wrapper: arXiv and Semantic Scholar with the given configuration.
pub async fn identify_sota(
    config: &PipelineConfig,
    topic: &str,
    query: SotaQuery,
) -> Result<SotaReport, SotaError> {
    SotaFinder::from_config(config, None)
        .identify_sota(topic, query)
        .await
}
