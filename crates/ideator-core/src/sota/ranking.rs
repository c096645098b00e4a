//! Relevance, citation and recency scoring.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde_json::Value;

use super::{ArxivPaper, CitationMetrics, PaperMetrics, RankedPaper};
use crate::gateway::LlmGateway;
use crate::response::{ParseError, extract_json, kind_of};
use crate::{StageParams, prompts};

/// Only this many titles are sent for model scoring; the rest get [`NEUTRAL_SCORE`].
pub const RANKED_TITLES: usize = 15;
pub const NEUTRAL_SCORE: f64 = 0.5;

const CITATION_SATURATION: f64 = 500.0;
const ABSTRACT_PREVIEW: usize = 500;
const MAX_AUTHORS: usize = 5;

const NO_MODEL_REASON: &str = "Paper matches search criteria based on title and abstract content.";
const FALLBACK_REASON: &str = "Relevant based on semantic similarity to the research topic.";

/// One relevance score per paper, in input order.
///
/// Uses the model when a gateway is available and falls back to keyword
/// overlap if the call or its parse fails.
pub async fn score_relevance(
    gateway: Option<&LlmGateway>,
    params: StageParams,
    topic: &str,
    papers: &[ArxivPaper],
) -> Vec<f64> {
    let Some(gateway) = gateway else {
        return keyword_scores(topic, papers);
    };

    let titles: Vec<&str> = papers
        .iter()
        .take(RANKED_TITLES)
        .map(|p| p.title.as_str())
        .collect();
    let scored = gateway
        .complete(
            prompts::rank_relevance(topic, &titles),
            params.temperature,
            params.max_tokens,
        )
        .await
        .map_err(|e| e.to_string())
        .and_then(|raw| parse_scores(&raw).map_err(|e| e.to_string()));

    match scored {
        Ok(scores) => (0..papers.len())
            .map(|i| scores.get(i).copied().unwrap_or(NEUTRAL_SCORE))
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "model relevance scoring failed, using keyword overlap");
            keyword_scores(topic, papers)
        }
    }
}

/// Parse `[0.95, 0.72, ...]`. Scores are clamped to `0..=1`.
pub fn parse_scores(raw: &str) -> Result<Vec<f64>, ParseError> {
    let items = match extract_json(raw)? {
        Value::Array(items) => items,
        other => {
            return Err(ParseError::Shape(format!(
                "expected an array of scores, got {}",
                kind_of(&other)
            )));
        }
    };
    if items.is_empty() {
        return Err(ParseError::Shape("empty score array".into()));
    }
    items
        .iter()
        .map(|v| {
            let score = match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            score
                .filter(|s| s.is_finite())
                .map(|s| s.clamp(0.0, 1.0))
                .ok_or_else(|| ParseError::Shape(format!("score is not a number: {}", v)))
        })
        .collect()
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

pub fn keyword_scores(topic: &str, papers: &[ArxivPaper]) -> Vec<f64> {
    let topic_words = words(topic);
    papers
        .iter()
        .map(|p| keyword_score(&topic_words, p))
        .collect()
}

/// `0.7 * overlap + 0.3 * title_overlap + 0.1`, capped at 1.
fn keyword_score(topic_words: &HashSet<String>, paper: &ArxivPaper) -> f64 {
    if topic_words.is_empty() {
        return NEUTRAL_SCORE;
    }
    let title_words = words(&paper.title);
    let mut text_words = words(&paper.abstract_text);
    text_words.extend(title_words.iter().cloned());

    let max = topic_words.len() as f64;
    let overlap = topic_words.intersection(&text_words).count() as f64 / max;
    let title_overlap = topic_words.intersection(&title_words).count() as f64 / max;
    (overlap * 0.7 + title_overlap * 0.3 + 0.1).min(1.0)
}

pub fn citation_score(citations: u64) -> f64 {
    (citations as f64 / CITATION_SATURATION).min(1.0)
}

/// 1.0 under six months, 0.9 under a year, 0.7 under two, then a ten-year
/// linear decay floored at 0.3. Undated papers score 0.5.
pub fn recency_score(published: Option<NaiveDate>, today: NaiveDate) -> f64 {
    let Some(published) = published else {
        return NEUTRAL_SCORE;
    };
    let days = (today - published).num_days();
    match days {
        d if d < 180 => 1.0,
        d if d < 365 => 0.9,
        d if d < 730 => 0.7,
        d => (1.0 - d as f64 / 3650.0).max(0.3),
    }
}

fn round_to(x: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (x * factor).round() / factor
}

/// Blend relevance (50%), citations (25%) and recency (25%). Rank is assigned by [`finalize`].
pub fn score_paper(
    paper: ArxivPaper,
    relevance: f64,
    metrics: Option<&CitationMetrics>,
    today: NaiveDate,
) -> RankedPaper {
    let citations = metrics.map(|m| m.citation_count).unwrap_or(0);
    let citation = citation_score(citations);
    let recency = recency_score(paper.published, today);
    let final_score = relevance * 0.5 + citation * 0.25 + recency * 0.25;

    let abstract_text = if paper.abstract_text.chars().count() > ABSTRACT_PREVIEW {
        format!(
            "{}...",
            crate::truncate_chars(&paper.abstract_text, ABSTRACT_PREVIEW)
        )
    } else {
        paper.abstract_text
    };

    RankedPaper {
        rank: 0,
        paper_id: format!("arXiv:{}", paper.arxiv_id),
        arxiv_id: paper.arxiv_id,
        title: paper.title,
        abstract_text,
        authors: paper.authors.into_iter().take(MAX_AUTHORS).collect(),
        url: paper.url,
        pdf_url: paper.pdf_url,
        published_date: paper.published.map(|d| d.format("%Y-%m-%d").to_string()),
        categories: paper.categories,
        relevance_score: round_to(relevance, 3),
        final_score: round_to(final_score, 3),
        metrics: PaperMetrics {
            citation_count: citations,
            influential_citations: metrics.map(|m| m.influential_citation_count).unwrap_or(0),
            reference_count: metrics.map(|m| m.reference_count).unwrap_or(0),
            recency_score: round_to(recency, 2),
            citation_score: round_to(citation, 2),
        },
        relevance_reason: None,
    }
}

/// Sort by final score (stable on ties), keep `top_k`, number from 1.
pub fn finalize(mut scored: Vec<RankedPaper>, top_k: usize) -> Vec<RankedPaper> {
    scored.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
    scored.truncate(top_k);
    for (i, paper) in scored.iter_mut().enumerate() {
        paper.rank = i + 1;
    }
    scored
}

/// One-sentence relevance explanation, with fixed fallbacks.
pub async fn explain(
    gateway: Option<&LlmGateway>,
    params: StageParams,
    topic: &str,
    paper: &RankedPaper,
) -> String {
    let Some(gateway) = gateway else {
        return NO_MODEL_REASON.to_string();
    };
    match gateway
        .complete(
            prompts::explain_relevance(topic, &paper.title, &paper.abstract_text),
            params.temperature,
            params.max_tokens,
        )
        .await
    {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or(FALLBACK_REASON)
            .to_string(),
        Err(e) => {
            tracing::debug!(arxiv_id = %paper.arxiv_id, error = %e, "explanation failed");
            FALLBACK_REASON.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineConfig;
    use crate::gateway::GatewayError;
    use crate::gateway::mock::{MockLlm, MockReply};
    use std::sync::Arc;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn paper(title: &str, abstract_text: &str) -> ArxivPaper {
        ArxivPaper {
            arxiv_id: "2401.00001v1".into(),
            title: title.into(),
            abstract_text: abstract_text.into(),
            authors: (0..8).map(|i| format!("Author {}", i)).collect(),
            published: Some(date("2024-06-01")),
            updated: None,
            categories: vec![],
            url: "http://arxiv.org/abs/2401.00001v1".into(),
            pdf_url: None,
        }
    }

    fn gateway(mock: &Arc<MockLlm>) -> LlmGateway {
        let config = PipelineConfig {
            requests_per_minute: 0,
            ..PipelineConfig::default()
        };
        LlmGateway::new(mock.clone(), &config)
    }

    #[test]
    fn recency_bands() {
        let today = date("2025-01-01");
        assert_eq!(recency_score(Some(date("2024-12-01")), today), 1.0);
        assert_eq!(recency_score(Some(date("2024-05-01")), today), 0.9);
        assert_eq!(recency_score(Some(date("2023-06-01")), today), 0.7);
        let five_years = recency_score(Some(date("2020-01-01")), today);
        assert!(five_years > 0.49 && five_years < 0.51);
        assert_eq!(recency_score(Some(date("1990-01-01")), today), 0.3);
        assert_eq!(recency_score(None, today), 0.5);
    }

    #[test]
    fn citation_saturates() {
        assert_eq!(citation_score(0), 0.0);
        assert_eq!(citation_score(250), 0.5);
        assert_eq!(citation_score(5000), 1.0);
    }

    #[test]
    fn keyword_overlap_formula() {
        let scores = keyword_scores(
            "graph neural networks",
            &[
                paper("Graph neural networks for chemistry", ""),
                paper("Protein folding", "We use graph methods."),
                paper("Unrelated", "Nothing here."),
            ],
        );
        assert_eq!(scores[0], 1.0);
        // 1/3 overlap, no title overlap.
        assert!((scores[1] - (0.7 / 3.0 + 0.1)).abs() < 1e-9);
        assert!((scores[2] - 0.1).abs() < 1e-9);
    }

    #[test]
    fn parse_scores_variants() {
        assert_eq!(parse_scores("[0.9, 0.2]").unwrap(), vec![0.9, 0.2]);
        assert_eq!(parse_scores("```json\n[1.5, \"0.3\"]\n```").unwrap(), vec![1.0, 0.3]);
        assert!(parse_scores("[]").is_err());
        assert!(parse_scores("[\"high\"]").is_err());
        assert!(parse_scores("{\"scores\": 1}").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn model_scores_padded_with_neutral() {
        let mock = Arc::new(MockLlm::new(MockReply::text("[0.9]")));
        let papers = vec![paper("a", ""), paper("b", "")];
        let scores = score_relevance(Some(&gateway(&mock)), StageParams::new(0.1, 200), "t", &papers).await;
        assert_eq!(scores, vec![0.9, NEUTRAL_SCORE]);
    }

    #[tokio::test(start_paused = true)]
    async fn model_failure_falls_back_to_keywords() {
        let mock = Arc::new(MockLlm::new(MockReply::Error(GatewayError::Service {
            status: 401,
            message: "bad key".into(),
        })));
        let papers = vec![paper("graph networks", "")];
        let scores =
            score_relevance(Some(&gateway(&mock)), StageParams::new(0.1, 200), "graph networks", &papers)
                .await;
        assert_eq!(scores, vec![1.0]);
    }

    #[test]
    fn scored_paper_shape() {
        let long = "x".repeat(600);
        let metrics = CitationMetrics {
            citation_count: 100,
            influential_citation_count: 4,
            ..CitationMetrics::default()
        };
        let ranked = score_paper(paper("T", &long), 0.8, Some(&metrics), date("2025-01-01"));
        assert_eq!(ranked.paper_id, "arXiv:2401.00001v1");
        assert_eq!(ranked.authors.len(), 5);
        assert_eq!(ranked.abstract_text.chars().count(), 503);
        assert_eq!(ranked.published_date.as_deref(), Some("2024-06-01"));
        assert_eq!(ranked.metrics.citation_score, 0.2);
        assert_eq!(ranked.metrics.recency_score, 0.9);
        // 0.4 + 0.05 + 0.225
        assert_eq!(ranked.final_score, 0.675);
    }

    #[test]
    fn finalize_ranks_from_one() {
        let today = date("2025-01-01");
        let scored = vec![
            score_paper(paper("low", ""), 0.1, None, today),
            score_paper(paper("high", ""), 0.9, None, today),
            score_paper(paper("mid", ""), 0.5, None, today),
        ];
        let ranked = finalize(scored, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].title, "high");
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].title, "mid");
        assert_eq!(ranked[1].rank, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn explanation_fallbacks() {
        let ranked = score_paper(paper("T", "A"), 0.5, None, date("2025-01-01"));
        assert_eq!(
            explain(None, StageParams::new(0.3, 100), "t", &ranked).await,
            NO_MODEL_REASON
        );

        let mock = Arc::new(MockLlm::new(MockReply::Error(GatewayError::Transient("x".into()))));
        assert_eq!(
            explain(Some(&gateway(&mock)), StageParams::new(0.3, 100), "t", &ranked).await,
            FALLBACK_REASON
        );

        let mock = Arc::new(MockLlm::new(MockReply::text("\nIt is directly on topic.\nExtra.")));
        assert_eq!(
            explain(Some(&gateway(&mock)), StageParams::new(0.3, 100), "t", &ranked).await,
            "It is directly on topic."
        );
    }
}
