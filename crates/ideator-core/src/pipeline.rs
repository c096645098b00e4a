//! The run orchestrator.
//!
//! Sequences the stages strictly forward, threads each stage's output into
//! the next, collects soft warnings, and decides which failures end the run.
//! Only [`PipelineError::DualParseFailure`] and
//! [`PipelineError::SynthesisFailure`] (plus cancellation) are fatal.

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::gateway::LlmGateway;
use crate::stage::StageOutcome;
use crate::{
    CanonicalWeakness, DEFAULT_ASPECTS, Document, PipelineConfig, PipelineError, PipelineEvent,
    PipelineResult, RawWeaknessList, Stage, StructuredPaper, Warning, comparison, extractor,
    fusion, normalizer, structurer, synthesizer,
};

/// A configured pipeline. Cheap to clone; concurrent runs share only the gateway.
#[derive(Debug, Clone)]
pub struct Pipeline {
    gateway: LlmGateway,
    config: Arc<PipelineConfig>,
}

impl Pipeline {
    /// Pipeline talking to the endpoint named in `config`.
    pub fn new(config: PipelineConfig) -> Self {
        let gateway = LlmGateway::from_config(&config);
        Self::with_gateway(gateway, config)
    }

    /// Pipeline over an existing gateway (a mock, or one shared with other runs).
    pub fn with_gateway(gateway: LlmGateway, config: PipelineConfig) -> Self {
        Self {
            gateway,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gateway(&self) -> &LlmGateway {
        &self.gateway
    }

    /// `run(documentA, documentB, aspectList) -> PipelineResult | PipelineError`.
    pub async fn run(
        &self,
        document_a: Document,
        document_b: Document,
        aspects: &[String],
    ) -> Result<PipelineResult, PipelineError> {
        self.run_with_progress(
            document_a,
            document_b,
            aspects,
            |_| {},
            CancellationToken::new(),
        )
        .await
    }

    /// Run with a progress callback and a cancellation token.
    ///
    /// Once `cancel` fires, the in-flight stage is dropped and no further
    /// gateway calls are issued.
    pub async fn run_with_progress(
        &self,
        document_a: Document,
        document_b: Document,
        aspects: &[String],
        progress: impl Fn(PipelineEvent) + Send + Sync,
        cancel: CancellationToken,
    ) -> Result<PipelineResult, PipelineError> {
        let mut tracker = Tracker::new(&progress);
        let result = self
            .run_stages(&document_a, &document_b, aspects, &mut tracker, &cancel)
            .await;
        match &result {
            Ok(_) => tracker.finish(),
            Err(e) => tracker.fail(e),
        }
        result
    }

    async fn run_stages<F: Fn(PipelineEvent)>(
        &self,
        document_a: &Document,
        document_b: &Document,
        aspects: &[String],
        tracker: &mut Tracker<'_, F>,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult, PipelineError> {
        let config = self.config.as_ref();
        let gateway = &self.gateway;
        let aspects = resolve_aspects(aspects, &config.aspects);
        let mut warnings = Vec::new();

        tracker.enter(Stage::ParsingDocuments);
        let (outcome_a, outcome_b) = guarded(
            cancel,
            Stage::ParsingDocuments,
            pair(
                config.concurrent_calls,
                structurer::structure_document(gateway, config, document_a),
                structurer::structure_document(gateway, config, document_b),
            ),
        )
        .await?;
        let (paper_a, parsed_a) = settle_paper(outcome_a, document_a, &mut warnings);
        let (paper_b, parsed_b) = settle_paper(outcome_b, document_b, &mut warnings);
        tracker.warn(&warnings);
        if !parsed_a && !parsed_b {
            let reason = warnings
                .iter()
                .filter(|w| w.stage == Stage::ParsingDocuments)
                .map(|w| w.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PipelineError::DualParseFailure {
                reason: if reason.is_empty() {
                    "no section found in either document".into()
                } else {
                    reason
                },
            });
        }
        tracker.complete();

        tracker.enter(Stage::ExtractingWeaknesses);
        let raw_a = guarded(
            cancel,
            Stage::ExtractingWeaknesses,
            extractor::extract_weaknesses(gateway, config, &paper_a),
        )
        .await?;
        let raw_b = guarded(
            cancel,
            Stage::ExtractingWeaknesses,
            extractor::extract_weaknesses(gateway, config, &paper_b),
        )
        .await?;
        let raw_a = settle_raw(raw_a, &paper_a, &mut warnings);
        let raw_b = settle_raw(raw_b, &paper_b, &mut warnings);
        tracker.warn(&warnings);
        tracker.complete();

        tracker.enter(Stage::NormalizingWeaknesses);
        let (canon_a, canon_b) = guarded(
            cancel,
            Stage::NormalizingWeaknesses,
            pair(
                config.concurrent_calls,
                normalizer::normalize_weaknesses(gateway, config, &raw_a),
                normalizer::normalize_weaknesses(gateway, config, &raw_b),
            ),
        )
        .await?;
        let canon_a = settle_canonical(canon_a, &raw_a, config, &mut warnings);
        let canon_b = settle_canonical(canon_b, &raw_b, config, &mut warnings);
        tracker.warn(&warnings);
        tracker.complete();

        tracker.enter(Stage::FusingWeaknesses);
        let analysis = fusion::fuse(&canon_a, &canon_b);
        tracing::info!(
            shared = analysis.shared.len(),
            a_only = analysis.paper_a_only.len(),
            b_only = analysis.paper_b_only.len(),
            "weaknesses fused"
        );
        tracker.complete();

        tracker.enter(Stage::SynthesizingMethod);
        let proposed_method = guarded(
            cancel,
            Stage::SynthesizingMethod,
            synthesizer::synthesize_method(gateway, config, &analysis, &paper_a, &paper_b),
        )
        .await?
        .resolve(&mut warnings)
        .map_err(|failure| PipelineError::SynthesisFailure {
            reason: failure.to_string(),
        })?;
        tracker.warn(&warnings);
        tracker.complete();

        tracker.enter(Stage::BuildingComparison);
        let comparison_table = match guarded(
            cancel,
            Stage::BuildingComparison,
            comparison::build_comparison(
                gateway,
                config,
                &aspects,
                &paper_a,
                &paper_b,
                &proposed_method,
            ),
        )
        .await?
        .resolve(&mut warnings)
        {
            Ok(table) => table,
            Err(failure) => {
                warnings.push(Warning::new(
                    Stage::BuildingComparison,
                    None,
                    format!("{}; using placeholder table", failure),
                ));
                crate::ComparisonTable::placeholder(&aspects)
            }
        };
        tracker.warn(&warnings);
        tracker.complete();

        Ok(PipelineResult {
            weaknesses_a: labels(&canon_a),
            weaknesses_b: labels(&canon_b),
            paper_a,
            paper_b,
            analysis,
            proposed_method,
            comparison_table,
            warnings,
        })
    }
}

/// Deduplicate aspects (first spelling wins) and fall back to the configured
/// list, then to the built-in defaults, when none are given.
pub fn resolve_aspects(requested: &[String], configured: &[String]) -> Vec<String> {
    let pick = |list: &[String]| {
        let mut seen = std::collections::HashSet::new();
        list.iter()
            .map(|a| a.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|a| !a.is_empty() && seen.insert(fusion::normalize_label(a)))
            .collect::<Vec<_>>()
    };
    let aspects = pick(requested);
    if !aspects.is_empty() {
        return aspects;
    }
    let aspects = pick(configured);
    if !aspects.is_empty() {
        return aspects;
    }
    DEFAULT_ASPECTS.iter().map(|a| a.to_string()).collect()
}

fn labels(canonical: &[CanonicalWeakness]) -> Vec<String> {
    canonical.iter().map(|w| w.label.clone()).collect()
}

/// The paper, and whether the reply actually parsed. An empty document or a
/// fallback record counts as unparsed even though it carries a value; a clean
/// reply with every section null counts as parsed.
fn settle_paper(
    outcome: StageOutcome<StructuredPaper>,
    document: &Document,
    warnings: &mut Vec<Warning>,
) -> (StructuredPaper, bool) {
    let parsed = outcome.is_complete();
    let paper = outcome.resolve(warnings).unwrap_or_else(|failure| {
        warnings.push(Warning::new(
            Stage::ParsingDocuments,
            Some(document.id()),
            failure.to_string(),
        ));
        StructuredPaper::absent(document.id())
    });
    (paper, parsed)
}

fn settle_raw(
    outcome: StageOutcome<RawWeaknessList>,
    paper: &StructuredPaper,
    warnings: &mut Vec<Warning>,
) -> RawWeaknessList {
    outcome.resolve(warnings).unwrap_or_else(|failure| {
        warnings.push(Warning::new(
            Stage::ExtractingWeaknesses,
            Some(paper.id),
            failure.to_string(),
        ));
        RawWeaknessList::new(paper.id)
    })
}

fn settle_canonical(
    outcome: StageOutcome<Vec<CanonicalWeakness>>,
    raw: &RawWeaknessList,
    config: &PipelineConfig,
    warnings: &mut Vec<Warning>,
) -> Vec<CanonicalWeakness> {
    outcome.resolve(warnings).unwrap_or_else(|failure| {
        warnings.push(Warning::new(
            Stage::NormalizingWeaknesses,
            Some(raw.paper),
            failure.to_string(),
        ));
        normalizer::canonicalize(raw, &[], config.dedup_threshold)
    })
}

/// Await `fut` unless the run is cancelled first.
async fn guarded<T>(
    cancel: &CancellationToken,
    stage: Stage,
    fut: impl Future<Output = T>,
) -> Result<T, PipelineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::info!(stage = %stage, "run cancelled");
            Err(PipelineError::Cancelled { stage })
        }
        value = fut => Ok(value),
    }
}

/// Two independent calls, concurrently or one after the other.
async fn pair<A, B>(
    concurrent: bool,
    a: impl Future<Output = A>,
    b: impl Future<Output = B>,
) -> (A, B) {
    if concurrent {
        tokio::join!(a, b)
    } else {
        (a.await, b.await)
    }
}

/// Emits progress events and enforces forward-only stage movement.
struct Tracker<'a, F> {
    progress: &'a F,
    stage: Stage,
    started: Instant,
    warned: usize,
}

impl<'a, F: Fn(PipelineEvent)> Tracker<'a, F> {
    fn new(progress: &'a F) -> Self {
        Self {
            progress,
            stage: Stage::ParsingDocuments,
            started: Instant::now(),
            warned: 0,
        }
    }

    fn enter(&mut self, stage: Stage) {
        debug_assert!(stage >= self.stage, "stage moved backwards");
        self.stage = stage;
        self.started = Instant::now();
        tracing::info!(stage = %stage, "stage started");
        (self.progress)(PipelineEvent::StageStarted { stage });
    }

    fn complete(&mut self) {
        let elapsed = self.started.elapsed();
        tracing::debug!(stage = %self.stage, elapsed_ms = elapsed.as_millis() as u64, "stage completed");
        (self.progress)(PipelineEvent::StageCompleted {
            stage: self.stage,
            elapsed,
        });
    }

    /// Emit warnings not yet reported.
    fn warn(&mut self, warnings: &[Warning]) {
        for w in &warnings[self.warned.min(warnings.len())..] {
            (self.progress)(PipelineEvent::Warning(w.clone()));
        }
        self.warned = warnings.len();
    }

    fn finish(&mut self) {
        self.stage = Stage::Done;
        tracing::info!(warnings = self.warned, "run complete");
    }

    fn fail(&mut self, error: &PipelineError) {
        tracing::warn!(stage = %self.stage, error = %error, "run failed");
        (self.progress)(PipelineEvent::Failed {
            stage: self.stage,
            error: error.to_string(),
        });
        self.stage = Stage::Failed;
    }
}
