use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod comparison;
pub mod config_file;
pub mod extractor;
pub mod fusion;
pub mod gateway;
pub mod normalizer;
pub mod pipeline;
pub mod prompts;
pub mod rate_limit;
pub mod response;
pub mod sota;
pub mod stage;
pub mod structurer;
pub mod synthesizer;

// Re-export for convenience
pub use gateway::{ChatBackend, ChatMessage, CompletionRequest, GatewayError, LlmGateway, Role};
pub use pipeline::Pipeline;
pub use response::ParseError;
pub use stage::{StageFailure, StageOutcome, StagePolicy};

/// Cell text used whenever the comparison stage cannot fill a cell.
pub const INSUFFICIENT_INFORMATION: &str = "insufficient information";

/// Aspects compared when the caller does not supply any.
pub const DEFAULT_ASPECTS: [&str; 4] = [
    "Task Scalability",
    "Theoretical Foundation",
    "Computational Efficiency",
    "Generalization Capability",
];

/// Which of the two input slots a document occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PaperId {
    A,
    B,
}

impl fmt::Display for PaperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaperId::A => write!(f, "A"),
            PaperId::B => write!(f, "B"),
        }
    }
}

/// Raw text of one input paper. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Document {
    id: PaperId,
    text: String,
}

impl Document {
    pub fn new(id: PaperId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }

    pub fn id(&self) -> PaperId {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// A paper section that weaknesses can be traced back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Method,
    Experiments,
    Limitations,
    Abstract,
}

impl Section {
    /// Sections the weakness extractor reviews, in order.
    pub const REVIEWED: [Section; 3] = [Section::Method, Section::Experiments, Section::Limitations];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Method => "method",
            Section::Experiments => "experiments",
            Section::Limitations => "limitations",
            Section::Abstract => "abstract",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-shape record extracted from a document. `None` means "not found",
/// which is a valid terminal value rather than an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredPaper {
    pub id: PaperId,
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub method: Option<String>,
    pub experiments: Option<String>,
    pub limitations: Option<String>,
}

impl StructuredPaper {
    /// A paper with every field marked absent.
    pub fn absent(id: PaperId) -> Self {
        Self {
            id,
            title: None,
            abstract_text: None,
            method: None,
            experiments: None,
            limitations: None,
        }
    }

    pub fn section(&self, section: Section) -> Option<&str> {
        match section {
            Section::Method => self.method.as_deref(),
            Section::Experiments => self.experiments.as_deref(),
            Section::Limitations => self.limitations.as_deref(),
            Section::Abstract => self.abstract_text.as_deref(),
        }
    }

    pub fn present_fields(&self) -> usize {
        [
            &self.title,
            &self.abstract_text,
            &self.method,
            &self.experiments,
            &self.limitations,
        ]
        .iter()
        .filter(|f| f.is_some())
        .count()
    }

    pub fn is_fully_absent(&self) -> bool {
        self.present_fields() == 0
    }
}

/// One free-text weakness and the section it was extracted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawWeakness {
    pub text: String,
    pub section: Section,
}

/// Weaknesses extracted from every reviewed section of one paper, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawWeaknessList {
    pub paper: PaperId,
    pub items: Vec<RawWeakness>,
}

impl RawWeaknessList {
    pub fn new(paper: PaperId) -> Self {
        Self {
            paper,
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A deduplicated, labeled weakness merged from one or more raw statements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalWeakness {
    pub label: String,
    pub sections: BTreeSet<Section>,
    /// Indices into the paper's [`RawWeaknessList`].
    pub source_indices: BTreeSet<usize>,
    pub paper: PaperId,
}

/// Shared and per-paper weakness labels. The three lists are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaknessAnalysis {
    pub shared: Vec<String>,
    pub paper_a_only: Vec<String>,
    pub paper_b_only: Vec<String>,
}

impl WeaknessAnalysis {
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.paper_a_only.is_empty() && self.paper_b_only.is_empty()
    }
}

/// One named building block of a proposed method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub description: String,
}

/// The synthesized method. `components` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedMethod {
    pub name: String,
    pub core_idea: String,
    pub components: Vec<Component>,
    pub addresses_weaknesses: String,
}

/// The three cells of one comparison aspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonCells {
    pub paper_a: String,
    pub paper_b: String,
    pub proposed: String,
}

impl ComparisonCells {
    pub fn insufficient() -> Self {
        Self {
            paper_a: INSUFFICIENT_INFORMATION.to_string(),
            paper_b: INSUFFICIENT_INFORMATION.to_string(),
            proposed: INSUFFICIENT_INFORMATION.to_string(),
        }
    }

    pub fn is_insufficient(&self) -> bool {
        [&self.paper_a, &self.paper_b, &self.proposed]
            .iter()
            .all(|c| c.as_str() == INSUFFICIENT_INFORMATION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonRow {
    pub aspect: String,
    pub cells: ComparisonCells,
}

/// Aspect-keyed comparison, in the order the aspects were requested.
///
/// Serializes as a JSON object so the aspect names become keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComparisonTable {
    pub rows: Vec<ComparisonRow>,
}

impl ComparisonTable {
    /// A table with every requested aspect set to "insufficient information".
    pub fn placeholder(aspects: &[String]) -> Self {
        Self {
            rows: aspects
                .iter()
                .map(|a| ComparisonRow {
                    aspect: a.clone(),
                    cells: ComparisonCells::insufficient(),
                })
                .collect(),
        }
    }

    pub fn get(&self, aspect: &str) -> Option<&ComparisonCells> {
        self.rows
            .iter()
            .find(|r| r.aspect == aspect)
            .map(|r| &r.cells)
    }

    pub fn aspects(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|r| r.aspect.as_str())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Serialize for ComparisonTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.rows.len()))?;
        for row in &self.rows {
            map.serialize_entry(&row.aspect, &row.cells)?;
        }
        map.end()
    }
}

/// Pipeline states, in the only order they may be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    ParsingDocuments,
    ExtractingWeaknesses,
    NormalizingWeaknesses,
    FusingWeaknesses,
    SynthesizingMethod,
    BuildingComparison,
    Done,
    Failed,
}

impl Stage {
    /// The stage that follows this one on the success path.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::ParsingDocuments => Some(Stage::ExtractingWeaknesses),
            Stage::ExtractingWeaknesses => Some(Stage::NormalizingWeaknesses),
            Stage::NormalizingWeaknesses => Some(Stage::FusingWeaknesses),
            Stage::FusingWeaknesses => Some(Stage::SynthesizingMethod),
            Stage::SynthesizingMethod => Some(Stage::BuildingComparison),
            Stage::BuildingComparison => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::ParsingDocuments => "parsing documents",
            Stage::ExtractingWeaknesses => "extracting weaknesses",
            Stage::NormalizingWeaknesses => "normalizing weaknesses",
            Stage::FusingWeaknesses => "fusing weaknesses",
            Stage::SynthesizingMethod => "synthesizing method",
            Stage::BuildingComparison => "building comparison",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A recoverable failure that was replaced by a default or placeholder value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paper: Option<PaperId>,
    pub message: String,
}

impl Warning {
    pub fn new(stage: Stage, paper: Option<PaperId>, message: impl Into<String>) -> Self {
        Self {
            stage,
            paper,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.paper {
            Some(p) => write!(f, "[{}] paper {}: {}", self.stage, p, self.message),
            None => write!(f, "[{}] {}", self.stage, self.message),
        }
    }
}

/// Aggregated output of a successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub paper_a: StructuredPaper,
    pub paper_b: StructuredPaper,
    pub weaknesses_a: Vec<String>,
    pub weaknesses_b: Vec<String>,
    pub analysis: WeaknessAnalysis,
    pub proposed_method: ProposedMethod,
    pub comparison_table: ComparisonTable,
    pub warnings: Vec<Warning>,
}

/// Fatal outcomes of a run. Partial results are never returned.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("both documents failed structuring: {reason}")]
    DualParseFailure { reason: String },
    #[error("method synthesis failed: {reason}")]
    SynthesisFailure { reason: String },
    #[error("run cancelled during {stage}")]
    Cancelled { stage: Stage },
}

impl PipelineError {
    /// Short machine-readable kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::DualParseFailure { .. } => "DualParseFailure",
            PipelineError::SynthesisFailure { .. } => "SynthesisFailure",
            PipelineError::Cancelled { .. } => "Cancelled",
        }
    }
}

/// Progress events emitted while a run advances.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted {
        stage: Stage,
    },
    StageCompleted {
        stage: Stage,
        elapsed: Duration,
    },
    Warning(Warning),
    Failed {
        stage: Stage,
        error: String,
    },
}

/// Temperature and token budget for one kind of gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl StageParams {
    pub const fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

/// Generation parameters for every call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub structure: StageParams,
    pub extract: StageParams,
    pub normalize: StageParams,
    pub synthesize: StageParams,
    pub compare: StageParams,
    pub rank: StageParams,
    pub explain: StageParams,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            structure: StageParams::new(0.1, 3000),
            extract: StageParams::new(0.2, 1000),
            normalize: StageParams::new(0.1, 800),
            synthesize: StageParams::new(0.5, 2500),
            compare: StageParams::new(0.2, 2500),
            rank: StageParams::new(0.1, 200),
            explain: StageParams::new(0.3, 100),
        }
    }
}

/// API credential handed in by the caller. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Configuration threaded explicitly into the gateway and the pipeline.
#[derive(Clone)]
pub struct PipelineConfig {
    pub model: String,
    /// Base URL of an OpenAI-compatible chat completions API.
    pub base_url: String,
    pub api_key: Option<ApiKey>,
    pub request_timeout_secs: u64,
    /// Retries for transient gateway failures (network, timeout, 429).
    pub max_transient_retries: u32,
    pub retry_backoff_ms: u64,
    /// Outbound request budget shared by every run using the same gateway. 0 disables.
    pub requests_per_minute: u32,
    pub aspects: Vec<String>,
    /// Issue the independent per-paper calls concurrently.
    pub concurrent_calls: bool,
    /// Review the abstract when no reviewed section yields a weakness.
    pub abstract_fallback: bool,
    /// Merge canonical labels whose fuzzy similarity reaches this value (0..=1).
    pub dedup_threshold: Option<f64>,
    pub max_document_chars: usize,
    pub max_section_chars: usize,
    pub min_section_chars: usize,
    pub params: GenerationParams,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_transient_retries", &self.max_transient_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("aspects", &self.aspects)
            .field("concurrent_calls", &self.concurrent_calls)
            .field("abstract_fallback", &self.abstract_fallback)
            .field("dedup_threshold", &self.dedup_threshold)
            .field("max_document_chars", &self.max_document_chars)
            .field("max_section_chars", &self.max_section_chars)
            .field("min_section_chars", &self.min_section_chars)
            .field("params", &self.params)
            .finish()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: "llama-3.3-70b-versatile".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key: None,
            request_timeout_secs: 45,
            max_transient_retries: 1,
            retry_backoff_ms: 1000,
            requests_per_minute: 30,
            aspects: DEFAULT_ASPECTS.iter().map(|a| a.to_string()).collect(),
            concurrent_calls: true,
            abstract_fallback: false,
            dedup_threshold: None,
            max_document_chars: 8000,
            max_section_chars: 3000,
            min_section_chars: 50,
            params: GenerationParams::default(),
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Truncate `text` to at most `max_chars` characters without splitting a char.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Run the full pipeline on two documents.
///
/// Convenience wrapper over [`Pipeline::run_with_progress`]. Progress events are
/// emitted via the callback; the run stops issuing gateway calls once `cancel`
/// fires.
pub async fn run(
    config: PipelineConfig,
    document_a: Document,
    document_b: Document,
    aspects: &[String],
    progress: impl Fn(PipelineEvent) + Send + Sync,
    cancel: CancellationToken,
) -> Result<PipelineResult, PipelineError> {
    let pipeline = Pipeline::new(config);
    pipeline
        .run_with_progress(document_a, document_b, aspects, progress, cancel)
        .await
}
