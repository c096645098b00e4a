//! Per-stage repair and fallback policy.
//!
//! Every gateway-backed stage runs through [`StagePolicy::run`]: one call, a
//! shape check, up to `max_repairs` repair re-prompts, and then either the
//! stage's fallback constructor or a [`StageFailure`] when the stage has no
//! safe default.

use std::fmt;

use crate::gateway::{ChatMessage, GatewayError, LlmGateway};
use crate::response::{ParseError, preview};
use crate::{PaperId, Stage, StageParams, Warning, prompts};

/// Why a stage could not produce a parsed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFailure {
    /// The gateway gave up (after its own transient retries).
    Gateway(GatewayError),
    /// Every attempt returned text that failed the shape check.
    Malformed { attempts: u32, error: ParseError },
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailure::Gateway(e) => write!(f, "{}", e),
            StageFailure::Malformed { attempts, error } => {
                write!(f, "malformed output after {} attempt(s): {}", attempts, error)
            }
        }
    }
}

impl std::error::Error for StageFailure {}

/// Tagged result of a stage.
#[derive(Debug)]
pub enum StageOutcome<T> {
    /// Parsed and validated.
    Complete(T),
    /// A usable value, built partly or wholly from defaults.
    Degraded { value: T, warnings: Vec<Warning> },
    /// No value and no safe default.
    Failed(StageFailure),
}

impl<T> StageOutcome<T> {
    /// Take the value, appending any soft warnings to `sink`.
    pub fn resolve(self, sink: &mut Vec<Warning>) -> Result<T, StageFailure> {
        match self {
            StageOutcome::Complete(v) => Ok(v),
            StageOutcome::Degraded { value, warnings } => {
                sink.extend(warnings);
                Ok(value)
            }
            StageOutcome::Failed(e) => Err(e),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, StageOutcome::Complete(_))
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, StageOutcome::Degraded { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            StageOutcome::Complete(v) | StageOutcome::Degraded { value: v, .. } => Some(v),
            StageOutcome::Failed(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageOutcome<U> {
        match self {
            StageOutcome::Complete(v) => StageOutcome::Complete(f(v)),
            StageOutcome::Degraded { value, warnings } => StageOutcome::Degraded {
                value: f(value),
                warnings,
            },
            StageOutcome::Failed(e) => StageOutcome::Failed(e),
        }
    }

    /// Attach extra warnings, turning a complete outcome into a degraded one.
    pub fn with_warnings(self, extra: Vec<Warning>) -> Self {
        if extra.is_empty() {
            return self;
        }
        match self {
            StageOutcome::Complete(value) => StageOutcome::Degraded {
                value,
                warnings: extra,
            },
            StageOutcome::Degraded { value, mut warnings } => {
                warnings.extend(extra);
                StageOutcome::Degraded { value, warnings }
            }
            failed => failed,
        }
    }
}

type Fallback<T> = Box<dyn FnOnce(&StageFailure) -> T + Send>;

/// Repair budget and fallback constructor for one stage invocation.
pub struct StagePolicy<T> {
    pub stage: Stage,
    pub max_repairs: u32,
    fallback: Option<Fallback<T>>,
}

impl<T> fmt::Debug for StagePolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagePolicy")
            .field("stage", &self.stage)
            .field("max_repairs", &self.max_repairs)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// One prompt plus what to send if the reply needs reshaping.
pub struct StageRequest {
    pub messages: Vec<ChatMessage>,
    pub params: StageParams,
    /// Shape description quoted in the repair re-prompt.
    pub shape_hint: String,
}

impl<T> StagePolicy<T> {
    /// No safe default: exhausting the repairs fails the stage.
    pub fn fatal(stage: Stage, max_repairs: u32) -> Self {
        Self {
            stage,
            max_repairs,
            fallback: None,
        }
    }

    /// Exhausting the repairs yields `fallback(failure)` plus a warning.
    pub fn degrade_to(
        stage: Stage,
        max_repairs: u32,
        fallback: impl FnOnce(&StageFailure) -> T + Send + 'static,
    ) -> Self {
        Self {
            stage,
            max_repairs,
            fallback: Some(Box::new(fallback)),
        }
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Run the stage: call, parse, repair, then settle.
    pub async fn run<P>(
        self,
        gateway: &LlmGateway,
        request: StageRequest,
        paper: Option<PaperId>,
        parse: P,
    ) -> StageOutcome<T>
    where
        P: Fn(&str) -> Result<T, ParseError>,
    {
        let attempt = attempt_with_repair(
            gateway,
            self.stage,
            self.max_repairs,
            request,
            paper,
            parse,
        )
        .await;
        self.settle(attempt, paper)
    }

    /// Turn an attempt result into an outcome using this policy's fallback.
    pub fn settle(self, attempt: Result<T, StageFailure>, paper: Option<PaperId>) -> StageOutcome<T> {
        match attempt {
            Ok(v) => StageOutcome::Complete(v),
            Err(failure) => match self.fallback {
                Some(fallback) => {
                    tracing::warn!(stage = %self.stage, paper = ?paper, error = %failure, "stage degraded to fallback");
                    let value = fallback(&failure);
                    StageOutcome::Degraded {
                        value,
                        warnings: vec![Warning::new(
                            self.stage,
                            paper,
                            format!("{}; using fallback", failure),
                        )],
                    }
                }
                None => StageOutcome::Failed(failure),
            },
        }
    }
}

async fn attempt_with_repair<T, P>(
    gateway: &LlmGateway,
    stage: Stage,
    max_repairs: u32,
    request: StageRequest,
    paper: Option<PaperId>,
    parse: P,
) -> Result<T, StageFailure>
where
    P: Fn(&str) -> Result<T, ParseError>,
{
    let StageRequest {
        messages: original,
        params,
        shape_hint,
    } = request;
    let mut messages = original.clone();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let (raw, error) = match gateway
            .complete(messages, params.temperature, params.max_tokens)
            .await
        {
            Ok(raw) => match parse(&raw) {
                Ok(v) => return Ok(v),
                Err(e) => (raw, e),
            },
            Err(GatewayError::EmptyResponse) => (String::new(), ParseError::NoJson),
            Err(e) => return Err(StageFailure::Gateway(e)),
        };

        tracing::debug!(
            stage = %stage,
            paper = ?paper,
            attempt = attempts,
            error = %error,
            preview = preview(&raw),
            "unparseable stage response"
        );

        if attempts > max_repairs {
            return Err(StageFailure::Malformed { attempts, error });
        }

        // An empty reply has nothing to reshape, so ask the original question again.
        messages = original.clone();
        if !raw.trim().is_empty() {
            messages.push(ChatMessage::assistant(raw));
            messages.push(ChatMessage::user(prompts::repair(&shape_hint)));
        }
    }
}
