//! Weakness extraction: one strict-reviewer call per present section.

use crate::gateway::{GatewayError, LlmGateway};
use crate::response::parse_bullets;
use crate::stage::StageOutcome;
use crate::{
    PipelineConfig, RawWeakness, RawWeaknessList, Section, Stage, StructuredPaper, Warning,
    prompts,
};

/// Extract raw weaknesses from a structured paper.
///
/// Sections that are absent or shorter than `min_section_chars` yield nothing
/// and cost no call. A section whose call fails contributes an empty list and
/// a warning; the stage itself never fails.
pub async fn extract_weaknesses(
    gateway: &LlmGateway,
    config: &PipelineConfig,
    paper: &StructuredPaper,
) -> StageOutcome<RawWeaknessList> {
    let mut list = RawWeaknessList::new(paper.id);
    let mut warnings = Vec::new();

    for section in Section::REVIEWED {
        let Some(text) = reviewable(config, paper, section) else {
            continue;
        };
        match review(gateway, config, section, text).await {
            Ok(items) => push_items(&mut list, section, items),
            Err(e) => {
                tracing::warn!(paper = %paper.id, section = %section, error = %e, "section review failed");
                warnings.push(Warning::new(
                    Stage::ExtractingWeaknesses,
                    Some(paper.id),
                    format!("{} section skipped: {}", section, e),
                ));
            }
        }
    }

    if list.is_empty()
        && config.abstract_fallback
        && let Some(text) = reviewable(config, paper, Section::Abstract)
    {
        tracing::debug!(paper = %paper.id, "no section weaknesses, reviewing abstract");
        match review(gateway, config, Section::Abstract, text).await {
            Ok(items) => push_items(&mut list, Section::Abstract, items),
            Err(e) => warnings.push(Warning::new(
                Stage::ExtractingWeaknesses,
                Some(paper.id),
                format!("abstract review failed: {}", e),
            )),
        }
    }

    tracing::debug!(paper = %paper.id, count = list.len(), "raw weaknesses extracted");
    StageOutcome::Complete(list).with_warnings(warnings)
}

fn reviewable<'a>(
    config: &PipelineConfig,
    paper: &'a StructuredPaper,
    section: Section,
) -> Option<&'a str> {
    let text = paper.section(section)?.trim();
    if text.chars().count() < config.min_section_chars {
        return None;
    }
    Some(crate::truncate_chars(text, config.max_section_chars))
}

async fn review(
    gateway: &LlmGateway,
    config: &PipelineConfig,
    section: Section,
    text: &str,
) -> Result<Vec<String>, GatewayError> {
    let params = config.params.extract;
    match gateway
        .complete(
            prompts::review_section(section, text),
            params.temperature,
            params.max_tokens,
        )
        .await
    {
        Ok(raw) => Ok(parse_bullets(&raw)),
        // Nothing to list is a valid answer for a reviewer.
        Err(GatewayError::EmptyResponse) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn push_items(list: &mut RawWeaknessList, section: Section, items: Vec<String>) {
    list.items
        .extend(items.into_iter().map(|text| RawWeakness { text, section }));
}
