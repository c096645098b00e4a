//! Weakness normalization: group near-duplicate statements under canonical labels.
//!
//! Grouping is delegated to the model. The result is then made deterministic
//! and lossless by [`canonicalize`]:
//!
//! - every raw index ends up in exactly one canonical weakness;
//! - indices the model skipped (or that only an empty label claimed) become
//!   singletons labelled with their own text;
//! - labels equal after case/whitespace normalization are merged, and so are
//!   labels whose fuzzy similarity reaches `dedup_threshold` when one is set.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::fusion::normalize_label;
use crate::gateway::LlmGateway;
use crate::response::{ParseError, extract_json, kind_of, squash_key};
use crate::stage::{StageOutcome, StagePolicy, StageRequest};
use crate::{CanonicalWeakness, PipelineConfig, RawWeaknessList, Stage, prompts};

/// One group as proposed by the model, before validation against the raw list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelGroup {
    pub label: String,
    pub source_indices: Vec<usize>,
}

/// Canonicalize one paper's raw weaknesses.
///
/// A failed grouping call degrades to one singleton per raw statement.
pub async fn normalize_weaknesses(
    gateway: &LlmGateway,
    config: &PipelineConfig,
    raw: &RawWeaknessList,
) -> StageOutcome<Vec<CanonicalWeakness>> {
    if raw.is_empty() {
        return StageOutcome::Complete(Vec::new());
    }

    let request = StageRequest {
        messages: prompts::normalize(raw),
        params: config.params.normalize,
        shape_hint: prompts::NORMALIZE_SHAPE.to_string(),
    };
    let outcome = StagePolicy::degrade_to(Stage::NormalizingWeaknesses, 0, |_| Vec::new())
        .run(gateway, request, Some(raw.paper), parse_groups)
        .await;

    let threshold = config.dedup_threshold;
    let outcome = outcome.map(|groups| canonicalize(raw, &groups, threshold));
    if let Some(canonical) = outcome.value() {
        tracing::debug!(
            paper = %raw.paper,
            raw = raw.len(),
            canonical = canonical.len(),
            "weaknesses normalized"
        );
    }
    outcome
}

/// Parse `[{"label", "sourceIndices"}]`.
///
/// Also accepts the array wrapped in an object (`{"groups": [...]}`) and the
/// `source_indices`/`indices` spellings. Non-integer indices are skipped.
pub fn parse_groups(raw: &str) -> Result<Vec<LabelGroup>, ParseError> {
    let value = extract_json(raw)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.into_iter().find_map(|(_, v)| match v {
            Value::Array(items) => Some(items),
            _ => None,
        }) {
            Some(items) => items,
            None => return Err(ParseError::Shape("expected an array of groups".into())),
        },
        other => {
            return Err(ParseError::Shape(format!(
                "expected an array of groups, got {}",
                kind_of(&other)
            )));
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let Value::Object(map) = item else {
                return Err(ParseError::Shape(format!("group {} is not an object", i)));
            };
            let mut label = None;
            let mut indices = Vec::new();
            for (key, value) in map {
                match squash_key(&key).as_str() {
                    "label" | "canonical" | "name" => label = value.as_str().map(String::from),
                    "sourceindices" | "indices" | "sources" => indices = index_list(&value),
                    _ => {}
                }
            }
            let label =
                label.ok_or_else(|| ParseError::Shape(format!("group {} has no label", i)))?;
            Ok(LabelGroup {
                label,
                source_indices: indices,
            })
        })
        .collect()
}

fn index_list(value: &Value) -> Vec<usize> {
    match value {
        Value::Array(values) => values
            .iter()
            .filter_map(|v| match v {
                Value::Number(n) => n.as_u64().map(|n| n as usize),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .collect(),
        Value::Number(n) => n.as_u64().map(|n| vec![n as usize]).unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Build the canonical list from the model's groups. Pure.
///
/// Output is ordered by each weakness's first source index.
pub fn canonicalize(
    raw: &RawWeaknessList,
    groups: &[LabelGroup],
    dedup_threshold: Option<f64>,
) -> Vec<CanonicalWeakness> {
    let n = raw.len();
    let mut claimed = vec![false; n];
    let mut out: Vec<CanonicalWeakness> = Vec::new();

    for group in groups {
        let label = tidy_label(&group.label);
        if label.is_empty() {
            continue;
        }
        let indices: BTreeSet<usize> = group
            .source_indices
            .iter()
            .copied()
            .filter(|&i| i < n && !claimed[i])
            .collect();
        if indices.is_empty() {
            continue;
        }
        for &i in &indices {
            claimed[i] = true;
        }
        merge_into(&mut out, raw, label, indices, dedup_threshold);
    }

    for i in (0..n).filter(|&i| !claimed[i]) {
        let label = tidy_label(&raw.items[i].text);
        merge_into(&mut out, raw, label, BTreeSet::from([i]), dedup_threshold);
    }

    out.sort_by_key(|w| w.source_indices.first().copied().unwrap_or(usize::MAX));
    out
}

fn merge_into(
    out: &mut Vec<CanonicalWeakness>,
    raw: &RawWeaknessList,
    label: String,
    indices: BTreeSet<usize>,
    dedup_threshold: Option<f64>,
) {
    let key = normalize_label(&label);
    let sections = indices.iter().map(|&i| raw.items[i].section);

    if let Some(existing) = out
        .iter_mut()
        .find(|w| is_duplicate(&normalize_label(&w.label), &key, dedup_threshold))
    {
        existing.sections.extend(sections);
        existing.source_indices.extend(indices);
        return;
    }

    out.push(CanonicalWeakness {
        label,
        sections: sections.collect(),
        source_indices: indices,
        paper: raw.paper,
    });
}

fn is_duplicate(a: &str, b: &str, threshold: Option<f64>) -> bool {
    if a == b {
        return true;
    }
    match threshold {
        Some(t) => rapidfuzz::fuzz::ratio(a.chars(), b.chars()) >= t,
        None => false,
    }
}

/// Collapse whitespace and drop trailing periods, keeping the text as-is
/// when nothing else would be left.
fn tidy_label(label: &str) -> String {
    let collapsed = label.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.trim_end_matches('.') {
        "" => collapsed,
        tidied => tidied.to_string(),
    }
}
