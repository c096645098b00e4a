//! Comparative analysis across a caller-fixed list of aspects.

use serde_json::{Map, Value};

use crate::fusion::normalize_label;
use crate::gateway::LlmGateway;
use crate::response::{ParseError, extract_json, kind_of, squash_key};
use crate::stage::{StageOutcome, StagePolicy, StageRequest};
use crate::{
    ComparisonCells, ComparisonRow, ComparisonTable, PipelineConfig, ProposedMethod, Stage,
    StructuredPaper, Warning, prompts,
};

/// A parsed table plus what the reply left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedComparison {
    pub table: ComparisonTable,
    /// Requested aspects with no usable row.
    pub missing: Vec<String>,
    /// `(aspect, column)` pairs filled with the placeholder inside a present row.
    pub missing_cells: Vec<(String, &'static str)>,
}

/// Build the comparison table.
///
/// Always yields a table with exactly the requested aspects, in order. Missing
/// aspects and cells are filled with "insufficient information" and reported
/// as warnings.
pub async fn build_comparison(
    gateway: &LlmGateway,
    config: &PipelineConfig,
    aspects: &[String],
    paper_a: &StructuredPaper,
    paper_b: &StructuredPaper,
    proposed: &ProposedMethod,
) -> StageOutcome<ComparisonTable> {
    let request = StageRequest {
        messages: prompts::compare(aspects, paper_a, paper_b, proposed, config.max_section_chars),
        params: config.params.compare,
        shape_hint: prompts::comparison_shape(aspects),
    };
    let placeholder = ComparisonTable::placeholder(aspects);
    let outcome = StagePolicy::degrade_to(Stage::BuildingComparison, 0, move |_| ParsedComparison {
        table: placeholder,
        missing: Vec::new(),
        missing_cells: Vec::new(),
    })
    .run(gateway, request, None, |raw| parse_comparison(raw, aspects))
    .await;

    let mut warnings = Vec::new();
    let outcome = outcome.map(|parsed| {
        for aspect in &parsed.missing {
            tracing::warn!(aspect = %aspect, "comparison reply omitted aspect");
            warnings.push(Warning::new(
                Stage::BuildingComparison,
                None,
                format!("aspect \"{}\" missing from reply; filled with placeholder", aspect),
            ));
        }
        for (aspect, column) in &parsed.missing_cells {
            tracing::warn!(aspect = %aspect, column, "comparison reply omitted cell");
            warnings.push(Warning::new(
                Stage::BuildingComparison,
                None,
                format!(
                    "cell \"{}\" of aspect \"{}\" missing from reply; filled with placeholder",
                    column, aspect
                ),
            ));
        }
        parsed.table
    });
    outcome.with_warnings(warnings)
}

/// Match a reply against the requested aspects.
///
/// Keys are compared case-insensitively with whitespace collapsed; the table
/// keeps the caller's spelling and order and drops aspects nobody asked for.
/// A reply that matches none of the aspects is malformed.
pub fn parse_comparison(raw: &str, aspects: &[String]) -> Result<ParsedComparison, ParseError> {
    let object = match extract_json(raw)? {
        Value::Object(map) => map,
        other => {
            return Err(ParseError::Shape(format!(
                "expected an object keyed by aspect, got {}",
                kind_of(&other)
            )));
        }
    };
    let object = unwrap_table(object, aspects);

    let mut rows = Vec::with_capacity(aspects.len());
    let mut missing = Vec::new();
    let mut missing_cells = Vec::new();
    for aspect in aspects {
        let parsed = match find_aspect(&object, aspect) {
            Some(Value::Object(cells)) => Some(parse_cells(cells)),
            _ => None,
        };
        let cells = match parsed {
            // A row without a single usable cell counts as a missing aspect.
            Some((cells, absent)) if absent.len() < COLUMNS.len() => {
                missing_cells.extend(absent.into_iter().map(|column| (aspect.clone(), column)));
                cells
            }
            _ => {
                missing.push(aspect.clone());
                ComparisonCells::insufficient()
            }
        };
        rows.push(ComparisonRow {
            aspect: aspect.clone(),
            cells,
        });
    }

    if !aspects.is_empty() && missing.len() == aspects.len() {
        return Err(ParseError::Shape("reply contains none of the requested aspects".into()));
    }

    Ok(ParsedComparison {
        table: ComparisonTable { rows },
        missing,
        missing_cells,
    })
}

/// Some replies nest the table under a `comparison`/`table` key.
fn unwrap_table(object: Map<String, Value>, aspects: &[String]) -> Map<String, Value> {
    if aspects.iter().any(|a| find_aspect(&object, a).is_some()) {
        return object;
    }
    let nested = object.iter().find_map(|(k, v)| match (squash_key(k).as_str(), v) {
        ("comparison" | "comparisontable" | "table", Value::Object(inner)) => Some(inner.clone()),
        _ => None,
    });
    nested.unwrap_or(object)
}

fn find_aspect<'a>(object: &'a Map<String, Value>, aspect: &str) -> Option<&'a Value> {
    if let Some(v) = object.get(aspect) {
        return Some(v);
    }
    let want = normalize_label(aspect);
    let squashed = squash_key(aspect);
    object
        .iter()
        .find(|(k, _)| normalize_label(k) == want)
        .or_else(|| object.iter().find(|(k, _)| squash_key(k) == squashed))
        .map(|(_, v)| v)
}

const COLUMNS: [&str; 3] = ["paper_a", "paper_b", "proposed"];

/// The row's cells plus the columns that had no usable text.
fn parse_cells(cells: &Map<String, Value>) -> (ComparisonCells, Vec<&'static str>) {
    let mut out = ComparisonCells::insufficient();
    let mut found = [false; 3];
    for (key, value) in cells {
        let (slot, column) = match squash_key(key).as_str() {
            "papera" | "a" => (&mut out.paper_a, 0),
            "paperb" | "b" => (&mut out.paper_b, 1),
            "proposed" | "proposedmethod" | "ours" => (&mut out.proposed, 2),
            _ => continue,
        };
        if let Some(text) = cell_text(value) {
            *slot = text;
            found[column] = true;
        }
    }
    let absent = COLUMNS
        .iter()
        .zip(found)
        .filter_map(|(column, ok)| (!ok).then_some(*column))
        .collect();
    (out, absent)
}

fn cell_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty() && !text.eq_ignore_ascii_case("null")).then_some(text)
}

/// True when every cell of every row is the placeholder.
pub fn is_placeholder(table: &ComparisonTable) -> bool {
    table.rows.iter().all(|r| r.cells.is_insufficient())
}
