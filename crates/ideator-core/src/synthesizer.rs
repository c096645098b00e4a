//! Method synthesis from the fused weakness analysis.

use serde_json::{Map, Value};

use crate::gateway::LlmGateway;
use crate::response::{ParseError, extract_json, kind_of, squash_key};
use crate::stage::{StageOutcome, StagePolicy, StageRequest};
use crate::{
    Component, PipelineConfig, ProposedMethod, Stage, StructuredPaper, WeaknessAnalysis, prompts,
};

/// Propose a method that addresses `analysis`.
///
/// The prompt carries only the analysis and the two `method` fields. One
/// corrective re-prompt is allowed; after that the outcome is `Failed`, since
/// there is no meaningful default method.
pub async fn synthesize_method(
    gateway: &LlmGateway,
    config: &PipelineConfig,
    analysis: &WeaknessAnalysis,
    paper_a: &StructuredPaper,
    paper_b: &StructuredPaper,
) -> StageOutcome<ProposedMethod> {
    let request = StageRequest {
        messages: prompts::synthesize(
            analysis,
            paper_a.method.as_deref(),
            paper_b.method.as_deref(),
        ),
        params: config.params.synthesize,
        shape_hint: prompts::SYNTHESIZE_SHAPE.to_string(),
    };
    StagePolicy::fatal(Stage::SynthesizingMethod, 1)
        .run(gateway, request, None, parse_method)
        .await
}

/// Validate a synthesis reply into a [`ProposedMethod`].
pub fn parse_method(raw: &str) -> Result<ProposedMethod, ParseError> {
    let object = match extract_json(raw)? {
        Value::Object(map) => map,
        other => {
            return Err(ParseError::Shape(format!(
                "expected an object, got {}",
                kind_of(&other)
            )));
        }
    };

    let name = required_text(&object, &["methodname", "name"], "method_name")?;
    let core_idea = required_text(&object, &["coreidea", "idea"], "core_idea")?;
    let addresses_weaknesses = text_field(&object, &["addressesweaknesses", "addresses"])
        .unwrap_or_default();

    let components = match field(&object, &["components"]) {
        Some(Value::Array(items)) => items.iter().filter_map(component).collect::<Vec<_>>(),
        Some(other) => {
            return Err(ParseError::Shape(format!(
                "components should be an array, got {}",
                kind_of(other)
            )));
        }
        None => Vec::new(),
    };
    if components.is_empty() {
        return Err(ParseError::Shape("method has no components".into()));
    }

    Ok(ProposedMethod {
        name,
        core_idea,
        components,
        addresses_weaknesses,
    })
}

fn field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|want| {
        object
            .iter()
            .find(|(k, _)| squash_key(k) == *want)
            .map(|(_, v)| v)
    })
}

fn text_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    field(object, keys)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn required_text(
    object: &Map<String, Value>,
    keys: &[&str],
    name: &str,
) -> Result<String, ParseError> {
    text_field(object, keys).ok_or_else(|| ParseError::Shape(format!("missing `{}`", name)))
}

/// A component is either `"Name: description"` or `{"name", "description"}`.
fn component(value: &Value) -> Option<Component> {
    let (name, description) = match value {
        Value::String(s) => match s.split_once(':') {
            Some((name, desc)) => (name.to_string(), desc.to_string()),
            None => (s.clone(), String::new()),
        },
        Value::Object(map) => (
            text_field(map, &["name", "componentname", "title"])?,
            text_field(map, &["description", "desc", "details", "role"]).unwrap_or_default(),
        ),
        _ => return None,
    };
    let name = name.trim().trim_matches('*').trim().to_string();
    if name.is_empty() {
        return None;
    }
    Some(Component {
        name,
        description: description.trim().to_string(),
    })
}
