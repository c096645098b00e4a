//! Document structuring: raw text to a fixed five-field record.

use serde_json::{Map, Value};

use crate::gateway::LlmGateway;
use crate::response::{ParseError, extract_json, kind_of, optional_text, squash_key};
use crate::stage::{StageOutcome, StagePolicy, StageRequest};
use crate::{Document, PaperId, PipelineConfig, Stage, StructuredPaper, Warning, prompts};

const FIELDS: [&str; 5] = ["title", "abstract", "method", "experiments", "limitations"];

/// Structure one document with a single gateway call and one repair pass.
///
/// Never fails: an unusable reply degrades to a fully-absent paper plus a warning.
pub async fn structure_document(
    gateway: &LlmGateway,
    config: &PipelineConfig,
    document: &Document,
) -> StageOutcome<StructuredPaper> {
    let id = document.id();
    let text = crate::truncate_chars(document.text().trim(), config.max_document_chars);
    if text.is_empty() {
        return StageOutcome::Degraded {
            value: StructuredPaper::absent(id),
            warnings: vec![Warning::new(
                Stage::ParsingDocuments,
                Some(id),
                "document is empty",
            )],
        };
    }

    tracing::debug!(paper = %id, chars = text.chars().count(), "structuring document");

    let request = StageRequest {
        messages: prompts::structure(text),
        params: config.params.structure,
        shape_hint: prompts::STRUCTURE_SHAPE.to_string(),
    };
    StagePolicy::degrade_to(Stage::ParsingDocuments, 1, move |_| {
        StructuredPaper::absent(id)
    })
    .run(gateway, request, Some(id), |raw| parse_structured(id, raw))
    .await
}

/// Validate a structuring reply.
///
/// The reply must be an object carrying at least one of the five field keys;
/// every present value must be text or null.
pub fn parse_structured(id: PaperId, raw: &str) -> Result<StructuredPaper, ParseError> {
    let value = extract_json(raw)?;
    let object = match value {
        Value::Object(map) => map,
        other => {
            return Err(ParseError::Shape(format!(
                "expected an object, got {}",
                kind_of(&other)
            )));
        }
    };

    let fields = lookup_fields(&object);
    if fields.iter().all(Option::is_none) {
        return Err(ParseError::Shape(
            "object has none of title/abstract/method/experiments/limitations".into(),
        ));
    }

    let [title, abstract_text, method, experiments, limitations] = fields;
    Ok(StructuredPaper {
        id,
        title: optional_text(title, "title")?,
        abstract_text: optional_text(abstract_text, "abstract")?,
        method: optional_text(method, "method")?,
        experiments: optional_text(experiments, "experiments")?,
        limitations: optional_text(limitations, "limitations")?,
    })
}

/// Find each field by its squashed key, so `"Method"` or `"Experiments "` still match.
fn lookup_fields(object: &Map<String, Value>) -> [Option<&Value>; 5] {
    FIELDS.map(|field| {
        object.get(field).or_else(|| {
            object
                .iter()
                .find(|(k, _)| squash_key(k) == field)
                .map(|(_, v)| v)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::{MockLlm, MockReply};
    use std::sync::Arc;

    const FULL: &str = r#"{"title": "Sparse Mixtures", "abstract": "We study sparse experts.", "method": "Top-k routing over experts.", "experiments": "GLUE and SuperGLUE.", "limitations": "Only English."}"#;

    fn config() -> PipelineConfig {
        PipelineConfig {
            requests_per_minute: 0,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn parses_full_object() {
        let paper = parse_structured(PaperId::A, FULL).unwrap();
        assert_eq!(paper.title.as_deref(), Some("Sparse Mixtures"));
        assert_eq!(paper.limitations.as_deref(), Some("Only English."));
        assert_eq!(paper.present_fields(), 5);
    }

    #[test]
    fn null_and_not_found_are_absent() {
        let raw = r#"{"title": "T", "abstract": null, "method": "Not found", "experiments": "", "limitations": null}"#;
        let paper = parse_structured(PaperId::B, raw).unwrap();
        assert_eq!(paper.id, PaperId::B);
        assert_eq!(paper.present_fields(), 1);
    }

    #[test]
    fn keys_match_leniently() {
        let raw = r#"```json
{"Title": "T", "Method": "m"}
```"#;
        let paper = parse_structured(PaperId::A, raw).unwrap();
        assert_eq!(paper.title.as_deref(), Some("T"));
        assert_eq!(paper.method.as_deref(), Some("m"));
        assert!(paper.experiments.is_none());
    }

    #[test]
    fn unrelated_object_is_malformed() {
        let err = parse_structured(PaperId::A, r#"{"answer": "sure"}"#).unwrap_err();
        assert!(matches!(err, ParseError::Shape(_)));
    }

    #[test]
    fn non_text_value_is_malformed() {
        let err = parse_structured(PaperId::A, r#"{"title": ["a", "b"]}"#).unwrap_err();
        assert!(matches!(err, ParseError::Shape(ref m) if m.contains("title")));
    }

    #[test]
    fn array_is_malformed() {
        assert!(parse_structured(PaperId::A, "[1, 2]").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn repair_pass_recovers_full_paper() {
        let mock = Arc::new(MockLlm::with_sequence(vec![
            MockReply::text("Title: Sparse Mixtures\nMethod: routing"),
            MockReply::text(FULL),
        ]));
        let config = config();
        let gateway = LlmGateway::new(mock.clone(), &config);
        let doc = Document::new(PaperId::A, "some paper text");

        let outcome = structure_document(&gateway, &config, &doc).await;
        match outcome {
            StageOutcome::Complete(paper) => assert_eq!(paper.present_fields(), 5),
            other => panic!("expected complete, got {:?}", other),
        }
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_repair_degrades_to_absent() {
        let mock = Arc::new(MockLlm::new(MockReply::text("I could not read the paper.")));
        let config = config();
        let gateway = LlmGateway::new(mock.clone(), &config);
        let doc = Document::new(PaperId::B, "some paper text");

        let outcome = structure_document(&gateway, &config, &doc).await;
        match outcome {
            StageOutcome::Degraded { value, warnings } => {
                assert!(value.is_fully_absent());
                assert_eq!(value.id, PaperId::B);
                assert_eq!(warnings.len(), 1);
            }
            other => panic!("expected degraded, got {:?}", other),
        }
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_document_skips_call() {
        let mock = Arc::new(MockLlm::new(MockReply::text(FULL)));
        let config = config();
        let gateway = LlmGateway::new(mock.clone(), &config);
        let doc = Document::new(PaperId::A, "   \n");

        let outcome = structure_document(&gateway, &config, &doc).await;
        assert!(outcome.is_degraded());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn long_document_is_truncated() {
        let mock = Arc::new(MockLlm::new(MockReply::text(FULL)));
        let config = PipelineConfig {
            max_document_chars: 100,
            ..config()
        };
        let gateway = LlmGateway::new(mock.clone(), &config);
        let doc = Document::new(PaperId::A, "x".repeat(5000));

        structure_document(&gateway, &config, &doc).await;
        let prompt = &mock.requests()[0].messages[1].content;
        assert!(prompt.contains(&"x".repeat(100)));
        assert!(!prompt.contains(&"x".repeat(101)));
    }
}
