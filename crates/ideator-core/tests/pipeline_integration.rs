//! End-to-end runs of the pipeline against a scripted chat backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ideator_core::gateway::mock::{MockLlm, MockReply};
use ideator_core::{
    CompletionRequest, Document, INSUFFICIENT_INFORMATION, LlmGateway, PaperId, Pipeline,
    PipelineConfig, PipelineError, PipelineEvent, Stage,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const DOC_A: &str = "Alpha Routing. We present Alpha, a router that assigns tokens with a \
                     fixed top-1 gate. Experiments on one benchmark.";
const DOC_B: &str = "Beta Experts. We present Beta, a dense mixture with learned gating. \
                     Experiments on two benchmarks.";

fn config() -> PipelineConfig {
    PipelineConfig {
        requests_per_minute: 0,
        min_section_chars: 10,
        ..PipelineConfig::default()
    }
}

fn aspects() -> Vec<String> {
    vec!["Accuracy".to_string(), "Memory efficiency".to_string()]
}

fn pipeline(mock: &Arc<MockLlm>) -> Pipeline {
    let config = config();
    Pipeline::with_gateway(LlmGateway::new(mock.clone(), &config), config)
}

fn user_text(request: &CompletionRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == ideator_core::Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

fn first_user_text(request: &CompletionRequest) -> &str {
    request
        .messages
        .iter()
        .find(|m| m.role == ideator_core::Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

fn structured(paper: &str) -> String {
    json!({
        "title": format!("{paper} Routing"),
        "abstract": format!("{paper} is a routing method for sparse models."),
        "method": format!("{paper} routes every token through a single learned expert gate."),
        "experiments": format!("{paper} is evaluated on a single language modelling benchmark."),
        "limitations": format!("{paper} has only been tested with small expert counts.")
    })
    .to_string()
}

/// Echo each numbered statement back as its own group.
fn echo_groups(prompt: &str) -> String {
    let groups: Vec<_> = prompt
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix('[')?;
            let (idx, text) = rest.split_once("] ")?;
            let idx: usize = idx.parse().ok()?;
            Some(json!({"label": text.trim(), "sourceIndices": [idx]}))
        })
        .collect();
    serde_json::Value::Array(groups).to_string()
}

fn method_reply() -> String {
    json!({
        "method_name": "Gated Sparse Routing with Guarantees",
        "core_idea": "Combine a learned gate with a convergence bound.",
        "components": [
            {"name": "Bounded gate", "description": "A gate with provable load balance."},
            "Cheap inference: distil the dense experts into one"
        ],
        "addresses_weaknesses": "Adds theory and lowers inference cost."
    })
    .to_string()
}

fn full_comparison() -> String {
    json!({
        "Accuracy": {"paper_a": "moderate", "paper_b": "high", "proposed": "high"},
        "Memory efficiency": {"paper_a": "good", "paper_b": "poor", "proposed": "good"}
    })
    .to_string()
}

/// Replies shared by every scenario; individual tests override one route.
#[derive(Clone, Copy, Default)]
struct Script {
    garbled_first_structure_a: bool,
    garbled_structure: bool,
    null_structure: bool,
    garbled_synthesis: bool,
    omit_memory_aspect: bool,
}

fn respond(script: Script, structure_calls: &AtomicUsize, request: &CompletionRequest) -> MockReply {
    let first = first_user_text(request);
    let last = user_text(request);
    let is_repair = last.contains("could not be parsed");

    if first.contains("Extract the following sections") {
        let paper = if first.contains("Alpha") { "Alpha" } else { "Beta" };
        structure_calls.fetch_add(1, Ordering::SeqCst);
        if script.garbled_structure
            || (script.garbled_first_structure_a && paper == "Alpha" && !is_repair)
        {
            return MockReply::text("Sure! The paper has a method section and experiments.");
        }
        if script.null_structure {
            return MockReply::text(
                json!({"title": null, "abstract": null, "method": null, "experiments": null, "limitations": null})
                    .to_string(),
            );
        }
        return MockReply::text(structured(paper));
    }

    if first.contains("Below is the method section") {
        return if first.contains("Alpha") {
            MockReply::text("- no theoretical guarantees")
        } else {
            MockReply::text("- no theoretical guarantees\n- high inference cost")
        };
    }
    if first.starts_with("Below is the") {
        return MockReply::text("- none");
    }

    if first.contains("Here are weakness statements") {
        return MockReply::text(echo_groups(first));
    }

    if first.contains("=== METHOD OF PAPER A ===") {
        return if script.garbled_synthesis {
            MockReply::text("I would propose combining both ideas somehow.")
        } else {
            MockReply::text(method_reply())
        };
    }

    if first.contains("=== PAPER A ===") {
        return if script.omit_memory_aspect {
            MockReply::text(
                json!({"Accuracy": {"paper_a": "moderate", "paper_b": "high", "proposed": "high"}})
                    .to_string(),
            )
        } else {
            MockReply::text(full_comparison())
        };
    }

    MockReply::text("")
}

fn scripted(script: Script) -> (Arc<MockLlm>, Arc<AtomicUsize>) {
    let structure_calls = Arc::new(AtomicUsize::new(0));
    let counter = structure_calls.clone();
    let mock = Arc::new(MockLlm::with_responder(move |req| {
        respond(script, &counter, req)
    }));
    (mock, structure_calls)
}

fn documents() -> (Document, Document) {
    (Document::new(PaperId::A, DOC_A), Document::new(PaperId::B, DOC_B))
}

fn count_requests(mock: &MockLlm, marker: &str) -> usize {
    mock.requests()
        .iter()
        .filter(|r| first_user_text(r).contains(marker))
        .count()
}

#[tokio::test]
async fn shared_weakness_is_fused_across_papers() {
    let (mock, _) = scripted(Script::default());
    let (a, b) = documents();

    let result = pipeline(&mock).run(a, b, &aspects()).await.unwrap();

    assert_eq!(result.analysis.shared, vec!["no theoretical guarantees"]);
    assert!(result.analysis.paper_a_only.is_empty());
    assert_eq!(result.analysis.paper_b_only, vec!["high inference cost"]);
    assert_eq!(result.weaknesses_a, vec!["no theoretical guarantees"]);
    assert_eq!(
        result.weaknesses_b,
        vec!["no theoretical guarantees", "high inference cost"]
    );

    assert_eq!(result.proposed_method.name, "Gated Sparse Routing with Guarantees");
    assert_eq!(result.proposed_method.components.len(), 2);
    assert_eq!(result.proposed_method.components[1].name, "Cheap inference");
    assert_eq!(result.comparison_table.len(), 2);
    assert_eq!(result.comparison_table.get("Accuracy").unwrap().paper_b, "high");
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
}

#[tokio::test]
async fn missing_aspect_is_filled_with_placeholder() {
    let (mock, _) = scripted(Script {
        omit_memory_aspect: true,
        ..Script::default()
    });
    let (a, b) = documents();

    let result = pipeline(&mock).run(a, b, &aspects()).await.unwrap();

    let aspects: Vec<_> = result.comparison_table.aspects().collect();
    assert_eq!(aspects, vec!["Accuracy", "Memory efficiency"]);
    let memory = result.comparison_table.get("Memory efficiency").unwrap();
    assert_eq!(memory.paper_a, INSUFFICIENT_INFORMATION);
    assert_eq!(memory.paper_b, INSUFFICIENT_INFORMATION);
    assert_eq!(memory.proposed, INSUFFICIENT_INFORMATION);
    assert_eq!(result.comparison_table.get("Accuracy").unwrap().paper_a, "moderate");

    assert!(
        result
            .warnings
            .iter()
            .any(|w| w.stage == Stage::BuildingComparison && w.message.contains("Memory efficiency"))
    );
}

#[tokio::test]
async fn structurer_repair_recovers_full_paper() {
    let (mock, structure_calls) = scripted(Script {
        garbled_first_structure_a: true,
        ..Script::default()
    });
    let (a, b) = documents();

    let result = pipeline(&mock).run(a, b, &aspects()).await.unwrap();

    assert_eq!(structure_calls.load(Ordering::SeqCst), 3);
    let paper = &result.paper_a;
    assert_eq!(paper.title.as_deref(), Some("Alpha Routing"));
    assert_eq!(paper.present_fields(), 5);
    assert!(
        !result
            .warnings
            .iter()
            .any(|w| w.stage == Stage::ParsingDocuments),
        "repair should not leave a warning"
    );
}

#[tokio::test]
async fn synthesis_failing_twice_is_fatal() {
    let (mock, _) = scripted(Script {
        garbled_synthesis: true,
        ..Script::default()
    });
    let (a, b) = documents();

    let err = pipeline(&mock).run(a, b, &aspects()).await.unwrap_err();

    assert!(matches!(err, PipelineError::SynthesisFailure { .. }), "{err}");
    assert_eq!(count_requests(&mock, "=== METHOD OF PAPER A ==="), 2);
    assert_eq!(count_requests(&mock, "=== PAPER A ==="), 0);
}

#[tokio::test]
async fn both_documents_unparseable_is_fatal() {
    let (mock, structure_calls) = scripted(Script {
        garbled_structure: true,
        ..Script::default()
    });
    let (a, b) = documents();

    let err = pipeline(&mock).run(a, b, &aspects()).await.unwrap_err();

    assert_eq!(err.kind(), "DualParseFailure");
    // One repair per document.
    assert_eq!(structure_calls.load(Ordering::SeqCst), 4);
    assert_eq!(count_requests(&mock, "Below is the"), 0);
}

#[tokio::test]
async fn all_null_sections_are_not_a_parse_failure() {
    let (mock, structure_calls) = scripted(Script {
        null_structure: true,
        ..Script::default()
    });
    let (a, b) = documents();

    let result = pipeline(&mock).run(a, b, &aspects()).await.unwrap();

    assert_eq!(structure_calls.load(Ordering::SeqCst), 2);
    assert!(result.paper_a.is_fully_absent());
    assert!(result.paper_b.is_fully_absent());
    assert!(result.weaknesses_a.is_empty());
    assert!(result.weaknesses_b.is_empty());
    assert!(result.analysis.shared.is_empty());
    assert_eq!(count_requests(&mock, "=== METHOD OF PAPER A ==="), 1);
}

#[tokio::test]
async fn one_empty_document_degrades() {
    let (mock, structure_calls) = scripted(Script::default());
    let a = Document::new(PaperId::A, "   ");
    let b = Document::new(PaperId::B, DOC_B);

    let result = pipeline(&mock).run(a, b, &aspects()).await.unwrap();

    assert_eq!(structure_calls.load(Ordering::SeqCst), 1);
    assert!(result.paper_a.is_fully_absent());
    assert!(result.weaknesses_a.is_empty());
    assert!(result.analysis.shared.is_empty());
    assert_eq!(result.analysis.paper_b_only.len(), 2);
    assert!(
        result
            .warnings
            .iter()
            .any(|w| w.paper == Some(PaperId::A) && w.stage == Stage::ParsingDocuments)
    );
}

#[tokio::test]
async fn cancelled_before_start_issues_no_calls() {
    let (mock, _) = scripted(Script::default());
    let (a, b) = documents();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = pipeline(&mock)
        .run_with_progress(a, b, &aspects(), |_| {}, cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Cancelled {
            stage: Stage::ParsingDocuments
        }
    ));
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn cancel_during_synthesis_stops_before_comparison() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let structure_calls = AtomicUsize::new(0);
    let mock = Arc::new(MockLlm::with_responder(move |req| {
        if first_user_text(req).contains("=== METHOD OF PAPER A ===") {
            trigger.cancel();
        }
        respond(Script::default(), &structure_calls, req)
    }));
    let (a, b) = documents();

    let err = pipeline(&mock)
        .run_with_progress(a, b, &aspects(), |_| {}, cancel)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "Cancelled");
    assert_eq!(count_requests(&mock, "=== PAPER A ==="), 0);
}

#[tokio::test]
async fn stages_are_reported_in_order() {
    let (mock, _) = scripted(Script {
        omit_memory_aspect: true,
        ..Script::default()
    });
    let (a, b) = documents();
    let events = Mutex::new(Vec::new());

    pipeline(&mock)
        .run_with_progress(
            a,
            b,
            &aspects(),
            |e| events.lock().unwrap().push(e),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let events = events.into_inner().unwrap();
    let started: Vec<Stage> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StageStarted { stage } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        started,
        vec![
            Stage::ParsingDocuments,
            Stage::ExtractingWeaknesses,
            Stage::NormalizingWeaknesses,
            Stage::FusingWeaknesses,
            Stage::SynthesizingMethod,
            Stage::BuildingComparison,
        ]
    );

    let completed = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::StageCompleted { .. }))
        .count();
    assert_eq!(completed, 6);

    let warnings = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::Warning(_)))
        .count();
    assert_eq!(warnings, 1);
    assert!(!events.iter().any(|e| matches!(e, PipelineEvent::Failed { .. })));
}

#[tokio::test]
async fn failure_emits_failed_event() {
    let (mock, _) = scripted(Script {
        garbled_synthesis: true,
        ..Script::default()
    });
    let (a, b) = documents();
    let events = Mutex::new(Vec::new());

    let _ = pipeline(&mock)
        .run_with_progress(
            a,
            b,
            &aspects(),
            |e| events.lock().unwrap().push(e),
            CancellationToken::new(),
        )
        .await;

    let events = events.into_inner().unwrap();
    match events.last() {
        Some(PipelineEvent::Failed { stage, .. }) => assert_eq!(*stage, Stage::SynthesizingMethod),
        other => panic!("expected a Failed event last, got {other:?}"),
    }
}

#[tokio::test]
async fn fused_sets_partition_each_side() {
    let (mock, _) = scripted(Script::default());
    let (a, b) = documents();

    let result = pipeline(&mock).run(a, b, &aspects()).await.unwrap();
    let analysis = &result.analysis;

    for label in &analysis.paper_a_only {
        assert!(!analysis.shared.contains(label));
    }
    for label in &analysis.paper_b_only {
        assert!(!analysis.shared.contains(label));
    }
    let mut union_a: Vec<_> = analysis
        .shared
        .iter()
        .chain(&analysis.paper_a_only)
        .cloned()
        .collect();
    union_a.sort();
    let mut side_a = result.weaknesses_a.clone();
    side_a.sort();
    assert_eq!(union_a, side_a);
}

#[tokio::test]
async fn result_serializes_with_camel_case_keys() {
    let (mock, _) = scripted(Script::default());
    let (a, b) = documents();

    let result = pipeline(&mock).run(a, b, &aspects()).await.unwrap();
    let value = serde_json::to_value(&result).unwrap();

    for key in [
        "paperA",
        "paperB",
        "weaknessesA",
        "weaknessesB",
        "analysis",
        "proposedMethod",
        "comparisonTable",
    ] {
        assert!(value.get(key).is_some(), "missing {key}");
    }
    assert_eq!(
        value["comparisonTable"]["Memory efficiency"]["proposed"],
        json!("good")
    );
}

#[tokio::test]
async fn sequential_and_concurrent_runs_agree() {
    let (mock_seq, _) = scripted(Script::default());
    let (mock_par, _) = scripted(Script::default());
    let seq_config = PipelineConfig {
        concurrent_calls: false,
        ..config()
    };
    let sequential = Pipeline::with_gateway(LlmGateway::new(mock_seq.clone(), &seq_config), seq_config);

    let (a, b) = documents();
    let left = sequential.run(a.clone(), b.clone(), &aspects()).await.unwrap();
    let right = pipeline(&mock_par).run(a, b, &aspects()).await.unwrap();

    assert_eq!(left.analysis, right.analysis);
    assert_eq!(left.comparison_table, right.comparison_table);
    assert_eq!(mock_seq.call_count(), mock_par.call_count());
}
