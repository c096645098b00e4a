//! Prompt construction for every gateway call the pipeline makes.

use crate::gateway::ChatMessage;
use crate::{ProposedMethod, RawWeaknessList, Section, StructuredPaper, WeaknessAnalysis};

const JSON_ONLY: &str = "Respond with valid JSON only. No markdown fences, no commentary.";

/// Sent after an unparseable reply, asking the model to reshape its own output.
pub fn repair(shape_hint: &str) -> String {
    format!(
        "Your previous reply could not be parsed. Reformat the same content as valid JSON \
         matching this shape exactly, without adding new content:\n{shape_hint}\n{JSON_ONLY}"
    )
}

pub const STRUCTURE_SHAPE: &str = r#"{"title": string|null, "abstract": string|null, "method": string|null, "experiments": string|null, "limitations": string|null}"#;

pub fn structure(text: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You extract sections from research papers. You copy text verbatim and never \
             infer missing content.",
        ),
        ChatMessage::user(format!(
            "Extract the following sections from this research paper.\n\n\
             Paper text:\n{text}\n\n\
             Return format:\n{STRUCTURE_SHAPE}\n\n\
             Rules:\n\
             - If a section is not found, use null\n\
             - Do not infer missing content\n\
             - Extract verbatim text\n\n\
             {JSON_ONLY}"
        )),
    ]
}

pub fn review_section(section: Section, text: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You are a strict technical reviewer. You list only weaknesses that are explicitly \
             supported by the text you are given. You never speculate beyond it.",
        ),
        ChatMessage::user(format!(
            "Below is the {section} section of a research paper.\n\n\
             Section text:\n{text}\n\n\
             List the weaknesses, limitations or gaps that this text itself supports \
             (for example: restrictive assumptions, limited evaluation, missing baselines, \
             scalability or cost concerns, missing theory). Do not speculate about anything \
             the section does not discuss.\n\n\
             Return one short weakness per line as a bullet list:\n\
             - first weakness\n\
             - second weakness\n\n\
             If the text supports no weaknesses, reply with a single line: - none"
        )),
    ]
}

pub const NORMALIZE_SHAPE: &str =
    r#"[{"label": string, "sourceIndices": [integer, ...]}, ...]"#;

pub fn normalize(raw: &RawWeaknessList) -> Vec<ChatMessage> {
    let numbered: Vec<String> = raw
        .items
        .iter()
        .enumerate()
        .map(|(i, w)| format!("[{}] {}", i, w.text))
        .collect();
    vec![
        ChatMessage::system(
            "You consolidate reviewer notes into a small controlled vocabulary of issues.",
        ),
        ChatMessage::user(format!(
            "Here are weakness statements about one research paper, each with its index:\n\
             {}\n\n\
             Group statements that describe the same underlying issue. For each group emit \
             one canonical label: a short, clear phrase in plain academic language \
             (5-12 words, no CamelCase, no abbreviations). Every index must appear in \
             exactly one group; a statement unlike any other forms its own group.\n\n\
             Return format:\n{NORMALIZE_SHAPE}\n\n{JSON_ONLY}",
            numbered.join("\n")
        )),
    ]
}

pub const SYNTHESIZE_SHAPE: &str = r#"{"method_name": string, "core_idea": string, "components": [{"name": string, "description": string}, ...], "addresses_weaknesses": string}"#;

fn bullet_block(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        format!("- {empty}")
    } else {
        items
            .iter()
            .map(|w| format!("- {w}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn synthesize(
    analysis: &WeaknessAnalysis,
    method_a: Option<&str>,
    method_b: Option<&str>,
) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You are a senior research scientist proposing a method that fixes documented \
             weaknesses of two existing methods.",
        ),
        ChatMessage::user(format!(
            "=== METHOD OF PAPER A ===\n{}\n\n\
             === METHOD OF PAPER B ===\n{}\n\n\
             === WEAKNESSES TO ADDRESS ===\n\
             Shared by both papers:\n{}\n\n\
             Only in paper A:\n{}\n\n\
             Only in paper B:\n{}\n\n\
             === TASK ===\n\
             Propose one novel method that combines the strengths of both methods and \
             explicitly addresses the weaknesses above.\n\
             Constraints:\n\
             - Do not introduce new datasets.\n\
             - Do not introduce new experiments or report results.\n\
             - Make no claims beyond what addresses the listed weaknesses.\n\
             - Give it a descriptive name (avoid generic names like \"New Method\").\n\
             - core_idea is one paragraph; addresses_weaknesses is one paragraph that \
             references the components.\n\
             - List at least one component.\n\n\
             Return format:\n{SYNTHESIZE_SHAPE}\n\n{JSON_ONLY}",
            method_a.unwrap_or("(not found)"),
            method_b.unwrap_or("(not found)"),
            bullet_block(&analysis.shared, "no shared weaknesses identified"),
            bullet_block(&analysis.paper_a_only, "no unique weaknesses"),
            bullet_block(&analysis.paper_b_only, "no unique weaknesses"),
        )),
    ]
}

pub fn comparison_shape(aspects: &[String]) -> String {
    let rows: Vec<String> = aspects
        .iter()
        .map(|a| {
            format!(
                r#"  {}: {{"paper_a": string, "paper_b": string, "proposed": string}}"#,
                serde_json::Value::String(a.clone())
            )
        })
        .collect();
    format!("{{\n{}\n}}", rows.join(",\n"))
}

pub fn compare(
    aspects: &[String],
    paper_a: &StructuredPaper,
    paper_b: &StructuredPaper,
    proposed: &ProposedMethod,
    max_chars: usize,
) -> Vec<ChatMessage> {
    let field = |v: Option<&str>| {
        v.map(|s| crate::truncate_chars(s, max_chars).to_string())
            .unwrap_or_else(|| "(not found)".to_string())
    };
    let components: Vec<String> = proposed
        .components
        .iter()
        .map(|c| format!("{}: {}", c.name, c.description))
        .collect();

    vec![
        ChatMessage::system(
            "You write concise comparative assessments of research methods for a table.",
        ),
        ChatMessage::user(format!(
            "=== PAPER A ===\nMethod: {}\nExperiments: {}\n\n\
             === PAPER B ===\nMethod: {}\nExperiments: {}\n\n\
             === PROPOSED METHOD ===\nName: {}\nCore idea: {}\nComponents: {}\n\n\
             === ASPECTS ===\n{}\n\n\
             Fill exactly one cell per aspect and column. Each cell is a specific phrase of \
             8-15 words, not a single word. If the text gives no basis for a cell, write \
             \"{}\".\n\n\
             Return format:\n{}\n\n{JSON_ONLY}",
            field(paper_a.method.as_deref()),
            field(paper_a.experiments.as_deref()),
            field(paper_b.method.as_deref()),
            field(paper_b.experiments.as_deref()),
            proposed.name,
            proposed.core_idea,
            components.join("; "),
            aspects
                .iter()
                .map(|a| format!("- {a}"))
                .collect::<Vec<_>>()
                .join("\n"),
            crate::INSUFFICIENT_INFORMATION,
            comparison_shape(aspects),
        )),
    ]
}

pub fn rank_relevance(topic: &str, titles: &[&str]) -> Vec<ChatMessage> {
    let list: Vec<String> = titles
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{}. \"{}\"", i + 1, t))
        .collect();
    vec![ChatMessage::user(format!(
        "You are a research paper relevance scorer. Given a research topic and a list of \
         paper titles, rate each paper's relevance to the topic.\n\n\
         Research Topic: {topic}\n\nPapers:\n{}\n\n\
         Score each from 0.0 (not relevant) to 1.0 (directly addresses the core topic).\n\
         Return ONLY a JSON array of scores in order, like: [0.95, 0.72, 0.45]",
        list.join("\n")
    ))]
}

pub fn explain_relevance(topic: &str, title: &str, abstract_text: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::user(format!(
        "In one sentence, explain why this paper is relevant to the research topic.\n\n\
         Topic: {topic}\nPaper Title: {title}\nAbstract: {}\n\n\
         Response (one sentence only):",
        crate::truncate_chars(abstract_text, 500)
    ))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PaperId, RawWeakness};

    #[test]
    fn normalize_prompt_numbers_from_zero() {
        let raw = RawWeaknessList {
            paper: PaperId::A,
            items: vec![
                RawWeakness {
                    text: "no theory".into(),
                    section: Section::Method,
                },
                RawWeakness {
                    text: "costly".into(),
                    section: Section::Experiments,
                },
            ],
        };
        let msgs = normalize(&raw);
        assert!(msgs[1].content.contains("[0] no theory"));
        assert!(msgs[1].content.contains("[1] costly"));
    }

    #[test]
    fn comparison_shape_quotes_aspects() {
        let shape = comparison_shape(&["Memory \"efficiency\"".to_string()]);
        assert!(shape.contains(r#""Memory \"efficiency\"""#));
    }

    #[test]
    fn synthesize_prompt_only_uses_methods_and_analysis() {
        let analysis = WeaknessAnalysis {
            shared: vec!["no theoretical guarantees".into()],
            paper_a_only: vec![],
            paper_b_only: vec!["high inference cost".into()],
        };
        let msgs = synthesize(&analysis, Some("Method A text"), None);
        let body = &msgs[1].content;
        assert!(body.contains("Method A text"));
        assert!(body.contains("(not found)"));
        assert!(body.contains("- no theoretical guarantees"));
        assert!(body.contains("- no unique weaknesses"));
        assert!(body.contains("Do not introduce new datasets"));
    }
}
