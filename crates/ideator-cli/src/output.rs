use std::io::Write;

use ideator_core::sota::{RankedPaper, SotaReport};
use ideator_core::{PipelineError, PipelineEvent, PipelineResult, StructuredPaper, Warning};
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

const RULE_WIDTH: usize = 60;

fn truncate(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}

fn heading(w: &mut dyn Write, title: &str, color: ColorMode) -> std::io::Result<()> {
    writeln!(w)?;
    let sep = "=".repeat(RULE_WIDTH);
    if color.enabled() {
        writeln!(w, "{}", sep.bold().cyan())?;
        writeln!(w, "{}", title.bold().cyan())?;
        writeln!(w, "{}", sep.bold().cyan())?;
    } else {
        writeln!(w, "{}", sep)?;
        writeln!(w, "{}", title)?;
        writeln!(w, "{}", sep)?;
    }
    Ok(())
}

/// Print one progress event as a status line.
pub fn print_progress(
    w: &mut dyn Write,
    event: &PipelineEvent,
    color: ColorMode,
) -> std::io::Result<()> {
    match event {
        PipelineEvent::StageStarted { .. } => {
            // Shown by the spinner
        }
        PipelineEvent::StageCompleted { stage, elapsed } => {
            if color.enabled() {
                writeln!(w, "{} {} ({:.1?})", "done".green(), stage, elapsed)?;
            } else {
                writeln!(w, "done {} ({:.1?})", stage, elapsed)?;
            }
        }
        PipelineEvent::Warning(warning) => print_warning(w, warning, color)?,
        PipelineEvent::Failed { stage, .. } => {
            // The error itself is reported once the run returns
            if color.enabled() {
                writeln!(w, "{} {}", "failed".red(), stage)?;
            } else {
                writeln!(w, "failed {}", stage)?;
            }
        }
    }
    Ok(())
}

pub fn print_warning(w: &mut dyn Write, warning: &Warning, color: ColorMode) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{} {}", "WARNING:".yellow(), warning)
    } else {
        writeln!(w, "WARNING: {}", warning)
    }
}

fn print_paper(
    w: &mut dyn Write,
    label: &str,
    paper: &StructuredPaper,
    color: ColorMode,
) -> std::io::Result<()> {
    let title = paper.title.as_deref().unwrap_or("(title not found)");
    if color.enabled() {
        writeln!(w, "{} {}", format!("{}:", label).bold(), title.cyan())?;
    } else {
        writeln!(w, "{}: {}", label, title)?;
    }
    if paper.is_fully_absent() {
        writeln!(w, "  (no sections could be extracted)")?;
    } else if paper.present_fields() < 5 {
        let missing: Vec<&str> = [
            ("title", paper.title.is_none()),
            ("abstract", paper.abstract_text.is_none()),
            ("method", paper.method.is_none()),
            ("experiments", paper.experiments.is_none()),
            ("limitations", paper.limitations.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();
        if color.enabled() {
            writeln!(w, "  {}", format!("not found: {}", missing.join(", ")).dimmed())?;
        } else {
            writeln!(w, "  not found: {}", missing.join(", "))?;
        }
    }
    Ok(())
}

fn print_labels(
    w: &mut dyn Write,
    title: &str,
    labels: &[String],
    color: ColorMode,
) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{} ({})", title.bold(), labels.len())?;
    } else {
        writeln!(w, "{} ({})", title, labels.len())?;
    }
    if labels.is_empty() {
        writeln!(w, "  (none)")?;
    }
    for label in labels {
        writeln!(w, "  - {}", label)?;
    }
    Ok(())
}

/// Print the full human-readable report for a completed run.
pub fn print_result(
    w: &mut dyn Write,
    result: &PipelineResult,
    color: ColorMode,
) -> std::io::Result<()> {
    heading(w, "PAPERS", color)?;
    print_paper(w, "Paper A", &result.paper_a, color)?;
    print_paper(w, "Paper B", &result.paper_b, color)?;

    heading(w, "WEAKNESS ANALYSIS", color)?;
    print_labels(w, "Shared", &result.analysis.shared, color)?;
    print_labels(w, "Paper A only", &result.analysis.paper_a_only, color)?;
    print_labels(w, "Paper B only", &result.analysis.paper_b_only, color)?;

    let method = &result.proposed_method;
    heading(w, "PROPOSED METHOD", color)?;
    if color.enabled() {
        writeln!(w, "{}", method.name.bold().green())?;
    } else {
        writeln!(w, "{}", method.name)?;
    }
    writeln!(w)?;
    writeln!(w, "{}", method.core_idea)?;
    writeln!(w)?;
    for (i, component) in method.components.iter().enumerate() {
        if color.enabled() {
            writeln!(w, "  {}. {}", i + 1, component.name.bold())?;
        } else {
            writeln!(w, "  {}. {}", i + 1, component.name)?;
        }
        if !component.description.is_empty() {
            writeln!(w, "     {}", component.description)?;
        }
    }
    if !method.addresses_weaknesses.is_empty() {
        writeln!(w)?;
        writeln!(w, "Addresses: {}", method.addresses_weaknesses)?;
    }

    heading(w, "COMPARISON", color)?;
    for row in &result.comparison_table.rows {
        if color.enabled() {
            writeln!(w, "{}", row.aspect.bold())?;
        } else {
            writeln!(w, "{}", row.aspect)?;
        }
        let cells = [
            ("Paper A", &row.cells.paper_a),
            ("Paper B", &row.cells.paper_b),
            ("Proposed", &row.cells.proposed),
        ];
        for (label, text) in cells {
            let text = truncate(text, 200);
            if color.enabled() && row.cells.is_insufficient() {
                writeln!(w, "  {:<9} {}", format!("{}:", label), text.dimmed())?;
            } else {
                writeln!(w, "  {:<9} {}", format!("{}:", label), text)?;
            }
        }
    }

    if !result.warnings.is_empty() {
        heading(w, "WARNINGS", color)?;
        for warning in &result.warnings {
            print_warning(w, warning, color)?;
        }
    }
    Ok(())
}

/// Print a fatal pipeline error.
pub fn print_failure(
    w: &mut dyn Write,
    error: &PipelineError,
    color: ColorMode,
) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{} {}", format!("{}:", error.kind()).bold().red(), error)
    } else {
        writeln!(w, "{}: {}", error.kind(), error)
    }
}

fn print_ranked(w: &mut dyn Write, paper: &RankedPaper, color: ColorMode) -> std::io::Result<()> {
    writeln!(w)?;
    if color.enabled() {
        writeln!(
            w,
            "{} {}",
            format!("[{}]", paper.rank).bold().yellow(),
            paper.title.bold()
        )?;
    } else {
        writeln!(w, "[{}] {}", paper.rank, paper.title)?;
    }

    let authors = if paper.authors.is_empty() {
        "(unknown)".to_string()
    } else {
        paper.authors.join(", ")
    };
    writeln!(w, "  Authors:   {}", authors)?;
    writeln!(
        w,
        "  Published: {}",
        paper.published_date.as_deref().unwrap_or("(unknown)")
    )?;
    writeln!(w, "  arXiv:     {}", paper.arxiv_id)?;
    writeln!(w, "  URL:       {}", paper.url)?;
    writeln!(
        w,
        "  Score:     {:.3} (relevance {:.3}, citations {}, recency {:.2})",
        paper.final_score,
        paper.relevance_score,
        paper.metrics.citation_count,
        paper.metrics.recency_score
    )?;
    if let Some(reason) = &paper.relevance_reason {
        writeln!(w, "  Why:       {}", reason)?;
    }
    let summary = truncate(&paper.abstract_text, 240);
    if color.enabled() {
        writeln!(w, "  {}", summary.dimmed())?;
    } else {
        writeln!(w, "  {}", summary)?;
    }
    Ok(())
}

/// Print the ranked state-of-the-art report.
pub fn print_sota_report(
    w: &mut dyn Write,
    report: &SotaReport,
    color: ColorMode,
) -> std::io::Result<()> {
    heading(w, &format!("STATE OF THE ART: {}", report.topic), color)?;
    writeln!(
        w,
        "{} candidate papers found, showing top {}",
        report.total_found,
        report.papers.len()
    )?;
    if report.papers.is_empty() {
        writeln!(w, "No papers matched the search.")?;
    }
    for paper in &report.papers {
        print_ranked(w, paper, color)?;
    }
    Ok(())
}
