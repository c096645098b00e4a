use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use ideator_core::config_file::{self, ConfigFile};
use ideator_core::sota::{SotaFinder, SotaQuery};
use ideator_core::{ApiKey, Document, PaperId, Pipeline, PipelineConfig, PipelineEvent};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

mod output;

use output::ColorMode;

/// Research ideation - compare two papers, fuse their weaknesses and propose a new method
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

/// Inference endpoint overrides shared by every subcommand.
#[derive(Args, Debug, Default, Clone)]
struct ApiArgs {
    /// API key for the chat completions endpoint
    #[arg(long)]
    api_key: Option<String>,

    /// Model identifier
    #[arg(long)]
    model: Option<String>,

    /// Base URL of an OpenAI-compatible API
    #[arg(long)]
    base_url: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline on two paper text files
    Run {
        /// Text of paper A
        paper_a: PathBuf,

        /// Text of paper B
        paper_b: PathBuf,

        /// Comparison aspect (repeatable, or comma-separated)
        #[arg(short, long = "aspect", value_delimiter = ',')]
        aspects: Vec<String>,

        #[command(flatten)]
        api: ApiArgs,

        /// Issue every gateway call one at a time
        #[arg(long)]
        sequential: bool,

        /// Review the abstract when no section yields a weakness
        #[arg(long)]
        abstract_fallback: bool,

        /// Merge weakness labels at or above this similarity (0..1)
        #[arg(long)]
        dedup_threshold: Option<f64>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Path to output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Find the most relevant recent arXiv papers for a topic
    Sota {
        /// Research topic
        topic: String,

        /// Number of papers to return
        #[arg(short = 'k', long, default_value_t = 2)]
        top_k: usize,

        /// Number of arXiv results to consider
        #[arg(long, default_value_t = 20)]
        max_results: usize,

        /// Earliest publication date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        start_date: Option<NaiveDate>,

        /// Latest publication date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        end_date: Option<NaiveDate>,

        /// Skip Semantic Scholar citation lookups
        #[arg(long)]
        no_metrics: bool,

        /// Skip per-paper relevance explanations
        #[arg(long)]
        no_explain: bool,

        /// Semantic Scholar API key
        #[arg(long)]
        s2_api_key: Option<String>,

        #[command(flatten)]
        api: ApiArgs,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the platform config file path
    Path,
    /// Write a config file populated with the defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("ideator={level},ideator_core={level}"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let file = config_file::load_config();

    match cli.command {
        Command::Run {
            paper_a,
            paper_b,
            aspects,
            api,
            sequential,
            abstract_fallback,
            dedup_threshold,
            json,
            output,
        } => {
            let mut config = resolve_config(&file, &api, env_var);
            if sequential {
                config.concurrent_calls = false;
            }
            if abstract_fallback {
                config.abstract_fallback = true;
            }
            if let Some(t) = dedup_threshold {
                config.dedup_threshold = Some(t.clamp(0.0, 1.0));
            }
            run(
                config,
                &paper_a,
                &paper_b,
                &aspects,
                json,
                output,
                cli.no_color,
            )
            .await
        }
        Command::Sota {
            topic,
            top_k,
            max_results,
            start_date,
            end_date,
            no_metrics,
            no_explain,
            s2_api_key,
            api,
            json,
        } => {
            let config = resolve_config(&file, &api, env_var);
            let s2_key = s2_api_key
                .or_else(|| env_var("S2_API_KEY"))
                .filter(|k| !k.trim().is_empty())
                .map(|k| ApiKey::new(k.trim()))
                .or_else(|| file.semantic_scholar_key());
            let query = SotaQuery {
                max_results,
                top_k,
                start_date,
                end_date,
                include_metrics: !no_metrics,
                explain: !no_explain,
            };
            sota(config, s2_key, &topic, query, json, cli.no_color).await
        }
        Command::Config { action } => config_command(action, &file),
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Resolve configuration: CLI flags > env vars > config file > defaults
fn resolve_config(
    file: &ConfigFile,
    api: &ApiArgs,
    env: impl Fn(&str) -> Option<String>,
) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    file.apply_to(&mut config);

    if let Some(key) = api.api_key.clone().or_else(|| env("GROQ_API_KEY")) {
        config.api_key = Some(ApiKey::new(key.trim()));
    }
    if let Some(model) = api.model.clone().or_else(|| env("IDEATOR_MODEL")) {
        config.model = model;
    }
    if let Some(url) = api.base_url.clone().or_else(|| env("IDEATOR_BASE_URL")) {
        config.base_url = url;
    }
    let timeout = api
        .timeout
        .or_else(|| env("IDEATOR_TIMEOUT").and_then(|v| v.trim().parse().ok()));
    if let Some(secs) = timeout {
        config.request_timeout_secs = secs;
    }
    config
}

/// Read a paper as text. Invalid UTF-8 is replaced rather than rejected.
fn read_document(path: &Path, id: PaperId) -> anyhow::Result<Document> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    if text.trim().is_empty() {
        tracing::warn!(path = %path.display(), "paper file is empty");
    }
    Ok(Document::new(id, text))
}

fn open_writer(output: Option<&Path>) -> anyhow::Result<Box<dyn Write>> {
    Ok(match output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    })
}

fn spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Cancel `token` on Ctrl+C.
fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            token.cancel();
        }
    });
}

async fn run(
    config: PipelineConfig,
    paper_a: &Path,
    paper_b: &Path,
    aspects: &[String],
    json: bool,
    output: Option<PathBuf>,
    no_color: bool,
) -> anyhow::Result<()> {
    if config.api_key.is_none() {
        anyhow::bail!(
            "No API key configured. Set GROQ_API_KEY, pass --api-key, or add groq_api_key to {}",
            config_file::config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| config_file::LOCAL_CONFIG.to_string())
        );
    }

    let document_a = read_document(paper_a, PaperId::A)?;
    let document_b = read_document(paper_b, PaperId::B)?;

    let color = ColorMode(!no_color && output.is_none());
    let status_color = ColorMode(!no_color);
    let mut writer = open_writer(output.as_deref())?;

    tracing::info!(model = %config.model, "starting run");
    let pipeline = Pipeline::new(config);

    let bar = spinner();
    let stderr = Arc::new(Mutex::new(std::io::stderr()));
    let progress = {
        let bar = bar.clone();
        let stderr = Arc::clone(&stderr);
        move |event: PipelineEvent| {
            if let PipelineEvent::StageStarted { stage } = &event {
                bar.set_message(stage.label());
            }
            bar.suspend(|| {
                if let Ok(mut w) = stderr.lock() {
                    let _ = output::print_progress(&mut *w, &event, status_color);
                }
            });
        }
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let result = pipeline
        .run_with_progress(document_a, document_b, aspects, progress, cancel)
        .await;
    bar.finish_and_clear();

    match result {
        Ok(result) => {
            if json {
                serde_json::to_writer_pretty(&mut writer, &result)?;
                writeln!(writer)?;
            } else {
                output::print_result(&mut writer, &result, color)?;
            }
            Ok(())
        }
        Err(e) => {
            if json {
                let body = serde_json::json!({ "error": e.kind(), "reason": e.to_string() });
                serde_json::to_writer_pretty(&mut writer, &body)?;
                writeln!(writer)?;
                return Err(e.into());
            }
            if let Ok(mut w) = stderr.lock() {
                output::print_failure(&mut *w, &e, status_color)?;
            }
            std::process::exit(1);
        }
    }
}

async fn sota(
    config: PipelineConfig,
    s2_key: Option<ApiKey>,
    topic: &str,
    query: SotaQuery,
    json: bool,
    no_color: bool,
) -> anyhow::Result<()> {
    if config.api_key.is_none() {
        tracing::warn!("no API key configured, ranking by keyword overlap");
    }
    let finder = SotaFinder::from_config(&config, s2_key);

    let bar = spinner();
    bar.set_message(format!("searching arXiv for \"{}\"", topic));

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let report = tokio::select! {
        report = finder.identify_sota(topic, query) => report,
        _ = cancel.cancelled() => {
            bar.finish_and_clear();
            anyhow::bail!("Search cancelled");
        }
    };
    bar.finish_and_clear();
    let report = report?;

    let mut stdout = std::io::stdout();
    if json {
        serde_json::to_writer_pretty(&mut stdout, &report)?;
        writeln!(stdout)?;
    } else {
        output::print_sota_report(&mut stdout, &report, ColorMode(!no_color))?;
    }
    Ok(())
}

fn config_command(action: ConfigAction, file: &ConfigFile) -> anyhow::Result<()> {
    match action {
        ConfigAction::Path => {
            let path = config_file::config_path()
                .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
            println!("{}", path.display());
        }
        ConfigAction::Show => {
            let config = resolve_config(file, &ApiArgs::default(), env_var);
            let rendered = toml::to_string_pretty(&ConfigFile::from_pipeline(&config))?;
            println!("{}", rendered.trim_end());
            println!();
            println!(
                "# api key: {}",
                if config.api_key.is_some() {
                    "set"
                } else {
                    "not set"
                }
            );
        }
        ConfigAction::Init { force } => {
            if let Some(path) = config_file::config_path()
                && path.exists()
                && !force
            {
                anyhow::bail!(
                    "Config file already exists at {}. Use --force to overwrite.",
                    path.display()
                );
            }
            let path = config_file::save_config(&ConfigFile::from_pipeline(
                &PipelineConfig::default(),
            ))
            .map_err(|e| anyhow::anyhow!(e))?;
            println!("Config written to: {}", path.display());
        }
    }
    Ok(())
}
