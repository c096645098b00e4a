use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{ApiKey, PipelineConfig};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub api: Option<ApiConfig>,
    pub pipeline: Option<PipelineSection>,
    pub limits: Option<LimitsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub groq_api_key: Option<String>,
    pub semantic_scholar_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    pub aspects: Option<Vec<String>>,
    pub concurrent_calls: Option<bool>,
    pub abstract_fallback: Option<bool>,
    pub dedup_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub requests_per_minute: Option<u32>,
    pub max_transient_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub max_document_chars: Option<usize>,
    pub max_section_chars: Option<usize>,
    pub min_section_chars: Option<usize>,
}

/// Project-local override file, looked up in the working directory.
pub const LOCAL_CONFIG: &str = ".ideator.toml";

/// Platform config directory path: `<config_dir>/ideator/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("ideator").join("config.toml"))
}

/// Load config by cascading CWD `.ideator.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(LOCAL_CONFIG));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            None
        }
    }
}

/// Field from `overlay` if set there, else from `base`.
fn pick<S, T>(overlay: &Option<S>, base: &Option<S>, field: impl Fn(&S) -> Option<T>) -> Option<T> {
    overlay
        .as_ref()
        .and_then(&field)
        .or_else(|| base.as_ref().and_then(&field))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (oa, ba) = (&overlay.api, &base.api);
    let (op, bp) = (&overlay.pipeline, &base.pipeline);
    let (ol, bl) = (&overlay.limits, &base.limits);
    ConfigFile {
        api: Some(ApiConfig {
            groq_api_key: pick(oa, ba, |a| a.groq_api_key.clone()),
            semantic_scholar_key: pick(oa, ba, |a| a.semantic_scholar_key.clone()),
            model: pick(oa, ba, |a| a.model.clone()),
            base_url: pick(oa, ba, |a| a.base_url.clone()),
            timeout_secs: pick(oa, ba, |a| a.timeout_secs),
        }),
        pipeline: Some(PipelineSection {
            aspects: pick(op, bp, |p| p.aspects.clone()),
            concurrent_calls: pick(op, bp, |p| p.concurrent_calls),
            abstract_fallback: pick(op, bp, |p| p.abstract_fallback),
            dedup_threshold: pick(op, bp, |p| p.dedup_threshold),
        }),
        limits: Some(LimitsConfig {
            requests_per_minute: pick(ol, bl, |l| l.requests_per_minute),
            max_transient_retries: pick(ol, bl, |l| l.max_transient_retries),
            retry_backoff_ms: pick(ol, bl, |l| l.retry_backoff_ms),
            max_document_chars: pick(ol, bl, |l| l.max_document_chars),
            max_section_chars: pick(ol, bl, |l| l.max_section_chars),
            min_section_chars: pick(ol, bl, |l| l.min_section_chars),
        }),
    }
}

impl ConfigFile {
    /// Overwrite the fields of `config` that this file sets.
    pub fn apply_to(&self, config: &mut PipelineConfig) {
        if let Some(api) = &self.api {
            if let Some(key) = api.groq_api_key.as_deref().filter(|k| !k.trim().is_empty()) {
                config.api_key = Some(ApiKey::new(key.trim()));
            }
            if let Some(model) = &api.model {
                config.model = model.clone();
            }
            if let Some(url) = &api.base_url {
                config.base_url = url.clone();
            }
            if let Some(t) = api.timeout_secs {
                config.request_timeout_secs = t;
            }
        }
        if let Some(p) = &self.pipeline {
            if let Some(aspects) = p.aspects.as_ref().filter(|a| !a.is_empty()) {
                config.aspects = aspects.clone();
            }
            if let Some(v) = p.concurrent_calls {
                config.concurrent_calls = v;
            }
            if let Some(v) = p.abstract_fallback {
                config.abstract_fallback = v;
            }
            if let Some(t) = p.dedup_threshold {
                config.dedup_threshold = Some(t.clamp(0.0, 1.0));
            }
        }
        if let Some(l) = &self.limits {
            if let Some(v) = l.requests_per_minute {
                config.requests_per_minute = v;
            }
            if let Some(v) = l.max_transient_retries {
                config.max_transient_retries = v;
            }
            if let Some(v) = l.retry_backoff_ms {
                config.retry_backoff_ms = v;
            }
            if let Some(v) = l.max_document_chars {
                config.max_document_chars = v;
            }
            if let Some(v) = l.max_section_chars {
                config.max_section_chars = v;
            }
            if let Some(v) = l.min_section_chars {
                config.min_section_chars = v;
            }
        }
    }

    pub fn semantic_scholar_key(&self) -> Option<ApiKey> {
        self.api
            .as_ref()
            .and_then(|a| a.semantic_scholar_key.as_deref())
            .filter(|k| !k.trim().is_empty())
            .map(|k| ApiKey::new(k.trim()))
    }

    /// A fully populated file describing `config`. Credentials are left out.
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        ConfigFile {
            api: Some(ApiConfig {
                groq_api_key: None,
                semantic_scholar_key: None,
                model: Some(config.model.clone()),
                base_url: Some(config.base_url.clone()),
                timeout_secs: Some(config.request_timeout_secs),
            }),
            pipeline: Some(PipelineSection {
                aspects: Some(config.aspects.clone()),
                concurrent_calls: Some(config.concurrent_calls),
                abstract_fallback: Some(config.abstract_fallback),
                dedup_threshold: config.dedup_threshold,
            }),
            limits: Some(LimitsConfig {
                requests_per_minute: Some(config.requests_per_minute),
                max_transient_retries: Some(config.max_transient_retries),
                retry_backoff_ms: Some(config.retry_backoff_ms),
                max_document_chars: Some(config.max_document_chars),
                max_section_chars: Some(config.max_section_chars),
                min_section_chars: Some(config.min_section_chars),
            }),
        }
    }
}

/// Save the current config to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, String> {
    let path = config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
    save_to_path(config, &path)?;
    Ok(path)
}

pub fn save_to_path(config: &ConfigFile, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_parses() {
        let toml_str = "[api]\nmodel = \"llama-3.1-8b-instant\"\n\n[limits]\nrequests_per_minute = 10\n";
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.api.unwrap().model.as_deref(), Some("llama-3.1-8b-instant"));
        assert!(parsed.pipeline.is_none());
        assert_eq!(parsed.limits.unwrap().requests_per_minute, Some(10));
    }

    #[test]
    fn merge_overlay_wins_field_by_field() {
        let base = ConfigFile {
            api: Some(ApiConfig {
                model: Some("base-model".into()),
                timeout_secs: Some(60),
                ..Default::default()
            }),
            ..Default::default()
        };
        let overlay = ConfigFile {
            api: Some(ApiConfig {
                model: Some("overlay-model".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merge(base, overlay);
        let api = merged.api.unwrap();
        assert_eq!(api.model.as_deref(), Some("overlay-model"));
        assert_eq!(api.timeout_secs, Some(60));
    }

    #[test]
    fn apply_overrides_only_set_fields() {
        let file = ConfigFile {
            api: Some(ApiConfig {
                groq_api_key: Some(" gsk_test ".into()),
                ..Default::default()
            }),
            pipeline: Some(PipelineSection {
                aspects: Some(vec!["Latency".into()]),
                dedup_threshold: Some(1.4),
                ..Default::default()
            }),
            limits: None,
        };
        let mut config = PipelineConfig::default();
        file.apply_to(&mut config);
        assert_eq!(config.api_key.as_ref().map(|k| k.expose()), Some("gsk_test"));
        assert_eq!(config.aspects, vec!["Latency"]);
        assert_eq!(config.dedup_threshold, Some(1.0));
        assert_eq!(config.model, PipelineConfig::default().model);
        assert_eq!(config.requests_per_minute, 30);
    }

    #[test]
    fn empty_aspect_list_keeps_defaults() {
        let file = ConfigFile {
            pipeline: Some(PipelineSection {
                aspects: Some(vec![]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut config = PipelineConfig::default();
        file.apply_to(&mut config);
        assert_eq!(config.aspects.len(), 4);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let file = ConfigFile::from_pipeline(&PipelineConfig::default());
        save_to_path(&file, &path).unwrap();

        let loaded = load_from_path(&path).unwrap();
        assert_eq!(loaded, file);
        assert!(loaded.api.unwrap().groq_api_key.is_none());
    }

    #[test]
    fn unparseable_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[api\nmodel = ").unwrap();
        assert!(load_from_path(&path).is_none());
        assert!(load_from_path(&dir.path().join("missing.toml")).is_none());
    }
}
