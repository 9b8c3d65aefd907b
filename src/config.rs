use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::embedding::{EmbedderSettings, DEFAULT_MODEL};

/// Flat configuration shared by the indexer, retriever and chat client.
///
/// Loaded from JSON (`.json` files) or TOML (anything else). Every path is
/// used as given; relative paths resolve against the working directory.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Free-form label for the configuration.
    #[serde(default)]
    pub name: String,
    pub root_path: PathBuf,
    pub temp_path: PathBuf,
    /// Base URL of an OpenAI-compatible chat API.
    pub api_path: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    pub embeddings_path: PathBuf,
    /// Chat model; empty means auto-detect from `api_path`.
    #[serde(default)]
    pub model_name: String,
    /// Per-file conversion/embedding budget in seconds.
    #[serde(default = "default_conversion_timeout")]
    pub conversion_timeout: u64,
    /// Comma-separated, e.g. `".txt,.md,.pdf"`.
    pub supported_extensions: String,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub enable_debug_log: bool,
    #[serde(default = "default_context_documents")]
    pub context_documents: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Chat request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// `local`, `ollama`, `openai` or `hash`.
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: String,
    #[serde(default)]
    pub embedding_url: Option<String>,
    #[serde(default)]
    pub embedding_dims: Option<usize>,
    /// Run conversion and embedding in child processes.
    #[serde(default = "default_isolate_workers")]
    pub isolate_workers: bool,
}

fn default_conversion_timeout() -> u64 {
    5
}
fn default_context_documents() -> usize {
    5
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_timeout() -> f64 {
    60.0
}
fn default_embedding_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_isolate_workers() -> bool {
    true
}

/// Accepts `true`/`false`, `0`/`1`, or strings such as `"yes"`.
fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i == 1,
        Flag::Text(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
    })
}

impl Config {
    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    pub fn embedder_settings(&self) -> EmbedderSettings {
        EmbedderSettings {
            provider: self.embedding_provider.clone(),
            model: self.embedding_model.clone(),
            url: self.embedding_url.clone(),
            dims: self.embedding_dims,
        }
    }

    /// Location of the debug log inside the temp workspace.
    pub fn debug_log_path(&self) -> PathBuf {
        self.temp_path.join(crate::workspace::DEBUG_LOG_NAME)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content, ConfigFormat::for_path(path))
        .with_context(|| format!("Invalid config file: {}", path.display()))
}

pub fn parse_config(content: &str, format: ConfigFormat) -> Result<Config> {
    let mut config: Config = match format {
        ConfigFormat::Json => {
            serde_json::from_str(content).with_context(|| "Failed to parse config file")?
        }
        ConfigFormat::Toml => toml::from_str(content).with_context(|| "Failed to parse config file")?,
    };

    config.supported_extensions = config.supported_extensions.trim().to_string();
    if config
        .supported_extensions
        .split(',')
        .all(|token| matches!(token.trim(), "" | "."))
    {
        anyhow::bail!("supported_extensions must specify at least one extension");
    }

    if config.conversion_timeout == 0 {
        anyhow::bail!("conversion_timeout must be > 0");
    }

    if !(config.timeout.is_finite() && config.timeout > 0.0) {
        anyhow::bail!("timeout must be > 0");
    }

    if !(0.0..=2.0).contains(&config.temperature) {
        anyhow::bail!("temperature must be in [0.0, 2.0]");
    }

    if !(config.top_p > 0.0 && config.top_p <= 1.0) {
        anyhow::bail!("top_p must be in (0.0, 1.0]");
    }

    if config.embedding_dims == Some(0) {
        anyhow::bail!("embedding_dims must be > 0");
    }

    match config.embedding_provider.as_str() {
        "local" | "ollama" | "openai" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be local, ollama, openai, or hash.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_JSON: &str = r#"{
        "root_path": "/docs",
        "temp_path": "/tmp/help",
        "api_path": "http://localhost:11434/v1",
        "embeddings_path": "/tmp/help/embeddings.db",
        "supported_extensions": ".txt,.md"
    }"#;

    #[test]
    fn json_defaults() {
        let config = parse_config(MINIMAL_JSON, ConfigFormat::Json).unwrap();
        assert_eq!(config.name, "");
        assert_eq!(config.api_key, "");
        assert_eq!(config.model_name, "");
        assert_eq!(config.conversion_timeout, 5);
        assert!(!config.enable_debug_log);
        assert_eq!(config.context_documents, 5);
        assert_eq!(config.max_tokens, 2000);
        assert!((config.temperature - 0.7).abs() < 1e-6);
        assert!((config.top_p - 0.9).abs() < 1e-6);
        assert_eq!(config.timeout, 60.0);
        assert_eq!(config.embedding_model, "all-MiniLM-L6-v2");
        assert_eq!(config.embedding_provider, "local");
        assert!(config.isolate_workers);
        assert_eq!(
            config.debug_log_path(),
            PathBuf::from("/tmp/help/program_debug.log")
        );
    }

    #[test]
    fn toml_config_with_overrides() {
        let toml = r#"
            name = "support docs"
            root_path = "/docs"
            temp_path = "/tmp/help"
            api_path = "https://api.openai.com/v1"
            embeddings_path = "/tmp/help/embeddings.db"
            supported_extensions = " .pdf "
            conversion_timeout = 12
            enable_debug_log = "yes"
            embedding_provider = "hash"
            embedding_dims = 64
            isolate_workers = false
        "#;
        let config = parse_config(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.name, "support docs");
        assert_eq!(config.supported_extensions, ".pdf");
        assert_eq!(config.conversion_timeout(), Duration::from_secs(12));
        assert!(config.enable_debug_log);
        let settings = config.embedder_settings();
        assert_eq!(settings.provider, "hash");
        assert_eq!(settings.dims, Some(64));
        assert!(!config.isolate_workers);
    }

    #[test]
    fn debug_flag_accepts_loose_values() {
        for (raw, expected) in [
            ("true", true),
            ("1", true),
            ("\"YES\"", true),
            ("\"no\"", false),
            ("0", false),
            ("false", false),
        ] {
            let json = MINIMAL_JSON.replacen('{', &format!("{{\"enable_debug_log\": {},", raw), 1);
            let config = parse_config(&json, ConfigFormat::Json).unwrap();
            assert_eq!(config.enable_debug_log, expected, "{raw}");
        }
    }

    #[test]
    fn missing_required_field_fails() {
        let json = r#"{"root_path": "/docs", "temp_path": "/tmp"}"#;
        let err = parse_config(json, ConfigFormat::Json).unwrap_err();
        assert!(format!("{:#}", err).contains("missing field"));
    }

    #[test]
    fn blank_extensions_fail() {
        let json = MINIMAL_JSON.replace(".txt,.md", " , ");
        let err = parse_config(&json, ConfigFormat::Json).unwrap_err();
        assert!(err.to_string().contains("supported_extensions"));
    }

    #[test]
    fn unknown_provider_fails() {
        let json = MINIMAL_JSON.replacen('{', "{\"embedding_provider\": \"magic\",", 1);
        assert!(parse_config(&json, ConfigFormat::Json).is_err());
    }

    #[test]
    fn serialized_config_omits_api_key() {
        let json = MINIMAL_JSON.replacen('{', "{\"api_key\": \"sk-secret\",", 1);
        let config = parse_config(&json, ConfigFormat::Json).unwrap();
        assert_eq!(config.api_key, "sk-secret");
        let value = serde_json::to_value(&config).unwrap();
        assert!(value.get("api_key").is_none());
        assert_eq!(value["root_path"], "/docs");
        assert_eq!(value["conversion_timeout"], 5);
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(ConfigFormat::for_path(Path::new("a/config.JSON")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::for_path(Path::new("a/config.toml")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::for_path(Path::new("config")), ConfigFormat::Toml);
    }
}
