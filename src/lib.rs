//! llm-observe: instrumented chat turns for generative-model backends.
//!
//! The crate wraps each outbound call to a model backend with:
//! - Conversation state that is replayed as context on every turn
//! - One span per turn, kept open across the whole streamed answer
//! - Request, token, latency and error metrics labelled by model
//! - Background OTLP export with an explicit flush barrier

#![allow(clippy::multiple_crate_versions)]

//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  Interactive binary (main.rs)                       │  ← Entry point
//! └─────────────────────────────────────────────────────┘
//!                        │
//! ┌─────────────────────────────────────────────────────┐
//! │  Instrumentors (instrument/)                        │  ← One turn
//! │  - CallInstrumentor                                 │
//! │  - StreamInstrumentor (Init → Streaming → Done)     │
//! └─────────────────────────────────────────────────────┘
//!         │                    │                    │
//! ┌───────────────┐   ┌───────────────┐   ┌───────────────┐
//! │ Domain        │   │ Backend       │   │ Telemetry     │
//! │ (domain/)     │   │ (backend/)    │   │ (telemetry/)  │
//! │ - Session     │   │ - ModelBackend│   │ - Spans       │
//! │ - History     │   │ - Ollama      │   │ - Metrics     │
//! │ - Errors      │   │               │   │ - Exporter    │
//! └───────────────┘   └───────────────┘   └───────────────┘
//!                        │
//! ┌─────────────────────────────────────────────────────┐
//! │  Observability (observability/)                     │  ← Diagnostics
//! │  - tracing subscriber, optional OTLP file export    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`domain`]: Messages, history, sessions, errors
//! - [`backend`]: Model backend trait and the Ollama implementation
//! - [`telemetry`]: Span recorder, metrics registry, exporter and sinks
//! - [`instrument`]: Call and stream instrumentors
//! - [`observability`]: The crate's own `tracing` setup
//! - [`infrastructure`]: Filesystem locations
//!
//! # Example
//!
//! ```no_run
//! use llm_observe::backend::OllamaBackend;
//! use llm_observe::instrument::{CallInstrumentor, InstrumentorConfig};
//! use llm_observe::telemetry::Telemetry;
//! use llm_observe::{Config, Session};
//! use std::sync::Arc;
//!
//! # async fn run() -> llm_observe::Result<()> {
//! let config = Config::from_env()?;
//! let telemetry = Telemetry::init(&config)?;
//! let backend = Arc::new(OllamaBackend::new(&config.backend_host, None)?);
//! let chat = CallInstrumentor::new(backend, telemetry.clone(), InstrumentorConfig::from_config(&config));
//!
//! let mut session = Session::new();
//! let outcome = chat.execute(&mut session, "What is OpenTelemetry?").await?;
//! println!("{}", outcome.content);
//!
//! telemetry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod domain;
pub mod infrastructure;
pub mod instrument;
pub mod observability;
pub mod telemetry;

pub use domain::{
    ConfigError, ConversationHistory, LlmObserveError, Message, ProviderError, Result, Role,
    Session, SessionSummary, TelemetryError,
};
pub use telemetry::{ExportProtocol, Telemetry};

use reqwest::Url;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variables read by [`Config::from_env`], by configuration key.
const ENV_KEYS: &[(&str, &[&str])] = &[
    ("model", &["OLLAMA_MODEL"]),
    ("backend_host", &["OLLAMA_HOST"]),
    ("collector_endpoint", &["OTEL_COLLECTOR_ENDPOINT"]),
    ("export_protocol", &["OTEL_EXPORTER_OTLP_PROTOCOL"]),
    ("flush_interval_ms", &["OTEL_FLUSH_INTERVAL_MS"]),
    ("service_name", &["OTEL_SERVICE_NAME"]),
    ("service_version", &["OTEL_SERVICE_VERSION"]),
    ("environment", &["DEPLOYMENT_ENVIRONMENT"]),
    ("project_name", &["TELEMETRY_PROJECT_NAME"]),
    ("workspace", &["TELEMETRY_WORKSPACE"]),
    ("temperature", &["LLM_TEMPERATURE"]),
    ("max_tokens", &["LLM_MAX_TOKENS"]),
    ("request_timeout_secs", &["LLM_REQUEST_TIMEOUT_SECS"]),
    ("telemetry_file", &["TELEMETRY_FILE"]),
    ("trace_level", &["LLM_OBSERVE_LOG", "RUST_LOG"]),
    ("diagnostics_file", &["LLM_OBSERVE_DIAGNOSTICS_FILE"]),
];

/// Application configuration.
///
/// Loaded from environment variables ([`Config::from_env`]), a TOML file
/// ([`Config::from_toml_file`]) or a plain key/value map
/// ([`Config::from_map`]). Every loader starts from [`Config::default`] and
/// validates the result.
///
/// # Example
///
/// ```toml
/// model = "llama3.1:8b"
/// backend_host = "http://localhost:11434"
/// export_protocol = "file"
/// flush_interval_ms = 0
/// temperature = 0.2
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Model identifier. Default: `"llama3.1:8b"`
    pub model: String,

    /// Ollama daemon URL. Default: `"http://localhost:11434"`
    pub backend_host: String,

    /// OTLP/HTTP collector base URL; `/v1/traces` and `/v1/metrics` are
    /// appended. Default: `"http://localhost:4318"`
    pub collector_endpoint: String,

    /// Telemetry transport. Default: [`ExportProtocol::HttpJson`]
    pub export_protocol: ExportProtocol,

    /// Export period in milliseconds; `0` exports every span immediately.
    /// Default: `10000`
    pub flush_interval_ms: u64,

    /// `service.name` resource attribute. Default: `"llm-observe-chatbot"`
    pub service_name: String,

    /// `service.version` resource attribute. Default: the crate version
    pub service_version: String,

    /// `deployment.environment` resource attribute. Default: `"demo"`
    pub environment: String,

    /// Optional `telemetry.project` resource attribute.
    pub project_name: Option<String>,

    /// Optional `telemetry.workspace` resource attribute.
    pub workspace: Option<String>,

    /// Sampling temperature, `0.0..=2.0`. Default: `0.7`
    pub temperature: f32,

    /// Upper bound on generated tokens. Default: `500`
    pub max_tokens: u32,

    /// Per-call deadline in seconds; unset waits forever.
    pub request_timeout_secs: Option<u64>,

    /// Output of the `file` protocol. Default: `<data dir>/telemetry-otlp.json`
    pub telemetry_file: Option<PathBuf>,

    /// `tracing` filter directive, e.g. `"debug"` or `"llm_observe=trace"`.
    /// Default: `"info"`
    pub trace_level: Option<String>,

    /// When set, the crate's own diagnostic spans are written here as OTLP
    /// JSON lines.
    pub diagnostics_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: "llama3.1:8b".to_string(),
            backend_host: "http://localhost:11434".to_string(),
            collector_endpoint: "http://localhost:4318".to_string(),
            export_protocol: ExportProtocol::HttpJson,
            flush_interval_ms: 10_000,
            service_name: "llm-observe-chatbot".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "demo".to_string(),
            project_name: None,
            workspace: None,
            temperature: 0.7,
            max_tokens: 500,
            request_timeout_secs: None,
            telemetry_file: None,
            trace_level: None,
            diagnostics_file: None,
        }
    }
}

impl Config {
    /// Builds a configuration from key/value pairs.
    ///
    /// Keys are the field names of [`Config`]. Missing keys keep their
    /// defaults, empty values clear optional fields, and unknown keys are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparsable value or a result
    /// that fails [`Config::validate`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::collections::BTreeMap;
    /// use llm_observe::Config;
    ///
    /// let mut map = BTreeMap::new();
    /// map.insert("model".to_string(), "mistral".to_string());
    /// map.insert("flush_interval_ms".to_string(), "0".to_string());
    ///
    /// let config = Config::from_map(&map)?;
    /// assert_eq!(config.model, "mistral");
    /// assert_eq!(config.flush_interval_ms, 0);
    /// # Ok::<(), llm_observe::ConfigError>(())
    /// ```
    pub fn from_map(values: &BTreeMap<String, String>) -> std::result::Result<Self, ConfigError> {
        let mut config = Self::default();

        for (key, raw) in values {
            let value = raw.trim();
            match key.as_str() {
                "model" => config.model = value.to_string(),
                "backend_host" => config.backend_host = value.to_string(),
                "collector_endpoint" => config.collector_endpoint = value.to_string(),
                "export_protocol" => config.export_protocol = value.parse()?,
                "flush_interval_ms" => config.flush_interval_ms = parse(key, value)?,
                "service_name" => config.service_name = value.to_string(),
                "service_version" => config.service_version = value.to_string(),
                "environment" => config.environment = value.to_string(),
                "project_name" => config.project_name = non_empty(value),
                "workspace" => config.workspace = non_empty(value),
                "temperature" => config.temperature = parse(key, value)?,
                "max_tokens" => config.max_tokens = parse(key, value)?,
                "request_timeout_secs" => {
                    config.request_timeout_secs = non_empty(value)
                        .map(|v| parse(key, &v))
                        .transpose()?;
                }
                "telemetry_file" => {
                    config.telemetry_file =
                        non_empty(value).map(|v| infrastructure::expand_tilde(&v));
                }
                "trace_level" => config.trace_level = non_empty(value),
                "diagnostics_file" => {
                    config.diagnostics_file =
                        non_empty(value).map(|v| infrastructure::expand_tilde(&v));
                }
                other => tracing::debug!(key = other, "ignoring unknown configuration key"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from environment variables.
    ///
    /// See the table in the crate README for the variable of each key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparsable or invalid value.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let values: BTreeMap<String, String> = ENV_KEYS
            .iter()
            .filter_map(|(key, vars)| {
                vars.iter()
                    .find_map(|var| lookup(var))
                    .map(|value| ((*key).to_string(), value))
            })
            .collect();
        Self::from_map(&values)
    }

    /// Loads a TOML file whose top-level keys are the field names of
    /// [`Config`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::File`] if the file cannot be read or parsed, and
    /// [`ConfigError::Invalid`] for invalid values.
    pub fn from_toml_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let file_error = |reason: String| ConfigError::File {
            path: path.display().to_string(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        let table: toml::Table = toml::from_str(&content).map_err(|e| file_error(e.to_string()))?;

        let mut values = BTreeMap::new();
        for (key, value) in table {
            let text = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(ConfigError::invalid(
                        key,
                        format!("expected a scalar, found {}", other.type_str()),
                    ))
                }
            };
            values.insert(key, text);
        }

        tracing::debug!(path = %path.display(), keys = values.len(), "configuration file loaded");
        Self::from_map(&values)
    }

    /// Checks value ranges and URLs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.model.is_empty() {
            return Err(ConfigError::invalid("model", "must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::invalid(
                "temperature",
                format!("{} is outside 0.0..=2.0", self.temperature),
            ));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::invalid("max_tokens", "must be greater than zero"));
        }
        if self.request_timeout_secs == Some(0) {
            return Err(ConfigError::invalid("request_timeout_secs", "must be greater than zero"));
        }
        check_http_url("backend_host", &self.backend_host)?;
        if self.export_protocol == ExportProtocol::HttpJson {
            check_http_url("collector_endpoint", &self.collector_endpoint)?;
        }
        Ok(())
    }

    /// File written by the `file` protocol.
    #[must_use]
    pub fn telemetry_file_path(&self) -> PathBuf {
        self.telemetry_file
            .clone()
            .unwrap_or_else(|| infrastructure::data_dir().join("telemetry-otlp.json"))
    }
}

fn parse<T>(key: &str, value: &str) -> std::result::Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConfigError::invalid(key, format!("`{value}`: {e}")))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn check_http_url(key: &str, value: &str) -> std::result::Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::invalid(key, format!("`{value}`: {e}")))?;
    if matches!(url.scheme(), "http" | "https") {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            key,
            format!("`{value}` must use http or https"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model, "llama3.1:8b");
        assert_eq!(config.flush_interval_ms, 10_000);
        assert_eq!(config.export_protocol, ExportProtocol::HttpJson);
    }

    #[test]
    fn from_map_parses_typed_values() {
        let config = Config::from_map(&map(&[
            ("export_protocol", "file"),
            ("flush_interval_ms", "0"),
            ("temperature", "0.2"),
            ("max_tokens", "64"),
            ("request_timeout_secs", "30"),
            ("project_name", ""),
            ("workspace", "team-a"),
            ("unknown", "ignored"),
        ]))
        .unwrap();

        assert_eq!(config.export_protocol, ExportProtocol::File);
        assert_eq!(config.flush_interval_ms, 0);
        assert!((config.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.max_tokens, 64);
        assert_eq!(config.request_timeout_secs, Some(30));
        assert_eq!(config.project_name, None);
        assert_eq!(config.workspace.as_deref(), Some("team-a"));
    }

    #[test]
    fn from_map_rejects_bad_values() {
        let err = Config::from_map(&map(&[("max_tokens", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "max_tokens"));

        let err = Config::from_map(&map(&[("temperature", "3.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "temperature"));

        let err = Config::from_map(&map(&[("export_protocol", "grpc")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "export_protocol"));

        let err = Config::from_map(&map(&[("backend_host", "localhost")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "backend_host"));
    }

    #[test]
    fn collector_endpoint_only_checked_for_http_export() {
        let config = Config::from_map(&map(&[
            ("export_protocol", "none"),
            ("collector_endpoint", "nowhere"),
        ]));
        assert!(config.is_ok());
    }

    #[test]
    fn env_lookup_prefers_first_listed_variable() {
        let config = Config::from_lookup(|name| match name {
            "OLLAMA_MODEL" => Some("phi3".to_string()),
            "LLM_OBSERVE_LOG" => Some("debug".to_string()),
            "RUST_LOG" => Some("warn".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.model, "phi3");
        assert_eq!(config.trace_level.as_deref(), Some("debug"));
    }

    #[test]
    fn toml_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm-observe.toml");
        std::fs::write(
            &path,
            "model = \"mistral\"\nflush_interval_ms = 0\ntemperature = 0.5\nexport_protocol = \"console\"\n",
        )
        .unwrap();

        let config = Config::from_toml_file(&path).unwrap();
        assert_eq!(config.model, "mistral");
        assert_eq!(config.flush_interval_ms, 0);
        assert_eq!(config.export_protocol, ExportProtocol::Console);
    }

    #[test]
    fn toml_file_errors_name_the_file() {
        let err = Config::from_toml_file("/nonexistent/llm-observe.toml").unwrap_err();
        assert!(matches!(err, ConfigError::File { .. }));
    }
}
