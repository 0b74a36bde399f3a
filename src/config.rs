//! Configuration types.
//!
//! Everything is read from the environment once per process (`TriageConfig`)
//! and, for agent settings, once per run (`Settings`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Prefix for environment variables that become agent settings.
pub const AGENT_SETTING_PREFIX: &str = "TRIAGE_AGENT_";

/// Default model used for classification and drafting.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Knowledge sources for the classifier prompt.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeConfig {
    /// Root directory of the document store. `None` disables knowledge.
    pub root: Option<PathBuf>,
    /// Organization-wide reference (file or folder under `root`).
    pub global: Option<String>,
    /// Classifier-specific reference.
    pub classifier: Option<String>,
    /// Reply-drafting reference.
    pub replies: Option<String>,
    /// Upper bound on documents pulled from one folder.
    pub max_docs: usize,
}

/// Process-wide run configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub model: String,
    /// Context window of `model`, used for knowledge utilization warnings.
    pub model_context_tokens: usize,
    pub db_path: PathBuf,
    pub batch_size: usize,
    /// Maximum threads pulled from the mailbox per run.
    pub max_threads: usize,
    /// Body excerpt bound per item.
    pub excerpt_chars: usize,
    pub max_retries: u32,
    /// Mailbox label namespace, e.g. `triage/` yields `triage/todo`.
    pub label_prefix: String,
    pub dry_run: bool,
    /// Periodic mode interval. `None` runs once and exits.
    pub interval: Option<Duration>,
    pub knowledge: KnowledgeConfig,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            model_context_tokens: 200_000,
            db_path: PathBuf::from("./data/mail-triage.db"),
            batch_size: 10,
            max_threads: 50,
            excerpt_chars: 600,
            max_retries: 3,
            label_prefix: "triage/".to_string(),
            dry_run: false,
            interval: None,
            knowledge: KnowledgeConfig {
                max_docs: 10,
                ..Default::default()
            },
        }
    }
}

impl TriageConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let batch_size = parse_env("TRIAGE_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_BATCH_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }

        let interval = match std::env::var("TRIAGE_INTERVAL_SECS") {
            Ok(raw) => match parse_value::<u64>("TRIAGE_INTERVAL_SECS", &raw)? {
                0 => {
                    return Err(ConfigError::InvalidValue {
                        key: "TRIAGE_INTERVAL_SECS".into(),
                        message: "must be at least 1".into(),
                    });
                }
                secs => Some(Duration::from_secs(secs)),
            },
            Err(_) => None,
        };

        Ok(Self {
            model: std::env::var("TRIAGE_MODEL").unwrap_or(defaults.model),
            model_context_tokens: parse_env(
                "TRIAGE_MODEL_CONTEXT_TOKENS",
                defaults.model_context_tokens,
            )?,
            db_path: std::env::var("TRIAGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            batch_size,
            max_threads: parse_env("TRIAGE_MAX_THREADS", defaults.max_threads)?,
            excerpt_chars: parse_env("TRIAGE_EXCERPT_CHARS", defaults.excerpt_chars)?,
            max_retries: parse_env("TRIAGE_MAX_RETRIES", defaults.max_retries)?,
            label_prefix: std::env::var("TRIAGE_LABEL_PREFIX").unwrap_or(defaults.label_prefix),
            dry_run: flag_env("TRIAGE_DRY_RUN")?.unwrap_or(false),
            interval,
            knowledge: KnowledgeConfig {
                root: std::env::var("TRIAGE_KNOWLEDGE_DIR").ok().map(PathBuf::from),
                global: non_empty_env("TRIAGE_GLOBAL_KNOWLEDGE"),
                classifier: non_empty_env("TRIAGE_CLASSIFIER_KNOWLEDGE"),
                replies: non_empty_env("TRIAGE_REPLY_KNOWLEDGE"),
                max_docs: parse_env("TRIAGE_KNOWLEDGE_MAX_DOCS", defaults.knowledge.max_docs)?,
            },
        })
    }
}

/// Read the AI service key. The binary refuses to start without it.
pub fn api_key_from_env() -> Result<SecretString, ConfigError> {
    std::env::var("ANTHROPIC_API_KEY")
        .map(SecretString::from)
        .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse a boolean switch. Shared by env config and agent settings.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Boolean env var; absent or blank is `None`, anything unrecognized is an error.
fn flag_env(key: &str) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = non_empty_env(key) else {
        return Ok(None);
    };
    parse_flag(&raw)
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}' is not a boolean (use true/false, 1/0, yes/no, on/off)"),
        })
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

// ── Agent settings ──────────────────────────────────────────────────

/// Agent-agnostic key/value settings resolved once per run and handed to
/// every hook through its context.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    /// Build settings from an explicit map (tests, embedding).
    pub fn from_map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: entries
                .into_iter()
                .map(|(k, v)| (k.into().to_lowercase(), v.into()))
                .collect(),
        }
    }

    /// Collect every `TRIAGE_AGENT_<KEY>` variable as setting `<key>`.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    fn from_vars(vars: impl Iterator<Item = (String, String)>) -> Self {
        Self::from_map(vars.filter_map(|(key, value)| {
            key.strip_prefix(AGENT_SETTING_PREFIX)
                .filter(|k| !k.is_empty())
                .map(|k| (k.to_string(), value))
        }))
    }

    /// Look up a setting. Empty values count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Look up a setting an agent cannot work without.
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingRequired {
            key: key.to_string(),
            hint: format!(
                "Set {}{}",
                AGENT_SETTING_PREFIX,
                key.to_uppercase()
            ),
        })
    }

    /// Boolean setting; unparsable values are treated as absent.
    pub fn flag(&self, key: &str) -> Option<bool> {
        parse_flag(self.get(key)?)
    }
}
