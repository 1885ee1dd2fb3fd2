use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ForageError, Result};

/// Top-level Forage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub places: PlacesConfig,
    #[serde(default)]
    pub calendar: Option<CalendarConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Extra HTTP headers sent with every request (e.g. OpenRouter attribution).
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.7 }
fn default_top_p() -> f32 { 0.95 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Workflow run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Target city for the catalog and for qualifying geocode queries.
    #[serde(default = "default_city")]
    pub city: String,
    /// Radius around the city centroid searched for venues, in metres.
    #[serde(default = "default_search_radius")]
    pub search_radius_m: u32,
    /// Cap on places requested from the places service.
    #[serde(default = "default_venue_limit")]
    pub venue_limit: u32,
    /// Corrective retries allowed within one stage after its first attempt.
    #[serde(default = "default_max_stage_retries")]
    pub max_stage_retries: u32,
    /// Timeout for a single stage invocation.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Keep a response cache for the duration of a run.
    #[serde(default = "default_cache_enabled")]
    pub cache: bool,
    #[serde(default = "default_food_preferences")]
    pub food_preferences: String,
    #[serde(default = "default_constraints")]
    pub constraints: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            city: default_city(),
            search_radius_m: default_search_radius(),
            venue_limit: default_venue_limit(),
            max_stage_retries: default_max_stage_retries(),
            stage_timeout_secs: default_stage_timeout(),
            workspace: default_workspace(),
            cache: default_cache_enabled(),
            food_preferences: default_food_preferences(),
            constraints: default_constraints(),
        }
    }
}

fn default_city() -> String { "Cambridge, England".to_string() }
fn default_search_radius() -> u32 { 2000 }
fn default_venue_limit() -> u32 { 1000 }
fn default_max_stage_retries() -> u32 { 2 }
fn default_stage_timeout() -> u64 { 1200 }
fn default_workspace() -> String { "~/.forage".to_string() }
fn default_cache_enabled() -> bool { true }
fn default_food_preferences() -> String {
    "casual dining with a mix of traditional British food and international cuisine".to_string()
}
fn default_constraints() -> String { "no specific constraints".to_string() }

/// Places service (OpenStreetMap MCP server) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacesConfig {
    #[serde(default)]
    pub transport: PlacesTransport,
    /// Per-call timeout in seconds.
    #[serde(default = "default_places_timeout")]
    pub timeout_secs: u64,
}

impl Default for PlacesConfig {
    fn default() -> Self {
        Self {
            transport: PlacesTransport::default(),
            timeout_secs: default_places_timeout(),
        }
    }
}

fn default_places_timeout() -> u64 { 30 }

/// How to reach the places MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlacesTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
    },
}

impl Default for PlacesTransport {
    fn default() -> Self {
        Self::Stdio {
            command: "osm-mcp-server".to_string(),
            args: vec![],
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// Calendar text file with `HH:MM - HH:MM  Description` lines.
    pub path: String,
    #[serde(default = "default_calendar_timeout")]
    pub timeout_secs: u64,
}

fn default_calendar_timeout() -> u64 { 10 }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = transitions and stages, 3 = every attempt.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ForageError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ForageError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workflow.workspace)
    }

    /// Directory of the per-run response cache.
    pub fn cache_dir(&self) -> PathBuf {
        self.workspace_dir().join(".cache")
    }

    /// Directory for JSONL run logs, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match log.log_dir {
            Some(ref dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FORAGE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FORAGE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FORAGE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FORAGE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FORAGE_VAR}\"");
    }

    #[test]
    fn test_workflow_defaults_from_minimal_toml() {
        let toml_str = r#"
[model]
model_id = "gpt-4o"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.workflow.city, "Cambridge, England");
        assert_eq!(config.workflow.search_radius_m, 2000);
        assert_eq!(config.workflow.venue_limit, 1000);
        assert_eq!(config.workflow.max_stage_retries, 2);
        assert!(config.workflow.cache);
        assert!(config.calendar.is_none());
        assert!(config.log_dir().is_none());
        match config.places.transport {
            PlacesTransport::Stdio { ref command, .. } => assert_eq!(command, "osm-mcp-server"),
            PlacesTransport::Http { .. } => panic!("expected stdio default"),
        }
    }

    #[test]
    fn test_http_places_transport() {
        let toml_str = r#"
[model]
model_id = "gpt-4o"

[places]
timeout_secs = 5

[places.transport]
type = "http"
url = "http://localhost:8080/mcp"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.places.timeout_secs, 5);
        match config.places.transport {
            PlacesTransport::Http { url } => assert_eq!(url, "http://localhost:8080/mcp"),
            PlacesTransport::Stdio { .. } => panic!("expected http transport"),
        }
    }

    #[test]
    fn test_log_dir_defaults_under_workspace() {
        let toml_str = r#"
[model]
model_id = "gpt-4o"

[workflow]
workspace = "/tmp/forage-ws"

[log]
level = 3
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_dir(), Some(PathBuf::from("/tmp/forage-ws/logs")));
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/forage-ws/.cache"));
    }
}
