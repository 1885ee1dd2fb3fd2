use std::io::Write;

use forage_core::config::{AppConfig, PlacesTransport};
use forage_core::error::ForageError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[model]
provider = "openrouter"
model_id = "openai/gpt-4o"
api_key = "sk-test-key"
max_tokens = 2048
temperature = 0.5

[model.retry]
max_retries = 5

[[fallback_models]]
provider = "ollama"
model_id = "llama3.2"

[workflow]
city = "Oxford, England"
search_radius_m = 1500
venue_limit = 200
max_stage_retries = 1
stage_timeout_secs = 90
workspace = "/tmp/forage-test"
cache = false
food_preferences = "vegetarian, likes curry"

[places]
timeout_secs = 12

[places.transport]
type = "stdio"
command = "uvx"
args = ["osm-mcp-server"]

[calendar]
path = "/tmp/forage-test/calendar.txt"

[log]
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "openrouter");
    assert_eq!(config.model.model_id, "openai/gpt-4o");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 2048);
    assert_eq!(config.model.retry.as_ref().map(|r| r.max_retries), Some(5));
    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].provider, "ollama");

    let wf = &config.workflow;
    assert_eq!(wf.city, "Oxford, England");
    assert_eq!(wf.search_radius_m, 1500);
    assert_eq!(wf.venue_limit, 200);
    assert_eq!(wf.max_stage_retries, 1);
    assert_eq!(wf.stage_timeout_secs, 90);
    assert!(!wf.cache);
    assert_eq!(wf.food_preferences, "vegetarian, likes curry");
    assert_eq!(wf.constraints, "no specific constraints");

    assert_eq!(config.places.timeout_secs, 12);
    match config.places.transport {
        PlacesTransport::Stdio { ref command, ref args, .. } => {
            assert_eq!(command, "uvx");
            assert_eq!(args, &vec!["osm-mcp-server".to_string()]);
        }
        PlacesTransport::Http { .. } => panic!("expected stdio transport"),
    }

    let calendar = config.calendar.as_ref().expect("calendar present");
    assert_eq!(calendar.path, "/tmp/forage-test/calendar.txt");
    assert_eq!(calendar.timeout_secs, 10);

    assert_eq!(
        config.log_dir(),
        Some(std::path::PathBuf::from("/tmp/forage-test/logs"))
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FORAGE_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "test-model"
api_key = "${FORAGE_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("FORAGE_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[model]
model_id = "llama3.2"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "openai");
    assert!(config.fallback_models.is_empty());
    assert_eq!(config.workflow.city, "Cambridge, England");
    assert_eq!(config.workflow.stage_timeout_secs, 1200);
    assert!(config.workflow.cache);
    assert_eq!(config.places.timeout_secs, 30);
    assert!(config.calendar.is_none());
    assert!(config.log.is_none());
}

#[test]
fn test_disabled_log_has_no_dir() {
    let toml_content = r#"
[model]
model_id = "llama3.2"

[log]
enabled = false
log_dir = "/tmp/forage-logs"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert!(config.log_dir().is_none());
}

#[test]
fn test_missing_file_and_bad_toml_errors() {
    let missing = AppConfig::load(std::path::Path::new("/nonexistent/forage.toml"));
    assert!(matches!(missing, Err(ForageError::ConfigNotFound(_))));

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[workflow]\ncity = \"Cambridge\"\n")
        .expect("write toml");
    let no_model = AppConfig::load(tmp.path());
    assert!(matches!(no_model, Err(ForageError::Config(_))));
}
