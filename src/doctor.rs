use std::path::{Path, PathBuf};

use forage_core::config::{AppConfig, PlacesTransport};
use forage_llm::providers::presets;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub fn run_doctor(config: &AppConfig) {
    let checks = vec![
        // 1. API key configured for primary model
        check_api_key(config),
        // 2. Workspace dir exists and writable
        check_workspace(config),
        // 3. Places server reachable as configured
        check_places(config),
        // 4. Calendar file readable
        check_calendar(config),
        // 5. Workflow settings sane
        check_workflow(config),
    ];

    // Print results
    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_api_key(config: &AppConfig) -> CheckResult {
    let has_key = config
        .model
        .api_key
        .as_ref()
        .is_some_and(|k| !k.is_empty() && !k.starts_with("${"));
    let provider = &config.model.provider;

    if !presets::is_openai_compatible(provider) {
        CheckResult {
            label: "API Key".into(),
            ok: false,
            detail: format!("Unsupported provider '{}'", provider),
        }
    } else if !presets::needs_api_key(provider) || has_key {
        CheckResult {
            label: "API Key".into(),
            ok: true,
            detail: format!("Configured for {} ({})", config.model.model_id, provider),
        }
    } else {
        CheckResult {
            label: "API Key".into(),
            ok: false,
            detail: format!("No API key set for provider '{}'", provider),
        }
    }
}

fn check_workspace(config: &AppConfig) -> CheckResult {
    let ws = config.workspace_dir();
    if !(ws.exists() && ws.is_dir()) {
        return CheckResult {
            label: "Workspace".into(),
            ok: false,
            detail: format!("{} (does not exist)", ws.display()),
        };
    }

    // Check writable by attempting to create a temp file
    let test_file = ws.join(".doctor_test");
    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            std::fs::remove_file(&test_file).ok();
            CheckResult {
                label: "Workspace".into(),
                ok: true,
                detail: format!("{}", ws.display()),
            }
        }
        Err(e) => CheckResult {
            label: "Workspace".into(),
            ok: false,
            detail: format!("{} (not writable: {})", ws.display(), e),
        },
    }
}

fn check_places(config: &AppConfig) -> CheckResult {
    match &config.places.transport {
        PlacesTransport::Stdio { command, .. } => match find_on_path(command) {
            Some(path) => CheckResult {
                label: "Places".into(),
                ok: true,
                detail: format!("stdio: {}", path.display()),
            },
            None => CheckResult {
                label: "Places".into(),
                ok: false,
                detail: format!("'{}' not found on PATH", command),
            },
        },
        PlacesTransport::Http { url } => {
            let ok = url.starts_with("http://") || url.starts_with("https://");
            CheckResult {
                label: "Places".into(),
                ok,
                detail: if ok {
                    format!("http: {}", url)
                } else {
                    format!("'{}' is not an http(s) URL", url)
                },
            }
        }
    }
}

fn check_calendar(config: &AppConfig) -> CheckResult {
    let Some(ref calendar) = config.calendar else {
        return CheckResult {
            label: "Calendar".into(),
            ok: true,
            detail: "Not configured (plans without anchors)".into(),
        };
    };

    match std::fs::read_to_string(&calendar.path) {
        Ok(text) => {
            let count = forage_core::calendar::parse_calendar_text(&text).len();
            CheckResult {
                label: "Calendar".into(),
                ok: true,
                detail: format!("{} ({} entries)", calendar.path, count),
            }
        }
        Err(e) => CheckResult {
            label: "Calendar".into(),
            ok: false,
            detail: format!("{}: {}", calendar.path, e),
        },
    }
}

fn check_workflow(config: &AppConfig) -> CheckResult {
    let wf = &config.workflow;
    let mut issues = Vec::new();
    if wf.city.trim().is_empty() {
        issues.push("empty city".to_string());
    }
    if wf.stage_timeout_secs == 0 {
        issues.push("stage_timeout_secs is 0".to_string());
    }
    if wf.venue_limit == 0 {
        issues.push("venue_limit is 0".to_string());
    }

    if issues.is_empty() {
        CheckResult {
            label: "Workflow".into(),
            ok: true,
            detail: format!(
                "{} within {}m, {} retries per stage",
                wf.city, wf.search_radius_m, wf.max_stage_retries
            ),
        }
    } else {
        CheckResult {
            label: "Workflow".into(),
            ok: false,
            detail: issues.join(", "),
        }
    }
}

fn find_on_path(command: &str) -> Option<PathBuf> {
    let direct = Path::new(command);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}
