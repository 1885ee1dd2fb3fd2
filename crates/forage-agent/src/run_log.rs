use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use forage_core::event::EventBus;
use forage_core::types::{RunId, WorkflowEvent};

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes structured log entries as JSONL
/// (one JSON object per line). This format is append-only and crash-resilient:
/// even if the process dies mid-run, all previously written lines are intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `log_dir` is the base directory; logs are written to
    /// `{log_dir}/{run_id}/{timestamp}.jsonl`.
    /// `level` controls verbosity: 1=summary, 2=transitions and stages, 3=every attempt.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log in a background task, so no event published
    /// after this call is missed.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, run_id, cancel))
    }

    /// Write JSONL until cancellation or RunComplete/RunFailed.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        let run_dir = self.log_dir.join(&run_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        let rid = run_id.0.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&rid, &event) else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                // Flush after each entry for crash resilience
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(
                                event,
                                WorkflowEvent::RunComplete { .. } | WorkflowEvent::RunFailed { .. }
                            ) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    fn entry(
        run_id: &str,
        event_type: &str,
        stage: Option<String>,
        detail: Option<serde_json::Value>,
    ) -> LogEntry {
        LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            stage,
            detail,
        }
    }

    /// Convert a WorkflowEvent to a log entry (None if filtered by level).
    fn event_to_entry(&self, run_id: &str, event: &WorkflowEvent) -> Option<LogEntry> {
        match event {
            // L1: run summary
            WorkflowEvent::RunStarted { .. } => {
                Some(Self::entry(run_id, "run_started", None, None))
            }
            WorkflowEvent::RunComplete { elapsed_ms, .. } => Some(Self::entry(
                run_id,
                "run_complete",
                None,
                Some(serde_json::json!({ "elapsed_ms": elapsed_ms })),
            )),
            WorkflowEvent::RunFailed { stage, error, .. } => Some(Self::entry(
                run_id,
                "run_failed",
                stage.map(|s| s.to_string()),
                Some(serde_json::json!({ "error": error })),
            )),

            // L2: transitions, degradations, stage outcomes
            WorkflowEvent::StateChanged { from, to, .. } if self.level >= 2 => Some(Self::entry(
                run_id,
                "state_changed",
                to.stage().map(|s| s.to_string()),
                Some(serde_json::json!({ "from": from, "to": to })),
            )),
            WorkflowEvent::Degraded {
                component, reason, ..
            } if self.level >= 2 => Some(Self::entry(
                run_id,
                "degraded",
                None,
                Some(serde_json::json!({
                    "component": component,
                    "reason": truncate_str(reason, 300),
                })),
            )),
            WorkflowEvent::StageCompleted { stage, attempts } if self.level >= 2 => {
                Some(Self::entry(
                    run_id,
                    "stage_completed",
                    Some(stage.to_string()),
                    Some(serde_json::json!({ "attempts": attempts })),
                ))
            }
            WorkflowEvent::UsageUpdate {
                input_tokens,
                output_tokens,
            } if self.level >= 2 => Some(Self::entry(
                run_id,
                "usage_update",
                None,
                Some(serde_json::json!({
                    "input_tokens": input_tokens,
                    "output_tokens": output_tokens,
                })),
            )),

            // L3: per-attempt detail
            WorkflowEvent::InstructionRendered { stage, chars } if self.level >= 3 => {
                Some(Self::entry(
                    run_id,
                    "instruction_rendered",
                    Some(stage.to_string()),
                    Some(serde_json::json!({ "chars": chars })),
                ))
            }
            WorkflowEvent::StageAttempt { stage, attempt } if self.level >= 3 => Some(Self::entry(
                run_id,
                "stage_attempt",
                Some(stage.to_string()),
                Some(serde_json::json!({ "attempt": attempt })),
            )),
            WorkflowEvent::StageRejected {
                stage,
                attempt,
                issues,
            } if self.level >= 3 => Some(Self::entry(
                run_id,
                "stage_rejected",
                Some(stage.to_string()),
                Some(serde_json::json!({
                    "attempt": attempt,
                    "issues": truncate_json(&serde_json::json!(issues), 1000),
                })),
            )),

            // TextDelta and anything filtered by level
            _ => None,
        }
    }
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        s
    } else {
        format!("{}...", truncate_str(&s, max_len))
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
