use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::NaiveTime;
use futures::future::BoxFuture;
use regex::Regex;
use tracing::debug;

use crate::domain::CalendarEntry;
use crate::error::{ForageError, Result};
use crate::traits::CalendarSource;

fn line_pattern() -> &'static Regex {
    static LINE: OnceLock<Regex> = OnceLock::new();
    LINE.get_or_init(|| Regex::new(r"^(\d{1,2}:\d{2})\s*-\s*(\d{1,2}:\d{2})\s+(.+)$").unwrap())
}

/// Parse calendar text of `HH:MM - HH:MM  Description` lines.
///
/// Comment lines (`#`), blank lines and lines that don't match are skipped,
/// as are lines whose times are out of range.
pub fn parse_calendar_text(text: &str) -> Vec<CalendarEntry> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let caps = line_pattern().captures(line)?;
            let start = NaiveTime::parse_from_str(&caps[1], "%H:%M").ok()?;
            let end = NaiveTime::parse_from_str(&caps[2], "%H:%M").ok()?;
            let description = caps[3].trim().to_string();
            if description.is_empty() {
                return None;
            }
            Some(CalendarEntry {
                start_time: start,
                end_time: end,
                description,
            })
        })
        .collect()
}

/// Calendar backed by a text file, read once per call.
pub struct FileCalendar {
    path: PathBuf,
    timeout: Duration,
}

impl FileCalendar {
    pub fn new(path: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            path: path.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl CalendarSource for FileCalendar {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn entries(&self) -> BoxFuture<'_, Result<Vec<CalendarEntry>>> {
        Box::pin(async move {
            let read = tokio::fs::read_to_string(&self.path);
            let text = tokio::time::timeout(self.timeout, read)
                .await
                .map_err(|_| {
                    ForageError::Calendar(format!(
                        "reading {} timed out after {}s",
                        self.path.display(),
                        self.timeout.as_secs()
                    ))
                })?
                .map_err(|e| ForageError::Calendar(format!("{}: {e}", self.path.display())))?;

            let entries = parse_calendar_text(&text);
            debug!(path = %self.path.display(), count = entries.len(), "Parsed calendar");
            Ok(entries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_garbage() {
        let text = "# My day\n\
                    07:30 - 08:15  Morning Run\n\
                    \n\
                    08:30 - 09:00  Breakfast at The Breakfast Club\n\
                    not a calendar line\n\
                    25:00 - 26:00  Impossible\n\
                    9:15-10:00 Meeting in Mill Road\n";
        let entries = parse_calendar_text(text);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].description, "Morning Run");
        assert_eq!(entries[1].start_time, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert_eq!(entries[2].description, "Meeting in Mill Road");
        assert_eq!(entries[2].start_time, NaiveTime::from_hms_opt(9, 15, 0).unwrap());
    }

    #[tokio::test]
    async fn test_file_calendar_reads_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calendar.txt");
        std::fs::write(&path, "12:00 - 13:00  Lunch at The Eagle\n").unwrap();
        let cal = FileCalendar::new(&path, 5);
        let entries = cal.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].description, "Lunch at The Eagle");
    }

    #[tokio::test]
    async fn test_file_calendar_missing_file_errors() {
        let cal = FileCalendar::new("/nonexistent/forage/calendar.txt", 5);
        let err = cal.entries().await.unwrap_err();
        assert!(matches!(err, ForageError::Calendar(_)));
    }
}
