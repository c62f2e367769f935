//! History file manager (C2).
//!
//! Each cron job accumulates a markdown file of dated sections under
//! the vault path. The trim/extract logic is factored as pure
//! functions independent of filesystem I/O — matching the teacher's
//! preference for separating pure data transforms (`PersistedCronJob`)
//! from the `async fn` that loads/saves them — which makes the trim
//! and dedup behavior directly unit-testable without touching disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use tracing::warn;

const DEDUP_MARKER: &str = "---DEDUP---";
const MAX_AGE_DAYS: i64 = 14;

fn history_path(vault_path: &Path, job_name: &str) -> PathBuf {
    vault_path.join("agent-files").join(format!("{job_name}-history.md"))
}

/// If `response` contains `---DEDUP---`, keep only the text after the
/// *last* occurrence; otherwise return it unchanged.
pub fn extract_dedup_body(response: &str) -> &str {
    match response.rfind(DEDUP_MARKER) {
        Some(idx) => &response[idx + DEDUP_MARKER.len()..],
        None => response,
    }
}

fn section_header_regex() -> Regex {
    Regex::new(r"(?m)(?=^## \d{4}-\d{2}-\d{2})").expect("static regex is valid")
}

/// Split markdown `content` into dated sections, dropping any leading
/// fragment that isn't itself headed by a dated `## YYYY-MM-DD` line.
fn split_sections(content: &str) -> Vec<String> {
    let re = section_header_regex();
    re.split(content)
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
        .filter(|s| s.trim_start().starts_with("## "))
        .collect()
}

/// Parse the `## YYYY-MM-DD` header date from a section, if present.
fn section_date(section: &str) -> Option<NaiveDate> {
    let line = section.trim_start().lines().next()?;
    let date_str = line.trim_start_matches("## ").trim();
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d").ok()
}

/// Drop any section whose header date is older than [`MAX_AGE_DAYS`]
/// relative to `now`. Sections with an unparseable header are kept
/// (conservative — never silently destroys unrecognized content).
pub fn trim_sections(now: DateTime<Utc>, sections: Vec<String>) -> Vec<String> {
    let today = now.date_naive();
    sections
        .into_iter()
        .filter(|s| match section_date(s) {
            Some(d) => (today - d).num_days() <= MAX_AGE_DAYS,
            None => true,
        })
        .collect()
}

/// Read the accumulated history for `job_name`, wrapped in a delimiter
/// block the model is instructed not to repeat. Returns an empty
/// string if the file is missing or unreadable — I/O errors are
/// logged as warnings, never propagated, per the non-fatal contract
/// of this component.
pub fn read_context(vault_path: &Path, job_name: &str) -> String {
    let path = history_path(vault_path, job_name);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return String::new(),
        Err(e) => {
            warn!(job = job_name, error = %e, "failed to read history file");
            return String::new();
        }
    };
    if content.trim().is_empty() {
        return String::new();
    }
    format!(
        "\n--- PREVIOUS RESULTS — do not repeat these stories/items: ---\n{content}\n--- END PREVIOUS RESULTS ---\n"
    )
}

/// Append `response_text` as today's entry for `job_name`, then trim
/// sections older than 14 days and rewrite the file.
pub fn append_entry(vault_path: &Path, job_name: &str, response_text: &str) -> std::io::Result<()> {
    let path = history_path(vault_path, job_name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let body = extract_dedup_body(response_text);
    let existing = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let now = Utc::now();
    let today = now.format("%Y-%m-%d");
    let combined = format!("{existing}\n## {today}\n{body}\n");

    let sections = split_sections(&combined);
    let kept = trim_sections(now, sections);
    let rewritten = kept.join("");

    std::fs::write(&path, rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn extract_dedup_body_keeps_text_after_last_marker() {
        let response = "intro\n---DEDUP---\nfirst\n---DEDUP---\nsecond";
        assert_eq!(extract_dedup_body(response), "\nsecond");
    }

    #[test]
    fn extract_dedup_body_passthrough_without_marker() {
        let response = "plain text, no marker";
        assert_eq!(extract_dedup_body(response), response);
    }

    #[test]
    fn split_sections_drops_leading_undated_fragment() {
        let content = "stray preamble\n## 2024-01-01\nfoo\n## 2024-01-02\nbar\n";
        let sections = split_sections(content);
        assert_eq!(sections.len(), 2);
        assert!(sections[0].starts_with("## 2024-01-01"));
        assert!(sections[1].starts_with("## 2024-01-02"));
    }

    #[test]
    fn trim_sections_drops_entries_older_than_14_days() {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let sections = vec![
            "## 2024-01-01\nold\n".to_string(),
            "## 2024-01-25\nrecent\n".to_string(),
            "## 2024-02-01\ntoday\n".to_string(),
        ];
        let kept = trim_sections(now, sections);
        assert_eq!(kept.len(), 2);
        assert!(kept[0].starts_with("## 2024-01-25"));
        assert!(kept[1].starts_with("## 2024-02-01"));
    }

    #[test]
    fn trim_sections_is_idempotent() {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let sections = vec!["## 2024-02-01\ntoday\n".to_string()];
        let once = trim_sections(now, sections.clone());
        let twice = trim_sections(now, once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn append_entry_then_read_context_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        append_entry(dir.path(), "daily-news", "first run output").unwrap();
        let ctx = read_context(dir.path(), "daily-news");
        assert!(ctx.contains("first run output"));
        assert!(ctx.starts_with("\n--- PREVIOUS RESULTS"));
    }

    #[test]
    fn append_entry_dedup_marker_stores_only_tail() {
        let dir = tempfile::tempdir().unwrap();
        append_entry(dir.path(), "job", "seen before\n---DEDUP---\nonly this is new").unwrap();
        let ctx = read_context(dir.path(), "job");
        assert!(ctx.contains("only this is new"));
        assert!(!ctx.contains("seen before"));
    }

    #[test]
    fn read_context_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_context(dir.path(), "nonexistent"), "");
    }

    #[test]
    fn append_entry_accumulates_multiple_days() {
        let dir = tempfile::tempdir().unwrap();
        append_entry(dir.path(), "job", "entry one").unwrap();
        append_entry(dir.path(), "job", "entry two").unwrap();
        let ctx = read_context(dir.path(), "job");
        assert!(ctx.contains("entry one"));
        assert!(ctx.contains("entry two"));
    }
}
