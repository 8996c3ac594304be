#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use vidrelay_tools::config::{ConfigOverrides, load_run_config};
use vidrelay_tools::history::{HistoryEntry, HistoryStatus, scan_entries};

/// Summarise the republishing history file.
#[derive(Debug, Parser)]
#[command(name = "history_report", version)]
struct Args {
    /// History file to read. Takes precedence over --config.
    #[arg(long, value_name = "PATH")]
    history: Option<PathBuf>,

    /// Settings file used to locate the history file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Only list videos whose latest outcome is not a success.
    #[arg(long)]
    failed_only: bool,
}

#[derive(Debug, Default)]
struct Report {
    lines: usize,
    counts: BTreeMap<&'static str, usize>,
    /// Latest entry per source id; a success is never replaced by a later failure.
    latest: BTreeMap<String, HistoryEntry>,
}

impl Report {
    fn build(entries: Vec<HistoryEntry>) -> Self {
        let mut report = Self {
            lines: entries.len(),
            ..Self::default()
        };
        for entry in entries {
            *report.counts.entry(entry.status.as_str()).or_default() += 1;
            match report.latest.get(&entry.source_id) {
                Some(existing) if existing.status == HistoryStatus::Success => {}
                _ => {
                    report.latest.insert(entry.source_id.clone(), entry);
                }
            }
        }
        report
    }

    fn render(&self, failed_only: bool) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{} line(s), {} video(s)\n",
            self.lines,
            self.latest.len()
        ));
        for (status, count) in &self.counts {
            out.push_str(&format!("  {status}: {count}\n"));
        }
        out.push('\n');
        for entry in self.latest.values() {
            if failed_only && entry.status == HistoryStatus::Success {
                continue;
            }
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\n",
                entry.source_id,
                entry.status.as_str(),
                entry.timestamp.as_deref().unwrap_or("-"),
                entry.destination_url.as_deref().unwrap_or("-"),
            ));
        }
        out
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path = match args.history {
        Some(path) => path,
        None => load_run_config(ConfigOverrides {
            config_path: args.config,
            ..ConfigOverrides::default()
        })
        .context("loading configuration")?
        .history_path(),
    };

    let entries = scan_entries(&path)?;
    println!("History: {}", path.display());
    print!("{}", Report::build(entries).render(args.failed_only));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const LINES: &str = r#"{"yt_id":"old1","uploaded_at":"2024-05-01T10:00:00"}
{"source_id":"v1","status":"failed","timestamp":"2025-01-01T00:00:00Z","reason":"timeout"}
{"source_id":"v1","status":"success","timestamp":"2025-01-02T00:00:00Z","destination_url":"https://www.bilibili.com/video/BV1ab411c7mD"}
{"source_id":"v2","status":"upload_failed"}
not json
"#;

    #[test]
    fn report_counts_statuses_and_keeps_latest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        fs::write(&path, LINES).unwrap();

        let report = Report::build(scan_entries(&path).unwrap());

        assert_eq!(report.lines, 4);
        assert_eq!(report.counts.get("success"), Some(&2));
        assert_eq!(report.counts.get("failed"), Some(&2));
        assert_eq!(report.latest["v1"].status, HistoryStatus::Success);
        assert_eq!(report.latest["old1"].status, HistoryStatus::Success);
        assert_eq!(report.latest["v2"].status, HistoryStatus::Failed);
    }

    #[test]
    fn failed_only_hides_successes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        fs::write(&path, LINES).unwrap();

        let rendered = Report::build(scan_entries(&path).unwrap()).render(true);

        assert!(rendered.starts_with("4 line(s), 3 video(s)\n"));
        assert!(rendered.contains("v2\tfailed\t-\t-\n"));
        assert!(!rendered.contains("old1\t"));
        assert!(!rendered.contains("v1\t"));
    }

    #[test]
    fn missing_history_renders_empty_report() {
        let dir = tempdir().unwrap();
        let report = Report::build(scan_entries(&dir.path().join("absent.jsonl")).unwrap());
        assert_eq!(report.render(false), "0 line(s), 0 video(s)\n\n");
    }
}
