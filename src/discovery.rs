//! Keyword search on the source platform.
//!
//! The production client shells out to `yt-dlp` and reads its `--dump-json`
//! output line by line, so candidates reach the pipeline while the search is
//! still running.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{NaiveDate, TimeDelta};
use serde::Deserialize;
use tracing::debug;

use crate::config::YoutubeSettings;

/// A source video found for a keyword. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCandidate {
    pub source_id: String,
    pub title: String,
    pub url: String,
    pub keyword: String,
    pub duration_sec: Option<u64>,
    pub uploader: Option<String>,
    pub upload_date: Option<NaiveDate>,
}

impl VideoCandidate {
    pub fn new(
        source_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        keyword: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            url: url.into(),
            keyword: keyword.into(),
            duration_sec: None,
            uploader: None,
            upload_date: None,
        }
    }
}

/// Lazily produced candidates. An `Err` item ends the keyword.
pub type CandidateStream = Box<dyn Iterator<Item = Result<VideoCandidate>>>;

pub trait Discovery {
    fn search(&self, keyword: &str) -> Result<CandidateStream>;
}

/// Why a candidate was passed over without being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyProcessed,
    DurationOutOfRange,
    BlacklistedChannel,
    TooOld,
    Duplicate,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyProcessed => "already_processed",
            Self::DurationOutOfRange => "duration_out_of_range",
            Self::BlacklistedChannel => "blacklisted_channel",
            Self::TooOld => "too_old",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Cheap local checks applied before any remote work.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    min_duration_sec: u64,
    max_duration_sec: u64,
    blacklist: Vec<String>,
    cutoff: Option<NaiveDate>,
}

impl CandidateFilter {
    pub fn from_settings(settings: &YoutubeSettings, today: NaiveDate) -> Self {
        let cutoff = (settings.published_after_days > 0)
            .then(|| TimeDelta::try_days(settings.published_after_days))
            .flatten()
            .and_then(|window| today.checked_sub_signed(window));
        Self {
            min_duration_sec: settings.min_duration_sec,
            max_duration_sec: settings.max_duration_sec,
            blacklist: settings
                .blacklist_channels
                .iter()
                .map(|channel| channel.trim().to_lowercase())
                .filter(|channel| !channel.is_empty())
                .collect(),
            cutoff,
        }
    }

    /// Lets everything through.
    pub fn permissive() -> Self {
        Self {
            min_duration_sec: 0,
            max_duration_sec: u64::MAX,
            blacklist: Vec::new(),
            cutoff: None,
        }
    }

    pub fn rejection(&self, candidate: &VideoCandidate) -> Option<SkipReason> {
        if let Some(duration) = candidate.duration_sec
            && (duration < self.min_duration_sec || duration > self.max_duration_sec)
        {
            return Some(SkipReason::DurationOutOfRange);
        }
        if let Some(uploader) = &candidate.uploader
            && self.blacklist.contains(&uploader.trim().to_lowercase())
        {
            return Some(SkipReason::BlacklistedChannel);
        }
        if let (Some(date), Some(cutoff)) = (candidate.upload_date, self.cutoff)
            && date < cutoff
        {
            return Some(SkipReason::TooOld);
        }
        None
    }
}

/// `yt-dlp` backed search (`ytsearchN:<keyword>`).
#[derive(Debug, Clone)]
pub struct YtDlpSearch {
    program: PathBuf,
    max_results: u32,
    cookies: Option<PathBuf>,
}

impl YtDlpSearch {
    pub fn new(program: impl Into<PathBuf>, settings: &YoutubeSettings) -> Self {
        Self {
            program: program.into(),
            max_results: settings.max_results_per_keyword.max(1),
            cookies: Some(settings.cookies_file.clone()),
        }
    }

    fn command(&self, keyword: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--dump-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--default-search")
            .arg("ytsearch");
        if let Some(cookies) = &self.cookies
            && cookies.exists()
        {
            command.arg("--cookies").arg(cookies);
        }
        command
            .arg(format!("ytsearch{}:{}", self.max_results, keyword))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        command
    }
}

impl Discovery for YtDlpSearch {
    fn search(&self, keyword: &str) -> Result<CandidateStream> {
        let mut child = self
            .command(keyword)
            .spawn()
            .with_context(|| format!("starting {} for `{keyword}`", self.program.display()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("search process has no stdout"))?;
        Ok(Box::new(SearchOutput {
            keyword: keyword.to_string(),
            child,
            lines: BufReader::new(stdout).lines(),
            pending: VecDeque::new(),
            finished: false,
        }))
    }
}

/// Streaming reader over a running search process.
struct SearchOutput {
    keyword: String,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    pending: VecDeque<VideoCandidate>,
    finished: bool,
}

impl SearchOutput {
    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let status = self.child.wait().context("waiting for search process")?;
        if !status.success() {
            bail!("search for `{}` exited with {}", self.keyword, status);
        }
        Ok(())
    }
}

impl Iterator for SearchOutput {
    type Item = Result<VideoCandidate>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(candidate) = self.pending.pop_front() {
                return Some(Ok(candidate));
            }
            if self.finished {
                return None;
            }
            match self.lines.next() {
                Some(Ok(line)) => {
                    self.pending.extend(parse_search_line(&line, &self.keyword));
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(err).context("reading search output"));
                }
                None => {
                    if let Err(err) = self.finish() {
                        return Some(Err(err));
                    }
                }
            }
        }
    }
}

impl Drop for SearchOutput {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    upload_date: Option<String>,
    #[serde(default, rename = "_type")]
    kind: Option<String>,
    #[serde(default)]
    entries: Vec<Option<SearchEntry>>,
}

/// Turns one `--dump-json` line into candidates. Playlist wrappers expand to
/// their entries; unparseable lines and entries without an id yield nothing.
fn parse_search_line(line: &str, keyword: &str) -> Vec<VideoCandidate> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let entry: SearchEntry = match serde_json::from_str(line) {
        Ok(entry) => entry,
        Err(err) => {
            debug!(keyword, "ignoring unparseable search line: {err}");
            return Vec::new();
        }
    };

    if entry.kind.as_deref() == Some("playlist") {
        return entry
            .entries
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.into_candidate(keyword))
            .collect();
    }
    entry.into_candidate(keyword).into_iter().collect()
}

impl SearchEntry {
    fn into_candidate(self, keyword: &str) -> Option<VideoCandidate> {
        let id = self.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty())?;
        let url = self
            .webpage_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={id}"));
        Some(VideoCandidate {
            title: self.title.unwrap_or_default(),
            url,
            keyword: keyword.to_string(),
            duration_sec: self
                .duration
                .filter(|value| value.is_finite() && *value >= 0.0)
                .map(|value| value.round() as u64),
            uploader: self.uploader,
            upload_date: self
                .upload_date
                .as_deref()
                .and_then(|value| NaiveDate::parse_from_str(value, "%Y%m%d").ok()),
            source_id: id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use std::{fs, path::Path};
    use tempfile::tempdir;

    fn settings() -> YoutubeSettings {
        YoutubeSettings {
            min_duration_sec: 60,
            max_duration_sec: 3600,
            blacklist_channels: vec!["Spam Channel".into()],
            published_after_days: 30,
            ..YoutubeSettings::default()
        }
    }

    fn candidate() -> VideoCandidate {
        let mut candidate = VideoCandidate::new("v1", "Title", "https://youtu.be/v1", "test");
        candidate.duration_sec = Some(600);
        candidate.uploader = Some("Good Channel".into());
        candidate.upload_date = NaiveDate::from_ymd_opt(2024, 6, 20);
        candidate
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()
    }

    #[test]
    fn filter_accepts_in_range_candidate() {
        let filter = CandidateFilter::from_settings(&settings(), today());
        assert_eq!(filter.rejection(&candidate()), None);
    }

    #[test]
    fn filter_rejects_by_duration_channel_and_age() {
        let filter = CandidateFilter::from_settings(&settings(), today());

        let mut short = candidate();
        short.duration_sec = Some(10);
        assert_eq!(filter.rejection(&short), Some(SkipReason::DurationOutOfRange));

        let mut spam = candidate();
        spam.uploader = Some("  spam channel ".into());
        assert_eq!(filter.rejection(&spam), Some(SkipReason::BlacklistedChannel));

        let mut old = candidate();
        old.upload_date = NaiveDate::from_ymd_opt(2023, 1, 1);
        assert_eq!(filter.rejection(&old), Some(SkipReason::TooOld));
    }

    #[test]
    fn oversized_age_window_disables_cutoff() {
        for days in [1_000_000_000, i64::MAX] {
            let settings = YoutubeSettings {
                published_after_days: days,
                ..settings()
            };
            let filter = CandidateFilter::from_settings(&settings, today());
            let mut ancient = candidate();
            ancient.upload_date = NaiveDate::from_ymd_opt(1970, 1, 1);
            assert_eq!(filter.rejection(&ancient), None);
        }
    }

    #[test]
    fn filter_ignores_unknown_fields() {
        let filter = CandidateFilter::from_settings(&settings(), today());
        let bare = VideoCandidate::new("v2", "t", "u", "k");
        assert_eq!(filter.rejection(&bare), None);
        assert_eq!(CandidateFilter::permissive().rejection(&candidate()), None);
    }

    #[test]
    fn parse_line_reads_single_entry() {
        let line = r#"{"id":"abc","title":"Hello","duration":61.6,"uploader":"Chan","upload_date":"20240102"}"#;
        let parsed = parse_search_line(line, "kw");
        assert_eq!(parsed.len(), 1);
        let candidate = &parsed[0];
        assert_eq!(candidate.source_id, "abc");
        assert_eq!(candidate.url, "https://www.youtube.com/watch?v=abc");
        assert_eq!(candidate.duration_sec, Some(62));
        assert_eq!(candidate.keyword, "kw");
        assert_eq!(candidate.upload_date, NaiveDate::from_ymd_opt(2024, 1, 2));
    }

    #[test]
    fn parse_line_expands_playlists_and_skips_garbage() {
        let line = r#"{"_type":"playlist","entries":[{"id":"a","title":"A","webpage_url":"https://y/a"},null,{"title":"no id"}]}"#;
        let parsed = parse_search_line(line, "kw");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].url, "https://y/a");
        assert!(parse_search_line("not json", "kw").is_empty());
        assert!(parse_search_line("   ", "kw").is_empty());
    }

    #[cfg(unix)]
    fn install_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("yt-dlp");
        fs::write(&path, format!("#!/usr/bin/env bash\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn search_streams_candidates_from_stub() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(
            dir.path(),
            r#"echo '{"id":"one","title":"First"}'
echo 'garbage'
echo '{"id":"two","title":"Second"}'"#,
        );
        let search = YtDlpSearch::new(stub, &YoutubeSettings::default());
        let ids: Vec<String> = search
            .search("rust")?
            .map(|item| item.map(|candidate| candidate.source_id))
            .collect::<Result<_>>()?;
        assert_eq!(ids, vec!["one".to_string(), "two".to_string()]);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn search_failure_surfaces_after_partial_output() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(dir.path(), "echo '{\"id\":\"one\"}'\nexit 3");
        let search = YtDlpSearch::new(stub, &YoutubeSettings::default());
        let mut stream = search.search("rust")?;
        assert_eq!(stream.next().unwrap()?.source_id, "one");
        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none());
        Ok(())
    }

    #[test]
    fn search_with_missing_program_fails_to_start() {
        let search = YtDlpSearch::new("/nonexistent/yt-dlp", &YoutubeSettings::default());
        assert!(search.search("rust").is_err());
    }
}
