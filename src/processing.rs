//! Client for the remote transcription/translation/dubbing service.
//!
//! The service exposes a small task API: submit a URL, poll the task, download
//! artifacts by type, and delete the task when done. Polling cadence and the
//! overall timeout belong to the pipeline; every method here is one request.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{ProcessingSettings, RunConfig};
use crate::discovery::VideoCandidate;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3600);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle of a submitted remote task; required for cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub task_id: String,
}

impl TaskHandle {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    pub percent: u8,
    pub step: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending(TaskProgress),
    Done,
    Error(String),
}

/// Local artifacts of a finished task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingResult {
    pub source_id: String,
    pub remote_task_id: String,
    pub local_video_path: PathBuf,
    /// The cover is best effort; uploads proceed without one.
    pub local_cover_path: Option<PathBuf>,
    pub local_dub_path: Option<PathBuf>,
    /// Translated subtitles, used as context for metadata generation.
    pub local_subtitle_path: Option<PathBuf>,
}

pub trait ProcessingClient {
    fn submit(&self, candidate: &VideoCandidate) -> Result<TaskHandle>;
    fn poll(&self, task: &TaskHandle) -> Result<TaskStatus>;
    fn fetch_artifacts(
        &self,
        task: &TaskHandle,
        candidate: &VideoCandidate,
    ) -> Result<ProcessingResult>;
    fn cleanup(&self, task: &TaskHandle) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct ProcessUrlRequest<'a> {
    url: &'a str,
    target_language: &'a str,
    source_language: Option<&'a str>,
    enable_dubbing: bool,
    burn_subtitles: bool,
    resolution: &'a str,
}

#[derive(Debug, Deserialize)]
struct ProcessUrlResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    current_step: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl TaskStatusResponse {
    fn into_status(self) -> TaskStatus {
        let message = self.message.unwrap_or_default();
        match self.status.as_deref() {
            Some("completed") => TaskStatus::Done,
            Some("failed") => TaskStatus::Error(if message.is_empty() {
                "remote task failed".to_string()
            } else {
                message
            }),
            _ => TaskStatus::Pending(TaskProgress {
                percent: self
                    .progress
                    .filter(|value| value.is_finite())
                    .map(|value| value.clamp(0.0, 100.0) as u8)
                    .unwrap_or(0),
                step: self.current_step.unwrap_or_default(),
                message,
            }),
        }
    }
}

/// Artifact kinds understood by the download endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Artifact {
    SubtitledVideo,
    DubbedVideo,
    TranslatedSubtitles,
    DubAudio,
}

impl Artifact {
    fn slug(self) -> &'static str {
        match self {
            Artifact::SubtitledVideo => "video_sub",
            Artifact::DubbedVideo => "video_dub",
            Artifact::TranslatedSubtitles => "trans_srt",
            Artifact::DubAudio => "dub_audio",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Artifact::SubtitledVideo => "output_sub.mp4",
            Artifact::DubbedVideo => "output_dub.mp4",
            Artifact::TranslatedSubtitles => "trans.srt",
            Artifact::DubAudio => "dub_audio.mp3",
        }
    }
}

/// HTTP client for a VideoLingo-compatible API.
pub struct VideoLingoClient {
    base: String,
    agent: ureq::Agent,
    settings: ProcessingSettings,
    downloads_dir: PathBuf,
    covers_dir: PathBuf,
    covers: CoverFetcher,
}

impl VideoLingoClient {
    pub fn new(config: &RunConfig, covers: CoverFetcher) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.processing.request_timeout_sec.max(1)))
            .build();
        Self {
            base: config.api_base.trim_end_matches('/').to_string(),
            agent,
            settings: config.processing.clone(),
            downloads_dir: config.paths.downloads.clone(),
            covers_dir: config.paths.covers.clone(),
            covers,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Confirms the service answers on `/health`, falling back to `/`.
    pub fn health(&self) -> Result<()> {
        let health = self
            .agent
            .get(&self.url("/health"))
            .timeout(HEALTH_TIMEOUT)
            .call();
        if health.is_ok() {
            return Ok(());
        }

        let body = self
            .agent
            .get(&self.url("/"))
            .timeout(HEALTH_TIMEOUT)
            .call()
            .with_context(|| format!("contacting processing service at {}", self.base))?
            .into_string()
            .context("reading processing service landing page")?;
        if body.contains("VideoLingo") || body.contains("docs") {
            Ok(())
        } else {
            bail!("{} does not look like a processing service", self.base)
        }
    }

    fn download(&self, task: &TaskHandle, artifact: Artifact, dir: &Path) -> Result<PathBuf> {
        let url = self.url(&format!(
            "/api/v1/download/{}/{}",
            task.task_id,
            artifact.slug()
        ));
        let response = self
            .agent
            .get(&url)
            .timeout(DOWNLOAD_TIMEOUT)
            .call()
            .with_context(|| format!("downloading {} for task {}", artifact.slug(), task.task_id))?;

        let target = dir.join(artifact.file_name());
        let partial = target.with_extension("part");
        let mut file =
            File::create(&partial).with_context(|| format!("creating {}", partial.display()))?;
        io::copy(&mut response.into_reader(), &mut file)
            .with_context(|| format!("writing {}", partial.display()))?;
        file.sync_all()
            .with_context(|| format!("flushing {}", partial.display()))?;
        fs::rename(&partial, &target)
            .with_context(|| format!("finalizing {}", target.display()))?;
        Ok(target)
    }
}

impl ProcessingClient for VideoLingoClient {
    fn submit(&self, candidate: &VideoCandidate) -> Result<TaskHandle> {
        let request = ProcessUrlRequest {
            url: &candidate.url,
            target_language: &self.settings.target_language,
            source_language: None,
            enable_dubbing: self.settings.enable_dubbing,
            burn_subtitles: self.settings.burn_subtitles,
            resolution: &self.settings.resolution,
        };
        let response: ProcessUrlResponse = self
            .agent
            .post(&self.url("/api/v1/process-url"))
            .send_json(&request)
            .with_context(|| format!("submitting {}", candidate.url))?
            .into_json()
            .context("decoding submit response")?;
        if response.task_id.trim().is_empty() {
            bail!("processing service returned an empty task id");
        }
        Ok(TaskHandle::new(response.task_id))
    }

    fn poll(&self, task: &TaskHandle) -> Result<TaskStatus> {
        let response: TaskStatusResponse = self
            .agent
            .get(&self.url(&format!("/api/v1/tasks/{}", task.task_id)))
            .call()
            .with_context(|| format!("polling task {}", task.task_id))?
            .into_json()
            .context("decoding task status")?;
        Ok(response.into_status())
    }

    fn fetch_artifacts(
        &self,
        task: &TaskHandle,
        candidate: &VideoCandidate,
    ) -> Result<ProcessingResult> {
        let work_dir = self.downloads_dir.join(&task.task_id);
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("creating {}", work_dir.display()))?;

        let local_subtitle_path = match self.download(task, Artifact::TranslatedSubtitles, &work_dir)
        {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(task_id = %task.task_id, "translated subtitles unavailable: {err:#}");
                None
            }
        };

        let (video_artifact, local_dub_path) = if self.settings.enable_dubbing {
            let dub = match self.download(task, Artifact::DubAudio, &work_dir) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(task_id = %task.task_id, "dub track unavailable: {err:#}");
                    None
                }
            };
            (Artifact::DubbedVideo, dub)
        } else {
            (Artifact::SubtitledVideo, None)
        };
        let local_video_path = self.download(task, video_artifact, &work_dir)?;

        let local_cover_path = self
            .covers
            .fetch(&candidate.url, &self.covers_dir.join(&task.task_id));
        if local_cover_path.is_none() {
            warn!(source_id = %candidate.source_id, "cover not found; uploading without one");
        }

        Ok(ProcessingResult {
            source_id: candidate.source_id.clone(),
            remote_task_id: task.task_id.clone(),
            local_video_path,
            local_cover_path,
            local_dub_path,
            local_subtitle_path,
        })
    }

    fn cleanup(&self, task: &TaskHandle) -> Result<()> {
        self.agent
            .delete(&self.url(&format!("/api/v1/tasks/{}", task.task_id)))
            .call()
            .with_context(|| format!("deleting remote task {}", task.task_id))?;
        Ok(())
    }
}

/// Downloads the source thumbnail as a JPEG through `yt-dlp`.
#[derive(Debug, Clone)]
pub struct CoverFetcher {
    program: PathBuf,
    cookies: Option<PathBuf>,
}

impl CoverFetcher {
    pub fn new(program: impl Into<PathBuf>, cookies: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies,
        }
    }

    /// Returns the first `.jpg` in `out_dir` after running the thumbnail
    /// download, if any.
    pub fn fetch(&self, video_url: &str, out_dir: &Path) -> Option<PathBuf> {
        if let Err(err) = fs::create_dir_all(out_dir) {
            warn!("could not create cover dir {}: {err}", out_dir.display());
            return None;
        }

        let mut command = Command::new(&self.program);
        command
            .arg("--skip-download")
            .arg("--write-thumbnail")
            .arg("--convert-thumbnails")
            .arg("jpg");
        if let Some(cookies) = &self.cookies
            && cookies.exists()
        {
            command.arg("--cookies").arg(cookies);
        }
        command
            .arg("-o")
            .arg(out_dir.join("%(id)s.%(ext)s"))
            .arg(video_url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match command.status() {
            Ok(status) if status.success() => {}
            Ok(status) => debug!("thumbnail command exited with {status}"),
            Err(err) => debug!("thumbnail command failed: {err}"),
        }

        first_jpeg(out_dir)
    }
}

fn first_jpeg(dir: &Path) -> Option<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg"))
        })
        .collect();
    found.sort();
    found.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use tempfile::tempdir;

    fn client_for(base: &str, root: &Path) -> VideoLingoClient {
        client_with(base, root, |_| {})
    }

    fn client_with(
        base: &str,
        root: &Path,
        adjust: impl FnOnce(&mut RunConfig),
    ) -> VideoLingoClient {
        let mut config = RunConfig {
            api_base: base.to_string(),
            ..RunConfig::default()
        };
        config.paths.downloads = root.join("downloads");
        config.paths.covers = root.join("covers");
        adjust(&mut config);
        VideoLingoClient::new(
            &config,
            CoverFetcher::new(root.join("missing-yt-dlp"), None),
        )
    }

    #[test]
    fn status_mapping_covers_all_states() {
        let pending = TaskStatusResponse {
            status: Some("processing".into()),
            progress: Some(142.0),
            current_step: Some("asr".into()),
            message: None,
        };
        assert_eq!(
            pending.into_status(),
            TaskStatus::Pending(TaskProgress {
                percent: 100,
                step: "asr".into(),
                message: String::new(),
            })
        );

        let done = TaskStatusResponse {
            status: Some("completed".into()),
            progress: None,
            current_step: None,
            message: None,
        };
        assert_eq!(done.into_status(), TaskStatus::Done);

        let failed = TaskStatusResponse {
            status: Some("failed".into()),
            progress: None,
            current_step: None,
            message: None,
        };
        assert_eq!(
            failed.into_status(),
            TaskStatus::Error("remote task failed".into())
        );
    }

    #[test]
    fn submit_posts_options_and_returns_handle() -> Result<()> {
        let (base, seen) = serve(vec![(200, r#"{"task_id":"t-1"}"#)]);
        let dir = tempdir()?;
        let client = client_for(&base, dir.path());
        let candidate = VideoCandidate::new("v1", "Title", "https://youtu.be/v1", "k");
        let handle = client.submit(&candidate)?;
        assert_eq!(handle, TaskHandle::new("t-1"));
        let requests = seen.lock().unwrap();
        assert!(requests[0].starts_with("POST /api/v1/process-url"));
        assert!(requests[0].contains("\"url\":\"https://youtu.be/v1\""));
        assert!(requests[0].contains("\"burn_subtitles\":true"));
        Ok(())
    }

    #[test]
    fn poll_decodes_pending_progress() -> Result<()> {
        let (base, _) = serve(vec![(
            200,
            r#"{"status":"processing","progress":42.5,"current_step":"translate","message":"working"}"#,
        )]);
        let dir = tempdir()?;
        let client = client_for(&base, dir.path());
        let status = client.poll(&TaskHandle::new("t-1"))?;
        assert_eq!(
            status,
            TaskStatus::Pending(TaskProgress {
                percent: 42,
                step: "translate".into(),
                message: "working".into(),
            })
        );
        Ok(())
    }

    #[test]
    fn fetch_artifacts_downloads_subtitles_and_video() -> Result<()> {
        let (base, seen) = serve(vec![(200, "1\n00:00 --> 00:01\n你好\n"), (200, "video-bytes")]);
        let dir = tempdir()?;
        let client = client_for(&base, dir.path());
        let candidate = VideoCandidate::new("v1", "Title", "https://youtu.be/v1", "k");
        let result = client.fetch_artifacts(&TaskHandle::new("t-9"), &candidate)?;
        assert_eq!(result.remote_task_id, "t-9");
        assert_eq!(fs::read_to_string(&result.local_video_path)?, "video-bytes");
        assert!(result.local_video_path.ends_with("t-9/output_sub.mp4"));
        assert!(result.local_subtitle_path.is_some());
        assert!(result.local_cover_path.is_none());
        assert!(result.local_dub_path.is_none());
        let requests = seen.lock().unwrap();
        assert!(requests[0].starts_with("GET /api/v1/download/t-9/trans_srt"));
        assert!(requests[1].starts_with("GET /api/v1/download/t-9/video_sub"));
        Ok(())
    }

    #[test]
    fn fetch_artifacts_with_dubbing_downloads_dub_track() -> Result<()> {
        let (base, seen) = serve(vec![
            (200, "1\n00:00 --> 00:01\n你好\n"),
            (200, "dub-audio"),
            (200, "dubbed-video"),
        ]);
        let dir = tempdir()?;
        let client = client_with(&base, dir.path(), |config| {
            config.processing.enable_dubbing = true;
        });
        let candidate = VideoCandidate::new("v1", "Title", "https://youtu.be/v1", "k");
        let result = client.fetch_artifacts(&TaskHandle::new("t-4"), &candidate)?;

        let dub = result.local_dub_path.expect("dub track downloaded");
        assert!(dub.ends_with("t-4/dub_audio.mp3"));
        assert_eq!(fs::read_to_string(&dub)?, "dub-audio");
        assert!(result.local_video_path.ends_with("t-4/output_dub.mp4"));
        assert_eq!(fs::read_to_string(&result.local_video_path)?, "dubbed-video");

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].starts_with("GET /api/v1/download/t-4/trans_srt"));
        assert!(requests[1].starts_with("GET /api/v1/download/t-4/dub_audio"));
        assert!(requests[2].starts_with("GET /api/v1/download/t-4/video_dub"));
        Ok(())
    }

    #[test]
    fn health_falls_back_to_landing_page() -> Result<()> {
        let (base, seen) = serve(vec![(500, "{}"), (200, "<html>VideoLingo API</html>")]);
        let dir = tempdir()?;
        client_for(&base, dir.path()).health()?;
        let requests = seen.lock().unwrap();
        assert!(requests[0].starts_with("GET /health"));
        assert!(requests[1].starts_with("GET / "));
        Ok(())
    }

    #[test]
    fn health_rejects_unrelated_landing_page() -> Result<()> {
        let (base, _) = serve(vec![(500, "{}"), (200, "<html>Welcome to nginx!</html>")]);
        let dir = tempdir()?;
        let err = client_for(&base, dir.path()).health().unwrap_err();
        assert!(err.to_string().contains("does not look like a processing service"));
        Ok(())
    }

    #[test]
    fn cleanup_reports_server_errors() -> Result<()> {
        let (base, seen) = serve(vec![(204, ""), (500, "{}")]);
        let dir = tempdir()?;
        let client = client_for(&base, dir.path());
        client.cleanup(&TaskHandle::new("t-1"))?;
        assert!(client.cleanup(&TaskHandle::new("t-2")).is_err());
        assert!(seen.lock().unwrap()[0].starts_with("DELETE /api/v1/tasks/t-1"));
        Ok(())
    }

    #[test]
    fn first_jpeg_picks_sorted_jpg() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("b.jpg"), "b")?;
        fs::write(dir.path().join("a.JPG"), "a")?;
        fs::write(dir.path().join("a.webp"), "w")?;
        assert_eq!(first_jpeg(dir.path()), Some(dir.path().join("a.JPG")));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn cover_fetcher_runs_stub_and_finds_jpeg() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir()?;
        let stub = dir.path().join("yt-dlp");
        fs::write(
            &stub,
            r#"#!/usr/bin/env bash
out=""
while [[ $# -gt 0 ]]; do
  if [[ "$1" == "-o" ]]; then shift; out="$1"; fi
  shift
done
target=$(printf '%s' "$out" | sed -e 's/%(id)s/abc/' -e 's/%(ext)s/jpg/')
echo jpeg > "$target"
"#,
        )?;
        let mut perms = fs::metadata(&stub)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&stub, perms)?;

        let fetcher = CoverFetcher::new(&stub, None);
        let out_dir = dir.path().join("covers").join("t-1");
        let cover = fetcher.fetch("https://youtu.be/abc", &out_dir);
        assert_eq!(cover, Some(out_dir.join("abc.jpg")));
        Ok(())
    }
}
