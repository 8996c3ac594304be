//! Upload to the destination platform through an external uploader command.
//!
//! Success is the uploader's exit status. The destination URL is recovered
//! from its output when a video id can be spotted there.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::PublishError;
use crate::metadata::UploadText;

const MAX_TAGS: usize = 12;
const FALLBACK_TAGS: usize = 6;
const STDERR_TAIL_CHARS: usize = 2000;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(7_200);
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Everything one upload attempt needs.
#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {
    pub video: &'a Path,
    pub cover: Option<&'a Path>,
    pub source_url: &'a str,
    pub text: &'a UploadText,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishReceipt {
    pub destination_url: Option<String>,
}

/// Retries are assumed safe: the pipeline may call `publish` again for the
/// same request after a failure.
pub trait Publisher {
    fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishReceipt, PublishError>;
}

/// `biliup upload` wrapper.
#[derive(Debug, Clone)]
pub struct BiliupPublisher {
    program: PathBuf,
    timeout: Duration,
}

impl BiliupPublisher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Caps one upload attempt; the uploader is killed when it runs longer.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Runs the uploader to completion or until the timeout, collecting both
    /// output streams.
    fn run(&self, mut command: Command) -> Result<(ExitStatus, String, String), PublishError> {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PublishError::Spawn {
                program: self.program_name(),
                source,
            })?;
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(program = %self.program_name(), "uploader timed out; killed");
                    return Err(PublishError::Timeout(self.timeout));
                }
                Ok(None) => thread::sleep(WAIT_SLICE),
                Err(source) => {
                    let _ = child.kill();
                    return Err(PublishError::Wait {
                        program: self.program_name(),
                        source,
                    });
                }
            }
        };
        Ok((status, collect(stdout), collect(stderr)))
    }

    fn command(&self, request: &PublishRequest<'_>) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("upload");
        if let Some(cover) = request.cover
            && cover.exists()
        {
            command.arg("--cover").arg(cover);
        }
        command
            .arg("--source")
            .arg(request.source_url)
            .arg("--title")
            .arg(&request.text.title)
            .arg("--desc")
            .arg(&request.text.description)
            .arg("--tag")
            .arg(normalize_tags(&request.text.tags))
            .arg(request.video)
            .stdin(Stdio::null());
        command
    }
}

impl Publisher for BiliupPublisher {
    fn publish(&self, request: &PublishRequest<'_>) -> Result<PublishReceipt, PublishError> {
        if !request.video.exists() {
            return Err(PublishError::MissingMedia(request.video.to_path_buf()));
        }

        let (status, stdout, stderr) = self.run(self.command(request))?;

        if !status.success() {
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(PublishError::Exit {
                status: status.to_string(),
                detail: tail_chars(detail, STDERR_TAIL_CHARS),
            });
        }

        let destination_url = find_bvid(&stdout)
            .or_else(|| find_bvid(&stderr))
            .map(|bvid| format!("https://www.bilibili.com/video/{bvid}"));
        debug!(?destination_url, "uploader finished");
        Ok(PublishReceipt { destination_url })
    }
}

fn drain<R: Read + Send + 'static>(mut stream: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = stream.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Keeps trimmed tags of 2 to 4 characters; if none qualify, uses the first
/// few raw tags instead. At most twelve, comma separated.
pub fn normalize_tags(tags: &[String]) -> String {
    let mut kept: Vec<&str> = tags
        .iter()
        .map(|tag| tag.trim())
        .filter(|tag| (2..=4).contains(&tag.chars().count()))
        .collect();
    if kept.is_empty() {
        kept = tags
            .iter()
            .map(|tag| tag.trim())
            .filter(|tag| !tag.is_empty())
            .take(FALLBACK_TAGS)
            .collect();
    }
    kept.truncate(MAX_TAGS);
    kept.join(",")
}

/// Finds a `BV` + 10 alphanumerics video id.
fn find_bvid(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find("BV") {
        let index = start + offset;
        let id_end = index + 12;
        let preceded_ok = index == 0 || !bytes[index - 1].is_ascii_alphanumeric();
        if preceded_ok
            && id_end <= bytes.len()
            && bytes[index + 2..id_end].iter().all(u8::is_ascii_alphanumeric)
            && bytes.get(id_end).is_none_or(|b| !b.is_ascii_alphanumeric())
        {
            return Some(text[index..id_end].to_string());
        }
        start = index + 2;
    }
    None
}

fn tail_chars(value: &str, max: usize) -> String {
    let count = value.chars().count();
    value.chars().skip(count.saturating_sub(max)).collect()
}
