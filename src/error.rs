//! Error taxonomy shared by the collaborators and the pipeline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures while loading or validating the run configuration. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("could not read env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Failure reported by a publisher for one upload attempt.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("media file {0} does not exist")]
    MissingMedia(PathBuf),

    #[error("could not start uploader `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("uploader exited with {status}: {detail}")]
    Exit { status: String, detail: String },

    #[error("lost track of uploader `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("uploader killed after running for {0:?}")]
    Timeout(Duration),
}

/// Per-candidate and systemic failures the orchestrator distinguishes.
///
/// Only [`PipelineError::HistoryWrite`] escapes a run; everything else is
/// handled at the candidate boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("discovery failed for keyword `{keyword}`: {source:#}")]
    Discovery {
        keyword: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("duplicate check failed: {0:#}")]
    DuplicateCheck(#[source] anyhow::Error),

    #[error("processing did not finish within {0:?}")]
    ProcessingTimeout(Duration),

    #[error("processing failed: {0:#}")]
    Processing(#[source] anyhow::Error),

    #[error("metadata generation failed: {0:#}")]
    Metadata(#[source] anyhow::Error),

    #[error("publishing failed after {attempts} attempt(s): {source}")]
    Publish {
        attempts: u32,
        #[source]
        source: PublishError,
    },

    #[error("remote cleanup failed for task {task_id}: {source:#}")]
    Cleanup {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not append history record to {path}: {source}")]
    HistoryWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Errors that must stop the whole run instead of a single candidate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::HistoryWrite { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_history_write_is_fatal() {
        let history = PipelineError::HistoryWrite {
            path: PathBuf::from("/tmp/history.jsonl"),
            source: std::io::Error::other("disk full"),
        };
        assert!(history.is_fatal());
        assert!(!PipelineError::ProcessingTimeout(Duration::from_secs(5)).is_fatal());
        assert!(!PipelineError::Cancelled.is_fatal());
    }

    #[test]
    fn publish_error_message_mentions_attempts() {
        let err = PipelineError::Publish {
            attempts: 3,
            source: PublishError::Exit {
                status: "exit status: 1".into(),
                detail: "quota".into(),
            },
        };
        let text = err.to_string();
        assert!(text.contains("3 attempt(s)"));
        assert!(text.contains("quota"));
    }
}
