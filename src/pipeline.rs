//! Run orchestration: keywords → candidates → filters → remote processing →
//! metadata → upload with backoff → cleanup → history.
//!
//! Candidates are handled strictly one at a time. Every candidate that gets
//! past the filters ends with exactly one history record, unless the run is
//! interrupted while it is in flight, in which case nothing is recorded and the
//! next run picks it up again. A history write failure aborts the run; every
//! other failure stays inside its candidate.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::discovery::{CandidateFilter, Discovery, SkipReason, VideoCandidate};
use crate::duplicate::DuplicateOracle;
use crate::error::PipelineError;
use crate::history::{HistoryRecord, HistoryStore};
use crate::metadata::{GeneratedMetadata, MetadataGenerator, UploadText, render_upload_text};
use crate::processing::{ProcessingClient, ProcessingResult, TaskHandle, TaskStatus};
use crate::publisher::{PublishReceipt, PublishRequest, Publisher};
use crate::retry::{BackoffPolicy, CancelToken, PollPlan, Sleeper};

/// The external collaborators a run drives.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub discovery: &'a dyn Discovery,
    pub oracle: &'a dyn DuplicateOracle,
    pub processing: &'a dyn ProcessingClient,
    pub metadata: &'a dyn MetadataGenerator,
    pub publisher: &'a dyn Publisher,
    pub sleeper: &'a dyn Sleeper,
}

/// Terminal state of one candidate.
#[derive(Debug)]
pub enum CandidateOutcome {
    Skipped(SkipReason),
    Published { destination_url: Option<String> },
    Failed(PipelineError),
    Interrupted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub published: usize,
    pub failed: usize,
    pub skipped: usize,
    pub discovery_errors: usize,
    pub interrupted: bool,
}

impl RunSummary {
    fn record(&mut self, outcome: &CandidateOutcome) {
        match outcome {
            CandidateOutcome::Skipped(_) => self.skipped += 1,
            CandidateOutcome::Published { .. } => self.published += 1,
            CandidateOutcome::Failed(_) => self.failed += 1,
            CandidateOutcome::Interrupted => self.interrupted = true,
        }
    }
}

struct Published {
    receipt: PublishReceipt,
    title: String,
}

pub struct Pipeline<'a> {
    config: &'a RunConfig,
    history: &'a mut HistoryStore,
    parts: Collaborators<'a>,
    filter: CandidateFilter,
    cancel: CancelToken,
    backoff: BackoffPolicy,
    poll: PollPlan,
    attempted: HashSet<String>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a RunConfig,
        history: &'a mut HistoryStore,
        parts: Collaborators<'a>,
        cancel: CancelToken,
    ) -> Self {
        let backoff = BackoffPolicy::new(
            config.upload_retry_attempts,
            Duration::from_secs(config.upload_retry_backoff_sec),
            Duration::from_secs(config.upload_retry_max_backoff_sec),
        );
        Self {
            config,
            history,
            parts,
            filter: CandidateFilter::from_settings(&config.youtube, Utc::now().date_naive()),
            cancel,
            backoff,
            poll: PollPlan::new(config.poll_interval(), config.processing_timeout()),
            attempted: HashSet::new(),
        }
    }

    /// Replaces the pre-filters derived from the config.
    pub fn with_filter(mut self, filter: CandidateFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Runs every configured keyword to completion. Only a history write
    /// failure is returned as an error.
    pub fn run(&mut self) -> Result<RunSummary, PipelineError> {
        let config = self.config;
        let mut summary = RunSummary::default();

        'keywords: for keyword in &config.keywords {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            info!(keyword = %keyword, "searching");

            let stream = match self.parts.discovery.search(keyword) {
                Ok(stream) => stream,
                Err(source) => {
                    let err = PipelineError::Discovery {
                        keyword: keyword.clone(),
                        source,
                    };
                    warn!(keyword = %keyword, "{err}");
                    summary.discovery_errors += 1;
                    continue;
                }
            };

            for item in stream {
                if self.cancel.is_cancelled() {
                    summary.interrupted = true;
                    break 'keywords;
                }
                let candidate = match item {
                    Ok(candidate) => candidate,
                    Err(source) => {
                        let err = PipelineError::Discovery {
                            keyword: keyword.clone(),
                            source,
                        };
                        warn!(keyword = %keyword, "{err}; skipping rest of keyword");
                        summary.discovery_errors += 1;
                        break;
                    }
                };

                let outcome = self.process_candidate(&candidate)?;
                log_outcome(&candidate, &outcome);
                summary.record(&outcome);
                if matches!(outcome, CandidateOutcome::Interrupted) {
                    break 'keywords;
                }
            }
        }

        info!(
            published = summary.published,
            failed = summary.failed,
            skipped = summary.skipped,
            discovery_errors = summary.discovery_errors,
            interrupted = summary.interrupted,
            "run finished"
        );
        Ok(summary)
    }

    fn already_done(&self, source_id: &str) -> bool {
        self.attempted.contains(source_id)
            || if self.config.retry_failed {
                self.history.has(source_id)
            } else {
                self.history.has_any(source_id)
            }
    }

    fn process_candidate(
        &mut self,
        candidate: &VideoCandidate,
    ) -> Result<CandidateOutcome, PipelineError> {
        if self.already_done(&candidate.source_id) {
            return Ok(CandidateOutcome::Skipped(SkipReason::AlreadyProcessed));
        }
        if let Some(reason) = self.filter.rejection(candidate) {
            return Ok(CandidateOutcome::Skipped(reason));
        }
        match self.parts.oracle.check(candidate) {
            Ok(verdict) if verdict.blocks(self.config.bilibili.duplicate_threshold) => {
                debug!(source_id = %candidate.source_id, reason = %verdict.reason, "duplicate verdict");
                return Ok(CandidateOutcome::Skipped(SkipReason::Duplicate));
            }
            Ok(_) => {}
            Err(source) => {
                let err = PipelineError::DuplicateCheck(source);
                warn!(source_id = %candidate.source_id, "{err}; treating as not duplicate");
            }
        }

        self.attempted.insert(candidate.source_id.clone());
        let mut task = None;
        let result = self.drive(candidate, &mut task);

        if let Some(task) = &task
            && self.config.cleanup_remote
        {
            self.cleanup(task);
        }

        let task_id = task.map(|task| task.task_id);
        match result {
            Ok(published) => {
                let mut record =
                    HistoryRecord::success(&candidate.source_id, published.receipt.destination_url.clone());
                record.source_url = Some(candidate.url.clone());
                record.title = Some(published.title);
                record.task_id = task_id;
                self.history.append(&record)?;
                Ok(CandidateOutcome::Published {
                    destination_url: published.receipt.destination_url,
                })
            }
            Err(PipelineError::Cancelled) => Ok(CandidateOutcome::Interrupted),
            Err(err) => {
                let mut record = HistoryRecord::failed(&candidate.source_id, err.to_string());
                record.source_url = Some(candidate.url.clone());
                record.task_id = task_id;
                self.history.append(&record)?;
                Ok(CandidateOutcome::Failed(err))
            }
        }
    }

    /// Processing through publishing. `task` is set as soon as the remote
    /// task exists so the caller can clean it up whatever happens next.
    fn drive(
        &self,
        candidate: &VideoCandidate,
        task: &mut Option<TaskHandle>,
    ) -> Result<Published, PipelineError> {
        let handle = self
            .parts
            .processing
            .submit(candidate)
            .map_err(PipelineError::Processing)?;
        info!(source_id = %candidate.source_id, task_id = %handle.task_id, "submitted for processing");
        let handle = task.insert(handle);

        self.wait_for_completion(handle)?;
        let result = self
            .parts
            .processing
            .fetch_artifacts(handle, candidate)
            .map_err(PipelineError::Processing)?;

        let metadata = match self.parts.metadata.generate(candidate, &result) {
            Ok(metadata) => metadata,
            Err(source) => {
                let err = PipelineError::Metadata(source);
                warn!(source_id = %candidate.source_id, "{err}; using source title");
                GeneratedMetadata::fallback(candidate)
            }
        };
        let text = render_upload_text(&metadata, candidate, self.config);

        let receipt = self.publish_with_retry(candidate, &result, &text)?;
        Ok(Published {
            receipt,
            title: text.title,
        })
    }

    fn wait_for_completion(&self, task: &TaskHandle) -> Result<(), PipelineError> {
        let max_polls = self.poll.max_polls();
        let mut last_step: Option<String> = None;

        for poll in 1..=max_polls {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match self.parts.processing.poll(task) {
                Ok(TaskStatus::Done) => return Ok(()),
                Ok(TaskStatus::Error(message)) => {
                    return Err(PipelineError::Processing(anyhow!(message)));
                }
                Ok(TaskStatus::Pending(progress)) => {
                    if last_step.as_deref() != Some(progress.step.as_str()) {
                        info!(
                            task_id = %task.task_id,
                            percent = progress.percent,
                            step = %progress.step,
                            "{}",
                            progress.message
                        );
                        last_step = Some(progress.step);
                    }
                }
                Err(err) => {
                    warn!(task_id = %task.task_id, poll, "status poll failed: {err:#}");
                }
            }
            if poll < max_polls {
                self.parts.sleeper.sleep(self.poll.interval);
            }
        }
        Err(PipelineError::ProcessingTimeout(self.poll.timeout))
    }

    fn publish_with_retry(
        &self,
        candidate: &VideoCandidate,
        result: &ProcessingResult,
        text: &UploadText,
    ) -> Result<PublishReceipt, PipelineError> {
        let request = PublishRequest {
            video: &result.local_video_path,
            cover: result.local_cover_path.as_deref(),
            source_url: &candidate.url,
            text,
        };

        let mut attempt = 1;
        loop {
            match self.parts.publisher.publish(&request) {
                Ok(receipt) => return Ok(receipt),
                Err(err) if attempt < self.backoff.attempts => {
                    let delay = self.backoff.delay_before(attempt + 1);
                    warn!(
                        source_id = %candidate.source_id,
                        attempt,
                        "upload failed: {err}; retrying in {}s",
                        delay.as_secs()
                    );
                    self.parts.sleeper.sleep(delay);
                    if self.cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(source) => {
                    return Err(PipelineError::Publish {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    fn cleanup(&self, task: &TaskHandle) {
        match self.parts.processing.cleanup(task) {
            Ok(()) => debug!(task_id = %task.task_id, "remote task removed"),
            Err(source) => {
                let err = PipelineError::Cleanup {
                    task_id: task.task_id.clone(),
                    source,
                };
                warn!("{err}");
            }
        }
    }
}

fn log_outcome(candidate: &VideoCandidate, outcome: &CandidateOutcome) {
    match outcome {
        CandidateOutcome::Skipped(reason) => info!(
            source_id = %candidate.source_id,
            keyword = %candidate.keyword,
            outcome = "skipped",
            reason = reason.as_str(),
            "{}",
            candidate.title
        ),
        CandidateOutcome::Published { destination_url } => info!(
            source_id = %candidate.source_id,
            keyword = %candidate.keyword,
            outcome = "published",
            destination_url = destination_url.as_deref().unwrap_or(""),
            "{}",
            candidate.title
        ),
        CandidateOutcome::Failed(err) => warn!(
            source_id = %candidate.source_id,
            keyword = %candidate.keyword,
            outcome = "failed",
            error = %err,
            "{}",
            candidate.title
        ),
        CandidateOutcome::Interrupted => warn!(
            source_id = %candidate.source_id,
            keyword = %candidate.keyword,
            outcome = "interrupted",
            "{}",
            candidate.title
        ),
    }
}
