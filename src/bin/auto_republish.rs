#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use vidrelay_tools::config::{ConfigOverrides, RunConfig, load_run_config};
use vidrelay_tools::discovery::YtDlpSearch;
use vidrelay_tools::duplicate::NeverDuplicate;
use vidrelay_tools::history::HistoryStore;
use vidrelay_tools::metadata::ChatCompletionGenerator;
use vidrelay_tools::pipeline::{Collaborators, Pipeline, RunSummary};
use vidrelay_tools::preflight;
use vidrelay_tools::processing::{CoverFetcher, VideoLingoClient};
use vidrelay_tools::publisher::BiliupPublisher;
use vidrelay_tools::retry::{CancelToken, ThreadSleeper};

const SEARCH_PROGRAM: &str = "yt-dlp";
const DEFAULT_LOG_FILTER: &str = "vidrelay_tools=info,auto_republish=info";
/// 128 + SIGINT.
const FORCED_EXIT_CODE: i32 = 130;

/// Search, translate, and republish videos for the configured keywords.
#[derive(Debug, Parser)]
#[command(name = "auto_republish", version)]
struct Args {
    /// Settings file (TOML).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Dotenv file whose values override the settings file.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Search keyword; repeat to replace the configured list.
    #[arg(long = "keyword", value_name = "TEXT")]
    keywords: Vec<String>,

    /// Emit JSON log lines (same as LOG_FORMAT=json).
    #[arg(long)]
    log_json: bool,

    /// Do not check yt-dlp and the processing service before starting.
    #[arg(long)]
    skip_preflight: bool,
}

fn init_tracing(force_json: bool) {
    let use_json = force_json
        || env::var("LOG_FORMAT")
            .map(|value| value.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(false))
            .with(env_filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_run_config(ConfigOverrides {
        config_path: args.config,
        env_path: args.env_file,
        keywords: args.keywords,
    })
    .context("loading configuration")?;
    config
        .ensure_dirs()
        .context("creating workspace directories")?;

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received; stopping after the current step (press Ctrl-C again to quit now)");
        on_signal.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("second interrupt received; exiting without waiting for the current step");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });

    let skip_preflight = args.skip_preflight;
    let summary = tokio::task::spawn_blocking(move || run(config, skip_preflight, cancel))
        .await
        .context("pipeline thread panicked")??;

    if summary.interrupted {
        info!("run interrupted; unfinished videos will be retried next time");
    }
    Ok(())
}

fn run(config: RunConfig, skip_preflight: bool, cancel: CancelToken) -> Result<RunSummary> {
    let covers = CoverFetcher::new(SEARCH_PROGRAM, Some(config.youtube.cookies_file.clone()));
    let processing = VideoLingoClient::new(&config, covers);
    if !skip_preflight {
        preflight::run(SEARCH_PROGRAM, &processing)?;
    }

    let history_path = config.history_path();
    let mut history = HistoryStore::open(&history_path)
        .with_context(|| format!("loading history from {}", history_path.display()))?;
    info!(
        path = %history_path.display(),
        entries = history.len(),
        keywords = config.keywords.len(),
        "starting run"
    );

    let discovery = YtDlpSearch::new(SEARCH_PROGRAM, &config.youtube);
    let metadata = ChatCompletionGenerator::new(&config.openai);
    let publisher = BiliupPublisher::new(&config.bilibili.uploader_bin)
        .with_timeout(Duration::from_secs(config.bilibili.upload_timeout_sec));
    let sleeper = ThreadSleeper::new(cancel.clone());
    let parts = Collaborators {
        discovery: &discovery,
        oracle: &NeverDuplicate,
        processing: &processing,
        metadata: &metadata,
        publisher: &publisher,
        sleeper: &sleeper,
    };

    let summary = Pipeline::new(&config, &mut history, parts, cancel).run()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn keyword_flag_repeats() {
        let args = Args::try_parse_from([
            "auto_republish",
            "--keyword",
            "rust",
            "--keyword",
            "tokio",
            "--skip-preflight",
        ])
        .unwrap();
        assert_eq!(args.keywords, vec!["rust", "tokio"]);
        assert!(args.skip_preflight);
        assert!(!args.log_json);
        assert!(args.config.is_none());
    }
}
