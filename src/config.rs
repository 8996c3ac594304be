//! Run configuration: a TOML settings file, optionally overridden by a `.env`
//! file and the process environment. Loaded once per run and never mutated
//! afterwards.

use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "config/settings.toml";
pub const DEFAULT_ENV_PATH: &str = ".env";
pub const HISTORY_FILE_NAME: &str = "history.jsonl";
/// Upper bound for `youtube.published_after_days`; 0 disables the age filter.
pub const MAX_PUBLISHED_AFTER_DAYS: i64 = 36_500;

pub const DEFAULT_TITLE_TEMPLATE: &str = "[中字翻译] {title}";
pub const DEFAULT_DESCRIPTION_TEMPLATE: &str = "{title_zh}
-----------------------
本视频由VideoLingo提供字幕。
原视频标题: {title_en}
原视频链接: {video_url}
描述: {desc}
";

/// Everything one run needs. Handed to each component at construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Search keywords, processed in order.
    pub keywords: Vec<String>,
    /// Base URL of the transcription/translation/dubbing service.
    pub api_base: String,
    pub history_file: Option<PathBuf>,
    pub cleanup_remote: bool,
    pub upload_retry_attempts: u32,
    pub upload_retry_backoff_sec: u64,
    pub upload_retry_max_backoff_sec: u64,
    /// When false, a `failed` history record also prevents reprocessing.
    pub retry_failed: bool,
    pub title_template: String,
    pub description_template: String,
    pub processing: ProcessingSettings,
    pub openai: OpenAiSettings,
    pub youtube: YoutubeSettings,
    pub bilibili: BilibiliSettings,
    pub paths: PathSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    pub poll_interval_sec: u64,
    pub timeout_sec: u64,
    pub request_timeout_sec: u64,
    pub target_language: String,
    pub enable_dubbing: bool,
    pub burn_subtitles: bool,
    pub resolution: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct YoutubeSettings {
    pub max_results_per_keyword: u32,
    pub search_region: String,
    pub min_duration_sec: u64,
    pub max_duration_sec: u64,
    pub blacklist_channels: Vec<String>,
    pub published_after_days: i64,
    pub cookies_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BilibiliSettings {
    pub duplicate_threshold: f64,
    pub uploader_bin: String,
    /// The uploader is killed once a single attempt runs this long.
    pub upload_timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub workspace: PathBuf,
    #[serde(alias = "uploads_cache")]
    pub downloads: PathBuf,
    pub covers: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            api_base: "http://127.0.0.1:8000".to_string(),
            history_file: None,
            cleanup_remote: true,
            upload_retry_attempts: 3,
            upload_retry_backoff_sec: 20,
            upload_retry_max_backoff_sec: 300,
            retry_failed: true,
            title_template: DEFAULT_TITLE_TEMPLATE.to_string(),
            description_template: DEFAULT_DESCRIPTION_TEMPLATE.to_string(),
            processing: ProcessingSettings::default(),
            openai: OpenAiSettings::default(),
            youtube: YoutubeSettings::default(),
            bilibili: BilibiliSettings::default(),
            paths: PathSettings::default(),
        }
    }
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            poll_interval_sec: 3,
            timeout_sec: 36_000,
            request_timeout_sec: 60,
            target_language: "简体中文".to_string(),
            enable_dubbing: false,
            burn_subtitles: true,
            resolution: "1080".to_string(),
        }
    }
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl Default for YoutubeSettings {
    fn default() -> Self {
        Self {
            max_results_per_keyword: 5,
            search_region: "US".to_string(),
            min_duration_sec: 0,
            max_duration_sec: 1_000_000,
            blacklist_channels: Vec::new(),
            published_after_days: 365,
            cookies_file: PathBuf::from("cookies.txt"),
        }
    }
}

impl Default for BilibiliSettings {
    fn default() -> Self {
        Self {
            duplicate_threshold: 0.6,
            uploader_bin: "biliup".to_string(),
            upload_timeout_sec: 7_200,
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("workspace"),
            downloads: PathBuf::from("workspace/uploads"),
            covers: PathBuf::from("workspace/covers"),
        }
    }
}

impl RunConfig {
    /// History file location, defaulting to `<workspace>/history.jsonl`.
    pub fn history_path(&self) -> PathBuf {
        self.history_file
            .clone()
            .unwrap_or_else(|| self.paths.workspace.join(HISTORY_FILE_NAME))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.processing.poll_interval_sec)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing.timeout_sec)
    }

    /// Creates the workspace, download, cover, and history directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.paths.workspace)?;
        fs::create_dir_all(&self.paths.downloads)?;
        fs::create_dir_all(&self.paths.covers)?;
        if let Some(parent) = self.history_path().parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn validate(mut self) -> Result<Self, ConfigError> {
        let mut keywords: Vec<String> = Vec::with_capacity(self.keywords.len());
        for keyword in self.keywords.iter().map(|k| k.trim()) {
            if !keyword.is_empty() && !keywords.iter().any(|existing| existing == keyword) {
                keywords.push(keyword.to_string());
            }
        }
        if keywords.is_empty() {
            return Err(ConfigError::invalid("no keywords configured"));
        }
        self.keywords = keywords;

        if self.api_base.trim().is_empty() {
            return Err(ConfigError::invalid("api_base must not be empty"));
        }
        self.api_base = self.api_base.trim().trim_end_matches('/').to_string();

        let threshold = self.bilibili.duplicate_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::invalid(format!(
                "bilibili.duplicate_threshold must be within 0..=1, got {threshold}"
            )));
        }
        if self.upload_retry_attempts == 0 {
            return Err(ConfigError::invalid("upload_retry_attempts must be at least 1"));
        }
        if self.processing.poll_interval_sec == 0 {
            return Err(ConfigError::invalid(
                "processing.poll_interval_sec must be at least 1",
            ));
        }
        if !(0..=MAX_PUBLISHED_AFTER_DAYS).contains(&self.youtube.published_after_days) {
            return Err(ConfigError::invalid(format!(
                "youtube.published_after_days must be within 0..={MAX_PUBLISHED_AFTER_DAYS}, got {}",
                self.youtube.published_after_days
            )));
        }
        if self.bilibili.upload_timeout_sec == 0 {
            return Err(ConfigError::invalid(
                "bilibili.upload_timeout_sec must be at least 1",
            ));
        }
        if self.youtube.min_duration_sec > self.youtube.max_duration_sec {
            return Err(ConfigError::invalid(
                "youtube.min_duration_sec exceeds youtube.max_duration_sec",
            ));
        }
        Ok(self)
    }
}

/// Command-line level inputs that influence how the config is resolved.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
    /// Replaces the configured keywords when non-empty.
    pub keywords: Vec<String>,
}

pub fn load_run_config(overrides: ConfigOverrides) -> Result<RunConfig, ConfigError> {
    let config_path = overrides
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let raw = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;

    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path).map_err(|source| ConfigError::EnvFile {
        path: env_path.clone(),
        source,
    })?;

    build_run_config(&raw, &config_path, &file_vars, env_var_string, overrides.keywords)
}

fn build_run_config(
    raw: &str,
    config_path: &Path,
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    keyword_overrides: Vec<String>,
) -> Result<RunConfig, ConfigError> {
    let mut config: RunConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
        path: config_path.to_path_buf(),
        source,
    })?;

    if let Some(value) = lookup_value("VIDEOLINGO_API_BASE", file_vars, &env_lookup) {
        config.api_base = value;
    }
    if let Some(value) = lookup_value("OPENAI_BASE_URL", file_vars, &env_lookup) {
        config.openai.base_url = value;
    }
    if let Some(value) = lookup_value("OPENAI_API_KEY", file_vars, &env_lookup) {
        config.openai.api_key = value;
    }
    if let Some(value) = lookup_value("OPENAI_MODEL", file_vars, &env_lookup) {
        config.openai.model = value;
    }
    if let Some(value) = lookup_value("BILIUP_BIN", file_vars, &env_lookup) {
        config.bilibili.uploader_bin = value;
    }
    if !keyword_overrides.is_empty() {
        config.keywords = keyword_overrides;
    }

    config.validate()
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses `KEY=value` lines, tolerating `export`, quotes, and comments. A
/// missing file yields no variables.
pub fn read_env_file(path: &Path) -> std::io::Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content = fs::read_to_string(path)?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
