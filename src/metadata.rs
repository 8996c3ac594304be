//! Destination metadata (title, tags, description) for a processed video.
//!
//! The production generator asks an OpenAI-compatible chat-completion endpoint
//! for a JSON object. Whatever it returns is later rendered through the
//! configured upload templates; when generation fails the pipeline falls back
//! to [`GeneratedMetadata::fallback`].

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::{OpenAiSettings, RunConfig};
use crate::discovery::VideoCandidate;
use crate::processing::ProcessingResult;

const SUBTITLE_CONTEXT_CHARS: usize = 6000;
const MAX_TITLE_CHARS: usize = 80;
const MAX_DESCRIPTION_CHARS: usize = 2000;
const JSON_ATTEMPTS: usize = 3;

const TITLE_TAGS_PROMPT: &str = "你是资深的新媒体编辑。根据提供的视频原标题与中文字幕，生成：
1) 一个吸引人的中文标题（限制 20 字内，避免夸张词）。
2) 8-12 个中文标签（每个 2-4 字）。
3) 一段简洁描述（80-150 字），自然口语、避免重复。

返回 JSON：{\"title\":\"...\",\"tags\":[\"..\"],\"desc\":\"...\"}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedMetadata {
    pub title: String,
    pub tags: Vec<String>,
    pub description: String,
}

impl GeneratedMetadata {
    /// Locally derived metadata used when generation fails: the source title,
    /// the search keyword as the only tag, and no description.
    pub fn fallback(candidate: &VideoCandidate) -> Self {
        Self {
            title: candidate.title.clone(),
            tags: vec![candidate.keyword.clone()],
            description: String::new(),
        }
    }
}

pub trait MetadataGenerator {
    fn generate(
        &self,
        candidate: &VideoCandidate,
        result: &ProcessingResult,
    ) -> Result<GeneratedMetadata>;
}

/// Title/description exactly as they will be sent to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadText {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

/// Applies the upload templates. Recognised placeholders: `{title}` in the
/// title template; `{title_zh}`, `{title_en}`, `{video_url}`, `{desc}` in the
/// description template.
pub fn render_upload_text(
    metadata: &GeneratedMetadata,
    candidate: &VideoCandidate,
    config: &RunConfig,
) -> UploadText {
    let generated_title = if metadata.title.trim().is_empty() {
        candidate.title.as_str()
    } else {
        metadata.title.trim()
    };
    let title = config
        .title_template
        .replace("{title}", &truncate_chars(generated_title, MAX_TITLE_CHARS));
    let description = config
        .description_template
        .replace("{title_zh}", &title)
        .replace("{title_en}", &candidate.title)
        .replace("{video_url}", &candidate.url)
        .replace(
            "{desc}",
            &truncate_chars(&metadata.description, MAX_DESCRIPTION_CHARS),
        );
    UploadText {
        title,
        description,
        tags: metadata.tags.clone(),
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Metadata generator backed by a chat-completion API.
pub struct ChatCompletionGenerator {
    agent: ureq::Agent,
    settings: OpenAiSettings,
}

impl ChatCompletionGenerator {
    pub fn new(settings: &OpenAiSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(120))
            .build();
        Self {
            agent,
            settings: settings.clone(),
        }
    }

    fn chat(&self, messages: &[ChatMessage], temperature: f32) -> Result<String> {
        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let response: ChatResponse = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.settings.api_key))
            .send_json(json!({
                "model": self.settings.model,
                "messages": messages,
                "temperature": temperature,
            }))
            .context("requesting chat completion")?
            .into_json()
            .context("decoding chat completion")?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        Ok(content.trim().to_string())
    }

    /// Asks for a JSON object, re-prompting when the reply does not parse.
    fn chat_json(&self, mut messages: Vec<ChatMessage>, temperature: f32) -> Result<Value> {
        messages.insert(
            0,
            ChatMessage {
                role: "system",
                content: "你必须只输出 JSON，不要任何额外文字、注释或代码块围栏。\
                          若无法满足，请返回一个 JSON 对象包含 {\"error\": \"原因\"}。"
                    .to_string(),
            },
        );

        let mut last_err = anyhow!("no completion attempts made");
        for attempt in 1..=JSON_ATTEMPTS {
            match self
                .chat(&messages, temperature)
                .and_then(|text| extract_json(&text))
            {
                Ok(value @ Value::Object(_)) => return Ok(value),
                Ok(other) => last_err = anyhow!("completion was JSON but not an object: {other}"),
                Err(err) => last_err = err,
            }
            debug!(attempt, "completion not usable: {last_err:#}");
            messages.push(ChatMessage {
                role: "system",
                content: "请仅输出 JSON 对象，不要附加说明或 Markdown。".to_string(),
            });
        }
        Err(last_err)
    }
}

impl MetadataGenerator for ChatCompletionGenerator {
    fn generate(
        &self,
        candidate: &VideoCandidate,
        result: &ProcessingResult,
    ) -> Result<GeneratedMetadata> {
        let subtitles = match &result.local_subtitle_path {
            Some(path) => {
                let bytes =
                    fs::read(path).with_context(|| format!("reading {}", path.display()))?;
                truncate_chars(&String::from_utf8_lossy(&bytes), SUBTITLE_CONTEXT_CHARS)
            }
            None => String::new(),
        };

        let prompt = format!(
            "{TITLE_TAGS_PROMPT}\n原标题：{}\n字幕：\n{}\n仅输出 JSON 对象，字段为 title/tags/desc。",
            candidate.title, subtitles
        );
        let value = self.chat_json(
            vec![
                ChatMessage {
                    role: "system",
                    content: "你是精通 B 站风格的中文新媒体编辑。".to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            0.7,
        )?;
        metadata_from_value(&value)
    }
}

/// Parses completion text as JSON: the whole text first, then the outermost
/// `{...}` block, then the outermost `[...]` block.
pub fn extract_json(text: &str) -> Result<Value> {
    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Ok(value);
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close))
            && start < end
            && let Ok(value) = serde_json::from_str(&text[start..=end])
        {
            return Ok(value);
        }
    }
    bail!("no JSON found in completion output")
}

fn metadata_from_value(value: &Value) -> Result<GeneratedMetadata> {
    if let Some(reason) = value.get("error").and_then(Value::as_str) {
        bail!("model declined: {reason}");
    }
    let title = value
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .ok_or_else(|| anyhow!("completion has no title"))?
        .to_string();
    let tags = match value.get("tags") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(joined)) => joined
            .split([',', '，'])
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    let description = value
        .get("desc")
        .or_else(|| value.get("description"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    Ok(GeneratedMetadata {
        title,
        tags,
        description,
    })
}
