use crate::client::{Summarizer, http_client};
use crate::error::{Result, TitleError};
use crate::types::{TranscriptLine, dialogue_from};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_TITLE_CHARS: usize = 40;

const HUMOR_PROMPT: &str = r#"You summarize group chats with a sense of humor. The user provides a JSON dialogue between several speakers. Do the following:
1. Find the core topic and the funniest moment.
2. Write a title of at most 20 characters, in the language the dialogue is written in.
3. Prefer puns, wordplay or current memes. Highlight the most absurd part. Avoid flat descriptions such as "a chat about X".

Output only the title itself: no explanation, no quotes, no trailing punctuation.

Example:
Input: {"dialogue":[{"role":"A","content":"Why do grapes spark in the microwave?"},{"role":"B","content":"Because they are at a rave!"}]}
Output: Grape Star Collision

Now title this dialogue:
{{dialogue}}"#;

/// Titles a view directly against an OpenAI-compatible chat completions API.
#[derive(Clone)]
pub struct OpenAiSummarizer {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiSummarizer {
    pub fn new(base_url: Option<&str>, api_key: &str, model: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(TitleError::InvalidInput(
                "openai summarizer requires an api key".to_string(),
            ));
        }
        if model.trim().is_empty() {
            return Err(TitleError::InvalidInput(
                "openai summarizer requires a model".to_string(),
            ));
        }
        let base_url = base_url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_OPENAI_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            http: http_client(Duration::from_secs(120)),
            base_url,
            api_key: api_key.trim().to_string(),
            model: model.trim().to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn summarize(&self, view: &Value) -> Result<String> {
        let prompt = build_prompt(view)?;
        let req = ChatRequest {
            model: &self.model,
            messages: vec![ChatRequestMessage {
                role: "user",
                content: &prompt,
            }],
            stream: false,
        };

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TitleError::Http(format!(
                "openai chat status={status} body={body}"
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                TitleError::ResponseFormat("openai response missing choices".to_string())
            })?;
        clean_title(&content)
    }
}

fn build_prompt(view: &Value) -> Result<String> {
    let lines: Vec<TranscriptLine> = match view.get("messages") {
        Some(messages) => serde_json::from_value(messages.clone())?,
        None => {
            return Err(TitleError::InvalidInput(
                "view record has no messages".to_string(),
            ));
        }
    };
    let dialogue = dialogue_from(&lines);
    if dialogue.is_empty() {
        return Err(TitleError::InvalidInput(
            "view has no text lines to title".to_string(),
        ));
    }
    let payload = serde_json::to_string(&json!({ "dialogue": dialogue }))?;
    Ok(HUMOR_PROMPT.replace("{{dialogue}}", &payload))
}

/// Reasoning models may prepend a `<think>` block; only the answer is kept.
fn clean_title(content: &str) -> Result<String> {
    let answer = match content.rfind("</think>") {
        Some(idx) => &content[idx + "</think>".len()..],
        None => content,
    };
    let title: String = answer
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '“' || c == '”')
        .trim()
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    if title.is_empty() {
        return Err(TitleError::ResponseFormat(
            "model returned an empty title".to_string(),
        ));
    }
    Ok(title)
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatRequestMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatRequestMessage<'a> {
    role: &'a str,
    content: &'a str,
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
