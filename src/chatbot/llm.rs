//! OpenAI-compatible chat-completions client.
//!
//! Implements both the response generator and the necessity check. Tries
//! the primary endpoint first, then each fallback in order.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chatbot::collaborators::{
    GenerationKind, GenerationRequest, NecessityChecker, ResponseGenerator,
};
use crate::chatbot::message::{ContextEntry, MessageId, UserId, format_context, truncate_chars};
use crate::error::CollaboratorError;

const NECESSITY_MAX_TOKENS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Empty response")]
    Empty,
}

impl From<LlmError> for CollaboratorError {
    fn from(e: LlmError) -> Self {
        CollaboratorError::Generation(e.to_string())
    }
}

/// One chat-completions endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub primary: LlmEndpoint,
    /// Tried in order when the primary fails.
    pub fallbacks: Vec<LlmEndpoint>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
    pub request_timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct LlmClient {
    config: LlmConfig,
    bot_name: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig, bot_name: String) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            bot_name,
            http,
        })
    }

    /// Send one system + user exchange, falling back across endpoints.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let mut last_err = LlmError::Empty;
        for (i, endpoint) in std::iter::once(&self.config.primary)
            .chain(self.config.fallbacks.iter())
            .enumerate()
        {
            match self.complete_with(endpoint, system, user, max_tokens, temperature).await {
                Ok(text) => {
                    if i > 0 {
                        info!("LLM fallback #{} ({}) succeeded", i, endpoint.model);
                    }
                    return Ok(text);
                }
                Err(e) => {
                    warn!("LLM endpoint {} ({}) failed: {}", endpoint.base_url, endpoint.model, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn complete_with(
        &self,
        endpoint: &LlmEndpoint,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &endpoint.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens,
            temperature,
            stream: false,
        };

        let url = format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&endpoint.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{status}: {}", truncate_chars(&body, 200))));
        }

        let body = response.text().await?;
        parse_completion(&body)
    }
}

fn parse_completion(body: &str) -> Result<String, LlmError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| LlmError::Parse(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(LlmError::Empty)
}

/// Split a completion into separately sent messages on blank lines.
pub fn split_segments(text: &str) -> Vec<String> {
    text.replace("\r\n", "\n")
        .split("\n\n")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Build the user turn for a generation request.
pub fn build_prompt(request: &GenerationRequest, bot_name: &str) -> String {
    let needs_reply: HashSet<MessageId> = match &request.kind {
        GenerationKind::Reply { targets } => targets
            .iter()
            .flat_map(|t| t.messages.iter().map(|m| m.message_id))
            .collect(),
        _ => HashSet::new(),
    };

    let mut prompt = String::new();
    prompt.push_str("<conversation>\n");
    prompt.push_str(&format_context(&request.context, &needs_reply));
    prompt.push_str("</conversation>\n\n");

    match &request.kind {
        GenerationKind::Reply { targets } if targets.len() > 1 => {
            prompt.push_str(
                "Several people are talking to you at once. You can answer everyone in one message, \
                 or split your reply into separate messages with a blank line between them. \
                 Pick whatever feels most natural:\n",
            );
            for (i, t) in targets.iter().enumerate() {
                prompt.push_str(&format!(
                    "{}. {}: {}\n",
                    i + 1,
                    t.display_name,
                    truncate_chars(&t.combined_text(), 50)
                ));
            }
        }
        GenerationKind::Reply { targets } => {
            if let Some(t) = targets.first() {
                prompt.push_str(&format!(
                    "Reply to {} as {}. Messages marked reply=\"needed\" are waiting for you.\n",
                    t.display_name, bot_name
                ));
            }
        }
        GenerationKind::Followup => {
            prompt.push_str(&format!(
                "Nobody addressed you directly, but you ({bot_name}) were just part of this conversation. \
                 Join in naturally if you have something to add. Keep it short.\n"
            ));
        }
        GenerationKind::SkillRephrase { result } => {
            prompt.push_str(&format!(
                "A task you started has finished with this result:\n{}\n\
                 Tell the room about it in your own voice.\n",
                result
            ));
        }
    }
    prompt
}

fn necessity_prompt(context: &[ContextEntry], bot_name: &str) -> String {
    format!(
        "<conversation>\n{}</conversation>\n\n\
         You are {bot_name}. Nobody mentioned you in the last messages. \
         Would a short reply from you be welcome and natural right now? \
         Answer with exactly one word: YES or NO.",
        format_context(context, &HashSet::new())
    )
}

#[async_trait]
impl ResponseGenerator for LlmClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<String>, CollaboratorError> {
        let prompt = build_prompt(request, &self.bot_name);
        debug!("LLM prompt for room {} ({} chars)", request.room_id, prompt.len());
        let text = self
            .complete(
                &self.config.system_prompt,
                &prompt,
                self.config.max_tokens,
                self.config.temperature,
            )
            .await?;
        Ok(split_segments(&text))
    }
}

#[async_trait]
impl NecessityChecker for LlmClient {
    async fn should_reply(&self, context: &[ContextEntry], _bot_id: UserId) -> bool {
        let prompt = necessity_prompt(context, &self.bot_name);
        match self
            .complete(&self.config.system_prompt, &prompt, NECESSITY_MAX_TOKENS, 0.0)
            .await
        {
            Ok(answer) => answer.trim().to_uppercase().starts_with("YES"),
            Err(e) => {
                warn!("Necessity check failed, not replying: {}", e);
                false
            }
        }
    }
}
