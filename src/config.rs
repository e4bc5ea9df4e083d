use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chatbot::aggregator::{AggregatorConfig, default_urgent_keywords};
use crate::chatbot::context::DEFAULT_CONTEXT_CAPACITY;
use crate::chatbot::dedup::DedupConfig;
use crate::chatbot::engine::{PipelineConfig, QueueFullPolicy};
use crate::chatbot::llm::{LlmConfig, LlmEndpoint};
use crate::chatbot::rate_limit::{RateLimitConfig, default_static_commands};
use crate::chatbot::reply_mode::ReplyModeConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file '{}': {source}", path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    #[error("failed to parse config file '{}': {source}", path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Invalid regex pattern.
    #[error("invalid regex pattern '{pattern}': {source}")]
    InvalidRegex { pattern: String, source: regex::Error },
    /// Validation error.
    #[error("config validation error: {0}")]
    Validation(String),
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    /// Rooms the bot listens in. Empty means every room.
    #[serde(default)]
    allowed_rooms: Vec<i64>,
    /// Directory for state files (logs, settings database). Defaults to current directory.
    data_dir: Option<String>,
    #[serde(default)]
    llm: LlmSection,
    #[serde(default)]
    aggregator: AggregatorSection,
    #[serde(default)]
    reply_mode: ReplyModeSection,
    #[serde(default)]
    rate_limit: RateLimitSection,
    #[serde(default)]
    dedup: DedupSection,
    #[serde(default)]
    queue: QueueSection,
    #[serde(default = "default_command_prefix")]
    command_prefix: String,
    #[serde(default = "default_idle_room_ttl_secs")]
    idle_room_ttl_secs: u64,
}

#[derive(Deserialize, Clone)]
struct EndpointSection {
    base_url: String,
    #[serde(default)]
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
#[serde(default)]
struct LlmSection {
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    system_prompt: String,
    request_timeout_secs: u64,
    fallbacks: Vec<EndpointSection>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 512,
            temperature: 0.8,
            system_prompt: "You are Cirno, a cheerful ice fairy who hangs out in group chats. \
                            Keep replies short and casual."
                .to_string(),
            request_timeout_secs: 90,
            fallbacks: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct AggregatorSection {
    normal_window_secs: f64,
    high_priority_window_secs: f64,
    max_window_secs: f64,
    trigger_keywords: Vec<String>,
    trigger_patterns: Vec<String>,
    urgent_keywords: Vec<String>,
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            normal_window_secs: 2.0,
            high_priority_window_secs: 1.0,
            max_window_secs: 5.0,
            trigger_keywords: vec!["bot".to_string()],
            trigger_patterns: Vec::new(),
            urgent_keywords: default_urgent_keywords(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct ReplyModeSection {
    short_timer_delay_secs: f64,
    long_timer_duration_secs: f64,
    scan_interval_secs: f64,
    followup_cooldown_secs: f64,
}

impl Default for ReplyModeSection {
    fn default() -> Self {
        Self {
            short_timer_delay_secs: 5.0,
            long_timer_duration_secs: 45.0,
            scan_interval_secs: 0.5,
            followup_cooldown_secs: 3.0,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RateLimitSection {
    global_rpm: u32,
    room_rpm: u32,
    user_cooldown_secs: f64,
    static_commands: Vec<String>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            global_rpm: 60,
            room_rpm: 60,
            user_cooldown_secs: 1.5,
            static_commands: default_static_commands(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct DedupSection {
    expiry_secs: u64,
    prune_threshold: usize,
    context_hash_window: usize,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            expiry_secs: 300,
            prune_threshold: 100,
            context_hash_window: 5,
        }
    }
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
enum FullPolicySetting {
    #[default]
    Silent,
    BusyNotice,
}

#[derive(Deserialize)]
#[serde(default)]
struct QueueSection {
    capacity: usize,
    generation_timeout_secs: u64,
    full_policy: FullPolicySetting,
    busy_notice_text: String,
    fallback_reply: String,
}

impl Default for QueueSection {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            capacity: pipeline.queue_capacity,
            generation_timeout_secs: pipeline.generation_timeout.as_secs(),
            full_policy: FullPolicySetting::Silent,
            busy_notice_text: pipeline.busy_notice_text,
            fallback_reply: pipeline.fallback_reply,
        }
    }
}

fn default_command_prefix() -> String {
    "$$".to_string()
}

fn default_idle_room_ttl_secs() -> u64 {
    24 * 60 * 60
}

pub struct Config {
    pub telegram_bot_token: String,
    /// Rooms the bot listens in. Empty means every room.
    pub allowed_rooms: HashSet<i64>,
    /// Directory for state files (logs, settings database).
    pub data_dir: PathBuf,
    pub llm: LlmConfig,
    pub aggregator: AggregatorConfig,
    pub reply_mode: ReplyModeConfig,
    pub rate_limit: RateLimitConfig,
    pub dedup: DedupConfig,
    pub queue_capacity: usize,
    pub generation_timeout: Duration,
    pub full_policy: QueueFullPolicy,
    pub busy_notice_text: String,
    pub fallback_reply: String,
    pub command_prefix: String,
    pub idle_room_ttl: Duration,
    pub followup_cooldown: Duration,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2
            || token_parts[0].parse::<u64>().is_err()
            || token_parts[1].is_empty()
        {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }

        let normal_window =
            positive_secs("aggregator.normal_window_secs", file.aggregator.normal_window_secs)?;
        let high_priority_window = positive_secs(
            "aggregator.high_priority_window_secs",
            file.aggregator.high_priority_window_secs,
        )?;
        let max_window =
            positive_secs("aggregator.max_window_secs", file.aggregator.max_window_secs)?;
        if high_priority_window > max_window {
            return Err(ConfigError::Validation(
                "aggregator.high_priority_window_secs must not exceed max_window_secs".into(),
            ));
        }
        let reply_mode = ReplyModeConfig {
            short_timer_delay: positive_secs(
                "reply_mode.short_timer_delay_secs",
                file.reply_mode.short_timer_delay_secs,
            )?,
            long_timer_duration: positive_secs(
                "reply_mode.long_timer_duration_secs",
                file.reply_mode.long_timer_duration_secs,
            )?,
            scan_interval: positive_secs(
                "reply_mode.scan_interval_secs",
                file.reply_mode.scan_interval_secs,
            )?,
        };
        let followup_cooldown = non_negative_secs(
            "reply_mode.followup_cooldown_secs",
            file.reply_mode.followup_cooldown_secs,
        )?;
        let user_cooldown = non_negative_secs(
            "rate_limit.user_cooldown_secs",
            file.rate_limit.user_cooldown_secs,
        )?;

        if file.queue.capacity == 0 {
            return Err(ConfigError::Validation("queue.capacity must be at least 1".into()));
        }
        if file.rate_limit.global_rpm == 0 || file.rate_limit.room_rpm == 0 {
            return Err(ConfigError::Validation("rate_limit rpm values must be at least 1".into()));
        }

        let trigger_patterns = file
            .aggregator
            .trigger_patterns
            .into_iter()
            .map(|p| {
                Regex::new(&p).map_err(|e| ConfigError::InvalidRegex { pattern: p, source: e })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let aggregator = AggregatorConfig {
            normal_window,
            high_priority_window,
            max_window,
            trigger_keywords: lowercase_all(file.aggregator.trigger_keywords),
            trigger_patterns,
            urgent_keywords: lowercase_all(file.aggregator.urgent_keywords),
        };

        let rate_limit = RateLimitConfig {
            global_rpm: file.rate_limit.global_rpm,
            room_rpm: file.rate_limit.room_rpm,
            user_cooldown,
            static_commands: lowercase_all(file.rate_limit.static_commands),
        };

        let dedup = DedupConfig {
            expiry: Duration::from_secs(file.dedup.expiry_secs),
            prune_threshold: file.dedup.prune_threshold,
            context_hash_window: file.dedup.context_hash_window.max(1),
        };

        let llm = LlmConfig {
            primary: LlmEndpoint {
                base_url: file.llm.base_url,
                api_key: file.llm.api_key,
                model: file.llm.model,
            },
            fallbacks: file
                .llm
                .fallbacks
                .into_iter()
                .map(|f| LlmEndpoint {
                    base_url: f.base_url,
                    api_key: f.api_key,
                    model: f.model,
                })
                .collect(),
            max_tokens: file.llm.max_tokens,
            temperature: file.llm.temperature,
            system_prompt: file.llm.system_prompt,
            request_timeout: Duration::from_secs(file.llm.request_timeout_secs),
        };

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            allowed_rooms: file.allowed_rooms.into_iter().collect(),
            data_dir,
            llm,
            aggregator,
            reply_mode,
            rate_limit,
            dedup,
            queue_capacity: file.queue.capacity,
            generation_timeout: Duration::from_secs(file.queue.generation_timeout_secs),
            full_policy: match file.queue.full_policy {
                FullPolicySetting::Silent => QueueFullPolicy::Silent,
                FullPolicySetting::BusyNotice => QueueFullPolicy::BusyNotice,
            },
            busy_notice_text: file.queue.busy_notice_text,
            fallback_reply: file.queue.fallback_reply,
            command_prefix: file.command_prefix,
            idle_room_ttl: Duration::from_secs(file.idle_room_ttl_secs),
            followup_cooldown,
        })
    }

    /// Whether events from this room should reach the pipeline.
    pub fn is_allowed_room(&self, room_id: i64) -> bool {
        self.allowed_rooms.is_empty() || self.allowed_rooms.contains(&room_id)
    }

    /// Pipeline settings for a bot with the given identity.
    pub fn pipeline(&self, bot_id: i64, bot_name: &str) -> PipelineConfig {
        PipelineConfig {
            bot_id,
            bot_name: bot_name.to_string(),
            aggregator: self.aggregator.clone(),
            reply_mode: self.reply_mode.clone(),
            rate_limit: self.rate_limit.clone(),
            dedup: self.dedup.clone(),
            queue_capacity: self.queue_capacity,
            generation_timeout: self.generation_timeout,
            full_policy: self.full_policy,
            busy_notice_text: self.busy_notice_text.clone(),
            fallback_reply: self.fallback_reply.clone(),
            command_prefix: self.command_prefix.clone(),
            context_capacity: DEFAULT_CONTEXT_CAPACITY,
            idle_room_ttl: self.idle_room_ttl,
            followup_cooldown: self.followup_cooldown,
        }
    }
}

/// Seconds from the config file as a `Duration`; must be finite and above zero.
fn positive_secs(name: &str, value: f64) -> Result<Duration, ConfigError> {
    if value <= 0.0 {
        return Err(ConfigError::Validation(format!("{name} must be positive")));
    }
    non_negative_secs(name, value)
}

fn non_negative_secs(name: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| ConfigError::Validation(format!("{name} is out of range: {e}")))
}

fn lowercase_all(words: Vec<String>) -> Vec<String> {
    words
        .into_iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}
