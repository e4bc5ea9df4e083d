//! Chatbot module - aggregates room messages and schedules replies.

pub mod aggregator;
pub mod collaborators;
pub mod context;
pub mod database;
pub mod debounce;
pub mod dedup;
pub mod engine;
pub mod llm;
pub mod message;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod reply_mode;
pub mod telegram;

pub use aggregator::{AggregatorConfig, MessageAggregator};
pub use collaborators::{
    GenerationKind, GenerationRequest, MessageSender, NecessityChecker, ResponseGenerator,
    RoomPermissions, RoomSettings, StaticSettings,
};
pub use database::SqliteSettings;
pub use engine::{Collaborators, IngestOutcome, Pipeline, PipelineConfig, QueueFullPolicy};
pub use llm::LlmClient;
pub use message::{AggregatedTask, ContextEntry, InboundEvent, MessageId, Priority, RoomId, UserId};
pub use telegram::{TelegramSender, is_direct_mention};
