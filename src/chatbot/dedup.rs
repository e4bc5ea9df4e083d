//! Duplicate-reply suppression for one room.
//!
//! Three guards:
//! - processed ids, with expiry, so a redelivered message is not answered twice
//! - pending ids, for messages a worker is handling right now
//! - a fingerprint of the recent non-bot context, so an unchanged
//!   conversation tail is not answered twice

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::chatbot::message::{ContextEntry, MessageId, UserId, truncate_chars};

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a processed id is remembered.
    pub expiry: Duration,
    /// Prune expired ids once the map grows past this.
    pub prune_threshold: usize,
    /// Number of non-bot entries in the context fingerprint.
    pub context_hash_window: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(300),
            prune_threshold: 100,
            context_hash_window: 5,
        }
    }
}

/// Per-room dedup state.
pub struct DedupTracker {
    config: DedupConfig,
    processed: HashMap<MessageId, Instant>,
    pending: HashSet<MessageId>,
    last_replied_context_hash: Option<String>,
}

impl DedupTracker {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            processed: HashMap::new(),
            pending: HashSet::new(),
            last_replied_context_hash: None,
        }
    }

    pub fn is_processed(&self, message_id: MessageId) -> bool {
        self.is_processed_at(message_id, Instant::now())
    }

    pub fn is_processed_at(&self, message_id: MessageId, now: Instant) -> bool {
        if message_id == 0 {
            return false;
        }
        self.processed
            .get(&message_id)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.config.expiry)
    }

    pub fn mark_processed(&mut self, message_id: MessageId) {
        self.mark_processed_at(message_id, Instant::now());
    }

    pub fn mark_processed_at(&mut self, message_id: MessageId, now: Instant) {
        if message_id == 0 {
            return;
        }
        self.processed.insert(message_id, now);
        if self.processed.len() > self.config.prune_threshold {
            let expiry = self.config.expiry;
            let before = self.processed.len();
            self.processed
                .retain(|_, at| now.saturating_duration_since(*at) < expiry);
            debug!("[Dedup] Pruned {} expired id(s)", before - self.processed.len());
        }
    }

    pub fn is_pending(&self, message_id: MessageId) -> bool {
        message_id != 0 && self.pending.contains(&message_id)
    }

    pub fn add_pending(&mut self, message_id: MessageId) {
        if message_id != 0 {
            self.pending.insert(message_id);
        }
    }

    pub fn remove_pending(&mut self, message_id: MessageId) {
        self.pending.remove(&message_id);
    }

    /// Processed or currently in flight.
    pub fn is_seen(&self, message_id: MessageId) -> bool {
        self.is_pending(message_id) || self.is_processed(message_id)
    }

    /// Whether `context` fingerprints the same as the last answered context.
    pub fn is_duplicate_context(&self, context: &[ContextEntry], bot_id: UserId) -> bool {
        let Some(last) = &self.last_replied_context_hash else {
            return false;
        };
        let current = compute_context_hash(context, bot_id, self.config.context_hash_window);
        !current.is_empty() && &current == last
    }

    /// Remember the fingerprint of the context that was just answered.
    pub fn update_context_hash(&mut self, context: &[ContextEntry], bot_id: UserId) {
        let hash = compute_context_hash(context, bot_id, self.config.context_hash_window);
        if !hash.is_empty() {
            self.last_replied_context_hash = Some(hash);
        }
    }

    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }
}

impl Default for DedupTracker {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

/// Fingerprint the last `n` entries not authored by the bot.
///
/// Each entry contributes `"{id}:{first 30 chars}"`; the parts are joined
/// with `|`, hashed with SHA-256 and truncated to 16 hex chars. Returns an
/// empty string when there is nothing to hash.
pub fn compute_context_hash(context: &[ContextEntry], bot_id: UserId, n: usize) -> String {
    let mut recent: Vec<&ContextEntry> = context
        .iter()
        .rev()
        .filter(|e| e.sender_id != bot_id)
        .take(n)
        .collect();
    if recent.is_empty() {
        return String::new();
    }
    recent.reverse();

    let joined = recent
        .iter()
        .map(|e| format!("{}:{}", e.message_id, truncate_chars(&e.text, 30)))
        .collect::<Vec<_>>()
        .join("|");

    let digest = Sha256::digest(joined.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}
