//! Pipeline data model and prompt formatting.
//!
//! Context is rendered as XML with entity escaping so user content cannot
//! forge entries: `<`, `>`, `&` become `&lt;`, `&gt;`, `&amp;`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Chat room id (group or private session).
pub type RoomId = i64;
/// Platform user id.
pub type UserId = i64;
/// Platform message id. `0` means "no id" and is never deduplicated.
pub type MessageId = i64;

/// How urgently a message asks for a reply.
///
/// Ordered so that `Critical > High > Medium > Low`. `Low` never triggers a
/// reply on its own; it only supplies context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Whether a message of this priority names its sender as a reply target.
    pub fn triggers_reply(self) -> bool {
        self >= Priority::Medium
    }

    /// Whether this priority shrinks the aggregation window.
    pub fn is_urgent(self) -> bool {
        self >= Priority::High
    }

    pub fn emoji(self) -> &'static str {
        match self {
            Priority::Critical => "🔴",
            Priority::High => "🟠",
            Priority::Medium => "🟡",
            Priority::Low => "⚪",
        }
    }
}

/// One event as delivered by the platform adapter.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub display_name: String,
    pub message_id: MessageId,
    pub text: String,
    pub is_direct_mention: bool,
    pub is_reply_to_bot: bool,
}

/// An inbound message buffered in an aggregation window.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub display_name: String,
    pub message_id: MessageId,
    pub text: String,
    pub is_direct_mention: bool,
    pub is_reply_to_bot: bool,
    /// Monotonic arrival time, used for window math and ordering.
    pub arrived_at: Instant,
    /// Wall-clock arrival time, used for display.
    pub received_at: DateTime<Utc>,
    pub priority: Priority,
}

impl PendingMessage {
    pub fn from_event(event: InboundEvent, priority: Priority) -> Self {
        Self {
            room_id: event.room_id,
            user_id: event.user_id,
            display_name: event.display_name,
            message_id: event.message_id,
            text: event.text,
            is_direct_mention: event.is_direct_mention,
            is_reply_to_bot: event.is_reply_to_bot,
            arrived_at: Instant::now(),
            received_at: Utc::now(),
            priority,
        }
    }
}

/// A user who must be answered in this aggregation cycle.
#[derive(Debug, Clone)]
pub struct ReplyTarget {
    pub user_id: UserId,
    pub display_name: String,
    /// The user's triggering messages, in arrival order.
    pub messages: Vec<PendingMessage>,
    pub highest_priority: Priority,
}

impl ReplyTarget {
    /// All of the user's triggering messages joined into one line.
    pub fn combined_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join(" | ")
    }

    pub fn first_seen(&self) -> Option<Instant> {
        self.messages.first().map(|m| m.arrived_at)
    }
}

/// The unit handed from the aggregator to the scheduling layer.
#[derive(Debug, Clone)]
pub struct AggregatedTask {
    pub room_id: RoomId,
    /// Sorted by priority (highest first), ties broken by first-seen time.
    pub reply_targets: Vec<ReplyTarget>,
    /// Every message seen in the window, in arrival order, including
    /// low-priority background chatter.
    pub messages: Vec<PendingMessage>,
    pub aggregated_at: Instant,
}

impl AggregatedTask {
    pub fn should_reply(&self) -> bool {
        !self.reply_targets.is_empty()
    }

    pub fn total_triggers(&self) -> usize {
        self.reply_targets.iter().map(|t| t.messages.len()).sum()
    }

    pub fn primary_target(&self) -> Option<&ReplyTarget> {
        self.reply_targets.first()
    }

    /// Ids of every triggering message, skipping the `0` placeholder.
    pub fn trigger_message_ids(&self) -> Vec<MessageId> {
        self.reply_targets
            .iter()
            .flat_map(|t| t.messages.iter().map(|m| m.message_id))
            .filter(|id| *id != 0)
            .collect()
    }

    /// Low-priority messages that are only background for this reply.
    pub fn context_messages(&self) -> impl Iterator<Item = &PendingMessage> {
        self.messages.iter().filter(|m| !m.priority.triggers_reply())
    }
}

/// Who authored a conversation log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Bot,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Bot => "bot",
        }
    }
}

/// One entry of a room's conversation log.
#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Set once a bot reply has covered this entry.
    pub replied: bool,
}

impl ContextEntry {
    pub fn from_event(event: &InboundEvent) -> Self {
        Self {
            message_id: event.message_id,
            sender_id: event.user_id,
            sender_name: event.display_name.clone(),
            role: Role::User,
            text: event.text.clone(),
            timestamp: Utc::now(),
            replied: false,
        }
    }

    pub fn bot(bot_id: UserId, bot_name: &str, text: String) -> Self {
        Self {
            message_id: 0,
            sender_id: bot_id,
            sender_name: bot_name.to_string(),
            role: Role::Bot,
            text,
            timestamp: Utc::now(),
            replied: true,
        }
    }

    /// Format the entry as one XML line for the generation prompt.
    ///
    /// Example output:
    /// ```xml
    /// <msg id="4521" user="923847" name="Alice" time="10:31" role="user" reply="needed">hey bot</msg>
    /// ```
    pub fn format(&self, needs_reply: bool) -> String {
        let reply_attr = if needs_reply { " reply=\"needed\"" } else { "" };
        format!(
            "<msg id=\"{}\" user=\"{}\" name=\"{}\" time=\"{}\" role=\"{}\"{}>{}</msg>",
            self.message_id,
            self.sender_id,
            xml_escape_attr(&self.sender_name),
            self.timestamp.format("%H:%M"),
            self.role.as_str(),
            reply_attr,
            xml_escape(&self.text)
        )
    }
}

/// Render a slice of log entries, flagging the ones that need an answer.
pub fn format_context(entries: &[ContextEntry], needs_reply: &HashSet<MessageId>) -> String {
    let mut s = String::new();
    for entry in entries {
        let flagged = entry.message_id != 0 && needs_reply.contains(&entry.message_id);
        s.push_str(&entry.format(flagged));
        s.push('\n');
    }
    s
}

/// Escape a string for safe inclusion in XML content.
fn xml_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape a string for safe inclusion in XML attributes (also escapes quotes).
fn xml_escape_attr(s: &str) -> String {
    xml_escape(s).replace('"', "&quot;")
}

/// First `max_chars` characters of `s`, never splitting a char.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
