//! Time-windowed message aggregation.
//!
//! A burst of messages in one room is buffered until the room goes quiet,
//! then classified into reply targets and emitted as a single
//! [`AggregatedTask`]. The window is a debounce with a hard ceiling: every
//! message restarts it, urgent messages shorten it, and it never stays open
//! longer than `max_window` after the first message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::chatbot::debounce::WindowTimer;
use crate::chatbot::message::{
    AggregatedTask, InboundEvent, MessageId, PendingMessage, Priority, ReplyTarget, RoomId, UserId,
    truncate_chars,
};

/// Receives every emitted task. Called synchronously from the window timer,
/// so implementations must hand work off rather than block.
pub type TaskHandler = Arc<dyn Fn(AggregatedTask) + Send + Sync>;

/// A handler that drops every task.
pub fn discard_tasks() -> TaskHandler {
    Arc::new(|_| {})
}

/// Aggregation window sizing and priority keywords.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub normal_window: Duration,
    pub high_priority_window: Duration,
    pub max_window: Duration,
    /// Lowercased keywords that raise a message to `Medium`.
    pub trigger_keywords: Vec<String>,
    /// Extra patterns that raise a message to `Medium`.
    pub trigger_patterns: Vec<Regex>,
    /// Lowercased keywords that raise a direct mention to `Critical`.
    pub urgent_keywords: Vec<String>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            normal_window: Duration::from_secs(2),
            high_priority_window: Duration::from_secs(1),
            max_window: Duration::from_secs(5),
            trigger_keywords: vec!["bot".to_string()],
            trigger_patterns: Vec::new(),
            urgent_keywords: default_urgent_keywords(),
        }
    }
}

pub fn default_urgent_keywords() -> Vec<String> {
    ["urgent", "asap", "help me", "emergency", "急", "马上", "立刻", "救命"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl AggregatorConfig {
    /// Classify a message.
    pub fn evaluate_priority(
        &self,
        text: &str,
        is_direct_mention: bool,
        is_reply_to_bot: bool,
    ) -> Priority {
        let lower = text.to_lowercase();

        if is_direct_mention {
            if self.urgent_keywords.iter().any(|k| lower.contains(k.as_str())) {
                return Priority::Critical;
            }
            return Priority::High;
        }

        if is_reply_to_bot {
            return Priority::High;
        }

        if self.trigger_keywords.iter().any(|k| lower.contains(k.as_str()))
            || self.trigger_patterns.iter().any(|p| p.is_match(text))
        {
            return Priority::Medium;
        }

        Priority::Low
    }

    /// How long to wait after a new message before flushing the window.
    ///
    /// `min(base, max_window - elapsed)`, where `base` depends on the new
    /// message's priority and `elapsed` is measured from the window's first
    /// message.
    pub fn window_duration(
        &self,
        opened_at: Instant,
        priority: Priority,
        now: Instant,
    ) -> Duration {
        let elapsed = now.saturating_duration_since(opened_at);
        let remaining_max = self.max_window.saturating_sub(elapsed);
        let base = if priority.is_urgent() {
            self.high_priority_window
        } else {
            self.normal_window
        };
        base.min(remaining_max)
    }
}

/// An open aggregation window for one room.
struct Window {
    messages: Vec<PendingMessage>,
    opened_at: Instant,
    /// Identifies the timer allowed to flush this window.
    generation: u64,
    timer: Option<WindowTimer>,
}

struct Inner {
    config: AggregatorConfig,
    bot_id: UserId,
    handler: TaskHandler,
    windows: Mutex<HashMap<RoomId, Window>>,
    next_generation: AtomicU64,
}

/// Collects inbound messages per room and emits aggregated tasks.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessageAggregator {
    inner: Arc<Inner>,
}

impl MessageAggregator {
    pub fn new(config: AggregatorConfig, bot_id: UserId, handler: TaskHandler) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                bot_id,
                handler,
                windows: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    pub fn evaluate_priority(
        &self,
        text: &str,
        is_direct_mention: bool,
        is_reply_to_bot: bool,
    ) -> Priority {
        self.inner
            .config
            .evaluate_priority(text, is_direct_mention, is_reply_to_bot)
    }

    /// Buffer a message and (re)start its room's window.
    ///
    /// Returns the message's priority, or `None` for the bot's own messages,
    /// which are ignored.
    pub fn add_message(&self, event: InboundEvent) -> Option<Priority> {
        if event.user_id == self.inner.bot_id {
            return None;
        }

        let priority =
            self.evaluate_priority(&event.text, event.is_direct_mention, event.is_reply_to_bot);
        let room_id = event.room_id;
        let msg = PendingMessage::from_event(event, priority);
        let now = msg.arrived_at;

        info!(
            "[Aggregator] Room {}: {} {}: '{}' (priority={:?})",
            room_id,
            priority.emoji(),
            msg.display_name,
            truncate_chars(&msg.text, 30),
            priority
        );

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut windows = self.inner.windows.lock().unwrap();
        let window = windows.entry(room_id).or_insert_with(|| Window {
            messages: Vec::new(),
            opened_at: now,
            generation,
            timer: None,
        });

        let duration = self.inner.config.window_duration(window.opened_at, priority, now);
        window.messages.push(msg);
        window.generation = generation;

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        // Replacing the timer drops (and aborts) the previous one.
        window.timer = Some(WindowTimer::start(duration, move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire(room_id, generation);
            }
        }));
        debug!("[Aggregator] Room {}: window reset to {:?}", room_id, duration);

        Some(priority)
    }

    /// Cancel the room's timer and process its window now.
    pub fn force_flush(&self, room_id: RoomId) {
        let window = {
            let mut windows = self.inner.windows.lock().unwrap();
            windows.remove(&room_id)
        };
        if let Some(mut window) = window {
            if let Some(timer) = window.timer.take() {
                timer.cancel();
            }
            self.inner.emit(room_id, window.messages);
        }
    }

    /// Flush every open window. Used on shutdown.
    pub fn flush_all(&self) {
        let rooms: Vec<RoomId> = {
            let windows = self.inner.windows.lock().unwrap();
            windows.keys().copied().collect()
        };
        for room_id in rooms {
            self.force_flush(room_id);
        }
    }

    /// Whether the message is already buffered in the room's open window.
    pub fn is_buffered(&self, room_id: RoomId, message_id: MessageId) -> bool {
        if message_id == 0 {
            return false;
        }
        let windows = self.inner.windows.lock().unwrap();
        windows
            .get(&room_id)
            .is_some_and(|w| w.messages.iter().any(|m| m.message_id == message_id))
    }

    /// Whether the user already has a reply-triggering message in the room's
    /// open window.
    pub fn has_trigger_from(&self, room_id: RoomId, user_id: UserId) -> bool {
        let windows = self.inner.windows.lock().unwrap();
        windows.get(&room_id).is_some_and(|w| {
            w.messages
                .iter()
                .any(|m| m.user_id == user_id && m.priority.triggers_reply())
        })
    }

    /// Number of messages buffered in the room's open window.
    pub fn pending_count(&self, room_id: RoomId) -> usize {
        let windows = self.inner.windows.lock().unwrap();
        windows.get(&room_id).map_or(0, |w| w.messages.len())
    }

    /// Number of rooms with an open window.
    pub fn open_windows(&self) -> usize {
        self.inner.windows.lock().unwrap().len()
    }
}

impl Inner {
    fn expire(&self, room_id: RoomId, generation: u64) {
        let window = {
            let mut windows = self.windows.lock().unwrap();
            // A newer message replaced this timer, or the window was force-flushed.
            if windows.get(&room_id).map(|w| w.generation) != Some(generation) {
                return;
            }
            windows.remove(&room_id)
        };

        if let Some(mut window) = window {
            if let Some(timer) = window.timer.take() {
                timer.disarm();
            }
            self.emit(room_id, window.messages);
        }
    }

    fn emit(&self, room_id: RoomId, messages: Vec<PendingMessage>) {
        if messages.is_empty() {
            return;
        }
        info!("[Aggregator] Room {}: processing {} aggregated message(s)", room_id, messages.len());

        let Some(task) = build_task(room_id, messages, Instant::now()) else {
            info!("[Aggregator] Room {}: no trigger messages, skipping reply", room_id);
            return;
        };

        let targets = task
            .reply_targets
            .iter()
            .map(|t| format!("{}({})", t.display_name, t.messages.len()))
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            "[Aggregator] Room {}: need to reply to {} user(s): {} ({} background message(s))",
            room_id,
            task.reply_targets.len(),
            targets,
            task.context_messages().count()
        );

        (self.handler)(task);
    }
}

/// Classify a window's messages into reply targets.
///
/// Returns `None` when no message triggers a reply.
pub fn build_task(
    room_id: RoomId,
    mut messages: Vec<PendingMessage>,
    now: Instant,
) -> Option<AggregatedTask> {
    messages.sort_by_key(|m| m.arrived_at);

    let mut order: Vec<UserId> = Vec::new();
    let mut triggers: HashMap<UserId, Vec<PendingMessage>> = HashMap::new();
    for msg in messages.iter().filter(|m| m.priority.triggers_reply()) {
        triggers
            .entry(msg.user_id)
            .or_insert_with(|| {
                order.push(msg.user_id);
                Vec::new()
            })
            .push(msg.clone());
    }

    if triggers.is_empty() {
        return None;
    }

    let mut reply_targets: Vec<ReplyTarget> = order
        .into_iter()
        .filter_map(|user_id| {
            let msgs = triggers.remove(&user_id)?;
            let highest_priority = msgs.iter().map(|m| m.priority).max()?;
            let display_name = msgs.first()?.display_name.clone();
            Some(ReplyTarget {
                user_id,
                display_name,
                messages: msgs,
                highest_priority,
            })
        })
        .collect();

    reply_targets.sort_by(|a, b| {
        b.highest_priority
            .cmp(&a.highest_priority)
            .then_with(|| a.first_seen().cmp(&b.first_seen()))
    });

    Some(AggregatedTask {
        room_id,
        reply_targets,
        messages,
        aggregated_at: now,
    })
}
