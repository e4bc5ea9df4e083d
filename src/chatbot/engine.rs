//! Pipeline composition root.
//!
//! Wires the aggregator, reply-mode controller, dedup, rate limiter and room
//! queues together with the injected collaborators:
//!
//! ```text
//! ingest ─► aggregator window ─► dispatch ─► room queue ─► worker ─► generator ─► sender
//!                                                ▲
//!            reply-mode scan ─► follow-up check ─┘
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use crate::chatbot::aggregator::{AggregatorConfig, MessageAggregator, TaskHandler};
use crate::chatbot::collaborators::{
    DiscardSender, GenerationKind, GenerationRequest, MessageSender, NecessityChecker, NeverReply,
    ResponseGenerator, RoomPermissions, RoomSettings, SilentGenerator, StaticSettings,
};
use crate::chatbot::context::DEFAULT_CONTEXT_CAPACITY;
use crate::chatbot::dedup::DedupConfig;
use crate::chatbot::message::{
    AggregatedTask, ContextEntry, InboundEvent, MessageId, Priority, RoomId, UserId, truncate_chars,
};
use crate::chatbot::queue::{DEFAULT_QUEUE_CAPACITY, RoomQueues, RoomTask, TaskProcessor};
use crate::chatbot::rate_limit::{RateLimitConfig, RateLimiter, ThrottleInfo};
use crate::chatbot::registry::{RoomRegistry, RoomState};
use crate::chatbot::reply_mode::ReplyModeConfig;
use crate::error::CollaboratorError;

/// Entries passed to the generator.
pub const GENERATION_CONTEXT: usize = 20;

/// Entries passed to the necessity check.
pub const NECESSITY_CONTEXT: usize = 10;

/// How often idle rooms are swept.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// What happens when a room's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueFullPolicy {
    /// Drop the task without telling anyone.
    #[default]
    Silent,
    /// Drop the task and send a short busy notice (reply tasks only).
    BusyNotice,
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub bot_id: UserId,
    pub bot_name: String,
    pub aggregator: AggregatorConfig,
    pub reply_mode: ReplyModeConfig,
    pub rate_limit: RateLimitConfig,
    pub dedup: DedupConfig,
    pub queue_capacity: usize,
    pub generation_timeout: Duration,
    pub full_policy: QueueFullPolicy,
    pub busy_notice_text: String,
    /// Sent in place of a reply when generation times out.
    pub fallback_reply: String,
    /// Messages starting with this are commands, not conversation.
    pub command_prefix: String,
    pub context_capacity: usize,
    pub idle_room_ttl: Duration,
    /// No follow-up within this long after the bot spoke.
    pub followup_cooldown: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bot_id: 0,
            bot_name: "cirno".to_string(),
            aggregator: AggregatorConfig::default(),
            reply_mode: ReplyModeConfig::default(),
            rate_limit: RateLimitConfig::default(),
            dedup: DedupConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            generation_timeout: Duration::from_secs(120),
            full_policy: QueueFullPolicy::Silent,
            busy_notice_text: "I'm a bit busy right now, give me a moment!".to_string(),
            fallback_reply: "Sorry, I spaced out for a second... what did you say?".to_string(),
            command_prefix: "$$".to_string(),
            context_capacity: DEFAULT_CONTEXT_CAPACITY,
            idle_room_ttl: Duration::from_secs(24 * 60 * 60),
            followup_cooldown: Duration::from_secs(3),
        }
    }
}

/// The pipeline's external boundaries.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn ResponseGenerator>,
    pub necessity: Arc<dyn NecessityChecker>,
    pub sender: Arc<dyn MessageSender>,
    pub settings: Arc<dyn RoomSettings>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            generator: Arc::new(SilentGenerator),
            necessity: Arc::new(NeverReply),
            sender: Arc::new(DiscardSender),
            settings: Arc::new(StaticSettings::disabled()),
        }
    }
}

/// Result of feeding one inbound event to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The bot's own message.
    Ignored,
    /// Already processed or in flight.
    Duplicate,
    /// Starts with the command prefix; left for the adapter to dispatch.
    Command,
    /// Room is in quiet mode; kept as context only.
    Muted,
    /// Rate limited; kept as context only.
    Throttled(ThrottleInfo),
    /// Buffered in the room's aggregation window.
    Accepted(Priority),
}

struct Shared {
    config: PipelineConfig,
    collab: Collaborators,
    registry: RoomRegistry,
    limiter: RateLimiter,
    queues: RoomQueues,
    aggregator: MessageAggregator,
}

/// The message aggregation and reply scheduling pipeline.
pub struct Pipeline {
    shared: Arc<Shared>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, collab: Collaborators) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let dispatcher = weak.clone();
            let handler: TaskHandler = Arc::new(move |task| {
                if let Some(shared) = dispatcher.upgrade() {
                    shared.dispatch_reply(task);
                }
            });
            let processor: Weak<dyn TaskProcessor> = weak.clone();

            Shared {
                aggregator: MessageAggregator::new(
                    config.aggregator.clone(),
                    config.bot_id,
                    handler,
                ),
                queues: RoomQueues::new(config.queue_capacity, processor),
                registry: RoomRegistry::new(
                    config.context_capacity,
                    config.dedup.clone(),
                    config.reply_mode.clone(),
                ),
                limiter: RateLimiter::new(config.rate_limit.clone()),
                collab,
                config,
            }
        });

        Self {
            shared,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.shared.registry
    }

    pub fn aggregator(&self) -> &MessageAggregator {
        &self.shared.aggregator
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    pub fn queues(&self) -> &RoomQueues {
        &self.shared.queues
    }

    /// Start the reply-mode scan (which also runs the idle-room sweep).
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.shared);
        let scan_interval = self
            .shared
            .config
            .reply_mode
            .scan_interval
            .max(Duration::from_millis(10));
        let sweep_every = (EVICTION_INTERVAL.as_millis() / scan_interval.as_millis()).max(1) as u64;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scan_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks: u64 = 0;
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                ticks += 1;

                let now = Instant::now();
                let quiet = shared.registry.quiet_rooms(now);
                let fired = shared
                    .registry
                    .reply_mode()
                    .tick_at(now, &quiet, |room_id| shared.followup_gate(room_id));
                for room_id in fired {
                    tokio::spawn(shared.clone().evaluate_followup(room_id));
                }

                if ticks % sweep_every == 0 {
                    shared.evict_idle(Instant::now());
                }
            }
        });

        self.background.lock().unwrap().push(handle);
        info!("⏱️ Reply-mode scan started ({:?} interval)", scan_interval);
    }

    /// Feed one inbound event. Never waits on generation or delivery.
    pub fn ingest(&self, event: InboundEvent) -> IngestOutcome {
        let shared = &self.shared;
        if event.user_id == shared.config.bot_id {
            return IngestOutcome::Ignored;
        }

        let room_id = event.room_id;
        let message_id = event.message_id;
        let now = Instant::now();

        let seen = shared
            .registry
            .with_existing(room_id, |state| state.dedup.is_seen(message_id))
            .unwrap_or(false);
        if seen || shared.aggregator.is_buffered(room_id, message_id) {
            debug!("Room {}: message {} already handled", room_id, message_id);
            return IngestOutcome::Duplicate;
        }

        if !shared.config.command_prefix.is_empty()
            && event.text.trim_start().starts_with(&shared.config.command_prefix)
        {
            shared.registry.with_room(room_id, |state| {
                state.dedup.mark_processed(message_id);
                state.last_activity = now;
            });
            return IngestOutcome::Command;
        }

        let muted = shared.registry.with_room(room_id, |state| {
            state.context.push(ContextEntry::from_event(&event));
            state.last_activity = now;
            if !state.is_quiet(now) {
                return false;
            }
            if event.is_direct_mention {
                state.quiet_until = None;
                info!("🔔 Room {}: quiet mode lifted by mention", room_id);
                return false;
            }
            true
        });
        shared.registry.reply_mode().reset_timers(room_id);

        if muted {
            return IngestOutcome::Muted;
        }

        let priority = shared
            .aggregator
            .evaluate_priority(&event.text, event.is_direct_mention, event.is_reply_to_bot);
        // A user's later triggers in an open window skip the limiter; they
        // join the generation their first trigger was admitted for.
        let joins_window = shared.aggregator.has_trigger_from(room_id, event.user_id);
        if priority.triggers_reply() && !joins_window {
            let throttle = shared.limiter.check(event.user_id, room_id, &event.text);
            if !throttle.is_allowed() {
                info!(
                    "🚦 Room {}: {} throttled ({:?}, retry in {:.1}s)",
                    room_id,
                    event.display_name,
                    throttle.result,
                    throttle.wait_time.as_secs_f64()
                );
                return IngestOutcome::Throttled(throttle);
            }
        }

        match shared.aggregator.add_message(event) {
            Some(priority) => IngestOutcome::Accepted(priority),
            None => IngestOutcome::Ignored,
        }
    }

    /// Apply an edit to a logged message. Returns false if the message is
    /// no longer in the room's log.
    pub fn handle_edit(&self, room_id: RoomId, message_id: MessageId, new_text: &str) -> bool {
        self.shared
            .registry
            .with_existing(room_id, |state| state.context.edit(message_id, new_text))
            .unwrap_or(false)
    }

    /// Mute non-mention replies and follow-ups in a room for `duration`.
    pub fn set_quiet(&self, room_id: RoomId, duration: Duration) {
        let until = Instant::now() + duration;
        self.shared
            .registry
            .with_room(room_id, |state| state.quiet_until = Some(until));
        info!("🤫 Room {}: quiet for {:?}", room_id, duration);
    }

    /// Queue a skill result to be restated in the room.
    pub fn submit_skill_result(&self, room_id: RoomId, result: String) -> bool {
        self.shared
            .queues
            .enqueue(room_id, RoomTask::SkillRephrase { result })
    }

    /// Flush open windows, stop background loops and abort room workers.
    pub fn shutdown(&self) {
        self.shared.aggregator.flush_all();
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.shared.queues.shutdown();
        info!("🛑 Pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Shared {
    fn bot_id(&self) -> UserId {
        self.config.bot_id
    }

    /// Hand an aggregated task to its room's worker.
    fn dispatch_reply(&self, task: AggregatedTask) {
        let room_id = task.room_id;
        let ids = task.trigger_message_ids();

        let fresh = self.registry.with_room(room_id, |state| {
            if !ids.is_empty() && ids.iter().all(|id| state.dedup.is_seen(*id)) {
                return false;
            }
            for id in &ids {
                state.dedup.add_pending(*id);
            }
            true
        });
        if !fresh {
            info!("Room {}: all triggers already handled, skipping", room_id);
            return;
        }

        if self.queues.enqueue(room_id, RoomTask::Reply(task)) {
            return;
        }

        self.registry.with_room(room_id, |state| {
            for id in &ids {
                state.dedup.remove_pending(*id);
            }
        });
        self.on_queue_full(room_id);
    }

    fn on_queue_full(&self, room_id: RoomId) {
        match self.config.full_policy {
            QueueFullPolicy::Silent => {}
            QueueFullPolicy::BusyNotice => {
                let sender = self.collab.sender.clone();
                let notice = vec![self.config.busy_notice_text.clone()];
                tokio::spawn(async move {
                    if let Err(e) = sender.send(room_id, &notice).await {
                        warn!("Room {}: failed to send busy notice: {}", room_id, e);
                    }
                });
            }
        }
    }

    /// Settings lookup that treats errors and missing rows as disabled.
    async fn permissions(&self, room_id: RoomId) -> Option<RoomPermissions> {
        match self.collab.settings.permissions(room_id).await {
            Ok(perms) => perms,
            Err(e) => {
                warn!("Room {}: settings lookup failed, treating as disabled: {}", room_id, e);
                None
            }
        }
    }

    /// Cheap synchronous filter applied when a short timer fires.
    fn followup_gate(&self, room_id: RoomId) -> bool {
        let bot_id = self.bot_id();
        let now = Instant::now();
        self.registry
            .with_existing(room_id, |state| {
                if state.is_quiet(now) {
                    return false;
                }
                match state.context.last() {
                    Some(last) => last.sender_id != bot_id && !last.replied,
                    None => false,
                }
            })
            .unwrap_or(false)
    }

    /// Decide whether a follow-up is warranted and enqueue it.
    async fn evaluate_followup(self: Arc<Self>, room_id: RoomId) {
        let Some(perms) = self.permissions(room_id).await else {
            return;
        };
        if !perms.can_reply() || !perms.proactive_enabled {
            debug!("Room {}: follow-up skipped, proactive replies off", room_id);
            return;
        }

        let bot_id = self.bot_id();
        let cooldown = self.config.followup_cooldown;
        let Some((context, just_spoke)) = self.registry.with_existing(room_id, |state| {
            let just_spoke = state
                .last_bot_speak
                .is_some_and(|at| at.elapsed() < cooldown);
            (state.context.recent(NECESSITY_CONTEXT), just_spoke)
        }) else {
            return;
        };

        if just_spoke {
            info!("Room {}: follow-up skipped, bot just spoke", room_id);
            return;
        }

        let Some(last) = context.last() else {
            return;
        };
        if last.sender_id == bot_id {
            info!("Room {}: follow-up skipped, last message is from bot", room_id);
            return;
        }
        if !perms.allows_proactive(last.sender_id) {
            info!("Room {}: follow-up skipped, user {} not allowed", room_id, last.sender_id);
            return;
        }

        if !self.collab.necessity.should_reply(&context, bot_id).await {
            info!("Room {}: necessity check declined follow-up", room_id);
            return;
        }

        let duplicate = self
            .registry
            .with_existing(room_id, |state| {
                let recent = state.context.recent(GENERATION_CONTEXT);
                state.dedup.is_duplicate_context(&recent, bot_id)
            })
            .unwrap_or(true);
        if duplicate {
            info!("Room {}: follow-up skipped, context unchanged", room_id);
            return;
        }

        if self.queues.enqueue(room_id, RoomTask::Followup) {
            info!("💬 Room {}: follow-up queued", room_id);
        } else {
            warn!("Room {}: queue full, dropping follow-up", room_id);
        }
    }

    fn evict_idle(&self, now: Instant) {
        for room_id in self.registry.evict_idle(now, self.config.idle_room_ttl) {
            self.queues.forget_room(room_id);
            self.limiter.forget_room(room_id);
        }
    }

    /// Run the generator under the configured timeout. `Ok(None)` means it
    /// timed out.
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<Option<Vec<String>>, CollaboratorError> {
        let generation = self.collab.generator.generate(request);
        match timeout(self.config.generation_timeout, generation).await {
            Ok(Ok(segments)) => Ok(Some(
                segments
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                error!(
                    "⏰ Room {}: generation timed out after {:?}",
                    request.room_id, self.config.generation_timeout
                );
                Ok(None)
            }
        }
    }

    async fn run_reply(&self, task: AggregatedTask) -> Result<(), CollaboratorError> {
        let room_id = task.room_id;
        let bot_id = self.bot_id();

        let Some(perms) = self.permissions(room_id).await else {
            info!("Room {}: no settings, reply skipped", room_id);
            return Ok(());
        };
        if !perms.can_reply() {
            info!("Room {}: replies disabled", room_id);
            return Ok(());
        }

        let (context, duplicate) = self.registry.with_room(room_id, |state| {
            let context = state.context.recent(GENERATION_CONTEXT);
            let duplicate = state.dedup.is_duplicate_context(&context, bot_id);
            (context, duplicate)
        });
        if duplicate {
            info!("Room {}: context unchanged since last reply, skipping", room_id);
            return Ok(());
        }

        info!(
            "🤖 Room {}: generating reply for {} target(s), {} context entries",
            room_id,
            task.reply_targets.len(),
            context.len()
        );
        let request = GenerationRequest {
            room_id,
            kind: GenerationKind::Reply {
                targets: task.reply_targets.clone(),
            },
            context,
        };

        let segments = match self.generate(&request).await? {
            Some(segments) => segments,
            None => vec![self.config.fallback_reply.clone()],
        };
        if segments.is_empty() {
            info!("Room {}: generator had nothing to say", room_id);
            return Ok(());
        }

        self.collab.sender.send(room_id, &segments).await?;

        let ids: HashSet<MessageId> = task.trigger_message_ids().into_iter().collect();
        self.record_bot_message(room_id, &segments, |state| {
            state.context.mark_replied(&ids);
            for id in &ids {
                state.dedup.mark_processed(*id);
            }
        });

        if let Some(target) = task.primary_target()
            && perms.allows_proactive(target.user_id)
        {
            self.registry.reply_mode().activate_long(room_id);
        }
        Ok(())
    }

    async fn run_followup(&self, room_id: RoomId) -> Result<(), CollaboratorError> {
        let context = self
            .registry
            .with_existing(room_id, |state| {
                if state.context.last().is_none_or(|e| e.replied) {
                    None
                } else {
                    Some(state.context.recent(GENERATION_CONTEXT))
                }
            })
            .flatten();
        let Some(context) = context else {
            info!("Room {}: follow-up dropped, nothing new to answer", room_id);
            return Ok(());
        };

        let request = GenerationRequest {
            room_id,
            kind: GenerationKind::Followup,
            context,
        };
        let Some(segments) = self.generate(&request).await? else {
            return Ok(());
        };
        if segments.is_empty() {
            return Ok(());
        }

        self.collab.sender.send(room_id, &segments).await?;
        self.record_bot_message(room_id, &segments, |state| state.context.mark_all_replied());
        Ok(())
    }

    async fn run_skill_rephrase(
        &self,
        room_id: RoomId,
        result: String,
    ) -> Result<(), CollaboratorError> {
        let context = self
            .registry
            .with_room(room_id, |state| state.context.recent(GENERATION_CONTEXT));
        let request = GenerationRequest {
            room_id,
            kind: GenerationKind::SkillRephrase { result },
            context,
        };
        let Some(segments) = self.generate(&request).await? else {
            return Ok(());
        };
        if segments.is_empty() {
            return Ok(());
        }

        self.collab.sender.send(room_id, &segments).await?;
        self.record_bot_message(room_id, &segments, |_| {});
        Ok(())
    }

    /// Log a sent bot message and refresh the room's reply bookkeeping.
    fn record_bot_message(
        &self,
        room_id: RoomId,
        segments: &[String],
        extra: impl FnOnce(&mut RoomState),
    ) {
        let bot_id = self.bot_id();
        let text = segments.join("\n\n");
        info!("📤 Room {}: sent \"{}\"", room_id, truncate_chars(&text, 50));

        self.registry.with_room(room_id, |state| {
            extra(state);
            state
                .context
                .push(ContextEntry::bot(bot_id, &self.config.bot_name, text));
            let recent = state.context.recent(GENERATION_CONTEXT);
            state.dedup.update_context_hash(&recent, bot_id);
            state.last_bot_speak = Some(Instant::now());
        });
    }
}

#[async_trait]
impl TaskProcessor for Shared {
    async fn process(&self, room_id: RoomId, task: RoomTask) {
        let kind = task.kind();
        debug!("Room {}: worker picked up {} task", room_id, kind);
        let result = match task {
            RoomTask::Reply(task) => self.run_reply(task).await,
            RoomTask::Followup => self.run_followup(room_id).await,
            RoomTask::SkillRephrase { result } => self.run_skill_rephrase(room_id, result).await,
        };
        if let Err(e) = result {
            error!("Room {}: {} task failed: {}", room_id, kind, e);
        }
    }

    fn release(&self, room_id: RoomId, trigger_ids: &[MessageId]) {
        self.registry.with_existing(room_id, |state| {
            for id in trigger_ids {
                state.dedup.remove_pending(*id);
            }
        });
    }
}
