//! End-to-end pipeline scenarios against in-memory collaborators.
//!
//! All tests run on a paused tokio clock, so window and reply-mode timings are
//! exact.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::{advance, sleep};

use cirnobot::chatbot::{
    Collaborators, ContextEntry, GenerationKind, GenerationRequest, InboundEvent, IngestOutcome,
    MessageSender, NecessityChecker, Pipeline, PipelineConfig, Priority, QueueFullPolicy,
    ResponseGenerator, RoomId, StaticSettings, UserId,
};
use cirnobot::error::CollaboratorError;

const BOT_ID: UserId = 999;
const ROOM: RoomId = -1001;

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<(RoomId, Vec<String>)>>,
}

impl RecordingSender {
    fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, segments)| segments.join(" | "))
            .collect()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, room_id: RoomId, segments: &[String]) -> Result<(), CollaboratorError> {
        self.sent.lock().unwrap().push((room_id, segments.to_vec()));
        Ok(())
    }
}

/// Answers every request deterministically. Optionally waits for a permit
/// (to hold the worker busy) or sleeps (to trip the generation timeout).
struct ScriptedGenerator {
    requests: Mutex<Vec<GenerationRequest>>,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            gate: None,
            delay: None,
        }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<String>, CollaboratorError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| CollaboratorError::Generation(e.to_string()))?
                .forget();
        }
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        Ok(match &request.kind {
            GenerationKind::Reply { targets } => {
                let names: Vec<&str> = targets.iter().map(|t| t.display_name.as_str()).collect();
                vec![format!("hi {}", names.join(" and "))]
            }
            GenerationKind::Followup => vec!["following up".to_string()],
            GenerationKind::SkillRephrase { result } => vec![format!("result: {result}")],
        })
    }
}

struct ScriptedNecessity {
    answer: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedNecessity {
    fn new(answer: bool) -> Self {
        Self {
            answer: AtomicBool::new(answer),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NecessityChecker for ScriptedNecessity {
    async fn should_reply(&self, _context: &[ContextEntry], _bot_id: UserId) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.load(Ordering::SeqCst)
    }
}

struct Harness {
    pipeline: Pipeline,
    sender: Arc<RecordingSender>,
    generator: Arc<ScriptedGenerator>,
    necessity: Arc<ScriptedNecessity>,
}

fn harness_with(config: PipelineConfig, generator: ScriptedGenerator, necessity: bool) -> Harness {
    let sender = Arc::new(RecordingSender::default());
    let generator = Arc::new(generator);
    let necessity = Arc::new(ScriptedNecessity::new(necessity));
    let collab = Collaborators {
        generator: generator.clone(),
        necessity: necessity.clone(),
        sender: sender.clone(),
        settings: Arc::new(StaticSettings::open()),
    };
    let pipeline = Pipeline::new(config, collab);
    Harness {
        pipeline,
        sender,
        generator,
        necessity,
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        bot_id: BOT_ID,
        bot_name: "cirno".to_string(),
        ..PipelineConfig::default()
    }
}

fn harness() -> Harness {
    harness_with(config(), ScriptedGenerator::new(), true)
}

fn event(message_id: i64, user_id: UserId, name: &str, text: &str) -> InboundEvent {
    InboundEvent {
        room_id: ROOM,
        user_id,
        display_name: name.to_string(),
        message_id,
        text: text.to_string(),
        is_direct_mention: false,
        is_reply_to_bot: false,
    }
}

fn mention(message_id: i64, user_id: UserId, name: &str, text: &str) -> InboundEvent {
    InboundEvent {
        is_direct_mention: true,
        ..event(message_id, user_id, name, text)
    }
}

#[tokio::test(start_paused = true)]
async fn test_burst_from_several_users_becomes_one_reply() {
    let h = harness();

    assert_eq!(
        h.pipeline.ingest(mention(10, 1, "alice", "@cirno what's up")),
        IngestOutcome::Accepted(Priority::High)
    );
    advance(Duration::from_millis(300)).await;
    assert_eq!(
        h.pipeline.ingest(event(11, 2, "bob", "the weather is nice")),
        IngestOutcome::Accepted(Priority::Low)
    );
    advance(Duration::from_millis(300)).await;
    assert_eq!(
        h.pipeline.ingest(event(12, 3, "carol", "bot do you agree?")),
        IngestOutcome::Accepted(Priority::Medium)
    );

    sleep(Duration::from_secs(5)).await;

    // One generation covering both askers, highest priority first
    let requests = h.generator.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let GenerationKind::Reply { targets } = &requests[0].kind else {
        panic!("expected a reply request");
    };
    let names: Vec<&str> = targets.iter().map(|t| t.display_name.as_str()).collect();
    assert_eq!(names, vec!["alice", "carol"]);
    // Background chatter is still part of the context
    assert!(requests[0].context.iter().any(|e| e.message_id == 11));

    assert_eq!(h.sender.texts(), vec!["hi alice and carol"]);

    let registry = h.pipeline.registry();
    for id in [10, 12] {
        assert_eq!(registry.with_existing(ROOM, |s| s.dedup.is_processed(id)), Some(true));
    }
    assert_eq!(registry.with_existing(ROOM, |s| s.dedup.is_processed(11)), Some(false));
    assert!(registry.reply_mode().is_long_active(ROOM));
}

#[tokio::test(start_paused = true)]
async fn test_same_user_twice_plus_chatter_is_one_target() {
    let h = harness();

    assert_eq!(
        h.pipeline.ingest(mention(10, 1, "alice", "@cirno hello")),
        IngestOutcome::Accepted(Priority::High)
    );
    advance(Duration::from_millis(400)).await;
    assert_eq!(
        h.pipeline.ingest(event(11, 2, "bob", "lol")),
        IngestOutcome::Accepted(Priority::Low)
    );
    advance(Duration::from_millis(400)).await;
    // Inside the user cooldown, but it joins the window alice already opened
    assert_eq!(
        h.pipeline.ingest(mention(12, 1, "alice", "@cirno still there?")),
        IngestOutcome::Accepted(Priority::High)
    );

    sleep(Duration::from_secs(5)).await;

    let requests = h.generator.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let GenerationKind::Reply { targets } = &requests[0].kind else {
        panic!("expected a reply request");
    };
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].user_id, 1);
    assert_eq!(targets[0].combined_text(), "@cirno hello | @cirno still there?");
    let ids: Vec<i64> = requests[0].context.iter().map(|e| e.message_id).collect();
    for id in [10, 11, 12] {
        assert!(ids.contains(&id), "message {id} missing from context");
    }

    assert_eq!(h.sender.texts(), vec!["hi alice"]);
    let registry = h.pipeline.registry();
    for id in [10, 12] {
        assert_eq!(registry.with_existing(ROOM, |s| s.dedup.is_processed(id)), Some(true));
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_drops_reply_silently() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(config(), ScriptedGenerator::gated(gate.clone()), true);

    // First task occupies the worker, the next five fill the queue
    assert!(h.pipeline.submit_skill_result(ROOM, "0".to_string()));
    sleep(Duration::from_millis(10)).await;
    for i in 1..=5 {
        assert!(h.pipeline.submit_skill_result(ROOM, i.to_string()));
    }
    assert!(!h.pipeline.submit_skill_result(ROOM, "6".to_string()));

    h.pipeline.ingest(mention(10, 1, "alice", "@cirno hello?"));
    sleep(Duration::from_secs(2)).await;
    assert_eq!(
        h.pipeline.registry().with_existing(ROOM, |s| s.dedup.is_pending(10)),
        Some(false)
    );

    gate.add_permits(100);
    sleep(Duration::from_secs(1)).await;

    // Tasks ran in submission order; the dropped reply left no trace
    assert_eq!(
        h.sender.texts(),
        vec!["result: 0", "result: 1", "result: 2", "result: 3", "result: 4", "result: 5"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_sends_busy_notice() {
    let gate = Arc::new(Semaphore::new(0));
    let config = PipelineConfig {
        queue_capacity: 1,
        full_policy: QueueFullPolicy::BusyNotice,
        busy_notice_text: "busy, one sec".to_string(),
        ..config()
    };
    let h = harness_with(config, ScriptedGenerator::gated(gate.clone()), true);

    assert!(h.pipeline.submit_skill_result(ROOM, "a".to_string()));
    sleep(Duration::from_millis(10)).await;
    assert!(h.pipeline.submit_skill_result(ROOM, "b".to_string()));

    h.pipeline.ingest(mention(10, 1, "alice", "@cirno hello?"));
    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.sender.texts(), vec!["busy, one sec"]);

    // Dropped follow-ups and skill results never produce a notice
    assert!(!h.pipeline.submit_skill_result(ROOM, "c".to_string()));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.sender.texts().len(), 1);

    gate.add_permits(100);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.sender.texts(), vec!["busy, one sec", "result: a", "result: b"]);
}

#[tokio::test(start_paused = true)]
async fn test_followup_after_quiet_period() {
    let h = harness();
    h.pipeline.start();

    h.pipeline.ingest(mention(10, 1, "alice", "@cirno hi"));
    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.sender.texts(), vec!["hi alice"]);
    assert!(h.pipeline.registry().reply_mode().is_long_active(ROOM));

    // Chatter inside the long window arms the short timer
    h.pipeline.ingest(event(11, 2, "bob", "lol that's funny"));
    assert!(h.pipeline.registry().reply_mode().snapshot(ROOM).short_timer_pending);

    sleep(Duration::from_secs(4)).await;
    assert_eq!(h.sender.texts().len(), 1);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.sender.texts(), vec!["hi alice", "following up"]);
    assert_eq!(h.necessity.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.pipeline.registry().with_existing(ROOM, |s| s.context.get(11).unwrap().replied),
        Some(true)
    );

    // Nothing new to answer, so no second follow-up; the window closes later
    sleep(Duration::from_secs(45)).await;
    assert_eq!(h.sender.texts().len(), 2);
    assert_eq!(h.necessity.calls.load(Ordering::SeqCst), 1);
    assert!(!h.pipeline.registry().reply_mode().is_long_active(ROOM));

    h.pipeline.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_followup_declined_by_necessity_check() {
    let h = harness_with(config(), ScriptedGenerator::new(), false);
    h.pipeline.start();

    h.pipeline.ingest(mention(10, 1, "alice", "@cirno hi"));
    sleep(Duration::from_secs(2)).await;
    h.pipeline.ingest(event(11, 2, "bob", "anyway"));
    sleep(Duration::from_secs(10)).await;

    assert_eq!(h.necessity.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.sender.texts(), vec!["hi alice"]);
    h.pipeline.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_no_followup_in_quiet_room() {
    let h = harness();
    h.pipeline.start();

    h.pipeline.ingest(mention(10, 1, "alice", "@cirno hi"));
    sleep(Duration::from_secs(2)).await;
    h.pipeline.set_quiet(ROOM, Duration::from_secs(600));
    assert_eq!(
        h.pipeline.ingest(event(11, 2, "bob", "bot what do you think")),
        IngestOutcome::Muted
    );
    sleep(Duration::from_secs(10)).await;

    assert_eq!(h.necessity.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.sender.texts(), vec!["hi alice"]);
    // The scan skipped the room, so its quiet-period timer is still armed
    let snap = h.pipeline.registry().reply_mode().snapshot(ROOM);
    assert!(snap.long_timer_active);
    assert!(snap.short_timer_pending);
    h.pipeline.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_reply_skipped_when_followup_covered_context() {
    // A long normal window lets the follow-up land before the reply task
    let mut config = config();
    config.aggregator.normal_window = Duration::from_secs(10);
    config.aggregator.max_window = Duration::from_secs(10);
    let h = harness_with(config, ScriptedGenerator::new(), true);
    h.pipeline.start();

    h.pipeline.ingest(mention(10, 1, "alice", "@cirno hi"));
    sleep(Duration::from_secs(2)).await;
    assert_eq!(
        h.pipeline.ingest(event(20, 3, "carol", "bot what do you think")),
        IngestOutcome::Accepted(Priority::Medium)
    );

    sleep(Duration::from_secs(6)).await;
    assert_eq!(h.sender.texts(), vec!["hi alice", "following up"]);

    // The window flushes a reply task for carol, but the context is unchanged
    sleep(Duration::from_secs(6)).await;
    assert_eq!(h.sender.texts(), vec!["hi alice", "following up"]);
    assert_eq!(h.generator.requests.lock().unwrap().len(), 2);
    h.pipeline.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_generation_timeout_sends_fallback() {
    let config = PipelineConfig {
        generation_timeout: Duration::from_secs(30),
        fallback_reply: "uh, what?".to_string(),
        ..config()
    };
    let h = harness_with(config, ScriptedGenerator::slow(Duration::from_secs(60)), true);

    h.pipeline.ingest(mention(10, 1, "alice", "@cirno tell me a story"));
    sleep(Duration::from_secs(35)).await;

    assert_eq!(h.sender.texts(), vec!["uh, what?"]);
    assert_eq!(
        h.pipeline.registry().with_existing(ROOM, |s| s.dedup.is_processed(10)),
        Some(true)
    );
}

#[tokio::test(start_paused = true)]
async fn test_rooms_are_independent() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(config(), ScriptedGenerator::gated(gate.clone()), true);

    // Room A is stuck in generation
    h.pipeline.ingest(mention(10, 1, "alice", "@cirno hi"));
    sleep(Duration::from_secs(2)).await;

    let mut other = mention(30, 4, "dave", "@cirno hey");
    other.room_id = ROOM - 1;
    h.pipeline.ingest(other);
    sleep(Duration::from_secs(2)).await;
    assert!(h.sender.texts().is_empty());
    // Room B started generating while room A was still blocked
    assert_eq!(h.generator.requests.lock().unwrap().len(), 2);

    gate.add_permits(1);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.sender.sent.lock().unwrap().len(), 1);

    gate.add_permits(1);
    sleep(Duration::from_millis(10)).await;
    let rooms: Vec<RoomId> = h.sender.sent.lock().unwrap().iter().map(|(r, _)| *r).collect();
    assert_eq!(rooms.len(), 2);
    assert!(rooms.contains(&ROOM) && rooms.contains(&(ROOM - 1)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_open_windows() {
    let h = harness();
    h.pipeline.ingest(mention(10, 1, "alice", "@cirno bye"));
    assert_eq!(h.pipeline.aggregator().open_windows(), 1);

    h.pipeline.shutdown();
    assert_eq!(h.pipeline.aggregator().open_windows(), 0);
    // The flushed task was handed off before the workers stopped
    assert_eq!(
        h.pipeline.registry().with_existing(ROOM, |s| s.dedup.is_seen(10)),
        Some(true)
    );
}
