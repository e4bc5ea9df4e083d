//! Per-room task queues, one worker each.
//!
//! A room's tasks run strictly one at a time in enqueue order. Rooms are
//! independent. A full queue drops the new task; nothing on the ingest path
//! ever waits for a worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chatbot::message::{AggregatedTask, MessageId, RoomId};

/// Default bound of each room queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

/// Work item for a room worker.
#[derive(Debug, Clone)]
pub enum RoomTask {
    Reply(AggregatedTask),
    Followup,
    SkillRephrase { result: String },
}

impl RoomTask {
    pub fn kind(&self) -> &'static str {
        match self {
            RoomTask::Reply(_) => "reply",
            RoomTask::Followup => "followup",
            RoomTask::SkillRephrase { .. } => "skill-rephrase",
        }
    }

    /// Message ids marked in flight while this task is queued or running.
    pub fn trigger_ids(&self) -> Vec<MessageId> {
        match self {
            RoomTask::Reply(task) => task.trigger_message_ids(),
            _ => Vec::new(),
        }
    }
}

/// Executes dequeued tasks.
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    async fn process(&self, room_id: RoomId, task: RoomTask);

    /// Called after every task, including ones that panicked.
    fn release(&self, room_id: RoomId, trigger_ids: &[MessageId]);
}

struct RoomWorker {
    tx: mpsc::Sender<RoomTask>,
    handle: JoinHandle<()>,
}

/// Owns the queue and worker of every room.
pub struct RoomQueues {
    capacity: usize,
    processor: Weak<dyn TaskProcessor>,
    rooms: Mutex<HashMap<RoomId, RoomWorker>>,
}

impl RoomQueues {
    /// `processor` is held weakly so the owner of the queues can also be
    /// the processor.
    pub fn new(capacity: usize, processor: Weak<dyn TaskProcessor>) -> Self {
        Self {
            capacity: capacity.max(1),
            processor,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push a task without waiting. Returns false if the room's queue is
    /// full and the task was dropped.
    pub fn enqueue(&self, room_id: RoomId, task: RoomTask) -> bool {
        let mut rooms = self.rooms.lock().unwrap();
        let kind = task.kind();

        let worker = rooms
            .entry(room_id)
            .or_insert_with(|| self.spawn_worker(room_id));

        let task = match worker.tx.try_send(task) {
            Ok(()) => {
                debug!("[Queue] Room {}: enqueued {} task", room_id, kind);
                return true;
            }
            Err(TrySendError::Full(_)) => {
                warn!("[Queue] Room {}: queue full, dropping {} task", room_id, kind);
                return false;
            }
            Err(TrySendError::Closed(task)) => task,
        };

        // The worker exited; start a fresh one.
        let worker = self.spawn_worker(room_id);
        let sent = worker.tx.try_send(task).is_ok();
        rooms.insert(room_id, worker);
        sent
    }

    /// Tasks waiting in the room's queue, not counting one being processed.
    pub fn queued_len(&self, room_id: RoomId) -> usize {
        let rooms = self.rooms.lock().unwrap();
        rooms
            .get(&room_id)
            .map_or(0, |w| self.capacity - w.tx.capacity())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }

    /// Close the room's queue. Its worker drains what is queued and exits.
    pub fn forget_room(&self, room_id: RoomId) {
        if self.rooms.lock().unwrap().remove(&room_id).is_some() {
            debug!("[Queue] Room {}: queue closed", room_id);
        }
    }

    /// Abort every worker. Queued tasks are discarded.
    pub fn shutdown(&self) {
        let mut rooms = self.rooms.lock().unwrap();
        for (_, worker) in rooms.drain() {
            worker.handle.abort();
        }
        info!("[Queue] All room workers stopped");
    }

    fn spawn_worker(&self, room_id: RoomId) -> RoomWorker {
        let (tx, rx) = mpsc::channel(self.capacity);
        let handle = tokio::spawn(run_worker(room_id, rx, self.processor.clone()));
        debug!("[Queue] Room {}: worker started", room_id);
        RoomWorker { tx, handle }
    }
}

async fn run_worker(
    room_id: RoomId,
    mut rx: mpsc::Receiver<RoomTask>,
    processor: Weak<dyn TaskProcessor>,
) {
    while let Some(task) = rx.recv().await {
        let Some(handler) = processor.upgrade() else {
            break;
        };

        let kind = task.kind();
        let trigger_ids = task.trigger_ids();

        // Run each task in its own tokio task so a panic is contained.
        let runner: Arc<dyn TaskProcessor> = handler.clone();
        let result = tokio::spawn(async move { runner.process(room_id, task).await }).await;
        if let Err(e) = result {
            error!("[Queue] Room {}: {} task failed: {}", room_id, kind, e);
        }

        handler.release(room_id, &trigger_ids);
    }
    debug!("[Queue] Room {}: worker exited", room_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::sleep;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(RoomId, String)>>,
        released: Mutex<Vec<RoomId>>,
        gate: Notify,
        gated: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TaskProcessor for Recorder {
        async fn process(&self, room_id: RoomId, task: RoomTask) {
            let label = match task {
                RoomTask::SkillRephrase { result } => result,
                other => other.kind().to_string(),
            };
            if label == "panic" {
                panic!("boom");
            }
            if label == "block" && self.gated.load(std::sync::atomic::Ordering::SeqCst) {
                self.gate.notified().await;
            }
            // Yield so other rooms' workers can interleave
            sleep(Duration::from_millis(1)).await;
            self.seen.lock().unwrap().push((room_id, label));
        }

        fn release(&self, room_id: RoomId, _trigger_ids: &[MessageId]) {
            self.released.lock().unwrap().push(room_id);
        }
    }

    fn labelled(label: &str) -> RoomTask {
        RoomTask::SkillRephrase {
            result: label.to_string(),
        }
    }

    fn queues_for(recorder: &Arc<Recorder>, capacity: usize) -> RoomQueues {
        let weak: Weak<dyn TaskProcessor> = Arc::downgrade(recorder) as Weak<dyn TaskProcessor>;
        RoomQueues::new(capacity, weak)
    }

    #[tokio::test]
    async fn test_fifo_per_room() {
        let recorder = Arc::new(Recorder::default());
        let queues = queues_for(&recorder, 5);

        assert!(queues.enqueue(1, labelled("t1")));
        assert!(queues.enqueue(2, labelled("u1")));
        assert!(queues.enqueue(1, labelled("t2")));
        assert!(queues.enqueue(2, labelled("u2")));
        assert!(queues.enqueue(1, labelled("t3")));

        sleep(Duration::from_millis(100)).await;

        let seen = recorder.seen.lock().unwrap();
        let room1: Vec<_> = seen.iter().filter(|(r, _)| *r == 1).map(|(_, l)| l.as_str()).collect();
        let room2: Vec<_> = seen.iter().filter(|(r, _)| *r == 2).map(|(_, l)| l.as_str()).collect();
        assert_eq!(room1, vec!["t1", "t2", "t3"]);
        assert_eq!(room2, vec!["u1", "u2"]);
        assert_eq!(queues.room_count(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_task() {
        let recorder = Arc::new(Recorder::default());
        recorder.gated.store(true, std::sync::atomic::Ordering::SeqCst);
        let queues = queues_for(&recorder, 5);

        // Occupy the worker so later tasks stay queued
        assert!(queues.enqueue(9, labelled("block")));
        sleep(Duration::from_millis(10)).await;

        for _ in 0..5 {
            assert!(queues.enqueue(9, RoomTask::Followup));
        }
        assert_eq!(queues.queued_len(9), 5);
        assert!(!queues.enqueue(9, labelled("dropped")));

        recorder.gate.notify_one();
        sleep(Duration::from_millis(100)).await;

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 6);
        assert!(seen.iter().all(|(_, l)| l != "dropped"));
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_worker() {
        let recorder = Arc::new(Recorder::default());
        let queues = queues_for(&recorder, 5);

        assert!(queues.enqueue(3, labelled("panic")));
        assert!(queues.enqueue(3, labelled("after")));
        sleep(Duration::from_millis(100)).await;

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(3, "after".to_string())]);
        // Released for both tasks, including the panicked one
        assert_eq!(recorder.released.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_forget_room_then_reuse() {
        let recorder = Arc::new(Recorder::default());
        let queues = queues_for(&recorder, 5);

        assert!(queues.enqueue(4, labelled("a")));
        sleep(Duration::from_millis(20)).await;
        queues.forget_room(4);
        assert_eq!(queues.room_count(), 0);

        assert!(queues.enqueue(4, labelled("b")));
        sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let recorder = Arc::new(Recorder::default());
        let queues = queues_for(&recorder, 5);
        assert!(queues.enqueue(5, labelled("a")));
        queues.shutdown();
        assert_eq!(queues.room_count(), 0);

        sleep(Duration::from_millis(20)).await;
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}
