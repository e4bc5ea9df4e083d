//! Owner of all per-room pipeline state.
//!
//! One registry per pipeline, created at startup. Rooms are allocated on
//! first activity and evicted after a configurable idle period.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::chatbot::context::RoomContext;
use crate::chatbot::dedup::{DedupConfig, DedupTracker};
use crate::chatbot::message::RoomId;
use crate::chatbot::reply_mode::{ReplyModeConfig, ReplyModeController};

/// Conversation state of one room.
pub struct RoomState {
    pub context: RoomContext,
    pub dedup: DedupTracker,
    pub last_activity: Instant,
    /// When the bot last sent anything here.
    pub last_bot_speak: Option<Instant>,
    /// Proactive and non-mention replies are muted until this instant.
    pub quiet_until: Option<Instant>,
}

impl RoomState {
    fn new(context_capacity: usize, dedup: DedupConfig, now: Instant) -> Self {
        Self {
            context: RoomContext::new(context_capacity),
            dedup: DedupTracker::new(dedup),
            last_activity: now,
            last_bot_speak: None,
            quiet_until: None,
        }
    }

    pub fn is_quiet(&self, now: Instant) -> bool {
        self.quiet_until.is_some_and(|until| now < until)
    }
}

pub struct RoomRegistry {
    context_capacity: usize,
    dedup: DedupConfig,
    rooms: Mutex<HashMap<RoomId, RoomState>>,
    reply_mode: ReplyModeController,
}

impl RoomRegistry {
    pub fn new(context_capacity: usize, dedup: DedupConfig, reply_mode: ReplyModeConfig) -> Self {
        Self {
            context_capacity,
            dedup,
            rooms: Mutex::new(HashMap::new()),
            reply_mode: ReplyModeController::new(reply_mode),
        }
    }

    pub fn reply_mode(&self) -> &ReplyModeController {
        &self.reply_mode
    }

    /// Run `f` on the room's state, allocating it if needed.
    pub fn with_room<R>(&self, room_id: RoomId, f: impl FnOnce(&mut RoomState) -> R) -> R {
        let mut rooms = self.rooms.lock().unwrap();
        let state = rooms
            .entry(room_id)
            .or_insert_with(|| {
                RoomState::new(self.context_capacity, self.dedup.clone(), Instant::now())
            });
        f(state)
    }

    /// Run `f` only if the room already has state.
    pub fn with_existing<R>(
        &self,
        room_id: RoomId,
        f: impl FnOnce(&mut RoomState) -> R,
    ) -> Option<R> {
        let mut rooms = self.rooms.lock().unwrap();
        rooms.get_mut(&room_id).map(f)
    }

    pub fn contains(&self, room_id: RoomId) -> bool {
        self.rooms.lock().unwrap().contains_key(&room_id)
    }

    /// Rooms currently in quiet mode.
    pub fn quiet_rooms(&self, now: Instant) -> HashSet<RoomId> {
        let rooms = self.rooms.lock().unwrap();
        rooms
            .iter()
            .filter(|(_, s)| s.is_quiet(now))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }

    /// Drop rooms idle for longer than `ttl`, including their reply-mode
    /// state. Returns the evicted ids so other per-room components can be
    /// cleaned up too.
    pub fn evict_idle(&self, now: Instant, ttl: Duration) -> Vec<RoomId> {
        let evicted: Vec<RoomId> = {
            let mut rooms = self.rooms.lock().unwrap();
            let stale: Vec<RoomId> = rooms
                .iter()
                .filter(|(_, s)| now.saturating_duration_since(s.last_activity) > ttl)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                rooms.remove(id);
            }
            stale
        };

        for id in &evicted {
            self.reply_mode.close(*id);
        }
        if !evicted.is_empty() {
            info!("[Registry] Evicted {} idle room(s)", evicted.len());
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbot::context::DEFAULT_CONTEXT_CAPACITY;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(
            DEFAULT_CONTEXT_CAPACITY,
            DedupConfig::default(),
            ReplyModeConfig::default(),
        )
    }

    #[test]
    fn test_rooms_allocated_lazily() {
        let reg = registry();
        assert_eq!(reg.with_existing(1, |_| ()), None);
        assert!(!reg.contains(1));

        reg.with_room(1, |s| s.dedup.mark_processed(5));
        assert!(reg.contains(1));
        assert_eq!(reg.with_existing(1, |s| s.dedup.is_processed(5)), Some(true));
    }

    #[test]
    fn test_independent_registries() {
        let a = registry();
        let b = registry();
        a.with_room(1, |s| s.dedup.mark_processed(5));
        assert_eq!(b.with_existing(1, |s| s.dedup.is_processed(5)), None);
    }

    #[test]
    fn test_quiet_window() {
        let reg = registry();
        let now = Instant::now();
        reg.with_room(1, |s| s.quiet_until = Some(now + Duration::from_secs(60)));
        assert_eq!(reg.with_existing(1, |s| s.is_quiet(now)), Some(true));
        assert_eq!(
            reg.with_existing(1, |s| s.is_quiet(now + Duration::from_secs(61))),
            Some(false)
        );

        reg.with_room(2, |_| ());
        assert_eq!(reg.quiet_rooms(now), [1].into_iter().collect());
        assert!(reg.quiet_rooms(now + Duration::from_secs(61)).is_empty());
    }

    #[test]
    fn test_evict_idle() {
        let reg = registry();
        let now = Instant::now();
        reg.with_room(1, |s| s.last_activity = now);
        reg.with_room(2, |s| s.last_activity = now);
        reg.reply_mode().activate_long(1);

        assert!(reg.evict_idle(now, Duration::from_secs(60)).is_empty());

        reg.with_room(2, |s| s.last_activity = now + Duration::from_secs(3600));
        let later = now + Duration::from_secs(3601);
        let evicted = reg.evict_idle(later, Duration::from_secs(60));
        assert_eq!(evicted, vec![1]);
        assert!(!reg.contains(1));
        assert!(reg.contains(2));
        assert!(!reg.reply_mode().is_long_active(1));
    }
}
