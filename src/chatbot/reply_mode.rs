//! Dual-timer follow-up window.
//!
//! After the bot answers a direct trigger, the room stays "open" for a
//! while (the long timer). Chatter inside that window arms a short quiet
//! timer; when the room has been quiet for the short delay, a follow-up
//! check is dispatched once. The long timer is extended by every message,
//! so an active conversation keeps the window open.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::chatbot::message::RoomId;

#[derive(Debug, Clone)]
pub struct ReplyModeConfig {
    pub short_timer_delay: Duration,
    pub long_timer_duration: Duration,
    /// Cadence of the background scan.
    pub scan_interval: Duration,
}

impl Default for ReplyModeConfig {
    fn default() -> Self {
        Self {
            short_timer_delay: Duration::from_secs(5),
            long_timer_duration: Duration::from_secs(45),
            scan_interval: Duration::from_millis(500),
        }
    }
}

/// Per-room timer state. A short timer only exists inside an open long
/// window, so "short armed while closed" is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeState {
    LongOpen {
        long_start: Instant,
        short_start: Option<Instant>,
    },
}

/// Observable timer flags for one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyModeSnapshot {
    pub long_timer_active: bool,
    pub long_timer_start: Option<Instant>,
    pub short_timer_pending: bool,
    pub short_timer_start: Option<Instant>,
}

/// Tracks the follow-up window of every room. Closed rooms hold no state.
pub struct ReplyModeController {
    config: ReplyModeConfig,
    rooms: Mutex<HashMap<RoomId, ModeState>>,
}

impl ReplyModeController {
    pub fn new(config: ReplyModeConfig) -> Self {
        Self {
            config,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ReplyModeConfig {
        &self.config
    }

    /// Open (or re-open) the long window after a direct reply was sent.
    pub fn activate_long(&self, room_id: RoomId) {
        self.activate_long_at(room_id, Instant::now());
    }

    pub fn activate_long_at(&self, room_id: RoomId, now: Instant) {
        let mut rooms = self.rooms.lock().unwrap();
        rooms.insert(
            room_id,
            ModeState::LongOpen {
                long_start: now,
                short_start: None,
            },
        );
        debug!("[ReplyMode] Room {}: long timer activated", room_id);
    }

    /// Record user activity. Extends the long window and (re)arms the short
    /// timer; no-op when the window is closed.
    pub fn reset_timers(&self, room_id: RoomId) {
        self.reset_timers_at(room_id, Instant::now());
    }

    pub fn reset_timers_at(&self, room_id: RoomId, now: Instant) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(ModeState::LongOpen {
            long_start,
            short_start,
        }) = rooms.get_mut(&room_id)
        {
            *long_start = now;
            *short_start = Some(now);
        }
    }

    pub fn snapshot(&self, room_id: RoomId) -> ReplyModeSnapshot {
        let rooms = self.rooms.lock().unwrap();
        match rooms.get(&room_id) {
            Some(ModeState::LongOpen {
                long_start,
                short_start,
            }) => ReplyModeSnapshot {
                long_timer_active: true,
                long_timer_start: Some(*long_start),
                short_timer_pending: short_start.is_some(),
                short_timer_start: *short_start,
            },
            None => ReplyModeSnapshot::default(),
        }
    }

    pub fn is_long_active(&self, room_id: RoomId) -> bool {
        self.rooms.lock().unwrap().contains_key(&room_id)
    }

    pub fn close(&self, room_id: RoomId) {
        self.rooms.lock().unwrap().remove(&room_id);
    }

    /// Number of rooms with an open long window.
    pub fn active_rooms(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }

    /// One scan step.
    ///
    /// Closes expired long windows and consumes every short timer whose
    /// quiet period has elapsed. Rooms in `paused` are skipped and keep their
    /// timers as they are. Returns the rooms for which `eligible` accepted a
    /// follow-up. `eligible` is called without the internal lock held, once
    /// per fired room.
    pub fn tick_at<F>(&self, now: Instant, paused: &HashSet<RoomId>, eligible: F) -> Vec<RoomId>
    where
        F: Fn(RoomId) -> bool,
    {
        let mut fired = Vec::new();
        {
            let mut rooms = self.rooms.lock().unwrap();
            rooms.retain(|room_id, state| {
                if paused.contains(room_id) {
                    return true;
                }
                let ModeState::LongOpen {
                    long_start,
                    short_start,
                } = state;

                if now.saturating_duration_since(*long_start) > self.config.long_timer_duration {
                    info!("[ReplyMode] Room {}: long timer expired, window closed", room_id);
                    return false;
                }

                if let Some(start) = *short_start
                    && now.saturating_duration_since(start) >= self.config.short_timer_delay
                {
                    *short_start = None;
                    fired.push(*room_id);
                }
                true
            });
        }

        fired.retain(|room_id| {
            let ok = eligible(*room_id);
            if ok {
                info!("[ReplyMode] Room {}: short timer fired, checking follow-up", room_id);
            } else {
                debug!("[ReplyMode] Room {}: short timer fired, follow-up not eligible", room_id);
            }
            ok
        });
        fired
    }
}

impl Default for ReplyModeController {
    fn default() -> Self {
        Self::new(ReplyModeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn assert_invariant(ctl: &ReplyModeController, room: RoomId) {
        let snap = ctl.snapshot(room);
        assert!(!snap.short_timer_pending || snap.long_timer_active);
    }

    #[test]
    fn test_reset_is_noop_when_closed() {
        let ctl = ReplyModeController::default();
        let t0 = Instant::now();
        ctl.reset_timers_at(1, t0);
        assert_eq!(ctl.snapshot(1), ReplyModeSnapshot::default());
        assert_eq!(ctl.active_rooms(), 0);
    }

    #[test]
    fn test_activate_does_not_arm_short() {
        let ctl = ReplyModeController::default();
        let t0 = Instant::now();
        ctl.activate_long_at(1, t0);
        let snap = ctl.snapshot(1);
        assert!(snap.long_timer_active);
        assert!(!snap.short_timer_pending);

        ctl.reset_timers_at(1, t0 + secs(1.0));
        assert!(ctl.snapshot(1).short_timer_pending);

        // Re-activating clears the short timer
        ctl.activate_long_at(1, t0 + secs(2.0));
        assert!(!ctl.snapshot(1).short_timer_pending);
    }

    #[test]
    fn test_reset_extends_long_window() {
        let ctl = ReplyModeController::default();
        let t0 = Instant::now();
        ctl.activate_long_at(100, t0);
        ctl.reset_timers_at(100, t0 + secs(40.0));

        let mut fired_at = None;
        let mut t = 40.0;
        while t <= 90.0 {
            let fired = ctl.tick_at(t0 + secs(t), &HashSet::new(), |_| true);
            if fired.contains(&100) && fired_at.is_none() {
                fired_at = Some(t);
            }
            if (45.0..85.0).contains(&t) {
                // Still open past the first 45s deadline
                assert!(ctl.is_long_active(100), "closed early at t={t}");
            }
            assert_invariant(&ctl, 100);
            t += 0.5;
        }

        assert_eq!(fired_at, Some(45.0));
        assert!(!ctl.is_long_active(100));
    }

    #[test]
    fn test_short_fires_once_per_lull() {
        let ctl = ReplyModeController::default();
        let t0 = Instant::now();
        ctl.activate_long_at(1, t0);
        ctl.reset_timers_at(1, t0 + secs(1.0));
        ctl.reset_timers_at(1, t0 + secs(3.0));

        assert!(ctl.tick_at(t0 + secs(7.5), &HashSet::new(), |_| true).is_empty());
        assert_eq!(ctl.tick_at(t0 + secs(8.0), &HashSet::new(), |_| true), vec![1]);
        assert!(ctl.tick_at(t0 + secs(8.5), &HashSet::new(), |_| true).is_empty());
        assert!(ctl.tick_at(t0 + secs(20.0), &HashSet::new(), |_| true).is_empty());
    }

    #[test]
    fn test_ineligible_room_consumes_short_timer() {
        let ctl = ReplyModeController::default();
        let t0 = Instant::now();
        ctl.activate_long_at(1, t0);
        ctl.reset_timers_at(1, t0);

        assert!(ctl.tick_at(t0 + secs(5.0), &HashSet::new(), |_| false).is_empty());
        assert!(!ctl.snapshot(1).short_timer_pending);
        assert!(ctl.is_long_active(1));
    }

    #[test]
    fn test_paused_room_keeps_its_timers() {
        let ctl = ReplyModeController::default();
        let t0 = Instant::now();
        ctl.activate_long_at(1, t0);
        ctl.reset_timers_at(1, t0 + secs(1.0));
        let paused: HashSet<RoomId> = [1].into_iter().collect();

        assert!(ctl.tick_at(t0 + secs(10.0), &paused, |_| true).is_empty());
        assert!(ctl.snapshot(1).short_timer_pending);
        // Past the long deadline, but paused rooms are not expired either
        assert!(ctl.tick_at(t0 + secs(60.0), &paused, |_| true).is_empty());
        assert!(ctl.is_long_active(1));

        assert!(ctl.tick_at(t0 + secs(60.5), &HashSet::new(), |_| true).is_empty());
        assert!(!ctl.is_long_active(1));
    }

    #[test]
    fn test_long_expiry_clears_everything() {
        let ctl = ReplyModeController::default();
        let t0 = Instant::now();
        ctl.activate_long_at(1, t0);

        assert!(ctl.tick_at(t0 + secs(45.0), &HashSet::new(), |_| true).is_empty());
        assert!(ctl.is_long_active(1));

        ctl.tick_at(t0 + secs(45.5), &HashSet::new(), |_| true);
        assert_eq!(ctl.snapshot(1), ReplyModeSnapshot::default());

        // A closed window ignores activity until re-activated
        ctl.reset_timers_at(1, t0 + secs(46.0));
        assert!(!ctl.snapshot(1).short_timer_pending);
    }

    #[test]
    fn test_invariant_under_mixed_sequence() {
        let ctl = ReplyModeController::default();
        let t0 = Instant::now();
        for step in 0..400u64 {
            let now = t0 + Duration::from_millis(step * 250);
            match step % 13 {
                0 if step % 39 == 0 => ctl.activate_long_at(1, now),
                3 | 7 => ctl.reset_timers_at(1, now),
                _ => {
                    ctl.tick_at(now, &HashSet::new(), |_| true);
                }
            }
            assert_invariant(&ctl, 1);
        }
    }

    #[test]
    fn test_rooms_are_independent() {
        let ctl = ReplyModeController::default();
        let t0 = Instant::now();
        ctl.activate_long_at(1, t0);
        ctl.activate_long_at(2, t0);
        ctl.reset_timers_at(1, t0);

        assert_eq!(ctl.tick_at(t0 + secs(5.0), &HashSet::new(), |_| true), vec![1]);
        assert!(!ctl.snapshot(2).short_timer_pending);
    }
}
