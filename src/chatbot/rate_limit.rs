//! Multi-level rate limiting in front of the generation backend.
//!
//! Checked in order, each level short-circuiting:
//! 1. static commands bypass everything
//! 2. per-(user, room) cooldown
//! 3. per-room token bucket
//! 4. global token bucket

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::chatbot::message::{RoomId, UserId};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Global requests per minute; also the global bucket capacity.
    pub global_rpm: u32,
    /// Per-room requests per minute; also each room bucket's capacity.
    pub room_rpm: u32,
    /// Minimum interval between two allowed requests of one user in one room.
    pub user_cooldown: Duration,
    /// Lowercased prefixes that skip limiting entirely.
    pub static_commands: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rpm: 60,
            room_rpm: 60,
            user_cooldown: Duration::from_millis(1500),
            static_commands: default_static_commands(),
        }
    }
}

pub fn default_static_commands() -> Vec<String> {
    [
        "查看背包", "背包", "物品", "查看属性", "属性", "状态", "签到", "领取",
        "礼包", "商店", "购买", "出售", "帮助", "help", "菜单",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleResult {
    Allowed,
    GroupLimit,
    GlobalLimit,
    UserCooldown,
    StaticCommand,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleInfo {
    pub result: ThrottleResult,
    /// How long until the blocking level would pass. Zero when allowed.
    pub wait_time: Duration,
}

impl ThrottleInfo {
    fn pass(result: ThrottleResult) -> Self {
        Self {
            result,
            wait_time: Duration::ZERO,
        }
    }

    /// Whether the request may go to the generation backend.
    pub fn is_allowed(&self) -> bool {
        matches!(self.result, ThrottleResult::Allowed | ThrottleResult::StaticCommand)
    }
}

/// Continuously refilling token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    pub fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_rate,
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    /// A bucket sized for `rpm` requests per minute.
    pub fn per_minute(rpm: u32, now: Instant) -> Self {
        Self::new_at(rpm, f64::from(rpm) / 60.0, now)
    }

    /// Take one token, or report how long until one is available.
    pub fn acquire_at(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let needed = 1.0 - self.tokens;
        if self.refill_rate <= 0.0 {
            return Err(Duration::MAX);
        }
        Err(Duration::from_secs_f64(needed / self.refill_rate))
    }

    /// Tokens available at `now`, after refill.
    pub fn available_at(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = self.last_refill.max(now);
    }
}

/// Snapshot of limiter state.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    pub global_tokens: f64,
    pub global_capacity: f64,
    pub active_rooms: usize,
    pub active_users: usize,
}

/// Shared across all rooms. Each structure has its own lock, held only for
/// the duration of one check.
pub struct RateLimiter {
    config: RateLimitConfig,
    global: Mutex<TokenBucket>,
    rooms: Mutex<HashMap<RoomId, TokenBucket>>,
    user_last_action: Mutex<HashMap<(UserId, RoomId), Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let global = TokenBucket::per_minute(config.global_rpm, Instant::now());
        Self {
            config,
            global: Mutex::new(global),
            rooms: Mutex::new(HashMap::new()),
            user_last_action: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_static_command(&self, text: &str) -> bool {
        let lower = text.trim().to_lowercase();
        self.config
            .static_commands
            .iter()
            .any(|cmd| lower.starts_with(cmd.as_str()))
    }

    pub fn check(&self, user_id: UserId, room_id: RoomId, text: &str) -> ThrottleInfo {
        self.check_at(user_id, room_id, text, Instant::now())
    }

    pub fn check_at(
        &self,
        user_id: UserId,
        room_id: RoomId,
        text: &str,
        now: Instant,
    ) -> ThrottleInfo {
        if self.is_static_command(text) {
            return ThrottleInfo::pass(ThrottleResult::StaticCommand);
        }

        let key = (user_id, room_id);
        let mut users = self.user_last_action.lock().unwrap();

        if let Some(last) = users.get(&key) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.config.user_cooldown {
                let wait = self.config.user_cooldown - elapsed;
                debug!("[RateLimit] User {} in room {}: cooldown {:?}", user_id, room_id, wait);
                return ThrottleInfo {
                    result: ThrottleResult::UserCooldown,
                    wait_time: wait,
                };
            }
        }

        {
            let mut rooms = self.rooms.lock().unwrap();
            let bucket = rooms
                .entry(room_id)
                .or_insert_with(|| TokenBucket::per_minute(self.config.room_rpm, now));
            if let Err(wait) = bucket.acquire_at(now) {
                debug!("[RateLimit] Room {}: bucket empty, wait {:?}", room_id, wait);
                return ThrottleInfo {
                    result: ThrottleResult::GroupLimit,
                    wait_time: wait,
                };
            }
        }

        if let Err(wait) = self.global.lock().unwrap().acquire_at(now) {
            debug!("[RateLimit] Global bucket empty, wait {:?}", wait);
            return ThrottleInfo {
                result: ThrottleResult::GlobalLimit,
                wait_time: wait,
            };
        }

        users.insert(key, now);
        ThrottleInfo::pass(ThrottleResult::Allowed)
    }

    pub fn stats(&self) -> RateLimiterStats {
        let active_users = self.user_last_action.lock().unwrap().len();
        let active_rooms = self.rooms.lock().unwrap().len();
        let (global_tokens, global_capacity) = {
            let mut global = self.global.lock().unwrap();
            (global.available_at(Instant::now()), global.capacity())
        };
        RateLimiterStats {
            global_tokens,
            global_capacity,
            active_rooms,
            active_users,
        }
    }

    /// Drop a room's bucket and cooldowns.
    pub fn forget_room(&self, room_id: RoomId) {
        self.rooms.lock().unwrap().remove(&room_id);
        self.user_last_action
            .lock()
            .unwrap()
            .retain(|(_, room), _| *room != room_id);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
