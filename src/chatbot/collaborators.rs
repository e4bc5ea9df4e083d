//! Boundaries between the scheduling core and the outside world.
//!
//! The pipeline is constructed with one implementation of each trait. The
//! no-op implementations here are the defaults, so the hot path never has
//! to check for a missing callback.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::chatbot::message::{ContextEntry, ReplyTarget, RoomId, UserId};
use crate::error::CollaboratorError;

/// Why a generation call is being made.
#[derive(Debug, Clone)]
pub enum GenerationKind {
    /// Answer the listed users.
    Reply { targets: Vec<ReplyTarget> },
    /// Unprompted follow-up after a quiet period.
    Followup,
    /// Restate the result of a skill for the room.
    SkillRephrase { result: String },
}

/// Everything the generator gets for one call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub room_id: RoomId,
    pub kind: GenerationKind,
    /// Recent conversation, oldest first.
    pub context: Vec<ContextEntry>,
}

/// Produces reply text. An empty list means "nothing to say".
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<String>, CollaboratorError>;
}

/// Cheap check run before committing to a follow-up generation.
#[async_trait]
pub trait NecessityChecker: Send + Sync {
    async fn should_reply(&self, context: &[ContextEntry], bot_id: UserId) -> bool;
}

/// Delivers reply segments to a room.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, room_id: RoomId, segments: &[String]) -> Result<(), CollaboratorError>;
}

/// Reply permissions of one room.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomPermissions {
    pub enabled: bool,
    pub llm_enabled: bool,
    pub proactive_enabled: bool,
    /// Users allowed to receive proactive follow-ups. `None` allows everyone.
    pub proactive_whitelist: Option<HashSet<UserId>>,
}

impl RoomPermissions {
    /// Fully enabled, no whitelist.
    pub fn open() -> Self {
        Self {
            enabled: true,
            llm_enabled: true,
            proactive_enabled: true,
            proactive_whitelist: None,
        }
    }

    pub fn can_reply(&self) -> bool {
        self.enabled && self.llm_enabled
    }

    pub fn allows_proactive(&self, user_id: UserId) -> bool {
        self.can_reply()
            && self.proactive_enabled
            && self
                .proactive_whitelist
                .as_ref()
                .is_none_or(|w| w.contains(&user_id))
    }
}

/// Long-lived per-room settings. `Ok(None)` and errors both mean the room
/// is disabled.
#[async_trait]
pub trait RoomSettings: Send + Sync {
    async fn permissions(
        &self,
        room_id: RoomId,
    ) -> Result<Option<RoomPermissions>, CollaboratorError>;
}

/// Generator that never produces a reply.
pub struct SilentGenerator;

#[async_trait]
impl ResponseGenerator for SilentGenerator {
    async fn generate(
        &self,
        _request: &GenerationRequest,
    ) -> Result<Vec<String>, CollaboratorError> {
        Ok(Vec::new())
    }
}

/// Necessity check that always declines.
pub struct NeverReply;

#[async_trait]
impl NecessityChecker for NeverReply {
    async fn should_reply(&self, _context: &[ContextEntry], _bot_id: UserId) -> bool {
        false
    }
}

/// Sender that discards everything.
pub struct DiscardSender;

#[async_trait]
impl MessageSender for DiscardSender {
    async fn send(&self, _room_id: RoomId, _segments: &[String]) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// In-memory settings, keyed by room. Rooms without an entry fall back to
/// `default`.
pub struct StaticSettings {
    rooms: Mutex<HashMap<RoomId, RoomPermissions>>,
    default: Option<RoomPermissions>,
}

impl StaticSettings {
    /// Every room is disabled unless set explicitly.
    pub fn disabled() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            default: None,
        }
    }

    /// Every room is fully enabled.
    pub fn open() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            default: Some(RoomPermissions::open()),
        }
    }

    pub fn set(&self, room_id: RoomId, permissions: RoomPermissions) {
        self.rooms.lock().unwrap().insert(room_id, permissions);
    }
}

#[async_trait]
impl RoomSettings for StaticSettings {
    async fn permissions(
        &self,
        room_id: RoomId,
    ) -> Result<Option<RoomPermissions>, CollaboratorError> {
        let rooms = self.rooms.lock().unwrap();
        Ok(rooms.get(&room_id).cloned().or_else(|| self.default.clone()))
    }
}
