//! Per-room conversation log.
//!
//! Holds the recent history fed to the generator, the necessity check and
//! the context hash. Bounded: the oldest entries fall off once `capacity`
//! is reached.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::chatbot::message::{ContextEntry, MessageId};

/// Default number of entries kept per room.
pub const DEFAULT_CONTEXT_CAPACITY: usize = 150;

/// Bounded log of recent messages in one room.
pub struct RoomContext {
    entries: VecDeque<ContextEntry>,
    capacity: usize,
    /// Ids of entries currently in the log, for edit lookups.
    index: HashMap<MessageId, usize>,
    /// Sequence number of `entries[0]`; positions in `index` are absolute.
    base: usize,
}

impl RoomContext {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
            index: HashMap::new(),
            base: 0,
        }
    }

    /// Append an entry, evicting the oldest if full.
    pub fn push(&mut self, entry: ContextEntry) {
        if self.entries.len() == self.capacity
            && let Some(old) = self.entries.pop_front()
        {
            if old.message_id != 0 && self.index.get(&old.message_id) == Some(&self.base) {
                self.index.remove(&old.message_id);
            }
            self.base += 1;
        }

        if entry.message_id != 0 {
            self.index
                .insert(entry.message_id, self.base + self.entries.len());
        }
        self.entries.push_back(entry);
    }

    /// Replace the text of a logged message. Returns false if it is no
    /// longer in the log.
    pub fn edit(&mut self, message_id: MessageId, new_text: &str) -> bool {
        match self.position(message_id) {
            Some(pos) => {
                self.entries[pos].text = new_text.to_string();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, message_id: MessageId) -> Option<&ContextEntry> {
        self.position(message_id).map(|pos| &self.entries[pos])
    }

    /// Flag the given messages as answered.
    pub fn mark_replied(&mut self, ids: &HashSet<MessageId>) {
        for id in ids {
            if let Some(pos) = self.position(*id) {
                self.entries[pos].replied = true;
            }
        }
    }

    pub fn mark_all_replied(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.replied = true;
        }
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ContextEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<&ContextEntry> {
        self.entries.back()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn position(&self, message_id: MessageId) -> Option<usize> {
        if message_id == 0 {
            return None;
        }
        let abs = *self.index.get(&message_id)?;
        abs.checked_sub(self.base).filter(|pos| *pos < self.entries.len())
    }
}

impl Default for RoomContext {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_CAPACITY)
    }
}
