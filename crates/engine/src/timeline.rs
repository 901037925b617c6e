use std::collections::HashMap;

use super::ids::{AttemptNonce, Identifier, ServerMessageId, TemporaryId};
use super::types::TimelineEntry;

/// Newest-first sequence of entries for one conversation.
///
/// Order reflects creation/arrival and is never re-sorted. Besides the entries the timeline
/// keeps an identifier-keyed memo of which attempt produced each entry; reconciliation moves
/// memo keys together with the entry identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    attempts: HashMap<Identifier, AttemptNonce>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a timeline from server history, already ordered newest-first.
    pub fn from_entries(entries: Vec<TimelineEntry>) -> Self {
        Self {
            entries,
            attempts: HashMap::new(),
        }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, id: &Identifier) -> Option<&TimelineEntry> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    pub(crate) fn find_mut(&mut self, id: &Identifier) -> Option<&mut TimelineEntry> {
        self.entries.iter_mut().find(|entry| entry.id() == id)
    }

    /// Attempt that created the entry currently known as `id`.
    pub fn attempt_of(&self, id: &Identifier) -> Option<AttemptNonce> {
        self.attempts.get(id).copied()
    }

    /// Every entry still waiting for a server identifier.
    pub fn temporary_ids(&self) -> Vec<&TemporaryId> {
        self.entries
            .iter()
            .filter_map(|entry| entry.id().as_temporary())
            .collect()
    }

    /// Inserts one attempt's user entry and assistant placeholder at the front.
    pub(crate) fn push_attempt(
        &mut self,
        nonce: AttemptNonce,
        user: TimelineEntry,
        assistant: TimelineEntry,
    ) {
        self.attempts.insert(user.id().clone(), nonce);
        self.attempts.insert(assistant.id().clone(), nonce);
        self.entries.insert(0, user);
        self.entries.insert(0, assistant);
    }

    /// Swaps a temporary identifier for the server one, in place.
    ///
    /// Returns false when no entry carries `temporary` (already reconciled or never inserted).
    pub(crate) fn replace_identifier(
        &mut self,
        temporary: &TemporaryId,
        server: ServerMessageId,
    ) -> bool {
        let old = Identifier::Temporary(temporary.clone());
        let new = Identifier::Server(server);

        let Some(entry) = self.find_mut(&old) else {
            return false;
        };
        entry.message.message_id = new.clone();

        if let Some(nonce) = self.attempts.remove(&old) {
            self.attempts.insert(new, nonce);
        }
        true
    }
}
