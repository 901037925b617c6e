use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use super::attempt::SettledStatus;
use super::bridge::ToolSelections;
use super::ids::{AttemptNonce, ConversationId, Identifier, ServerMessageId, TemporaryId};
use super::timeline::Timeline;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Per-conversation client state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    pub timeline: Timeline,
    /// Attempts currently in flight. Advisory: callers read it to disable sending.
    pub in_flight: usize,
    pub model_override: Option<String>,
    pub bridge_agent_ids: Vec<String>,
    pub tool_selections: ToolSelections,
}

impl ConversationState {
    pub fn is_pending(&self) -> bool {
        self.in_flight > 0
    }
}

/// Change notifications for renderers. Snapshots read afterwards are eventually consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEvent {
    EntriesInserted {
        conversation_id: ConversationId,
        attempt: AttemptNonce,
    },
    IdentifierReconciled {
        conversation_id: ConversationId,
        temporary: TemporaryId,
        server: ServerMessageId,
    },
    ContentUpdated {
        conversation_id: ConversationId,
        message_id: Identifier,
    },
    Settled {
        conversation_id: ConversationId,
        attempt: AttemptNonce,
        status: SettledStatus,
    },
    PendingChanged {
        conversation_id: ConversationId,
        pending: bool,
    },
    Hydrated {
        conversation_id: ConversationId,
    },
}

#[derive(Debug, Default)]
struct StoreInner {
    conversations: HashMap<ConversationId, ConversationState>,
    default_tool_selections: ToolSelections,
}

/// Session-scoped keyed store: conversation id → state.
///
/// Callers may read snapshots and set selections or model overrides; timelines and the
/// pending flag are written only by the reconciliation engine.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<RwLock<StoreInner>>,
    events: broadcast::Sender<TimelineEvent>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self, conversation_id: &ConversationId) -> Option<ConversationState> {
        self.read(|inner| inner.conversations.get(conversation_id).cloned())
    }

    pub fn timeline(&self, conversation_id: &ConversationId) -> Option<Timeline> {
        self.read(|inner| {
            inner
                .conversations
                .get(conversation_id)
                .map(|state| state.timeline.clone())
        })
    }

    pub fn is_pending(&self, conversation_id: &ConversationId) -> bool {
        self.read(|inner| {
            inner
                .conversations
                .get(conversation_id)
                .is_some_and(ConversationState::is_pending)
        })
    }

    pub fn model_override(&self, conversation_id: &ConversationId) -> Option<String> {
        self.read(|inner| {
            inner
                .conversations
                .get(conversation_id)
                .and_then(|state| state.model_override.clone())
        })
    }

    pub fn set_model_override(&self, conversation_id: &ConversationId, model: Option<String>) {
        let model = model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty());
        self.update(conversation_id, |state| state.model_override = model);
    }

    pub fn set_bridge_agent_ids(&self, conversation_id: &ConversationId, agent_ids: Vec<String>) {
        self.update(conversation_id, |state| state.bridge_agent_ids = agent_ids);
    }

    pub fn set_tool_selections(&self, conversation_id: &ConversationId, selections: ToolSelections) {
        self.update(conversation_id, |state| state.tool_selections = selections);
    }

    pub fn set_default_tool_selections(&self, selections: ToolSelections) {
        self.write(|inner| inner.default_tool_selections = selections);
    }

    /// Conversation agent ids, conversation tool selections and session defaults.
    pub(crate) fn bridge_inputs(
        &self,
        conversation_id: &ConversationId,
    ) -> (Vec<String>, ToolSelections, ToolSelections) {
        self.read(|inner| {
            let (agent_ids, tools) = inner
                .conversations
                .get(conversation_id)
                .map(|state| (state.bridge_agent_ids.clone(), state.tool_selections.clone()))
                .unwrap_or_default();
            (agent_ids, tools, inner.default_tool_selections.clone())
        })
    }

    /// Runs `apply` against the conversation's state, creating it on first use.
    pub(crate) fn update<R>(
        &self,
        conversation_id: &ConversationId,
        apply: impl FnOnce(&mut ConversationState) -> R,
    ) -> R {
        self.write(|inner| {
            let state = inner
                .conversations
                .entry(conversation_id.clone())
                .or_default();
            apply(state)
        })
    }

    /// Counts one more attempt in flight. Returns how many were already running.
    pub(crate) fn begin_attempt(&self, conversation_id: &ConversationId) -> usize {
        let already_running = self.update(conversation_id, |state| {
            let already_running = state.in_flight;
            state.in_flight += 1;
            already_running
        });

        if already_running == 0 {
            self.emit(TimelineEvent::PendingChanged {
                conversation_id: conversation_id.clone(),
                pending: true,
            });
        }
        already_running
    }

    /// Releases one in-flight attempt; pending clears only when the last one settles.
    pub(crate) fn finish_attempt(&self, conversation_id: &ConversationId) {
        let cleared = self.update(conversation_id, |state| {
            if state.in_flight == 0 {
                return false;
            }
            state.in_flight -= 1;
            state.in_flight == 0
        });

        if cleared {
            self.emit(TimelineEvent::PendingChanged {
                conversation_id: conversation_id.clone(),
                pending: false,
            });
        }
    }

    pub(crate) fn emit(&self, event: TimelineEvent) {
        // No subscribers is fine; renderers attach and detach freely.
        let _ = self.events.send(event);
    }

    fn read<R>(&self, apply: impl FnOnce(&StoreInner) -> R) -> R {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        apply(&inner)
    }

    fn write<R>(&self, apply: impl FnOnce(&mut StoreInner) -> R) -> R {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut inner)
    }
}
