use super::ids::{AttemptNonce, ConversationId, Identifier, TemporaryId};
use super::types::Role;

/// How a settled attempt ended. Both flavors release the conversation's pending flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettledStatus {
    Completed,
    Failed,
}

/// Lifecycle of one send: `Idle → Sending → Streaming* → Settled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttemptPhase {
    #[default]
    Idle,
    Sending,
    Streaming,
    Settled(SettledStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptTransition {
    Send,
    Stream,
    Settle(SettledStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptTransitionRejection {
    AlreadyStarted,
    NotStarted,
    AlreadySettled(SettledStatus),
}

pub type AttemptTransitionResult = Result<AttemptPhase, AttemptTransitionRejection>;

impl AttemptPhase {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Settled(_))
    }

    /// Applies one transition deterministically. `Settled` accepts nothing.
    pub fn apply(&self, transition: AttemptTransition) -> AttemptTransitionResult {
        match (self, transition) {
            (Self::Settled(status), _) => Err(AttemptTransitionRejection::AlreadySettled(*status)),
            (Self::Idle, AttemptTransition::Send) => Ok(Self::Sending),
            (Self::Idle, AttemptTransition::Stream | AttemptTransition::Settle(_)) => {
                Err(AttemptTransitionRejection::NotStarted)
            }
            (Self::Sending | Self::Streaming, AttemptTransition::Send) => {
                Err(AttemptTransitionRejection::AlreadyStarted)
            }
            (Self::Sending | Self::Streaming, AttemptTransition::Stream) => Ok(Self::Streaming),
            (Self::Sending | Self::Streaming, AttemptTransition::Settle(status)) => {
                Ok(Self::Settled(status))
            }
        }
    }
}

/// Engine-side bookkeeping for one in-flight send.
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub conversation_id: ConversationId,
    pub nonce: AttemptNonce,
    pub phase: AttemptPhase,
    pub user_temporary: TemporaryId,
    pub assistant_temporary: TemporaryId,
    pub user_id: Identifier,
    pub assistant_id: Identifier,
    /// Concatenated deltas, in arrival order.
    pub streamed: String,
    pub last_seq: Option<u64>,
    pub image_generation: bool,
}

impl Attempt {
    pub(crate) fn new(conversation_id: ConversationId, image_generation: bool) -> Self {
        let nonce = AttemptNonce::new_v7();
        let user_temporary = TemporaryId::for_attempt(nonce, Role::User);
        let assistant_temporary = TemporaryId::for_attempt(nonce, Role::Assistant);

        Self {
            conversation_id,
            nonce,
            phase: AttemptPhase::Idle,
            user_id: user_temporary.clone().into(),
            assistant_id: assistant_temporary.clone().into(),
            user_temporary,
            assistant_temporary,
            streamed: String::new(),
            last_seq: None,
            image_generation,
        }
    }

    /// Applies a transition, logging and ignoring illegal ones.
    pub(crate) fn transition(&mut self, transition: AttemptTransition) -> bool {
        match self.phase.apply(transition) {
            Ok(next) => {
                self.phase = next;
                true
            }
            Err(rejection) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    attempt = %self.nonce,
                    ?transition,
                    ?rejection,
                    "ignoring illegal attempt transition"
                );
                false
            }
        }
    }

    /// Records a stream sequence number. Out-of-order numbers are reported, never enforced.
    pub(crate) fn observe_seq(&mut self, seq: Option<u64>) {
        let Some(seq) = seq else {
            return;
        };

        if let Some(previous) = self.last_seq
            && seq <= previous
        {
            tracing::debug!(
                attempt = %self.nonce,
                previous,
                seq,
                "stream sequence did not increase"
            );
        }
        self.last_seq = Some(seq);
    }

    pub(crate) fn has_temporary_ids(&self) -> bool {
        self.user_id.is_temporary() || self.assistant_id.is_temporary()
    }
}
