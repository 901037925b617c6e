use snafu::Snafu;
use tidewire_transport::TransportError;

use crate::ids::{AttemptNonce, ConversationId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("send request has no conversation id"))]
    MissingConversationId { stage: &'static str },
    #[snafu(display("send request is missing required field '{field}'"))]
    MissingField {
        stage: &'static str,
        field: &'static str,
    },
    #[snafu(display("'{raw}' is not a valid {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("failed to encode send body on `{stage}`, {source}"))]
    EncodeBody {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("transport failed on `{stage}`, {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("malformed stream frame on `{stage}`: {data}"))]
    MalformedFrame {
        stage: &'static str,
        data: String,
        source: serde_json::Error,
    },
    #[snafu(display("stream frame has no event type: {data}"))]
    MissingEventType { stage: &'static str, data: String },
    #[snafu(display("malformed send response on `{stage}`, {source}"))]
    MalformedResponse {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("event stream closed before a terminal event"))]
    StreamClosed { stage: &'static str },
    #[snafu(display("attempt {attempt} on conversation {conversation_id} was cancelled"))]
    Cancelled {
        stage: &'static str,
        conversation_id: ConversationId,
        attempt: AttemptNonce,
    },
    #[snafu(display("reconciliation invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
}

impl EngineError {
    /// Rejected before any network call was made.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::MissingConversationId { .. }
                | Self::MissingField { .. }
                | Self::InvalidId { .. }
                | Self::EncodeBody { .. }
        )
    }

    /// The system itself failed to talk to the backend.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::MalformedFrame { .. }
                | Self::MissingEventType { .. }
                | Self::MalformedResponse { .. }
                | Self::StreamClosed { .. }
        )
    }

    /// User-initiated stop; callers usually suppress error messaging for it.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::MissingConversationId { stage }
            | Self::MissingField { stage, .. }
            | Self::InvalidId { stage, .. }
            | Self::EncodeBody { stage, .. }
            | Self::Transport { stage, .. }
            | Self::MalformedFrame { stage, .. }
            | Self::MissingEventType { stage, .. }
            | Self::MalformedResponse { stage, .. }
            | Self::StreamClosed { stage }
            | Self::Cancelled { stage, .. }
            | Self::InvariantViolation { stage, .. } => stage,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
