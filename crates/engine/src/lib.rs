pub mod attempt;
pub mod bridge;
pub mod catalog;
pub mod consumer;
pub mod content;
pub mod engine;
pub mod error;
pub mod event;
pub mod ids;
pub mod settings;
pub mod store;
pub mod timeline;
pub mod types;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use attempt::{AttemptPhase, AttemptTransition, AttemptTransitionRejection, SettledStatus};
pub use bridge::{
    BridgeFieldSet, ToolSelection, ToolSelections, merge_bridge_fields, sanitize_bridge_fields,
};
pub use catalog::{AgentCatalog, StaticAgentCatalog};
pub use consumer::{ConsumerStep, EventStreamConsumer, StreamEnd};
pub use content::{DEFAULT_IMAGE_PLACEHOLDER, NormalizedContent, normalize_content};
pub use engine::{
    CANCELLED_ERROR_CODE, ReconciliationEngine, SendKind, SendOutcome, SendRequest,
    TRANSPORT_ERROR_CODE,
};
pub use error::{EngineError, EngineResult};
pub use event::{DecodedEvent, FrameOutcome, StreamEvent, decode_frame};
pub use ids::{
    AttemptNonce, ConversationId, Identifier, RunId, ServerMessageId, TEMPORARY_ID_PREFIX,
    TemporaryId,
};
pub use settings::{EngineSettings, SettingsError, SettingsStore};
pub use store::{ConversationState, ConversationStore, TimelineEvent};
pub use timeline::Timeline;
pub use types::{
    ImageGenerationKind, ImageGenerationRecord, ImageGenerationStatus, ImageRef, Message, Role,
    RunStatus, RunSummary, TimelineEntry,
};
pub use wire::{SendMessageBody, SendMessageResponse, ServerMessage};
