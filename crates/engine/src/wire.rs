use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bridge::BridgeFieldSet;
use super::content::normalize_content;
use super::ids::{ConversationId, Identifier, RunId, ServerMessageId};
use super::types::{Message, RunSummary, Role, TimelineEntry};

pub fn messages_path(conversation_id: &ConversationId) -> String {
    format!("/v1/conversations/{conversation_id}/messages")
}

pub fn cancel_run_path(run_id: &RunId) -> String {
    format!("/v1/runs/{run_id}/cancel")
}

/// Message record as the backend returns it; `content` is not normalized yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub message_id: ServerMessageId,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub role: Role,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ServerMessage {
    pub fn into_entry(
        self,
        fallback_conversation_id: &ConversationId,
        image_placeholder: &str,
    ) -> TimelineEntry {
        let normalized = normalize_content(&self.content, image_placeholder);
        TimelineEntry::new(Message {
            message_id: Identifier::Server(self.message_id),
            conversation_id: self
                .conversation_id
                .unwrap_or_else(|| fallback_conversation_id.clone()),
            role: self.role,
            content: normalized.content,
            image_generation: normalized.image_generation,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    pub params: Value,
}

/// Outbound body, identical for streaming and non-streaming sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendMessageBody {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_preset: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_logical_model: Option<String>,
    pub streaming: bool,
    #[serde(flatten)]
    pub bridge: BridgeFieldSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_generation: Option<ImageGenerationRequest>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendMessageResponse {
    pub user_message: ServerMessage,
    #[serde(default)]
    pub assistant_message: Option<ServerMessage>,
    #[serde(default)]
    pub baseline_run: Option<RunSummary>,
    #[serde(default)]
    pub output_text: Option<String>,
}
