use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ConversationId, Identifier, RunId};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// Lifecycle of one backend run: `queued → running → {succeeded | failed | canceled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Terminal states are frozen; earlier states may only move forward.
    pub fn can_advance_to(&self, next: RunStatus) -> bool {
        match self {
            Self::Queued => true,
            Self::Running => next != Self::Queued,
            Self::Succeeded | Self::Failed | Self::Canceled => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    #[serde(default)]
    pub requested_logical_model: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl RunSummary {
    pub fn new(run_id: RunId, requested_logical_model: impl Into<String>) -> Self {
        Self {
            run_id,
            requested_logical_model: requested_logical_model.into(),
            status: RunStatus::Queued,
            output_preview: None,
            latency: None,
            error_code: None,
        }
    }

    /// Replaces this summary with `next` when the status change is legal.
    ///
    /// A placeholder run is always replaced, since the server's run supersedes it.
    pub fn advance(&mut self, next: RunSummary) -> bool {
        if !self.run_id.is_placeholder() && !self.status.can_advance_to(next.status) {
            tracing::warn!(
                run_id = %self.run_id,
                current = ?self.status,
                attempted = ?next.status,
                "refusing run status regression"
            );
            return false;
        }

        *self = next;
        true
    }

    /// Moves a still-open run to a terminal status, keeping everything else.
    pub fn settle(&mut self, status: RunStatus, error_code: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        self.status = status;
        if error_code.is_some() {
            self.error_code = error_code;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageGenerationStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Discriminator carried as `"type": "image_generation"` by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ImageGenerationKind {
    #[default]
    #[serde(rename = "image_generation")]
    ImageGeneration,
}

/// Structured result of an image-generation request, rendered beside the flattened text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageGenerationRecord {
    #[serde(rename = "type", default)]
    pub kind: ImageGenerationKind,
    #[serde(default)]
    pub status: ImageGenerationStatus,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImageGenerationRecord {
    pub fn pending(prompt: impl Into<String>, params: Value) -> Self {
        Self {
            kind: ImageGenerationKind::ImageGeneration,
            status: ImageGenerationStatus::Pending,
            prompt: prompt.into(),
            params,
            images: Vec::new(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ImageGenerationStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: Identifier,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub image_generation: Option<ImageGenerationRecord>,
    pub created_at: DateTime<Utc>,
}

/// One row of the timeline. User entries carry the run they spawned.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub message: Message,
    pub run: Option<RunSummary>,
    pub runs: Vec<RunSummary>,
}

impl TimelineEntry {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            run: None,
            runs: Vec::new(),
        }
    }

    pub fn with_run(mut self, run: RunSummary) -> Self {
        self.runs.push(run.clone());
        self.run = Some(run);
        self
    }

    /// Records a run update, keeping `runs` as the per-run history and `run` as the latest.
    pub fn record_run(&mut self, run: RunSummary) -> bool {
        let accepted = match self.run.as_mut() {
            Some(current) if current.run_id == run.run_id || current.run_id.is_placeholder() => {
                current.advance(run.clone())
            }
            Some(_) | None => {
                self.run = Some(run.clone());
                true
            }
        };

        if !accepted {
            return false;
        }

        match self
            .runs
            .iter_mut()
            .find(|existing| existing.run_id == run.run_id || existing.run_id.is_placeholder())
        {
            Some(existing) => *existing = run,
            None => self.runs.push(run),
        }
        true
    }

    pub fn id(&self) -> &Identifier {
        &self.message.message_id
    }
}
