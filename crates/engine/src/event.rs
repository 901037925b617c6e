use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::ResultExt;
use tidewire_transport::SseFrame;

use super::error::{EngineResult, MalformedFrameSnafu, MissingEventTypeSnafu};
use super::ids::RunId;
use super::wire::ServerMessage;
use super::types::{ImageGenerationRecord, RunSummary};

pub const MESSAGE_CREATED: &str = "message.created";
pub const MESSAGE_DELTA: &str = "message.delta";
pub const MESSAGE_COMPLETED: &str = "message.completed";
pub const MESSAGE_FAILED: &str = "message.failed";

/// Literal `data` value that ends a stream cleanly.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageCreated {
    pub user_message: ServerMessage,
    #[serde(default)]
    pub assistant_message: Option<ServerMessage>,
    #[serde(default)]
    pub baseline_run: Option<RunSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageDelta {
    #[serde(alias = "text")]
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageCompleted {
    #[serde(default)]
    pub output_text: Option<String>,
    #[serde(default)]
    pub assistant_message: Option<ServerMessage>,
    #[serde(default)]
    pub baseline_run: Option<RunSummary>,
    #[serde(default)]
    pub image_generation: Option<ImageGenerationRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FailureDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageFailed {
    #[serde(default)]
    pub error: Option<FailureDetail>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub baseline_run: Option<RunSummary>,
}

impl MessageFailed {
    pub fn error_code(&self) -> Option<&str> {
        self.error_code
            .as_deref()
            .or_else(|| self.error.as_ref().and_then(|error| error.code.as_deref()))
            .or_else(|| {
                self.baseline_run
                    .as_ref()
                    .and_then(|run| run.error_code.as_deref())
            })
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().and_then(|error| error.message.as_deref())
    }
}

/// One decoded stream event. Unknown types are kept so they can be forwarded and ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Created(MessageCreated),
    Delta(MessageDelta),
    Completed(MessageCompleted),
    Failed(MessageFailed),
    Unknown { event_type: String, payload: Value },
}

impl StreamEvent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::Created(_) => MESSAGE_CREATED,
            Self::Delta(_) => MESSAGE_DELTA,
            Self::Completed(_) => MESSAGE_COMPLETED,
            Self::Failed(_) => MESSAGE_FAILED,
            Self::Unknown { event_type, .. } => event_type,
        }
    }

    /// No further events are expected for the attempt after this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub run_id: Option<RunId>,
    pub seq: Option<u64>,
    pub event: StreamEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Event(DecodedEvent),
    Done,
    Skip,
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(default, alias = "type")]
    event_type: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    run_id: Option<RunId>,
    #[serde(default)]
    seq: Option<u64>,
}

/// Decodes one raw frame. Flat and `run_id`/`seq` enveloped frames decode the same way;
/// when the JSON carries no discriminator the SSE event name is used instead.
pub fn decode_frame(frame: &SseFrame) -> EngineResult<FrameOutcome> {
    let data = frame.data.trim();
    if data.is_empty() {
        return Ok(FrameOutcome::Skip);
    }
    if data == DONE_SENTINEL {
        return Ok(FrameOutcome::Done);
    }

    let envelope: WireEnvelope = serde_json::from_str(data).context(MalformedFrameSnafu {
        stage: "decode-envelope",
        data: data.to_string(),
    })?;

    let Some(event_type) = envelope
        .event_type
        .or_else(|| frame.event.clone())
        .filter(|event_type| !event_type.trim().is_empty())
    else {
        return MissingEventTypeSnafu {
            stage: "decode-envelope",
            data: data.to_string(),
        }
        .fail();
    };

    let event = match event_type.as_str() {
        MESSAGE_CREATED => StreamEvent::Created(decode_payload(envelope.payload, data)?),
        MESSAGE_DELTA => StreamEvent::Delta(decode_payload(envelope.payload, data)?),
        MESSAGE_COMPLETED => StreamEvent::Completed(decode_payload(envelope.payload, data)?),
        MESSAGE_FAILED => StreamEvent::Failed(decode_payload(envelope.payload, data)?),
        _ => StreamEvent::Unknown {
            event_type,
            payload: envelope.payload,
        },
    };

    Ok(FrameOutcome::Event(DecodedEvent {
        run_id: envelope.run_id,
        seq: envelope.seq,
        event,
    }))
}

fn decode_payload<T: DeserializeOwned>(payload: Value, data: &str) -> EngineResult<T> {
    // A terminal event may legitimately carry no payload at all.
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };

    serde_json::from_value(payload).context(MalformedFrameSnafu {
        stage: "decode-payload",
        data: data.to_string(),
    })
}
