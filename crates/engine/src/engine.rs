use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use snafu::{ResultExt, ensure};
use tidewire_transport::{HttpTransport, Transport, TransportRequest};
use tokio_util::sync::CancellationToken;

use super::attempt::{Attempt, AttemptTransition, SettledStatus};
use super::bridge::{BridgeFieldSet, merge_bridge_fields, sanitize_bridge_fields};
use super::catalog::AgentCatalog;
use super::consumer::{ConsumerStep, EventStreamConsumer, StreamEnd};
use super::content::normalize_content;
use super::error::{
    CancelledSnafu, EncodeBodySnafu, EngineError, EngineResult, InvariantViolationSnafu,
    MalformedResponseSnafu, MissingConversationIdSnafu, MissingFieldSnafu, StreamClosedSnafu,
    TransportSnafu,
};
use super::event::{MessageCompleted, MessageCreated, MessageFailed, StreamEvent};
use super::ids::{AttemptNonce, ConversationId, Identifier, RunId};
use super::settings::EngineSettings;
use super::store::{ConversationStore, TimelineEvent};
use super::timeline::Timeline;
use super::types::{
    ImageGenerationRecord, ImageGenerationStatus, Message, Role, RunStatus, RunSummary,
    TimelineEntry,
};
use super::wire::{
    ImageGenerationRequest, SendMessageBody, SendMessageResponse, ServerMessage, messages_path,
};

/// Run error code recorded when the caller stops an attempt.
pub const CANCELLED_ERROR_CODE: &str = "CANCELLED";
/// Run error code recorded when the backend could not be reached or spoke garbage.
pub const TRANSPORT_ERROR_CODE: &str = "TRANSPORT_ERROR";

#[derive(Debug, Clone, PartialEq)]
pub enum SendKind {
    Chat { content: String },
    ImageGeneration { prompt: String, params: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    /// Raw identifier; a blank value is rejected before any I/O.
    pub conversation_id: String,
    pub kind: SendKind,
    /// `None` defers to `EngineSettings::prefer_streaming`.
    pub streaming: Option<bool>,
    pub model_preset: Option<Value>,
    /// Wins over the conversation's stored model override.
    pub override_logical_model: Option<String>,
}

impl SendRequest {
    pub fn chat(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            conversation_id,
            SendKind::Chat {
                content: content.into(),
            },
        )
    }

    pub fn image_generation(
        conversation_id: impl Into<String>,
        prompt: impl Into<String>,
        params: Value,
    ) -> Self {
        Self::new(
            conversation_id,
            SendKind::ImageGeneration {
                prompt: prompt.into(),
                params,
            },
        )
    }

    fn new(conversation_id: impl Into<String>, kind: SendKind) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            kind,
            streaming: None,
            model_preset: None,
            override_logical_model: None,
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = Some(streaming);
        self
    }

    pub fn with_model_preset(mut self, preset: Value) -> Self {
        self.model_preset = Some(preset);
        self
    }

    pub fn with_logical_model(mut self, model: impl Into<String>) -> Self {
        self.override_logical_model = Some(model.into());
        self
    }
}

/// Settled result of one attempt. A failed model run is reported here, not as an error.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub conversation_id: ConversationId,
    pub attempt: AttemptNonce,
    pub status: SettledStatus,
    pub user_message: Message,
    pub assistant_message: Message,
    pub baseline_run: Option<RunSummary>,
}

impl SendOutcome {
    pub fn is_failed_run(&self) -> bool {
        self.status == SettledStatus::Failed
    }
}

struct PreparedSend {
    conversation_id: ConversationId,
    body: SendMessageBody,
    payload: Value,
}

/// Owns optimistic timeline state and drives every send from insert to settle.
#[derive(Clone)]
pub struct ReconciliationEngine {
    transport: Arc<dyn Transport>,
    catalog: Arc<dyn AgentCatalog>,
    store: ConversationStore,
    settings: Arc<EngineSettings>,
}

impl ReconciliationEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        catalog: Arc<dyn AgentCatalog>,
        store: ConversationStore,
        settings: Arc<EngineSettings>,
    ) -> Self {
        Self {
            transport,
            catalog,
            store,
            settings,
        }
    }

    /// Engine talking HTTP to the backend configured in `settings`.
    pub fn with_http(
        settings: Arc<EngineSettings>,
        catalog: Arc<dyn AgentCatalog>,
        store: ConversationStore,
    ) -> EngineResult<Self> {
        let transport = HttpTransport::new(settings.to_transport_config())
            .context(TransportSnafu {
                stage: "build-transport",
            })?;
        Ok(Self::new(Arc::new(transport), catalog, store, settings))
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Replaces a conversation's timeline with server history, newest first.
    ///
    /// Refused while an attempt is pending so optimistic entries are never dropped.
    pub fn hydrate_timeline(
        &self,
        conversation_id: &ConversationId,
        history: Vec<ServerMessage>,
    ) -> bool {
        let entries = history
            .into_iter()
            .map(|record| record.into_entry(conversation_id, &self.settings.image_placeholder))
            .collect::<Vec<_>>();

        let hydrated = self.store.update(conversation_id, |state| {
            if state.is_pending() {
                return false;
            }
            state.timeline = Timeline::from_entries(entries);
            true
        });

        if hydrated {
            self.store.emit(TimelineEvent::Hydrated {
                conversation_id: conversation_id.clone(),
            });
        } else {
            tracing::warn!(
                conversation_id = %conversation_id,
                "attempt in flight; not replacing timeline with server history"
            );
        }
        hydrated
    }

    /// Sends one message and reconciles the timeline until the attempt settles.
    ///
    /// Returns `Ok` for both completed and failed model runs. Errors are local preconditions
    /// (nothing was inserted or sent), transport failures, or cancellation; in the last two
    /// cases the optimistic entries stay in the timeline and pending is cleared.
    pub async fn send(
        &self,
        request: SendRequest,
        cancel: CancellationToken,
    ) -> EngineResult<SendOutcome> {
        let prepared = self.prepare(request)?;
        let mut guard = AttemptGuard {
            engine: self,
            attempt: self.begin(&prepared),
            armed: true,
        };
        let streaming = prepared.body.streaming;

        tracing::info!(
            conversation_id = %guard.attempt.conversation_id,
            attempt = %guard.attempt.nonce,
            streaming,
            "send started"
        );

        let settled = if streaming {
            self.stream_attempt(&mut guard.attempt, prepared.payload, &cancel)
                .await
        } else {
            self.request_attempt(&mut guard.attempt, prepared.payload, &cancel)
                .await
        };

        // Nothing below awaits, so the attempt settles here or not at all.
        guard.armed = false;
        let attempt = &mut guard.attempt;
        match settled {
            Ok(status) => {
                self.settle(attempt, status);
                self.outcome(attempt, status)
            }
            Err(error) => Err(self.settle_after_error(attempt, error)),
        }
    }

    fn prepare(&self, request: SendRequest) -> EngineResult<PreparedSend> {
        ensure!(
            !request.conversation_id.trim().is_empty(),
            MissingConversationIdSnafu {
                stage: "validate-request",
            }
        );
        let conversation_id = ConversationId::parse(&request.conversation_id)?;

        let (content, image_generation) = match request.kind {
            SendKind::Chat { content } => {
                ensure!(
                    !content.trim().is_empty(),
                    MissingFieldSnafu {
                        stage: "validate-request",
                        field: "content",
                    }
                );
                (content, None)
            }
            SendKind::ImageGeneration { prompt, params } => {
                ensure!(
                    !prompt.trim().is_empty(),
                    MissingFieldSnafu {
                        stage: "validate-request",
                        field: "prompt",
                    }
                );
                (
                    prompt.clone(),
                    Some(ImageGenerationRequest { prompt, params }),
                )
            }
        };

        let override_logical_model = request
            .override_logical_model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .or_else(|| self.store.model_override(&conversation_id));

        let body = SendMessageBody {
            content,
            model_preset: request.model_preset,
            override_logical_model,
            streaming: request.streaming.unwrap_or(self.settings.prefer_streaming),
            bridge: self.bridge_fields(&conversation_id),
            image_generation,
        };
        let payload = serde_json::to_value(&body).context(EncodeBodySnafu {
            stage: "build-payload",
        })?;

        Ok(PreparedSend {
            conversation_id,
            body,
            payload,
        })
    }

    fn bridge_fields(&self, conversation_id: &ConversationId) -> BridgeFieldSet {
        let (agent_ids, tools, default_tools) = self.store.bridge_inputs(conversation_id);
        let merged = merge_bridge_fields(&agent_ids, &tools, &default_tools);
        let available = self.catalog.available_agent_ids();
        sanitize_bridge_fields(merged, available.as_ref())
    }

    /// Inserts the optimistic pair and marks the conversation pending. No I/O happens here.
    fn begin(&self, prepared: &PreparedSend) -> Attempt {
        let body = &prepared.body;
        let mut attempt = Attempt::new(
            prepared.conversation_id.clone(),
            body.image_generation.is_some(),
        );
        attempt.transition(AttemptTransition::Send);

        let now = Utc::now();
        let placeholder_run = RunSummary::new(
            RunId::placeholder(attempt.nonce),
            body.override_logical_model.clone().unwrap_or_default(),
        );
        let user = TimelineEntry::new(Message {
            message_id: attempt.user_id.clone(),
            conversation_id: attempt.conversation_id.clone(),
            role: Role::User,
            content: body.content.clone(),
            image_generation: None,
            created_at: now,
        })
        .with_run(placeholder_run);

        let (assistant_content, assistant_image) = match &body.image_generation {
            Some(request) => (
                self.settings.image_placeholder.clone(),
                Some(ImageGenerationRecord::pending(
                    request.prompt.clone(),
                    request.params.clone(),
                )),
            ),
            None => (self.settings.pending_placeholder.clone(), None),
        };
        let assistant = TimelineEntry::new(Message {
            message_id: attempt.assistant_id.clone(),
            conversation_id: attempt.conversation_id.clone(),
            role: Role::Assistant,
            content: assistant_content,
            image_generation: assistant_image,
            created_at: now,
        });

        let nonce = attempt.nonce;
        self.store.update(&attempt.conversation_id, |state| {
            state.timeline.push_attempt(nonce, user, assistant);
        });
        self.store.emit(TimelineEvent::EntriesInserted {
            conversation_id: attempt.conversation_id.clone(),
            attempt: nonce,
        });

        let already_running = self.store.begin_attempt(&attempt.conversation_id);
        if already_running > 0 {
            tracing::warn!(
                conversation_id = %attempt.conversation_id,
                attempt = %nonce,
                already_running,
                "conversation already has a send in flight; proceeding"
            );
        }
        attempt
    }

    async fn stream_attempt(
        &self,
        attempt: &mut Attempt,
        payload: Value,
        cancel: &CancellationToken,
    ) -> EngineResult<SettledStatus> {
        let request = TransportRequest::post(messages_path(&attempt.conversation_id), payload);
        let handle = self
            .transport
            .open_stream(request)
            .context(TransportSnafu {
                stage: "open-stream",
            })?;
        tokio::spawn(handle.worker);

        let mut consumer =
            EventStreamConsumer::new(handle.stream, cancel.clone(), Arc::clone(&self.transport));
        loop {
            match consumer.next().await? {
                ConsumerStep::Event(decoded) => {
                    attempt.observe_seq(decoded.seq);
                    if let Some(status) = self.apply_event(attempt, decoded.event) {
                        return Ok(status);
                    }
                }
                ConsumerStep::Finished(StreamEnd::Cancelled) => {
                    return CancelledSnafu {
                        stage: "read-stream",
                        conversation_id: attempt.conversation_id.clone(),
                        attempt: attempt.nonce,
                    }
                    .fail();
                }
                ConsumerStep::Finished(StreamEnd::Sentinel | StreamEnd::Closed) => {
                    return StreamClosedSnafu {
                        stage: "read-stream",
                    }
                    .fail();
                }
            }
        }
    }

    async fn request_attempt(
        &self,
        attempt: &mut Attempt,
        payload: Value,
        cancel: &CancellationToken,
    ) -> EngineResult<SettledStatus> {
        let request = TransportRequest::post(messages_path(&attempt.conversation_id), payload);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return CancelledSnafu {
                    stage: "await-response",
                    conversation_id: attempt.conversation_id.clone(),
                    attempt: attempt.nonce,
                }
                .fail();
            }
            response = self.transport.request(request) => response.context(TransportSnafu {
                stage: "send-message",
            })?,
        };

        let response: SendMessageResponse =
            serde_json::from_value(response).context(MalformedResponseSnafu {
                stage: "decode-response",
            })?;

        // Same reconcile-then-settle path the stream takes, minus the streaming states.
        self.apply_created(
            attempt,
            MessageCreated {
                user_message: response.user_message,
                assistant_message: response.assistant_message.clone(),
                baseline_run: None,
            },
        );
        Ok(self.apply_completed(
            attempt,
            MessageCompleted {
                output_text: response.output_text,
                assistant_message: response.assistant_message,
                baseline_run: response.baseline_run,
                image_generation: None,
            },
        ))
    }

    /// Applies one event; returns the settled status once a terminal event arrives.
    fn apply_event(&self, attempt: &mut Attempt, event: StreamEvent) -> Option<SettledStatus> {
        match event {
            StreamEvent::Created(created) => {
                attempt.transition(AttemptTransition::Stream);
                self.apply_created(attempt, created);
                None
            }
            StreamEvent::Delta(delta) => {
                attempt.transition(AttemptTransition::Stream);
                self.apply_delta(attempt, &delta.delta);
                None
            }
            StreamEvent::Completed(completed) => Some(self.apply_completed(attempt, completed)),
            StreamEvent::Failed(failed) => Some(self.apply_failed(attempt, failed)),
            StreamEvent::Unknown { event_type, .. } => {
                tracing::warn!(
                    attempt = %attempt.nonce,
                    event_type = %event_type,
                    "ignoring unknown stream event"
                );
                None
            }
        }
    }

    fn apply_created(&self, attempt: &mut Attempt, created: MessageCreated) {
        self.assign_server_id(attempt, Role::User, &created.user_message);
        if let Some(assistant) = &created.assistant_message {
            self.assign_server_id(attempt, Role::Assistant, assistant);
        }
        if let Some(run) = created.baseline_run {
            self.record_user_run(attempt, run);
        }
    }

    /// Swaps the temporary identifier for `role` with the server one, in place.
    fn assign_server_id(&self, attempt: &mut Attempt, role: Role, record: &ServerMessage) {
        let (temporary, current) = match role {
            Role::User => (attempt.user_temporary.clone(), attempt.user_id.clone()),
            Role::Assistant | Role::System => (
                attempt.assistant_temporary.clone(),
                attempt.assistant_id.clone(),
            ),
        };

        if let Identifier::Server(existing) = &current {
            if existing != &record.message_id {
                tracing::warn!(
                    attempt = %attempt.nonce,
                    existing = %existing,
                    received = %record.message_id,
                    "server identifier already assigned; ignoring a different one"
                );
            }
            return;
        }

        let server = record.message_id.clone();
        let created_at = record.created_at;
        let replaced = self.store.update(&attempt.conversation_id, |state| {
            if !state.timeline.replace_identifier(&temporary, server.clone()) {
                return false;
            }
            if let Some(created_at) = created_at
                && let Some(entry) = state.timeline.find_mut(&Identifier::Server(server.clone()))
            {
                entry.message.created_at = created_at;
            }
            true
        });

        if !replaced {
            tracing::warn!(
                attempt = %attempt.nonce,
                temporary = %temporary,
                "optimistic entry missing; cannot reconcile identifier"
            );
            return;
        }

        let reconciled = Identifier::Server(server.clone());
        match role {
            Role::User => attempt.user_id = reconciled,
            Role::Assistant | Role::System => attempt.assistant_id = reconciled,
        }
        self.store.emit(TimelineEvent::IdentifierReconciled {
            conversation_id: attempt.conversation_id.clone(),
            temporary,
            server,
        });
    }

    fn apply_delta(&self, attempt: &mut Attempt, fragment: &str) {
        attempt.streamed.push_str(fragment);
        let content = attempt.streamed.clone();
        let assistant_id = attempt.assistant_id.clone();

        if self.update_entry(attempt, &assistant_id, |entry| entry.message.content = content) {
            self.store.emit(TimelineEvent::ContentUpdated {
                conversation_id: attempt.conversation_id.clone(),
                message_id: assistant_id,
            });
        }
    }

    fn apply_completed(&self, attempt: &mut Attempt, completed: MessageCompleted) -> SettledStatus {
        if let Some(assistant) = &completed.assistant_message {
            self.assign_server_id(attempt, Role::Assistant, assistant);
        }

        // A run the server itself marks failed or canceled settles the way `message.failed` does.
        if let Some(run) = completed
            .baseline_run
            .as_ref()
            .filter(|run| matches!(run.status, RunStatus::Failed | RunStatus::Canceled))
        {
            let error_code = run.error_code.clone().or_else(|| {
                (run.status == RunStatus::Canceled).then(|| CANCELLED_ERROR_CODE.to_string())
            });
            return self.apply_failure(attempt, completed.baseline_run, error_code, None);
        }

        let normalized = completed
            .assistant_message
            .as_ref()
            .map(|message| normalize_content(&message.content, &self.settings.image_placeholder))
            .unwrap_or_default();
        let image_record = completed.image_generation.or(normalized.image_generation);

        let mut content = Some(normalized.content)
            .filter(|content| !content.is_empty())
            .or(completed.output_text.filter(|text| !text.is_empty()))
            .unwrap_or_else(|| attempt.streamed.clone());
        if content.is_empty() && attempt.image_generation {
            content = self.settings.image_placeholder.clone();
        }

        let assistant_id = attempt.assistant_id.clone();
        self.update_entry(attempt, &assistant_id, |entry| {
            entry.message.content = content;
            match image_record {
                Some(record) => entry.message.image_generation = Some(record),
                None => {
                    if let Some(pending) = entry
                        .message
                        .image_generation
                        .as_mut()
                        .filter(|record| !record.is_terminal())
                    {
                        pending.status = ImageGenerationStatus::Succeeded;
                    }
                }
            }
        });
        self.store.emit(TimelineEvent::ContentUpdated {
            conversation_id: attempt.conversation_id.clone(),
            message_id: assistant_id,
        });

        if let Some(run) = completed.baseline_run {
            self.record_user_run(attempt, run);
        }
        self.settle_user_run(attempt, RunStatus::Succeeded, None);
        SettledStatus::Completed
    }

    fn apply_failed(&self, attempt: &mut Attempt, failed: MessageFailed) -> SettledStatus {
        let error_code = failed.error_code().map(str::to_string);
        let message = failed.error_message().map(str::to_string);
        self.apply_failure(attempt, failed.baseline_run, error_code, message)
    }

    fn apply_failure(
        &self,
        attempt: &mut Attempt,
        run: Option<RunSummary>,
        error_code: Option<String>,
        message: Option<String>,
    ) -> SettledStatus {
        tracing::info!(
            conversation_id = %attempt.conversation_id,
            attempt = %attempt.nonce,
            error_code = ?error_code,
            "model run failed"
        );

        let failure_placeholder = self.settings.failure_placeholder.clone();
        let image_error = message.or_else(|| error_code.clone());
        let assistant_id = attempt.assistant_id.clone();
        self.update_entry(attempt, &assistant_id, |entry| {
            entry.message.content = failure_placeholder;
            mark_image_failed(entry, image_error);
        });
        self.store.emit(TimelineEvent::ContentUpdated {
            conversation_id: attempt.conversation_id.clone(),
            message_id: assistant_id,
        });

        if let Some(mut run) = run {
            if run.error_code.is_none() {
                run.error_code = error_code.clone();
            }
            self.record_user_run(attempt, run);
        }
        self.settle_user_run(attempt, RunStatus::Failed, error_code);
        SettledStatus::Failed
    }

    fn record_user_run(&self, attempt: &Attempt, run: RunSummary) {
        let user_id = attempt.user_id.clone();
        self.update_entry(attempt, &user_id, |entry| {
            entry.record_run(run);
        });
    }

    fn settle_user_run(&self, attempt: &Attempt, status: RunStatus, error_code: Option<String>) {
        let user_id = attempt.user_id.clone();
        self.update_entry(attempt, &user_id, |entry| {
            if let Some(run) = entry.run.as_mut()
                && run.settle(status, error_code)
                && let Some(history) = entry
                    .runs
                    .iter_mut()
                    .find(|existing| existing.run_id == run.run_id)
            {
                *history = run.clone();
            }
        });
    }

    fn update_entry(
        &self,
        attempt: &Attempt,
        id: &Identifier,
        apply: impl FnOnce(&mut TimelineEntry),
    ) -> bool {
        self.store
            .update(&attempt.conversation_id, |state| {
                state.timeline.find_mut(id).map(apply)
            })
            .is_some()
    }

    fn settle(&self, attempt: &mut Attempt, status: SettledStatus) {
        attempt.transition(AttemptTransition::Settle(status));
        if attempt.has_temporary_ids() {
            tracing::warn!(
                conversation_id = %attempt.conversation_id,
                attempt = %attempt.nonce,
                "attempt settled with temporary identifiers still in place"
            );
        }

        self.store.finish_attempt(&attempt.conversation_id);
        self.store.emit(TimelineEvent::Settled {
            conversation_id: attempt.conversation_id.clone(),
            attempt: attempt.nonce,
            status,
        });
        tracing::info!(
            conversation_id = %attempt.conversation_id,
            attempt = %attempt.nonce,
            ?status,
            "send settled"
        );
    }

    /// Marks the attempt failed after a transport error or cancellation and hands the error back.
    fn settle_after_error(&self, attempt: &mut Attempt, error: EngineError) -> EngineError {
        let (run_status, error_code) = if error.is_cancellation() {
            tracing::info!(
                conversation_id = %attempt.conversation_id,
                attempt = %attempt.nonce,
                "send cancelled"
            );
            (RunStatus::Canceled, CANCELLED_ERROR_CODE)
        } else {
            tracing::error!(
                conversation_id = %attempt.conversation_id,
                attempt = %attempt.nonce,
                stage = error.stage(),
                error = %error,
                "send failed"
            );
            (RunStatus::Failed, TRANSPORT_ERROR_CODE)
        };

        // Partial streamed text survives a cancel; otherwise the failure placeholder is shown.
        let content = if error.is_cancellation() && !attempt.streamed.is_empty() {
            attempt.streamed.clone()
        } else {
            self.settings.failure_placeholder.clone()
        };
        let image_error = Some(error.to_string());
        let assistant_id = attempt.assistant_id.clone();
        self.update_entry(attempt, &assistant_id, |entry| {
            entry.message.content = content;
            mark_image_failed(entry, image_error);
        });
        self.settle_user_run(attempt, run_status, Some(error_code.to_string()));
        self.settle(attempt, SettledStatus::Failed);
        error
    }

    fn outcome(&self, attempt: &Attempt, status: SettledStatus) -> EngineResult<SendOutcome> {
        let timeline = self
            .store
            .timeline(&attempt.conversation_id)
            .unwrap_or_default();

        let Some(user) = timeline.find(&attempt.user_id) else {
            return InvariantViolationSnafu {
                stage: "build-outcome",
                details: format!("user entry {} missing from timeline", attempt.user_id),
            }
            .fail();
        };
        let Some(assistant) = timeline.find(&attempt.assistant_id) else {
            return InvariantViolationSnafu {
                stage: "build-outcome",
                details: format!(
                    "assistant entry {} missing from timeline",
                    attempt.assistant_id
                ),
            }
            .fail();
        };

        Ok(SendOutcome {
            conversation_id: attempt.conversation_id.clone(),
            attempt: attempt.nonce,
            status,
            user_message: user.message.clone(),
            assistant_message: assistant.message.clone(),
            baseline_run: user.run.clone(),
        })
    }
}

/// Settles its attempt as cancelled when the send future is dropped before settling.
struct AttemptGuard<'a> {
    engine: &'a ReconciliationEngine,
    attempt: Attempt,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::info!(
            conversation_id = %self.attempt.conversation_id,
            attempt = %self.attempt.nonce,
            "send dropped before settling"
        );
        let dropped = EngineError::Cancelled {
            stage: "drop-attempt",
            conversation_id: self.attempt.conversation_id.clone(),
            attempt: self.attempt.nonce,
        };
        self.engine.settle_after_error(&mut self.attempt, dropped);
    }
}

fn mark_image_failed(entry: &mut TimelineEntry, error: Option<String>) {
    if let Some(record) = entry
        .message
        .image_generation
        .as_mut()
        .filter(|record| !record.is_terminal())
    {
        record.status = ImageGenerationStatus::Failed;
        record.error = error;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use serde_json::json;
    use tidewire_transport::{SseFrame, TransportError, TransportResult};

    use super::*;
    use crate::bridge::ToolSelections;
    use crate::catalog::StaticAgentCatalog;
    use crate::ids::ServerMessageId;
    use crate::test_support::ScriptedTransport;

    const CONVERSATION: &str = "conv-1";

    fn conversation() -> ConversationId {
        ConversationId::parse(CONVERSATION).expect("id")
    }

    fn engine_with(
        transport: &Arc<ScriptedTransport>,
        catalog: StaticAgentCatalog,
    ) -> ReconciliationEngine {
        let transport: Arc<dyn Transport> = transport.clone();
        ReconciliationEngine::new(
            transport,
            Arc::new(catalog),
            ConversationStore::new(),
            Arc::new(EngineSettings::default()),
        )
    }

    fn engine(transport: &Arc<ScriptedTransport>) -> ReconciliationEngine {
        engine_with(transport, StaticAgentCatalog::unknown())
    }

    fn frame(event_type: &str, payload: Value) -> TransportResult<SseFrame> {
        Ok(SseFrame::data(
            json!({"run_id": "run-1", "event_type": event_type, "payload": payload}).to_string(),
        ))
    }

    fn created() -> TransportResult<SseFrame> {
        frame(
            "message.created",
            json!({
                "user_message": {"message_id": "msg-u", "role": "user", "content": "hello"},
                "assistant_message": {"message_id": "msg-a", "role": "assistant", "content": ""},
                "baseline_run": {"run_id": "run-1", "status": "running"}
            }),
        )
    }

    fn delta(text: &str) -> TransportResult<SseFrame> {
        frame("message.delta", json!({"delta": text}))
    }

    fn completed(payload: Value) -> TransportResult<SseFrame> {
        frame("message.completed", payload)
    }

    fn entry<'a>(timeline: &'a Timeline, raw: &str) -> &'a TimelineEntry {
        timeline
            .find(&Identifier::Server(ServerMessageId::parse(raw).expect("id")))
            .expect("entry present")
    }

    #[tokio::test]
    async fn final_content_replaces_streamed_deltas() {
        let transport = Arc::new(ScriptedTransport::new().with_frames(vec![
            created(),
            delta("hi"),
            completed(json!({
                "output_text": "hi",
                "baseline_run": {"run_id": "run-1", "status": "succeeded"}
            })),
        ]));
        let engine = engine(&transport);

        let outcome = engine
            .send(SendRequest::chat(CONVERSATION, "hello"), CancellationToken::new())
            .await
            .expect("send settles");

        assert_eq!(outcome.status, SettledStatus::Completed);
        assert_eq!(outcome.assistant_message.content, "hi");
        assert_eq!(
            outcome.baseline_run.as_ref().map(|run| run.status),
            Some(RunStatus::Succeeded)
        );

        let timeline = engine.store().timeline(&conversation()).expect("timeline");
        assert_eq!(timeline.len(), 2);
        assert!(timeline.temporary_ids().is_empty());
        assert_eq!(entry(&timeline, "msg-a").message.content, "hi");
        assert_eq!(entry(&timeline, "msg-u").runs.len(), 1);
        assert!(!engine.store().is_pending(&conversation()));
        assert_eq!(
            transport.request_paths(),
            vec!["/v1/conversations/conv-1/messages".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_run_resolves_instead_of_erroring() {
        let transport = Arc::new(ScriptedTransport::new().with_frames(vec![
            created(),
            frame(
                "message.failed",
                json!({
                    "error_code": "RATE_LIMIT_EXCEEDED",
                    "baseline_run": {"run_id": "run-1", "status": "failed"}
                }),
            ),
        ]));
        let engine = engine(&transport);

        let outcome = engine
            .send(SendRequest::chat(CONVERSATION, "hello"), CancellationToken::new())
            .await
            .expect("failed run is not an error");

        assert!(outcome.is_failed_run());
        let run = outcome.baseline_run.expect("run");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_code.as_deref(), Some("RATE_LIMIT_EXCEEDED"));
        assert_eq!(
            outcome.assistant_message.content,
            engine.settings().failure_placeholder
        );
        assert!(!engine.store().is_pending(&conversation()));
    }

    #[tokio::test]
    async fn completion_with_canceled_run_settles_as_failed() {
        let transport = Arc::new(ScriptedTransport::new().with_frames(vec![
            created(),
            delta("par"),
            completed(json!({"baseline_run": {"run_id": "run-1", "status": "canceled"}})),
        ]));
        let engine = engine(&transport);

        let outcome = engine
            .send(SendRequest::chat(CONVERSATION, "hello"), CancellationToken::new())
            .await
            .expect("canceled run is not an error");

        assert!(outcome.is_failed_run());
        let run = outcome.baseline_run.expect("run");
        assert_eq!(run.status, RunStatus::Canceled);
        assert_eq!(run.error_code.as_deref(), Some(CANCELLED_ERROR_CODE));
        assert_eq!(
            outcome.assistant_message.content,
            engine.settings().failure_placeholder
        );
        assert!(!engine.store().is_pending(&conversation()));
    }

    #[tokio::test]
    async fn failure_without_run_settles_the_placeholder_run() {
        let transport = Arc::new(ScriptedTransport::new().with_frames(vec![
            created(),
            frame(
                "message.failed",
                json!({"error": {"code": "MODEL_OVERLOADED", "message": "busy"}}),
            ),
        ]));
        let engine = engine(&transport);

        let outcome = engine
            .send(SendRequest::chat(CONVERSATION, "hello"), CancellationToken::new())
            .await
            .expect("settles");

        let run = outcome.baseline_run.expect("run");
        assert_eq!(run.run_id.as_str(), "run-1");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_code.as_deref(), Some("MODEL_OVERLOADED"));
    }

    #[tokio::test]
    async fn streaming_and_blocking_sends_settle_to_the_same_shape() {
        let streaming_transport = Arc::new(ScriptedTransport::new().with_frames(vec![
            created(),
            delta("h"),
            delta("i"),
            completed(json!({
                "output_text": "hi",
                "baseline_run": {"run_id": "run-1", "status": "succeeded"}
            })),
        ]));
        let blocking_transport = Arc::new(ScriptedTransport::new().with_response(Ok(json!({
            "user_message": {"message_id": "msg-u", "role": "user", "content": "hello"},
            "assistant_message": {
                "message_id": "msg-a",
                "role": "assistant",
                "content": [{"type": "output_text", "text": "hi"}]
            },
            "baseline_run": {"run_id": "run-1", "status": "succeeded"}
        }))));

        let streamed = engine(&streaming_transport)
            .send(
                SendRequest::chat(CONVERSATION, "hello").with_streaming(true),
                CancellationToken::new(),
            )
            .await
            .expect("streamed");
        let blocking = engine(&blocking_transport)
            .send(
                SendRequest::chat(CONVERSATION, "hello").with_streaming(false),
                CancellationToken::new(),
            )
            .await
            .expect("blocking");

        assert_eq!(streamed.status, blocking.status);
        assert_eq!(
            streamed.assistant_message.content,
            blocking.assistant_message.content
        );
        assert_eq!(
            streamed.assistant_message.message_id,
            blocking.assistant_message.message_id
        );
        assert_eq!(streamed.user_message.message_id, blocking.user_message.message_id);
        assert_eq!(
            streamed.baseline_run.map(|run| run.status),
            blocking.baseline_run.map(|run| run.status)
        );

        let body = blocking_transport.requests()[0].body.clone().expect("body");
        assert_eq!(body["streaming"], json!(false));
    }

    #[tokio::test]
    async fn blocking_response_with_failed_run_resolves_as_failed() {
        let transport = Arc::new(ScriptedTransport::new().with_response(Ok(json!({
            "user_message": {"message_id": "msg-u", "role": "user", "content": "hello"},
            "assistant_message": {"message_id": "msg-a", "role": "assistant", "content": ""},
            "baseline_run": {"run_id": "run-1", "status": "failed", "error_code": "CONTENT_FILTER"}
        }))));
        let engine = engine(&transport);

        let outcome = engine
            .send(
                SendRequest::chat(CONVERSATION, "hello").with_streaming(false),
                CancellationToken::new(),
            )
            .await
            .expect("settles");

        assert!(outcome.is_failed_run());
        assert_eq!(
            outcome.baseline_run.and_then(|run| run.error_code).as_deref(),
            Some("CONTENT_FILTER")
        );
    }

    #[tokio::test]
    async fn transport_failure_keeps_entries_and_clears_pending() {
        let transport = Arc::new(ScriptedTransport::new().failing_open(
            TransportError::HttpStatus {
                stage: "open-stream",
                status: 503,
                body: "unavailable".to_string(),
            },
        ));
        let engine = engine(&transport);

        let error = engine
            .send(SendRequest::chat(CONVERSATION, "hello"), CancellationToken::new())
            .await
            .expect_err("transport failure");

        assert!(error.is_transport());
        assert!(!error.is_cancellation());
        assert!(!engine.store().is_pending(&conversation()));

        let timeline = engine.store().timeline(&conversation()).expect("timeline");
        assert_eq!(timeline.len(), 2);
        let assistant = &timeline.entries()[0];
        let user = &timeline.entries()[1];
        assert_eq!(user.message.content, "hello");
        assert_eq!(assistant.message.content, engine.settings().failure_placeholder);
        let run = user.run.as_ref().expect("placeholder run");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_code.as_deref(), Some(TRANSPORT_ERROR_CODE));
    }

    #[tokio::test]
    async fn malformed_blocking_response_is_a_transport_failure() {
        let transport = Arc::new(
            ScriptedTransport::new().with_response(Ok(json!({"unexpected": true}))),
        );
        let engine = engine(&transport);

        let error = engine
            .send(
                SendRequest::chat(CONVERSATION, "hello").with_streaming(false),
                CancellationToken::new(),
            )
            .await
            .expect_err("malformed");

        assert!(error.is_transport());
        assert_eq!(error.stage(), "decode-response");
    }

    #[tokio::test]
    async fn preconditions_fail_before_any_request() {
        let transport = Arc::new(ScriptedTransport::new());
        let engine = engine(&transport);

        let missing_conversation = engine
            .send(SendRequest::chat("  ", "hello"), CancellationToken::new())
            .await
            .expect_err("no conversation");
        let missing_content = engine
            .send(SendRequest::chat(CONVERSATION, " "), CancellationToken::new())
            .await
            .expect_err("no content");
        let missing_prompt = engine
            .send(
                SendRequest::image_generation(CONVERSATION, "", json!({})),
                CancellationToken::new(),
            )
            .await
            .expect_err("no prompt");

        assert!(matches!(
            missing_conversation,
            EngineError::MissingConversationId { .. }
        ));
        assert!(matches!(
            missing_content,
            EngineError::MissingField { field: "content", .. }
        ));
        assert!(matches!(
            missing_prompt,
            EngineError::MissingField { field: "prompt", .. }
        ));
        assert!(missing_content.is_precondition());
        assert!(transport.requests().is_empty());
        assert!(engine.store().timeline(&conversation()).is_none());
    }

    #[tokio::test]
    async fn cancellation_keeps_entries_and_notifies_backend() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .with_frames(vec![created(), delta("par")])
                .holding_stream_open(),
        );
        let engine = engine(&transport);
        let mut events = engine.store().subscribe();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let (result, _) = tokio::join!(
            engine.send(SendRequest::chat(CONVERSATION, "hello"), cancel),
            async move {
                while let Ok(event) = events.recv().await {
                    if matches!(event, TimelineEvent::ContentUpdated { .. }) {
                        trigger.cancel();
                        break;
                    }
                }
            }
        );

        let error = result.expect_err("cancelled");
        assert!(error.is_cancellation());
        assert!(!error.is_transport());
        assert!(!engine.store().is_pending(&conversation()));

        let timeline = engine.store().timeline(&conversation()).expect("timeline");
        assert_eq!(timeline.len(), 2);
        assert!(timeline.temporary_ids().is_empty());
        assert_eq!(entry(&timeline, "msg-a").message.content, "par");
        let run = entry(&timeline, "msg-u").run.clone().expect("run");
        assert_eq!(run.status, RunStatus::Canceled);
        assert_eq!(run.error_code.as_deref(), Some(CANCELLED_ERROR_CODE));

        assert!(transport.wait_for_request("/v1/runs/run-1/cancel").await);
    }

    #[tokio::test]
    async fn dropped_send_settles_as_cancelled() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .with_frames(vec![created()])
                .holding_stream_open(),
        );
        let engine = engine(&transport);

        let elapsed = tokio::time::timeout(
            Duration::from_millis(50),
            engine.send(SendRequest::chat(CONVERSATION, "hello"), CancellationToken::new()),
        )
        .await;

        assert!(elapsed.is_err(), "stream never ends on its own");
        assert!(!engine.store().is_pending(&conversation()));
        let timeline = engine.store().timeline(&conversation()).expect("timeline");
        assert_eq!(timeline.len(), 2);
        assert_eq!(
            entry(&timeline, "msg-a").message.content,
            engine.settings().failure_placeholder
        );
        let run = entry(&timeline, "msg-u").run.clone().expect("run");
        assert_eq!(run.status, RunStatus::Canceled);
        assert_eq!(run.error_code.as_deref(), Some(CANCELLED_ERROR_CODE));
        assert!(engine.hydrate_timeline(&conversation(), Vec::new()));
    }

    #[tokio::test]
    async fn overlapping_sends_stay_pending_until_the_last_settles() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .with_frames(vec![created()])
                .holding_stream_open()
                .with_response(Ok(json!({
                    "user_message": {"message_id": "msg-u2", "role": "user", "content": "two"},
                    "assistant_message": {"message_id": "msg-a2", "role": "assistant", "content": "2"}
                }))),
        );
        let engine = engine(&transport);
        let mut events = engine.store().subscribe();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let (first, (second, pending_between)) = tokio::join!(
            engine.send(SendRequest::chat(CONVERSATION, "one"), cancel),
            async {
                while let Ok(event) = events.recv().await {
                    if matches!(event, TimelineEvent::IdentifierReconciled { .. }) {
                        break;
                    }
                }
                let second = engine
                    .send(
                        SendRequest::chat(CONVERSATION, "two").with_streaming(false),
                        CancellationToken::new(),
                    )
                    .await;
                let pending_between = engine.store().is_pending(&conversation());
                trigger.cancel();
                (second, pending_between)
            }
        );

        assert!(first.expect_err("cancelled").is_cancellation());
        assert_eq!(second.expect("second settles").assistant_message.content, "2");
        assert!(pending_between, "first send was still in flight");
        assert!(!engine.store().is_pending(&conversation()));
    }

    #[tokio::test]
    async fn unknown_events_are_ignored() {
        let transport = Arc::new(ScriptedTransport::new().with_frames(vec![
            created(),
            frame("run.heartbeat", json!({"beat": 1})),
            delta("x"),
            completed(json!({})),
        ]));
        let engine = engine(&transport);

        let outcome = engine
            .send(SendRequest::chat(CONVERSATION, "hello"), CancellationToken::new())
            .await
            .expect("settles");

        assert_eq!(outcome.assistant_message.content, "x");
        assert_eq!(
            outcome.baseline_run.map(|run| run.status),
            Some(RunStatus::Succeeded)
        );
    }

    #[tokio::test]
    async fn deltas_append_in_arrival_order_without_final_content() {
        let transport = Arc::new(ScriptedTransport::new().with_frames(vec![
            created(),
            delta("a"),
            delta("b"),
            delta("a"),
            completed(json!({})),
        ]));
        let engine = engine(&transport);

        let outcome = engine
            .send(SendRequest::chat(CONVERSATION, "hello"), CancellationToken::new())
            .await
            .expect("settles");

        assert_eq!(outcome.assistant_message.content, "aba");
    }

    #[tokio::test]
    async fn stream_closing_before_terminal_event_is_a_transport_failure() {
        let transport = Arc::new(
            ScriptedTransport::new().with_frames(vec![created(), Ok(SseFrame::data("[DONE]"))]),
        );
        let engine = engine(&transport);

        let error = engine
            .send(SendRequest::chat(CONVERSATION, "hello"), CancellationToken::new())
            .await
            .expect_err("closed early");

        assert!(matches!(error, EngineError::StreamClosed { .. }));
        assert!(!engine.store().is_pending(&conversation()));
        let timeline = engine.store().timeline(&conversation()).expect("timeline");
        assert!(timeline.temporary_ids().is_empty());
    }

    #[tokio::test]
    async fn outbound_body_carries_sanitized_bridge_fields_and_model_override() {
        let transport = Arc::new(ScriptedTransport::new().with_response(Ok(json!({
            "user_message": {"message_id": "msg-u", "role": "user", "content": "hello"},
            "assistant_message": {"message_id": "msg-a", "role": "assistant", "content": "ok"}
        }))));
        let engine = engine_with(&transport, StaticAgentCatalog::new(["agentA"]));

        let mut defaults = ToolSelections::new();
        defaults.insert("agentA".to_string(), vec!["search".to_string()]);
        engine.store().set_default_tool_selections(defaults);
        let mut conversation_tools = ToolSelections::new();
        conversation_tools.insert("agentB".to_string(), vec!["browse".to_string()]);
        engine
            .store()
            .set_tool_selections(&conversation(), conversation_tools);
        engine
            .store()
            .set_model_override(&conversation(), Some("large".to_string()));

        engine
            .send(
                SendRequest::chat(CONVERSATION, "hello").with_streaming(false),
                CancellationToken::new(),
            )
            .await
            .expect("settles");

        let body = transport.requests()[0].body.clone().expect("body");
        assert_eq!(body["bridge_agent_ids"], json!(["agentA"]));
        assert_eq!(
            body["bridge_tool_selections"],
            json!([{"agent_id": "agentA", "tool_names": ["search"]}])
        );
        assert_eq!(body["override_logical_model"], json!("large"));
    }

    #[tokio::test]
    async fn request_model_wins_and_unknown_catalogue_drops_bridge_fields() {
        let transport = Arc::new(ScriptedTransport::new().with_response(Ok(json!({
            "user_message": {"message_id": "msg-u", "role": "user", "content": "hello"}
        }))));
        let engine = engine(&transport);
        engine
            .store()
            .set_bridge_agent_ids(&conversation(), vec!["agentA".to_string()]);
        engine
            .store()
            .set_model_override(&conversation(), Some("large".to_string()));

        engine
            .send(
                SendRequest::chat(CONVERSATION, "hello")
                    .with_streaming(false)
                    .with_logical_model("small")
                    .with_model_preset(json!({"temperature": 0.2})),
                CancellationToken::new(),
            )
            .await
            .expect("settles");

        let body = transport.requests()[0].body.clone().expect("body");
        let keys = body
            .as_object()
            .expect("object")
            .keys()
            .cloned()
            .collect::<HashSet<_>>();
        assert!(!keys.contains("bridge_agent_ids"));
        assert!(!keys.contains("bridge_tool_selections"));
        assert_eq!(body["override_logical_model"], json!("small"));
        assert_eq!(body["model_preset"], json!({"temperature": 0.2}));
    }

    #[tokio::test]
    async fn image_generation_moves_from_pending_to_succeeded() {
        let transport = Arc::new(ScriptedTransport::new().with_frames(vec![
            created(),
            completed(json!({
                "image_generation": {
                    "status": "succeeded",
                    "prompt": "a lighthouse",
                    "images": [{"url": "https://cdn.example.com/1.png"}]
                }
            })),
        ]));
        let engine = engine(&transport);
        let mut events = engine.store().subscribe();

        let outcome = engine
            .send(
                SendRequest::image_generation(CONVERSATION, "a lighthouse", json!({"n": 1})),
                CancellationToken::new(),
            )
            .await
            .expect("settles");

        let TimelineEvent::EntriesInserted { .. } = events.recv().await.expect("event") else {
            panic!("optimistic insert comes first");
        };
        let record = outcome.assistant_message.image_generation.expect("record");
        assert_eq!(record.status, ImageGenerationStatus::Succeeded);
        assert_eq!(record.images.len(), 1);
        assert_eq!(
            outcome.assistant_message.content,
            engine.settings().image_placeholder
        );

        let body = transport.requests()[0].body.clone().expect("body");
        assert_eq!(body["content"], json!("a lighthouse"));
        assert_eq!(
            body["image_generation"],
            json!({"prompt": "a lighthouse", "params": {"n": 1}})
        );
    }

    #[tokio::test]
    async fn image_generation_failure_marks_record_failed() {
        let transport = Arc::new(ScriptedTransport::new().with_frames(vec![
            created(),
            frame(
                "message.failed",
                json!({"error": {"code": "IMAGE_REJECTED", "message": "unsafe prompt"}}),
            ),
        ]));
        let engine = engine(&transport);

        let outcome = engine
            .send(
                SendRequest::image_generation(CONVERSATION, "something", json!({})),
                CancellationToken::new(),
            )
            .await
            .expect("settles");

        let record = outcome.assistant_message.image_generation.expect("record");
        assert_eq!(record.status, ImageGenerationStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("unsafe prompt"));
    }

    #[tokio::test]
    async fn attempt_memo_follows_reconciled_identifiers() {
        let transport = Arc::new(
            ScriptedTransport::new().with_frames(vec![created(), completed(json!({}))]),
        );
        let engine = engine(&transport);

        let outcome = engine
            .send(SendRequest::chat(CONVERSATION, "hello"), CancellationToken::new())
            .await
            .expect("settles");

        let timeline = engine.store().timeline(&conversation()).expect("timeline");
        for raw in ["msg-u", "msg-a"] {
            let id = Identifier::Server(ServerMessageId::parse(raw).expect("id"));
            assert_eq!(timeline.attempt_of(&id), Some(outcome.attempt));
        }
    }

    #[tokio::test]
    async fn each_attempt_gets_its_own_entries() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .with_response(Ok(json!({
                    "user_message": {"message_id": "msg-u1", "role": "user", "content": "one"},
                    "assistant_message": {"message_id": "msg-a1", "role": "assistant", "content": "1"}
                })))
                .with_response(Ok(json!({
                    "user_message": {"message_id": "msg-u2", "role": "user", "content": "two"},
                    "assistant_message": {"message_id": "msg-a2", "role": "assistant", "content": "2"}
                }))),
        );
        let engine = engine(&transport);

        let first = engine
            .send(
                SendRequest::chat(CONVERSATION, "one").with_streaming(false),
                CancellationToken::new(),
            )
            .await
            .expect("first");
        let second = engine
            .send(
                SendRequest::chat(CONVERSATION, "two").with_streaming(false),
                CancellationToken::new(),
            )
            .await
            .expect("second");

        assert_ne!(first.attempt, second.attempt);
        let timeline = engine.store().timeline(&conversation()).expect("timeline");
        let ids = timeline
            .entries()
            .iter()
            .map(|entry| entry.id().as_str().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["msg-a2", "msg-u2", "msg-a1", "msg-u1"]);
    }

    #[tokio::test]
    async fn hydration_is_refused_while_pending() {
        let transport = Arc::new(ScriptedTransport::new());
        let engine = engine(&transport);
        let history = vec![
            serde_json::from_value::<ServerMessage>(json!({
                "message_id": "msg-2", "role": "assistant", "content": "later"
            }))
            .expect("record"),
            serde_json::from_value::<ServerMessage>(json!({
                "message_id": "msg-1", "role": "user", "content": "earlier"
            }))
            .expect("record"),
        ];

        assert!(engine.hydrate_timeline(&conversation(), history.clone()));
        let timeline = engine.store().timeline(&conversation()).expect("timeline");
        assert_eq!(timeline.entries()[0].message.content, "later");

        engine.store().begin_attempt(&conversation());
        assert!(!engine.hydrate_timeline(&conversation(), Vec::new()));
        assert_eq!(
            engine.store().timeline(&conversation()).expect("timeline").len(),
            2
        );
    }
}
