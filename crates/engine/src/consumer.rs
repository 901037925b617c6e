use std::sync::Arc;

use serde_json::json;
use tidewire_transport::{FrameStream, Transport, TransportRequest};
use tokio_util::sync::CancellationToken;

use super::error::{EngineError, EngineResult};
use super::event::{DecodedEvent, FrameOutcome, StreamEvent, decode_frame};
use super::ids::RunId;
use super::wire::cancel_run_path;

/// Why the consumer stopped reading without handing out a terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Sentinel,
    Closed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerStep {
    Event(DecodedEvent),
    Finished(StreamEnd),
}

/// Reads one attempt's frames, decodes them and hands them out in arrival order.
///
/// The cancellation token is checked at every frame boundary. `seq` numbers are passed
/// through untouched.
pub struct EventStreamConsumer {
    stream: FrameStream,
    cancel: CancellationToken,
    transport: Arc<dyn Transport>,
    run_id: Option<RunId>,
    finished: Option<StreamEnd>,
}

impl EventStreamConsumer {
    pub fn new(
        stream: FrameStream,
        cancel: CancellationToken,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            stream,
            cancel,
            transport,
            run_id: None,
            finished: None,
        }
    }

    /// Latest run id seen on the wire, used for the backend cancel notification.
    pub fn run_id(&self) -> Option<&RunId> {
        self.run_id.as_ref()
    }

    pub async fn next(&mut self) -> EngineResult<ConsumerStep> {
        if let Some(end) = self.finished {
            return Ok(ConsumerStep::Finished(end));
        }

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.stop_cancelled());
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                frame = self.stream.recv() => Some(frame),
            };
            let Some(frame) = next else {
                return Ok(self.stop_cancelled());
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(source)) => {
                    self.release(StreamEnd::Closed);
                    return Err(EngineError::Transport {
                        stage: "read-frame",
                        source,
                    });
                }
                None => {
                    self.finished = Some(StreamEnd::Closed);
                    return Ok(ConsumerStep::Finished(StreamEnd::Closed));
                }
            };

            let decoded = match decode_frame(&frame) {
                Ok(FrameOutcome::Skip) => continue,
                Ok(FrameOutcome::Done) => {
                    self.release(StreamEnd::Sentinel);
                    return Ok(ConsumerStep::Finished(StreamEnd::Sentinel));
                }
                Ok(FrameOutcome::Event(decoded)) => decoded,
                Err(error) => {
                    self.release(StreamEnd::Closed);
                    return Err(error);
                }
            };

            self.remember_run_id(&decoded);
            tracing::debug!(
                event_type = decoded.event.event_type(),
                seq = ?decoded.seq,
                "stream event decoded"
            );

            if decoded.event.is_terminal() {
                self.release(StreamEnd::Closed);
            }
            return Ok(ConsumerStep::Event(decoded));
        }
    }

    fn remember_run_id(&mut self, decoded: &DecodedEvent) {
        let from_payload = match &decoded.event {
            StreamEvent::Created(created) => created.baseline_run.as_ref(),
            StreamEvent::Completed(completed) => completed.baseline_run.as_ref(),
            StreamEvent::Failed(failed) => failed.baseline_run.as_ref(),
            StreamEvent::Delta(_) | StreamEvent::Unknown { .. } => None,
        }
        .map(|run| &run.run_id);

        if let Some(run_id) = decoded.run_id.as_ref().or(from_payload) {
            self.run_id = Some(run_id.clone());
        }
    }

    fn release(&mut self, end: StreamEnd) {
        self.finished = Some(end);
        self.stream.cancel();
    }

    fn stop_cancelled(&mut self) -> ConsumerStep {
        self.release(StreamEnd::Cancelled);
        self.notify_backend_cancel();
        ConsumerStep::Finished(StreamEnd::Cancelled)
    }

    /// Fire-and-forget: the local stop never waits on this request.
    fn notify_backend_cancel(&self) {
        let Some(run_id) = self.run_id.clone() else {
            tracing::debug!("no run id known yet; skipping backend cancel notification");
            return;
        };

        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let request = TransportRequest::post(cancel_run_path(&run_id), json!({}));
            match transport.request(request).await {
                Ok(_) => tracing::debug!(run_id = %run_id, "backend acknowledged cancel"),
                Err(error) => {
                    tracing::warn!(run_id = %run_id, error = %error, "backend cancel notification failed")
                }
            }
        });
    }
}
