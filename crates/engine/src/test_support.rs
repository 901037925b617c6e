use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;
use tidewire_transport::{
    BoxFuture, FrameStreamHandle, SseFrame, Transport, TransportError, TransportRequest,
    TransportResult, TransportWorker, make_frame_stream,
};

/// In-memory transport replaying scripted frames and responses, recording every request.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<TransportResult<SseFrame>>>>,
    responses: Mutex<VecDeque<TransportResult<Value>>>,
    open_error: Mutex<Option<TransportError>>,
    requests: Mutex<Vec<TransportRequest>>,
    hold_open: bool,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Frames for the next `open_stream` call.
    pub(crate) fn with_frames(self, frames: Vec<TransportResult<SseFrame>>) -> Self {
        self.scripts.lock().expect("scripts lock").push_back(frames);
        self
    }

    pub(crate) fn with_response(self, response: TransportResult<Value>) -> Self {
        self.responses
            .lock()
            .expect("responses lock")
            .push_back(response);
        self
    }

    pub(crate) fn failing_open(self, error: TransportError) -> Self {
        *self.open_error.lock().expect("open error lock") = Some(error);
        self
    }

    /// Keeps the stream open after the script until the reader cancels.
    pub(crate) fn holding_stream_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub(crate) fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub(crate) fn request_paths(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|request| request.path)
            .collect()
    }

    /// Yields to spawned tasks until a request for `path` shows up.
    pub(crate) async fn wait_for_request(&self, path: &str) -> bool {
        for _ in 0..100 {
            if self.request_paths().iter().any(|seen| seen == path) {
                return true;
            }
            tokio::task::yield_now().await;
        }
        false
    }

    fn record(&self, request: TransportRequest) {
        self.requests.lock().expect("requests lock").push(request);
    }
}

impl Transport for ScriptedTransport {
    fn request<'a>(&'a self, request: TransportRequest) -> BoxFuture<'a, TransportResult<Value>> {
        self.record(request);
        let response = self
            .responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or(Ok(Value::Null));
        Box::pin(async move { response })
    }

    fn open_stream(&self, request: TransportRequest) -> TransportResult<FrameStreamHandle> {
        self.record(request);
        if let Some(error) = self.open_error.lock().expect("open error lock").take() {
            return Err(error);
        }

        let (frame_tx, stream, cancel_rx) = make_frame_stream();
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_default();
        for frame in script {
            let _ = frame_tx.send(frame);
        }

        let worker: TransportWorker = if self.hold_open {
            Box::pin(async move {
                let _frame_tx = frame_tx;
                let _ = cancel_rx.await;
            })
        } else {
            drop(frame_tx);
            drop(cancel_rx);
            Box::pin(async {})
        };

        Ok(FrameStreamHandle { stream, worker })
    }
}
