use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

/// One outbound call, relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Raw server-sent event as delivered by the wire, before any JSON decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`, {source}"))]
    SendRequest {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("server returned status {status}: {body}"))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to read response body on `{stage}`, {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to decode response body on `{stage}`, {source}"))]
    DecodeBody {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("event stream failed on `{stage}`: {message}"))]
    StreamRead {
        stage: &'static str,
        message: String,
    },
}

impl TransportError {
    /// HTTP status code when the server answered with a non-success status.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Receiving half of one open event stream.
///
/// Dropping the stream signals the worker to stop reading, so callers never leak a
/// connection by forgetting to cancel.
pub struct FrameStream {
    frames: mpsc::UnboundedReceiver<TransportResult<SseFrame>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct FrameStreamHandle {
    pub stream: FrameStream,
    pub worker: TransportWorker,
}

impl FrameStream {
    pub(crate) fn new(
        frames: mpsc::UnboundedReceiver<TransportResult<SseFrame>>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            frames,
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Next frame, or `None` once the worker has closed the stream.
    pub async fn recv(&mut self) -> Option<TransportResult<SseFrame>> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TransportResult<SseFrame>> {
        self.frames.try_recv().ok()
    }

    /// Asks the worker to abort. Returns false when it was already cancelled or gone.
    pub fn cancel(&mut self) -> bool {
        self.frames.close();
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// The two primitives the engine needs from the network.
pub trait Transport: Send + Sync {
    /// Sends one request and decodes the whole response body as JSON.
    fn request<'a>(&'a self, request: TransportRequest) -> BoxFuture<'a, TransportResult<Value>>;

    /// Opens an event stream. The returned worker must be spawned for frames to flow.
    fn open_stream(&self, request: TransportRequest) -> TransportResult<FrameStreamHandle>;
}

/// Wires a frame channel to its cancel signal. Transports (including test doubles) feed
/// the sender from their worker and watch the receiver for aborts.
pub fn make_frame_stream() -> (
    mpsc::UnboundedSender<TransportResult<SseFrame>>,
    FrameStream,
    oneshot::Receiver<()>,
) {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (frame_tx, FrameStream::new(frame_rx, cancel_tx), cancel_rx)
}
