mod http;
mod transport;

pub use http::{DEFAULT_USER_AGENT, HttpTransport, HttpTransportConfig};
pub use transport::{
    BoxFuture, FrameStream, FrameStreamHandle, Method, SseFrame, Transport, TransportError,
    TransportRequest, TransportResult, TransportWorker, make_frame_stream,
};
