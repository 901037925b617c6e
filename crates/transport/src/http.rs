use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde_json::Value;
use snafu::ResultExt;
use tokio::sync::{mpsc, oneshot};

use super::transport::{
    BoxFuture, BuildClientSnafu, DecodeBodySnafu, FrameStreamHandle, HttpStatusSnafu, Method,
    ReadBodySnafu, SendRequestSnafu, SseFrame, Transport, TransportError, TransportRequest,
    TransportResult, TransportWorker, make_frame_stream,
};

pub const DEFAULT_USER_AGENT: &str = concat!("tidewire/", env!("CARGO_PKG_VERSION"));

/// SSE frames without an explicit `event:` line carry this name.
const DEFAULT_SSE_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub user_agent: String,
    pub connect_timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            api_token: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into().trim().to_string();
        self.api_token = (!token.is_empty()).then_some(token);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// `reqwest`-backed transport speaking JSON for single responses and SSE for streams.
pub struct HttpTransport {
    config: HttpTransportConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-client",
            })?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    fn build(&self, request: &TransportRequest, accept: &'static str) -> reqwest::RequestBuilder {
        let url = self.url(&request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };

        builder = builder.header(ACCEPT, accept);
        if let Some(token) = &self.config.api_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder
    }

    async fn send_checked(
        builder: reqwest::RequestBuilder,
        url: &str,
        stage: &'static str,
    ) -> TransportResult<reqwest::Response> {
        let response = builder.send().await.context(SendRequestSnafu {
            stage,
            url: url.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(url = %url, status = status.as_u16(), "server rejected request");
            return HttpStatusSnafu {
                stage,
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(response)
    }

    fn map_sse_event(event: eventsource_stream::Event) -> Option<SseFrame> {
        if event.data.is_empty() {
            // Keep-alive comment or bare `event:` line.
            return None;
        }

        let name = (!event.event.is_empty() && event.event != DEFAULT_SSE_EVENT)
            .then_some(event.event);
        Some(SseFrame {
            event: name,
            data: event.data,
        })
    }

    async fn run_stream_worker(
        builder: reqwest::RequestBuilder,
        url: String,
        frame_tx: mpsc::UnboundedSender<TransportResult<SseFrame>>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let response = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(url = %url, "stream cancelled before response");
                return;
            }
            response = Self::send_checked(builder, &url, "open-stream") => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(url = %url, error = %error, "failed to open event stream");
                let _ = frame_tx.send(Err(error));
                return;
            }
        };

        let stream = response.bytes_stream().eventsource();
        let mut stream = std::pin::pin!(stream);

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Dropping the body stream closes the connection.
                    tracing::debug!(url = %url, "event stream cancelled");
                    break;
                }
                next_event = stream.next() => {
                    match next_event {
                        Some(Ok(event)) => {
                            if let Some(frame) = Self::map_sse_event(event)
                                && frame_tx.send(Ok(frame)).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(url = %url, error = %source, "event stream read failed");
                            let _ = frame_tx.send(Err(TransportError::StreamRead {
                                stage: "read-event-stream",
                                message: source.to_string(),
                            }));
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

impl Transport for HttpTransport {
    fn request<'a>(&'a self, request: TransportRequest) -> BoxFuture<'a, TransportResult<Value>> {
        Box::pin(async move {
            let url = self.url(&request.path);
            let builder = self.build(&request, "application/json");
            let response = Self::send_checked(builder, &url, "send-request").await?;
            let payload = response.text().await.context(ReadBodySnafu {
                stage: "read-response-body",
            })?;

            if payload.trim().is_empty() {
                return Ok(Value::Null);
            }

            serde_json::from_str(&payload).context(DecodeBodySnafu {
                stage: "decode-response-body",
            })
        })
    }

    fn open_stream(&self, request: TransportRequest) -> TransportResult<FrameStreamHandle> {
        let url = self.url(&request.path);
        let builder = self.build(&request, "text/event-stream");
        let (frame_tx, stream, cancel_rx) = make_frame_stream();
        let worker: TransportWorker =
            Box::pin(Self::run_stream_worker(builder, url, frame_tx, cancel_rx));

        Ok(FrameStreamHandle { stream, worker })
    }
}
