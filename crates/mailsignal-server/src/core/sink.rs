use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mailsignal_proto::{Identify, OutboundBatch, OutboundCall, OutboundMessage, Track};
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SinkConfig;

const RETRY_ATTEMPTS: usize = 3;
const BATCH_PATH: &str = "/v1/batch";

#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("sink transport failed: {0}")]
    Transport(String),
    #[error("sink rejected batch: status={status}, body={body}")]
    Rejected { status: u16, body: String },
    #[error("sink call aborted: {0}")]
    Aborted(String),
}

impl SinkError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::Aborted(_) => false,
        }
    }
}

/// Receives identify and track calls for the analytics backend.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn identify(
        &self,
        call: Identify
    ) -> Result<(), SinkError>;

    async fn track(
        &self,
        call: Track
    ) -> Result<(), SinkError>;

    /// Pushes out anything buffered so far.
    async fn flush(&self) -> Result<(), SinkError>;
}

/// Stand-in used when no write key is configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AnalyticsSink for LogSink {
    async fn identify(
        &self,
        call: Identify
    ) -> Result<(), SinkError> {
        info!(
            "identify (not forwarded): user_id={}, traits={}",
            call.user_id,
            serde_json::Value::Object(call.traits)
        );
        Ok(())
    }

    async fn track(
        &self,
        call: Track
    ) -> Result<(), SinkError> {
        info!(
            "track (not forwarded): user_id={}, event={}, properties={}",
            call.user_id,
            call.event,
            serde_json::Value::Object(call.properties)
        );
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// A buffered message and the caller waiting on its upload.
#[derive(Debug)]
struct PendingMessage {
    message: OutboundMessage,
    done: oneshot::Sender<Result<(), SinkError>>,
}

/// Buffers calls and uploads them to a Segment-compatible batch endpoint.
///
/// `identify` and `track` resolve only once the batch holding their message
/// has been uploaded, with that upload's result. A full buffer is uploaded
/// by the call that filled it; anything smaller waits for `flush`.
#[derive(Debug)]
pub struct HttpSink {
    client: reqwest::Client,
    batch_url: String,
    write_key: String,
    flush_at: usize,
    buffer: Mutex<Vec<PendingMessage>>,
}

impl HttpSink {
    pub fn new(
        write_key: &str,
        config: &SinkConfig
    ) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| SinkError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            batch_url: format!("{}{}", config.endpoint, BATCH_PATH),
            write_key: write_key.to_string(),
            flush_at: config.flush_at.max(1),
            buffer: Mutex::new(Vec::new()),
        })
    }

    async fn enqueue(
        &self,
        call: OutboundCall
    ) -> Result<(), SinkError> {
        let (done, uploaded) = oneshot::channel();
        let full = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(PendingMessage {
                message: OutboundMessage { call, message_id: Uuid::new_v4().to_string() },
                done,
            });
            if buffer.len() >= self.flush_at {
                std::mem::take(&mut *buffer)
            } else {
                Vec::new()
            }
        };

        // The outcome reaches every waiter, this caller included.
        let _ = self.upload(full).await;

        uploaded.await.unwrap_or_else(|_| {
            Err(SinkError::Aborted("buffered call dropped before upload".to_string()))
        })
    }

    /// Uploads `pending` and hands the result to each waiting caller.
    async fn upload(
        &self,
        pending: Vec<PendingMessage>
    ) -> Result<(), SinkError> {
        if pending.is_empty() {
            return Ok(());
        }

        let (messages, waiters): (Vec<_>, Vec<_>) =
            pending.into_iter().map(|entry| (entry.message, entry.done)).unzip();
        let batch = OutboundBatch { batch: messages };
        let result = self.send_with_retry(&batch).await;
        match &result {
            Ok(()) => debug!("sink batch uploaded: messages={}", batch.batch.len()),
            Err(err) => warn!(
                "sink batch failed, callers notified: messages={}, error={}",
                batch.batch.len(),
                err
            ),
        }

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    async fn send_with_retry(
        &self,
        batch: &OutboundBatch
    ) -> Result<(), SinkError> {
        let mut last_error: Option<SinkError> = None;

        for attempt in 1..=RETRY_ATTEMPTS {
            match self.post(batch).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => {
                    warn!(
                        "sink upload failed: attempt={}, messages={}, error={}",
                        attempt,
                        batch.batch.len(),
                        err
                    );
                    last_error = Some(err);
                    if attempt < RETRY_ATTEMPTS {
                        sleep(Duration::from_millis((attempt * 250) as u64)).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| SinkError::Transport("send failed".to_string())))
    }

    async fn post(
        &self,
        batch: &OutboundBatch
    ) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.batch_url)
            .basic_auth(&self.write_key, Some(""))
            .json(batch)
            .send()
            .await
            .map_err(|err| SinkError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Rejected { status: status.as_u16(), body })
    }
}

#[async_trait]
impl AnalyticsSink for HttpSink {
    async fn identify(
        &self,
        call: Identify
    ) -> Result<(), SinkError> {
        self.enqueue(OutboundCall::Identify(call)).await
    }

    async fn track(
        &self,
        call: Track
    ) -> Result<(), SinkError> {
        self.enqueue(OutboundCall::Track(call)).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let pending = std::mem::take(&mut *self.buffer.lock().await);
        self.upload(pending).await
    }
}

/// Flushes the sink on a fixed interval until shutdown.
pub async fn run_sink_flusher(
    sink: Arc<dyn AnalyticsSink>,
    every: Duration,
    shutdown: CancellationToken
) {
    let mut ticker = interval(every);
    info!("sink flusher started: every={}", humantime::format_duration(every));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("sink flusher stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = sink.flush().await {
                    warn!("periodic sink flush failed: error={err}");
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mailsignal_proto::{Identify, Track, Traits};
    use serde_json::{Map, Value, json};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{AnalyticsSink, HttpSink, SinkError};
    use crate::config::SinkConfig;

    fn sink_for(
        server: &MockServer,
        flush_at: usize
    ) -> HttpSink {
        let config = SinkConfig {
            write_key: Some("key".to_string()),
            endpoint: server.uri(),
            flush_at,
            flush_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        };
        HttpSink::new("key", &config).unwrap()
    }

    fn identify(user_id: &str) -> Identify {
        let mut traits = Traits::new();
        traits.insert("email".to_string(), json!(user_id));
        Identify { user_id: user_id.to_string(), traits }
    }

    fn track(user_id: &str) -> Track {
        Track {
            user_id: user_id.to_string(),
            event: "Email Opened".to_string(),
            properties: Map::new(),
            context: Map::new(),
        }
    }

    #[tokio::test]
    async fn uploads_when_buffer_reaches_flush_at() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/batch"))
            .and(header("authorization", "Basic a2V5Og=="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let sink = sink_for(&server, 2);
        let (identified, tracked) =
            tokio::join!(sink.identify(identify("a@x.com")), sink.track(track("a@x.com")));
        identified.unwrap();
        tracked.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);

        let body: Value = requests[0].body_json().unwrap();
        let batch = body["batch"].as_array().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0]["type"], "identify");
        assert_eq!(batch[0]["userId"], "a@x.com");
        assert_eq!(batch[1]["type"], "track");
        assert_eq!(batch[1]["event"], "Email Opened");
        assert_ne!(batch[0]["messageId"], batch[1]["messageId"]);
    }

    #[tokio::test]
    async fn flush_uploads_partial_buffer_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/batch"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = sink_for(&server, 20);
        let (identified, flushed) =
            tokio::join!(sink.identify(identify("a@x.com")), sink.flush());
        identified.unwrap();
        flushed.unwrap();
        sink.flush().await.unwrap();

        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn buffered_calls_wait_for_their_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/batch"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sink = sink_for(&server, 20);
        let pending = tokio::time::timeout(
            Duration::from_millis(100),
            sink.identify(identify("a@x.com")),
        )
        .await;

        assert!(pending.is_err());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_upload_fails_every_waiting_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/batch"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = sink_for(&server, 2);
        let (identified, tracked) =
            tokio::join!(sink.identify(identify("a@x.com")), sink.track(track("a@x.com")));

        assert!(matches!(identified, Err(SinkError::Rejected { status: 500, .. })));
        assert!(matches!(tracked, Err(SinkError::Rejected { status: 500, .. })));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);

        sink.flush().await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/batch"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/batch"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sink = sink_for(&server, 1);
        sink.track(track("a@x.com")).await.unwrap();

        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/batch"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let sink = sink_for(&server, 1);
        let err = sink.identify(identify("a@x.com")).await.unwrap_err();

        assert!(matches!(err, SinkError::Rejected { status: 429, .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/batch"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad write key"))
            .mount(&server)
            .await;

        let sink = sink_for(&server, 1);
        let err = sink.identify(identify("a@x.com")).await.unwrap_err();

        match err {
            SinkError::Rejected { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad write key");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
