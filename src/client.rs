//! Buffered Fluentd client.
//!
//! The alternative outbound mode: instead of the raw connection manager,
//! records are posted to a client that owns its own connection, retry
//! policy, optional async queue and optional acknowledgements.

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::connection::wait_or_shutdown;
use crate::encoder::{Encoder, EncodingError, Format};
use crate::transport::{self, Connection, Transport, timed_out};

const DEFAULT_BUFFER_LIMIT: usize = 1024 * 1024;
const DEFAULT_RETRY_WAIT: Duration = Duration::from_millis(1000);
const DEFAULT_MAX_RETRY_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_WAIT_INCREASE_RATE: f64 = 1.5;
const ACK_BUFFER_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub network: String,
    pub socket_path: String,
    pub buffer_limit: usize,
    pub retry_wait: Duration,
    pub max_retries: u32,
    pub max_retry_wait: Duration,
    pub async_connect: bool,
    pub sub_second_precision: bool,
    pub request_ack: bool,
    pub write_timeout: Duration,
    pub ack_timeout: Duration,
    pub format: Format,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 24224,
            network: transport::DEFAULT_TRANSPORT.to_string(),
            socket_path: String::new(),
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            retry_wait: DEFAULT_RETRY_WAIT,
            max_retries: i32::MAX as u32,
            max_retry_wait: DEFAULT_MAX_RETRY_WAIT,
            async_connect: false,
            sub_second_precision: false,
            request_ack: false,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            format: Format::MsgPack,
        }
    }
}

impl ClientConfig {
    pub fn address(&self) -> String {
        match self.network.as_str() {
            "unix" => self.socket_path.clone(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Wait before retry number `attempt` (0-based), capped at `max_retry_wait`.
    pub fn retry_wait_for(&self, attempt: u32) -> Duration {
        let factor = RETRY_WAIT_INCREASE_RATE.powi(attempt.min(i32::MAX as u32) as i32);
        let wait = self.retry_wait.as_secs_f64() * factor;
        if !wait.is_finite() || wait >= self.max_retry_wait.as_secs_f64() {
            self.max_retry_wait
        } else {
            Duration::from_secs_f64(wait)
        }
    }
}

#[derive(Error, Debug)]
pub enum PostError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("Buffer full: pending {pending} bytes, limit {limit} bytes")]
    BufferFull { pending: usize, limit: usize },
    #[error("Unknown network {0}")]
    UnknownNetwork(String),
    #[error("Failed to write after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("Shutdown requested before the record was delivered")]
    Cancelled,
    #[error("Client is closed")]
    Closed,
}

/// Single-attempt failure, retried by the writer.
#[derive(Error, Debug)]
enum AttemptError {
    #[error("connect failed: {0}")]
    Dial(#[from] transport::DialError),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("ack mismatch: expected {expected}, got {got}")]
    AckMismatch { expected: String, got: String },
    #[error("invalid ack response: {0}")]
    InvalidAck(#[from] rmp_serde::decode::Error),
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    ack: String,
}

struct Message {
    payload: Bytes,
    chunk: Option<String>,
}

struct Writer {
    config: ClientConfig,
    address: String,
    transport: Arc<dyn Transport>,
    connection: Option<Box<dyn Connection>>,
    shutdown: watch::Receiver<bool>,
}

impl Writer {
    async fn send(&mut self, message: &Message) -> Result<(), PostError> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0
                && wait_or_shutdown(&mut self.shutdown, self.config.retry_wait_for(attempt - 1))
                    .await
            {
                return Err(PostError::Cancelled);
            }

            match self.attempt(message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "fluentd-adapter: attempt {}/{attempts} to {} failed: {e}",
                        attempt + 1,
                        self.address
                    );
                    self.disconnect().await;
                    last_error = e.to_string();
                }
            }
        }

        Err(PostError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    async fn attempt(&mut self, message: &Message) -> Result<(), AttemptError> {
        if self.connection.is_none() {
            let conn = self.transport.dial(&self.address, &HashMap::new()).await?;
            log::debug!("Connected to fluentd @ {}", self.address);
            self.connection = Some(conn);
        }
        let Some(conn) = self.connection.as_mut() else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into());
        };

        match timeout(self.config.write_timeout, conn.write_all(&message.payload)).await {
            Ok(result) => result?,
            Err(_) => return Err(timed_out("write").into()),
        }

        if let Some(chunk) = &message.chunk {
            let response = match timeout(self.config.ack_timeout, read_ack(&mut **conn)).await {
                Ok(result) => result?,
                Err(_) => return Err(timed_out("ack read").into()),
            };
            if &response.ack != chunk {
                return Err(AttemptError::AckMismatch {
                    expected: chunk.clone(),
                    got: response.ack,
                });
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            let _ = conn.shutdown().await;
        }
    }
}

/// Reads until the buffered bytes hold one complete ack response; the
/// collector may split it across several segments.
async fn read_ack(conn: &mut dyn Connection) -> Result<AckResponse, AttemptError> {
    let mut received = Vec::with_capacity(ACK_BUFFER_LEN);
    let mut buf = [0u8; ACK_BUFFER_LEN];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        received.extend_from_slice(&buf[..n]);
        match rmp_serde::from_slice::<AckResponse>(&received) {
            Ok(response) => return Ok(response),
            Err(e) if is_truncated(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn is_truncated(err: &rmp_serde::decode::Error) -> bool {
    match err {
        rmp_serde::decode::Error::InvalidMarkerRead(e)
        | rmp_serde::decode::Error::InvalidDataRead(e) => {
            e.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

enum Mode {
    Sync(Writer),
    Async {
        queue: Option<mpsc::UnboundedSender<Message>>,
        pending: Arc<AtomicUsize>,
        worker: Option<JoinHandle<()>>,
    },
}

pub struct FluentClient {
    encoder: Encoder,
    request_ack: bool,
    buffer_limit: usize,
    address: String,
    mode: Mode,
}

impl FluentClient {
    pub async fn new(
        config: ClientConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, PostError> {
        let transport = transport::lookup(&config.network)
            .ok_or_else(|| PostError::UnknownNetwork(config.network.clone()))?;
        Ok(Self::with_transport(config, transport, shutdown))
    }

    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let address = config.address();
        let encoder = Encoder::new(config.format, config.sub_second_precision);
        let request_ack = config.request_ack;
        let buffer_limit = config.buffer_limit;
        let async_connect = config.async_connect;

        let writer = Writer {
            config,
            address: address.clone(),
            transport,
            connection: None,
            shutdown,
        };

        let mode = if async_connect {
            let (queue, rx) = mpsc::unbounded_channel();
            let pending = Arc::new(AtomicUsize::new(0));
            let worker = tokio::spawn(drain(writer, rx, Arc::clone(&pending)));
            Mode::Async {
                queue: Some(queue),
                pending,
                worker: Some(worker),
            }
        } else {
            Mode::Sync(writer)
        };

        Self {
            encoder,
            request_ack,
            buffer_limit,
            address,
            mode,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn post(
        &mut self,
        tag: &str,
        time: DateTime<Utc>,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), PostError> {
        let chunk = self.request_ack.then(new_chunk_id);
        let payload = self
            .encoder
            .encode_with_chunk(tag, time, fields, chunk.as_deref())?;
        let message = Message { payload, chunk };

        match &mut self.mode {
            Mode::Sync(writer) => writer.send(&message).await,
            Mode::Async { queue, pending, .. } => {
                let queue = queue.as_ref().ok_or(PostError::Closed)?;
                let len = message.payload.len();
                let current = pending.load(Ordering::SeqCst);
                if current + len > self.buffer_limit {
                    return Err(PostError::BufferFull {
                        pending: current,
                        limit: self.buffer_limit,
                    });
                }
                pending.fetch_add(len, Ordering::SeqCst);
                queue.send(message).map_err(|_| {
                    pending.fetch_sub(len, Ordering::SeqCst);
                    PostError::Closed
                })
            }
        }
    }

    /// Flushes the async queue (if any) and closes the connection.
    pub async fn close(&mut self) {
        match &mut self.mode {
            Mode::Sync(writer) => writer.disconnect().await,
            Mode::Async { queue, worker, .. } => {
                queue.take();
                if let Some(worker) = worker.take() {
                    if let Err(e) = worker.await {
                        log::error!("fluentd-adapter: async writer task failed: {e}");
                    }
                }
            }
        }
    }
}

async fn drain(
    mut writer: Writer,
    mut rx: mpsc::UnboundedReceiver<Message>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(message) = rx.recv().await {
        let len = message.payload.len();
        if let Err(e) = writer.send(&message).await {
            log::error!("fluentd-adapter: dropping record for {}: {e}", writer.address);
        }
        pending.fetch_sub(len, Ordering::SeqCst);
    }
    writer.disconnect().await;
}

fn new_chunk_id() -> String {
    base64::engine::general_purpose::STANDARD.encode(Uuid::new_v4().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{Script, ScriptedTransport};
    use crate::encoder::decode;
    use std::io::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fields() -> BTreeMap<String, String> {
        BTreeMap::from([("log".to_string(), "hello".to_string())])
    }

    fn config(max_retries: u32) -> ClientConfig {
        ClientConfig {
            max_retries,
            retry_wait: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.buffer_limit, 1024 * 1024);
        assert_eq!(config.retry_wait, Duration::from_millis(1000));
        assert_eq!(config.max_retries, i32::MAX as u32);
        assert_eq!(config.write_timeout, Duration::from_secs(3));
        assert!(!config.async_connect);
        assert!(!config.request_ack);
        assert_eq!(config.address(), "127.0.0.1:24224");
    }

    #[test]
    fn test_retry_wait_grows_and_caps() {
        let config = ClientConfig::default();
        assert_eq!(config.retry_wait_for(0), Duration::from_millis(1000));
        assert_eq!(config.retry_wait_for(1), Duration::from_millis(1500));
        assert_eq!(config.retry_wait_for(2), Duration::from_millis(2250));
        assert_eq!(config.retry_wait_for(100), DEFAULT_MAX_RETRY_WAIT);
        assert_eq!(config.retry_wait_for(u32::MAX), DEFAULT_MAX_RETRY_WAIT);
    }

    #[test]
    fn test_unix_address() {
        let config = ClientConfig {
            network: "unix".to_string(),
            socket_path: "/var/run/fluent.sock".to_string(),
            ..Default::default()
        };
        assert_eq!(config.address(), "/var/run/fluent.sock");
    }

    #[tokio::test]
    async fn test_unknown_network() {
        let (_tx, rx) = watch::channel(false);
        let config = ClientConfig {
            network: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            FluentClient::new(config, rx).await,
            Err(PostError::UnknownNetwork(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_post_retries_then_succeeds() {
        let script = Script::failing_writes([ErrorKind::ConnectionReset, ErrorKind::TimedOut]);
        let (_tx, rx) = watch::channel(false);
        let mut client = FluentClient::with_transport(
            config(5),
            Arc::new(ScriptedTransport(Arc::clone(&script))),
            rx,
        );

        client
            .post("docker.web", Utc::now(), &fields())
            .await
            .expect("Post failed");

        assert_eq!(script.write_attempts.load(Ordering::SeqCst), 3);
        // Every failure drops the connection.
        assert_eq!(script.dial_attempts.load(Ordering::SeqCst), 3);
        let written = script.written.lock().unwrap();
        let decoded = decode(&written[0]).expect("Failed to decode");
        assert_eq!(decoded.tag, "docker.web");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_post_gives_up_after_max_retries() {
        let script = Script::failing_writes(std::iter::repeat_n(ErrorKind::BrokenPipe, 10));
        let (_tx, rx) = watch::channel(false);
        let mut client = FluentClient::with_transport(
            config(3),
            Arc::new(ScriptedTransport(Arc::clone(&script))),
            rx,
        );

        let result = client.post("t", Utc::now(), &fields()).await;
        assert!(matches!(
            result,
            Err(PostError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(script.write_attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_post_cancelled_by_shutdown() {
        let script = Script::failing_writes([]);
        script.fail_dials(usize::MAX);
        let (tx, rx) = watch::channel(false);
        let mut client = FluentClient::with_transport(
            config(100),
            Arc::new(ScriptedTransport(Arc::clone(&script))),
            rx,
        );

        let handle = tokio::spawn(async move { client.post("t", Utc::now(), &fields()).await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).unwrap();

        assert!(matches!(handle.await.unwrap(), Err(PostError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_post_buffer_limit() {
        let script = Script::failing_writes([]);
        // Keep the worker stuck dialing so nothing drains.
        script.fail_dials(usize::MAX);
        let (_tx, rx) = watch::channel(false);
        let mut client = FluentClient::with_transport(
            ClientConfig {
                async_connect: true,
                buffer_limit: 64,
                ..config(100)
            },
            Arc::new(ScriptedTransport(Arc::clone(&script))),
            rx,
        );

        client.post("t", Utc::now(), &fields()).await.expect("Post failed");
        let mut saw_full = false;
        for _ in 0..10 {
            if let Err(PostError::BufferFull { limit, .. }) =
                client.post("t", Utc::now(), &fields()).await
            {
                assert_eq!(limit, 64);
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);
    }

    #[tokio::test]
    async fn test_async_close_flushes_queue() {
        let script = Script::failing_writes([]);
        let (_tx, rx) = watch::channel(false);
        let mut client = FluentClient::with_transport(
            ClientConfig {
                async_connect: true,
                ..config(3)
            },
            Arc::new(ScriptedTransport(Arc::clone(&script))),
            rx,
        );

        for i in 0..5 {
            let fields = BTreeMap::from([("log".to_string(), format!("line {i}"))]);
            client.post("t", Utc::now(), &fields).await.expect("Post failed");
        }
        client.close().await;

        let written = script.written.lock().unwrap();
        assert_eq!(written.len(), 5);
        let last = decode(&written[4]).expect("Failed to decode");
        assert_eq!(last.fields["log"], "line 4");
        drop(written);

        assert!(matches!(
            client.post("t", Utc::now(), &fields()).await,
            Err(PostError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_request_ack_against_tcp_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let decoded = decode(&buf[..n]).expect("Failed to decode");
            let chunk = decoded.chunk.clone().expect("Missing chunk");
            let ack = rmp_serde::to_vec_named(&HashMap::from([("ack", chunk)])).unwrap();
            socket.write_all(&ack).await.unwrap();
            decoded
        });

        let (_tx, rx) = watch::channel(false);
        let mut client = FluentClient::new(
            ClientConfig {
                port,
                request_ack: true,
                ..config(1)
            },
            rx,
        )
        .await
        .expect("Failed to create client");

        client
            .post("docker.web", Utc::now(), &fields())
            .await
            .expect("Post failed");
        client.close().await;

        let decoded = server.await.unwrap();
        assert_eq!(decoded.tag, "docker.web");
        assert_eq!(decoded.fields, fields());
    }

    #[tokio::test]
    async fn test_ack_mismatch_fails_the_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let ack = rmp_serde::to_vec_named(&HashMap::from([("ack", "nope")])).unwrap();
            socket.write_all(&ack).await.unwrap();
        });

        let (_tx, rx) = watch::channel(false);
        let mut client = FluentClient::new(
            ClientConfig {
                port,
                request_ack: true,
                ..config(1)
            },
            rx,
        )
        .await
        .expect("Failed to create client");

        let result = client.post("t", Utc::now(), &fields()).await;
        match result {
            Err(PostError::RetriesExhausted { last_error, .. }) => {
                assert!(last_error.contains("ack mismatch"), "{last_error}");
            }
            other => panic!("Expected ack failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ack_split_across_segments() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let chunk = decode(&buf[..n]).expect("Failed to decode").chunk.unwrap();
            let ack = rmp_serde::to_vec_named(&HashMap::from([("ack", chunk)])).unwrap();
            let (head, tail) = ack.split_at(ack.len() / 2);
            socket.write_all(head).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            socket.write_all(tail).await.unwrap();
        });

        let (_tx, rx) = watch::channel(false);
        let mut client = FluentClient::new(
            ClientConfig {
                port,
                request_ack: true,
                ..config(1)
            },
            rx,
        )
        .await
        .expect("Failed to create client");

        client
            .post("t", Utc::now(), &fields())
            .await
            .expect("Split ack should be accepted on the first attempt");
    }

    #[test]
    fn test_truncated_ack_is_detected() {
        let ack = rmp_serde::to_vec_named(&HashMap::from([("ack", "Y2h1bms=")])).unwrap();
        for cut in 1..ack.len() {
            let err = rmp_serde::from_slice::<AckResponse>(&ack[..cut]).unwrap_err();
            assert!(is_truncated(&err), "cut at {cut}: {err}");
        }
        let err = rmp_serde::from_slice::<AckResponse>(&[0xc1]).unwrap_err();
        assert!(!is_truncated(&err));
    }
}
