//! Dialers for the outbound connection.
//!
//! Transports are selected by name (`tcp`, `unix`) the same way the route
//! scheme selects them: `fluentd+unix:///var/run/fluent.sock`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;

pub const DEFAULT_TRANSPORT: &str = "tcp";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum DialError {
    #[error("Unable to connect to {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connecting to {0} timed out")]
    Timeout(String),
    #[error("Invalid dial option {key}={value}")]
    InvalidOption { key: String, value: String },
}

/// A live byte stream to the collector.
#[async_trait]
pub trait Connection: Send {
    /// Writes a prefix of `buf` and returns its length. Cancelling the future
    /// means nothing was written.
    async fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
    async fn flush(&mut self) -> std::io::Result<()>;
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    async fn shutdown(&mut self) -> std::io::Result<()>;

    async fn write_all(&mut self, mut buf: &[u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        self.flush().await
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(
        &self,
        address: &str,
        options: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>, DialError>;
}

struct StreamConnection<S>(S);

#[async_trait]
impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf).await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush().await
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf).await
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.0.shutdown().await
    }
}

fn connect_timeout(options: &HashMap<String, String>) -> Result<Duration, DialError> {
    match options.get("connect_timeout") {
        Some(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| DialError::InvalidOption {
                key: "connect_timeout".to_string(),
                value: value.clone(),
            }),
        None => Ok(DEFAULT_CONNECT_TIMEOUT),
    }
}

#[derive(Debug, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(
        &self,
        address: &str,
        options: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>, DialError> {
        let stream = match timeout(connect_timeout(options)?, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(DialError::Io {
                    address: address.to_string(),
                    source,
                });
            }
            Err(_) => return Err(DialError::Timeout(address.to_string())),
        };

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY on {address}: {e}");
        }

        Ok(Box::new(StreamConnection(stream)))
    }
}

#[derive(Debug, Default)]
pub struct UnixTransport;

#[async_trait]
impl Transport for UnixTransport {
    async fn dial(
        &self,
        address: &str,
        options: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>, DialError> {
        match timeout(connect_timeout(options)?, UnixStream::connect(address)).await {
            Ok(Ok(stream)) => Ok(Box::new(StreamConnection(stream))),
            Ok(Err(source)) => Err(DialError::Io {
                address: address.to_string(),
                source,
            }),
            Err(_) => Err(DialError::Timeout(address.to_string())),
        }
    }
}

pub fn lookup(name: &str) -> Option<Arc<dyn Transport>> {
    match name {
        "tcp" => Some(Arc::new(TcpTransport)),
        "unix" => Some(Arc::new(UnixTransport)),
        _ => None,
    }
}

pub(crate) fn timed_out(action: &str) -> std::io::Error {
    std::io::Error::new(ErrorKind::TimedOut, format!("{action} timed out"))
}
