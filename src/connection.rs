//! Ownership of the outbound connection and its recovery policies.
//!
//! Two layers of recovery:
//! - temporary failures (timeouts, interrupts) retry the same write with
//!   exponential backoff, up to a fixed number of attempts;
//! - anything else, or exhausted retries, drops the connection and redials
//!   at a fixed interval until the collector is reachable again.
//!
//! A payload that triggers a reconnect is not resent.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};

use crate::transport::{Connection, DialError, Transport, timed_out};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total write attempts for one payload, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 11,
            base_delay: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (the first retry is attempt 1).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Temporary,
    Permanent,
    Other,
}

pub fn classify(err: &std::io::Error) -> ErrorClass {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            ErrorClass::Temporary
        }
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof
        | ErrorKind::WriteZero => ErrorClass::Permanent,
        _ => ErrorClass::Other,
    }
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Record dropped, connection to {address} was re-established after: {cause}")]
    Dropped {
        address: String,
        #[source]
        cause: std::io::Error,
    },
    #[error("Shutdown requested while reconnecting to {0}")]
    Cancelled(String),
}

/// Sleeps for `delay` unless shutdown is signalled first. Returns `true` when
/// shutdown was requested.
pub(crate) async fn wait_or_shutdown(
    shutdown: &mut watch::Receiver<bool>,
    delay: Duration,
) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow_and_update() => return true,
                Ok(()) => continue,
                Err(_) => {
                    // Sender gone: nobody can request shutdown anymore.
                    sleep.await;
                    return false;
                }
            }
        }
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    address: String,
    options: HashMap<String, String>,
    connection: Option<Box<dyn Connection>>,
    retry: RetryPolicy,
    reconnect: ReconnectPolicy,
    write_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    reconnects: u64,
}

impl ConnectionManager {
    /// Dials the collector once. A failure here is a construction error.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        address: impl Into<String>,
        options: HashMap<String, String>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, DialError> {
        let address = address.into();
        let connection = transport.dial(&address, &options).await?;
        log::info!("Connectivity successful to fluentd @ {address}");
        Ok(Self {
            transport,
            address,
            options,
            connection: Some(connection),
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            write_timeout: Duration::from_secs(3),
            shutdown,
            reconnects: 0,
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_reconnect_policy(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects
    }

    pub async fn write(&mut self, payload: &[u8]) -> Result<(), WriteError> {
        if self.connection.is_none() {
            self.reconnect().await?;
        }

        let mut sent = 0;
        let err = match self.try_write(payload, &mut sent).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let cause = match classify(&err) {
            ErrorClass::Temporary => match self.retry_temporary(payload, &mut sent, err).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            },
            ErrorClass::Permanent | ErrorClass::Other => err,
        };

        log::error!("Write to {} failed: {cause}. Reconnecting...", self.address);
        self.reconnect().await?;
        Err(WriteError::Dropped {
            address: self.address.clone(),
            cause,
        })
    }

    /// Writes `payload[*sent..]` under the write timeout. Accepted bytes are
    /// counted in `sent` even when the deadline hits, so a retry on the same
    /// connection continues the frame instead of starting it again.
    async fn try_write(&mut self, payload: &[u8], sent: &mut usize) -> std::io::Result<()> {
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| std::io::Error::from(ErrorKind::NotConnected))?;
        let deadline = Instant::now() + self.write_timeout;

        while *sent < payload.len() {
            match timeout_at(deadline, conn.write(&payload[*sent..])).await {
                Ok(Ok(0)) => return Err(ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => *sent += n,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(timed_out("write")),
            }
        }

        match timeout_at(deadline, conn.flush()).await {
            Ok(result) => result,
            Err(_) => Err(timed_out("flush")),
        }
    }

    async fn retry_temporary(
        &mut self,
        payload: &[u8],
        sent: &mut usize,
        first: std::io::Error,
    ) -> std::io::Result<()> {
        log::warn!(
            "Temporary error writing to {}: {first}. Retrying up to {} more times",
            self.address,
            self.retry.max_attempts.saturating_sub(1)
        );

        let mut last = first;
        for attempt in 1..self.retry.max_attempts {
            tokio::time::sleep(self.retry.delay_before(attempt)).await;
            match self.try_write(payload, sent).await {
                Ok(()) => {
                    log::info!(
                        "Write to {} succeeded on attempt {}",
                        self.address,
                        attempt + 1
                    );
                    return Ok(());
                }
                Err(err) => {
                    log::warn!(
                        "Write attempt {}/{} to {} failed: {err}",
                        attempt + 1,
                        self.retry.max_attempts,
                        self.address
                    );
                    if classify(&err) != ErrorClass::Temporary {
                        return Err(err);
                    }
                    last = err;
                }
            }
        }

        log::error!(
            "Giving up on write to {} after {} attempts",
            self.address,
            self.retry.max_attempts
        );
        Err(last)
    }

    /// Replaces the connection, dialing until it succeeds or shutdown is
    /// requested.
    pub async fn reconnect(&mut self) -> Result<(), WriteError> {
        if let Some(mut old) = self.connection.take() {
            let _ = old.shutdown().await;
        }

        let mut attempt: u64 = 0;
        loop {
            if *self.shutdown.borrow() {
                return Err(WriteError::Cancelled(self.address.clone()));
            }
            attempt += 1;
            match self.transport.dial(&self.address, &self.options).await {
                Ok(connection) => {
                    log::info!(
                        "Reconnected to {} after {attempt} attempt(s)",
                        self.address
                    );
                    self.connection = Some(connection);
                    self.reconnects += 1;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Reconnect attempt {attempt} to {} failed: {e}. Retrying in {:?}",
                        self.address,
                        self.reconnect.interval
                    );
                    if wait_or_shutdown(&mut self.shutdown, self.reconnect.interval).await {
                        return Err(WriteError::Cancelled(self.address.clone()));
                    }
                }
            }
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            if let Err(e) = conn.shutdown().await {
                log::debug!("Error closing connection to {}: {e}", self.address);
            }
        }
    }
}
