use async_trait::async_trait;
use thiserror::Error;

use crate::client::{FluentClient, PostError};
use crate::connection::{ConnectionManager, WriteError};
use crate::encoder::{Encoder, EncodingError};
use crate::record::OutboundRecord;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("PostWithTime error: {0}")]
    Post(#[from] PostError),
}

/// Where the forwarder delivers records.
#[async_trait]
pub trait RecordSink: Send {
    fn target(&self) -> &str;
    async fn send(&mut self, record: &OutboundRecord) -> Result<(), SinkError>;
    async fn close(&mut self);
}

/// Encodes records itself and writes them through the connection manager.
pub struct RawSink {
    encoder: Encoder,
    manager: ConnectionManager,
}

impl RawSink {
    pub fn new(encoder: Encoder, manager: ConnectionManager) -> Self {
        Self { encoder, manager }
    }
}

#[async_trait]
impl RecordSink for RawSink {
    fn target(&self) -> &str {
        self.manager.address()
    }

    async fn send(&mut self, record: &OutboundRecord) -> Result<(), SinkError> {
        let payload = self
            .encoder
            .encode(&record.tag, record.time, &record.fields)?;
        self.manager.write(&payload).await?;
        Ok(())
    }

    async fn close(&mut self) {
        log::info!(
            "Closing connection to {} ({} reconnects)",
            self.manager.address(),
            self.manager.reconnect_count()
        );
        self.manager.close().await;
    }
}

#[async_trait]
impl RecordSink for FluentClient {
    fn target(&self) -> &str {
        self.address()
    }

    async fn send(&mut self, record: &OutboundRecord) -> Result<(), SinkError> {
        self.post(&record.tag, record.time, &record.fields).await?;
        Ok(())
    }

    async fn close(&mut self) {
        FluentClient::close(self).await;
    }
}
