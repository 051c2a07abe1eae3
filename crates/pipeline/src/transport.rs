//! Connection abstraction used by sessions
//!
//! The session engine does not know about WebSockets. The server adapts its
//! socket halves to [`FrameSource`] and [`FrameSink`]; tests use channels.

use crate::priming::LivenessProbe;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use voice_gateway_core::ServerFrame;

/// A message read from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Binary(Vec<u8>),
    Text(String),
    /// Keep-alive traffic with no payload for the session
    Ping,
    Close,
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// Inbound half of a client connection
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next message, or `None` once the stream has ended
    async fn next_message(&mut self) -> Option<Result<InboundMessage, TransportError>>;
}

/// Outbound half of a client connection
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_frame(&mut self, frame: ServerFrame) -> Result<(), TransportError>;

    /// Close the connection, optionally telling the client why
    async fn close(&mut self, reason: Option<String>) -> Result<(), TransportError>;
}

/// Liveness probe that peeks at the inbound stream.
///
/// Waits up to `timeout` for a message: silence means the client is still
/// there, a close, error or end of stream means it left. Any other message is
/// consumed and discarded.
pub struct SourceProbe<'a, S: ?Sized> {
    source: &'a mut S,
    timeout: Duration,
    cancel: Option<CancellationToken>,
    gone: bool,
}

impl<'a, S: FrameSource + ?Sized> SourceProbe<'a, S> {
    pub fn new(source: &'a mut S, timeout: Duration) -> Self {
        Self {
            source,
            timeout,
            cancel: None,
            gone: false,
        }
    }

    /// Also report the client gone once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[async_trait]
impl<'a, S: FrameSource + ?Sized> LivenessProbe for SourceProbe<'a, S> {
    async fn is_alive(&mut self) -> bool {
        if self.gone {
            return false;
        }
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            self.gone = true;
            return false;
        }

        match tokio::time::timeout(self.timeout, self.source.next_message()).await {
            Err(_) => true,
            Ok(Some(Ok(InboundMessage::Close))) | Ok(Some(Err(_))) | Ok(None) => {
                self.gone = true;
                false
            }
            Ok(Some(Ok(_))) => true,
        }
    }
}
