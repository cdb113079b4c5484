//! Ready-made sinks
//!
//! - [`HydrateSink`] decodes a message body before handing it on, closing the
//!   channel instead of propagating a decode failure
//! - [`QueueSink`] moves routed messages onto a tokio queue for an async stage
//! - [`UnsupportedMessageSink`] declines everything; a default sink for
//!   routers that should tolerate unknown traffic

use super::router::MessageSink;
use super::TcMessage;
use crate::error::RoutingError;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Hydrates each message, then passes it to `consumer`
pub struct HydrateSink<F> {
    consumer: F,
}

impl<F> HydrateSink<F>
where
    F: Fn(TcMessage) + Send + Sync,
{
    pub fn new(consumer: F) -> Self {
        Self { consumer }
    }
}

impl<F> MessageSink for HydrateSink<F>
where
    F: Fn(TcMessage) + Send + Sync,
{
    fn put_message(&self, message: TcMessage) -> Result<(), RoutingError> {
        if let Err(e) = message.hydrate() {
            error!(
                channel = %message.channel().channel_id(),
                message_type = %message.message_type(),
                error = %e,
                "Failed to hydrate message; closing channel"
            );
            message.channel().close();
            return Ok(());
        }
        (self.consumer)(message);
        Ok(())
    }
}

/// Forwards messages into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct QueueSink {
    tx: mpsc::UnboundedSender<TcMessage>,
}

impl QueueSink {
    pub fn new(tx: mpsc::UnboundedSender<TcMessage>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end of its queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSink for QueueSink {
    fn put_message(&self, message: TcMessage) -> Result<(), RoutingError> {
        if let Err(mpsc::error::SendError(dropped)) = self.tx.send(message) {
            warn!(
                message_type = %dropped.message_type(),
                "Queue consumer has gone away; dropping message"
            );
        }
        Ok(())
    }
}

/// Declines every message
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedMessageSink;

impl MessageSink for UnsupportedMessageSink {
    fn put_message(&self, message: TcMessage) -> Result<(), RoutingError> {
        Err(RoutingError::Unsupported(message.message_type()))
    }
}
