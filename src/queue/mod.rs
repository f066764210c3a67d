//! Queue ports consumed by the reconciliation loop and the publisher.
//!
//! The transport is assumed to deliver at least once, may duplicate messages,
//! and gives no ordering guarantee. Nothing in this module tries to fix that;
//! the consumer compensates with the watermark comparison.

pub mod credentials;
pub mod memory;
pub mod sigv4;
pub mod sqs;

use std::time::Duration;
use thiserror::Error;

pub use memory::{InMemoryBroker, InMemoryQueue};
pub use credentials::{CredentialProvider, CredentialSource, Credentials};
pub use sqs::{SqsClient, SqsQueue};

/// Message handed out by a receive call, tagged with the handle needed to delete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// Consumer-side view of a single queue.
pub trait QueuePort {
    /// Long-polls for up to `wait`, returning between zero and `max_messages` messages.
    fn receive(
        &mut self,
        wait: Duration,
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledges a message so it is never redelivered.
    fn delete(&mut self, message: &QueueMessage) -> Result<(), QueueError>;
}

/// Producer-side view of a single queue.
pub trait QueueSink {
    /// Enqueues one message body, returning the broker-assigned id.
    fn send(&mut self, body: &str) -> Result<String, QueueError>;
}

/// Resolves queue names to handles.
pub trait QueueResolver {
    type Queue: QueuePort + QueueSink;

    fn open(&mut self, queue_name: &str) -> Result<Self::Queue, QueueError>;
}

/// Transport-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue {queue} does not exist")]
    NotFound { queue: String },
    #[error("queue transport is misconfigured: {0}")]
    Configuration(String),
    #[error("queue request failed: {0}")]
    Transport(String),
    #[error("queue rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
}
