use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::LiveQueueConfig;
use crate::constants::queue::LIVE_SOURCE_PREFIX;
use crate::data::{RawMessage, UniqueMessage};
use crate::errors::IngestError;
use crate::source::{FetchBatch, MessageSource};
use crate::types::{BodyChecksum, ReceiptHandle, SourceId};

/// Parameters of one receive call.
#[derive(Clone, Copy, Debug)]
pub struct ReceiveRequest {
    /// Upper bound on messages returned.
    pub max_messages: usize,
    /// Long-poll wait when the queue is empty.
    pub wait_time: Duration,
    /// How long returned messages stay hidden from other receivers.
    pub visibility_timeout: Duration,
}

/// One message as handed over by a queue transport.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    /// Message body (expected to be a JSON document).
    pub body: String,
    /// Transport-supplied MD5 of `body`, hex encoded.
    pub md5_of_body: BodyChecksum,
    /// Handle used to acknowledge this delivery.
    pub receipt_handle: ReceiptHandle,
}

/// Queue service seam used by [`LiveQueueSource`].
///
/// Implementations wrap a concrete queue client. `receive` should block for at
/// most `request.wait_time` when the queue is empty and hide returned messages
/// for `request.visibility_timeout`.
pub trait QueueTransport {
    fn receive(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, IngestError>;

    fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), IngestError>;

    fn send(&self, queue_url: &str, body: String) -> Result<(), IngestError>;

    fn purge(&self, queue_url: &str) -> Result<(), IngestError>;
}

impl<T: QueueTransport + ?Sized> QueueTransport for &T {
    fn receive(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, IngestError> {
        (**self).receive(queue_url, request)
    }

    fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), IngestError> {
        (**self).delete(queue_url, receipt_handle)
    }

    fn send(&self, queue_url: &str, body: String) -> Result<(), IngestError> {
        (**self).send(queue_url, body)
    }

    fn purge(&self, queue_url: &str) -> Result<(), IngestError> {
        (**self).purge(queue_url)
    }
}

/// Hex MD5 digest of a message body.
pub fn body_checksum(body: &str) -> BodyChecksum {
    format!("{:x}", md5::compute(body.as_bytes()))
}

/// Running counters for a live source.
#[derive(Clone, Debug, Default)]
pub struct LiveQueueStats {
    /// Messages returned by the transport.
    pub received: u64,
    /// Bodies whose MD5 did not match; left on the queue.
    pub checksum_mismatches: u64,
    /// Bodies that were not a JSON object with a classification id.
    pub undecodable: u64,
    pub acknowledged: u64,
    pub ack_failures: u64,
    pub receive_failures: u64,
}

/// Polling client over a [`QueueTransport`].
pub struct LiveQueueSource<T: QueueTransport> {
    id: SourceId,
    config: LiveQueueConfig,
    transport: T,
    stats: LiveQueueStats,
}

impl<T: QueueTransport> LiveQueueSource<T> {
    /// Create a live source after validating `config`.
    pub fn new(config: LiveQueueConfig, transport: T) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self {
            id: format!("{LIVE_SOURCE_PREFIX}{}", config.queue_url),
            config,
            transport,
            stats: LiveQueueStats::default(),
        })
    }

    /// Counters accumulated since construction.
    pub fn stats(&self) -> &LiveQueueStats {
        &self.stats
    }

    /// Borrow the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Post JSON object messages to the queue, optionally purging it first.
    ///
    /// Non-object values are skipped. Returns the number of messages posted.
    pub fn put_messages(&self, messages: &[RawMessage], purge: bool) -> Result<usize, IngestError> {
        if purge {
            self.transport.purge(&self.config.queue_url)?;
        }
        let mut posted = 0usize;
        for message in messages {
            if !message.is_object() {
                continue;
            }
            self.transport
                .send(&self.config.queue_url, serde_json::to_string(message)?)?;
            posted += 1;
        }
        info!(
            source_id = %self.id,
            posted,
            "posted messages to queue"
        );
        Ok(posted)
    }

    fn request(&self) -> ReceiveRequest {
        ReceiveRequest {
            max_messages: self.config.max_messages,
            wait_time: self.config.wait_time,
            visibility_timeout: self.config.visibility_timeout,
        }
    }

    fn verify(&mut self, received: &ReceivedMessage) -> Option<UniqueMessage> {
        let checksum = body_checksum(&received.body);
        if !checksum.eq_ignore_ascii_case(received.md5_of_body.trim()) {
            self.stats.checksum_mismatches += 1;
            warn!(
                source_id = %self.id,
                expected = %received.md5_of_body,
                actual = %checksum,
                "message body checksum mismatch; dropping message"
            );
            return None;
        }
        let decoded = serde_json::from_str::<Value>(&received.body)
            .ok()
            .and_then(UniqueMessage::new);
        if decoded.is_none() {
            self.stats.undecodable += 1;
            warn!(
                source_id = %self.id,
                "message body has no usable classification_id; dropping message"
            );
        }
        decoded
    }
}

impl<T: QueueTransport> MessageSource for LiveQueueSource<T> {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch(&mut self, delete_on_ack: bool) -> Result<FetchBatch, IngestError> {
        let request = self.request();
        let received = match self.transport.receive(&self.config.queue_url, &request) {
            Ok(received) => received,
            Err(err) => {
                self.stats.receive_failures += 1;
                warn!(source_id = %self.id, error = %err, "queue receive failed");
                return Ok(FetchBatch::default());
            }
        };
        self.stats.received += received.len() as u64;

        let mut arrivals = Vec::with_capacity(received.len());
        for item in &received {
            let Some(message) = self.verify(item) else {
                continue;
            };
            if delete_on_ack {
                match self
                    .transport
                    .delete(&self.config.queue_url, &item.receipt_handle)
                {
                    Ok(()) => self.stats.acknowledged += 1,
                    Err(err) => {
                        self.stats.ack_failures += 1;
                        warn!(
                            source_id = %self.id,
                            classification_id = message.classification_id(),
                            error = %err,
                            "failed to acknowledge message; it may be redelivered"
                        );
                    }
                }
            }
            arrivals.push(message);
        }
        let batch = FetchBatch::from_arrivals(arrivals);
        debug!(
            source_id = %self.id,
            received = received.len(),
            unique = batch.unique.len(),
            "queue fetch completed"
        );
        Ok(batch)
    }
}
