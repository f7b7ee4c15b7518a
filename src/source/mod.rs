//! Message source interfaces.
//!
//! Ownership model:
//! - `MessageSource` is the orchestrator-facing interface that produces fetches.
//! - `live::LiveQueueSource` polls a `QueueTransport` and acknowledges messages.
//! - `replay::ReplaySource` pages pre-recorded dumps held in memory.
//!
//! Exhaustion is an empty `FetchBatch`, never an error.

use crate::data::{RawMessage, UniqueMessage};
use crate::dedup::deduplicate;
use crate::errors::IngestError;
use crate::types::ClassificationId;

/// Live queue client and transport seam.
pub mod live;
/// In-process queue transport with visibility timeouts.
pub mod memory_queue;
/// Offline replay source backed by message dump files.
pub mod replay;

pub use live::{LiveQueueSource, QueueTransport, ReceiveRequest, ReceivedMessage, body_checksum};
pub use memory_queue::MemoryQueue;
pub use replay::ReplaySource;

/// Result of a single fetch call.
#[derive(Clone, Debug, Default)]
pub struct FetchBatch {
    /// Messages deduplicated by classification id within this fetch.
    pub unique: Vec<UniqueMessage>,
    /// Every decoded message in arrival order, repeats included.
    pub messages: Vec<RawMessage>,
    /// Classification ids in arrival order, repeats included.
    pub ids: Vec<ClassificationId>,
}

impl FetchBatch {
    /// Build a fetch from messages in arrival order.
    pub fn from_arrivals(arrivals: Vec<UniqueMessage>) -> Self {
        let messages = arrivals
            .iter()
            .map(|message| message.message().clone())
            .collect();
        let ids = arrivals
            .iter()
            .map(UniqueMessage::classification_id)
            .collect();
        Self {
            unique: deduplicate(arrivals),
            messages,
            ids,
        }
    }

    /// Returns `true` when the source had nothing to deliver.
    pub fn is_empty(&self) -> bool {
        self.unique.is_empty()
    }
}

/// Orchestrator-facing message source.
pub trait MessageSource {
    /// Stable source identifier used in logs.
    fn id(&self) -> &str;

    /// Fetch the next page of messages.
    ///
    /// When `delete_on_ack` is true, sources with acknowledgement semantics
    /// remove verified messages so they are not redelivered.
    fn fetch(&mut self, delete_on_ack: bool) -> Result<FetchBatch, IngestError>;

    /// Whether fetched messages are already free of cross-fetch repeats.
    ///
    /// The orchestrator skips buffer deduplication for such sources.
    fn is_prededuplicated(&self) -> bool {
        false
    }

    /// Pick up records appended to the backing store since construction.
    ///
    /// Returns the number of new records made available.
    fn update(&mut self) -> Result<usize, IngestError> {
        Ok(0)
    }
}

impl<S: MessageSource + ?Sized> MessageSource for Box<S> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn fetch(&mut self, delete_on_ack: bool) -> Result<FetchBatch, IngestError> {
        (**self).fetch(delete_on_ack)
    }

    fn is_prededuplicated(&self) -> bool {
        (**self).is_prededuplicated()
    }

    fn update(&mut self) -> Result<usize, IngestError> {
        (**self).update()
    }
}
