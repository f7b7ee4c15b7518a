use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::errors::IngestError;
use crate::source::live::{QueueTransport, ReceiveRequest, ReceivedMessage, body_checksum};
use crate::types::{BodyChecksum, ReceiptHandle};

/// Thread-safe in-process queue honouring the live transport contract.
///
/// Receives long-poll on a condition variable, returned messages stay hidden
/// until their visibility timeout lapses, and only the latest receipt handle
/// of a delivery can delete it. Clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<(Mutex<QueueState>, Condvar)>,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    next_id: u64,
}

struct StoredMessage {
    message_id: u64,
    body: String,
    checksum: BodyChecksum,
    hidden_until: Option<Instant>,
    receive_count: u32,
    receipt: Option<ReceiptHandle>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.hidden_until.is_none_or(|until| until <= now)
    }
}

impl MemoryQueue {
    /// Create an empty queue set.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `body` with an explicit checksum, bypassing digest computation.
    ///
    /// Lets callers simulate corruption in transit.
    pub fn send_with_checksum(&self, queue_url: &str, body: String, checksum: BodyChecksum) {
        let mut state = self.state();
        state.next_id += 1;
        let message_id = state.next_id;
        state
            .queues
            .entry(queue_url.to_string())
            .or_default()
            .push_back(StoredMessage {
                message_id,
                body,
                checksum,
                hidden_until: None,
                receive_count: 0,
                receipt: None,
            });
        drop(state);
        self.inner.1.notify_all();
    }

    /// Number of stored messages (visible or in flight) on `queue_url`.
    pub fn len(&self, queue_url: &str) -> usize {
        self.state().queues.get(queue_url).map_or(0, VecDeque::len)
    }

    /// Returns `true` when `queue_url` holds no messages.
    pub fn is_empty(&self, queue_url: &str) -> bool {
        self.len(queue_url) == 0
    }

    fn take_visible(
        state: &mut QueueState,
        queue_url: &str,
        request: &ReceiveRequest,
        now: Instant,
    ) -> Vec<ReceivedMessage> {
        let Some(queue) = state.queues.get_mut(queue_url) else {
            return Vec::new();
        };
        let mut received = Vec::new();
        for stored in queue.iter_mut() {
            if received.len() >= request.max_messages {
                break;
            }
            if !stored.is_visible(now) {
                continue;
            }
            stored.receive_count += 1;
            stored.hidden_until = Some(now + request.visibility_timeout);
            let receipt = format!("rh-{}-{}", stored.message_id, stored.receive_count);
            stored.receipt = Some(receipt.clone());
            received.push(ReceivedMessage {
                body: stored.body.clone(),
                md5_of_body: stored.checksum.clone(),
                receipt_handle: receipt,
            });
        }
        received
    }
}

impl QueueTransport for MemoryQueue {
    fn receive(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, IngestError> {
        let deadline = Instant::now() + request.wait_time;
        let (lock, cvar) = &*self.inner;
        let mut state = lock
            .lock()
            .map_err(|_| IngestError::Transport("memory queue lock poisoned".to_string()))?;
        loop {
            let now = Instant::now();
            let received = Self::take_visible(&mut state, queue_url, request, now);
            if !received.is_empty() || now >= deadline {
                return Ok(received);
            }
            // Wake at the deadline or when the earliest hidden message reappears.
            let next_visible = state
                .queues
                .get(queue_url)
                .and_then(|queue| queue.iter().filter_map(|stored| stored.hidden_until).min());
            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            let timeout = wake_at.saturating_duration_since(now).max(Duration::from_millis(1));
            let (guard, _) = cvar
                .wait_timeout(state, timeout)
                .map_err(|_| IngestError::Transport("memory queue lock poisoned".to_string()))?;
            state = guard;
        }
    }

    fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), IngestError> {
        let mut state = self.state();
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| IngestError::Transport(format!("unknown queue '{queue_url}'")))?;
        let position = queue
            .iter()
            .position(|stored| stored.receipt.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                IngestError::Transport(format!("receipt handle '{receipt_handle}' is not current"))
            })?;
        queue.remove(position);
        Ok(())
    }

    fn send(&self, queue_url: &str, body: String) -> Result<(), IngestError> {
        let checksum = body_checksum(&body);
        self.send_with_checksum(queue_url, body, checksum);
        Ok(())
    }

    fn purge(&self, queue_url: &str) -> Result<(), IngestError> {
        if let Some(queue) = self.state().queues.get_mut(queue_url) {
            queue.clear();
        }
        Ok(())
    }
}
