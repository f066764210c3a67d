use super::{QueueError, QueueMessage, QueuePort, QueueResolver, QueueSink};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Process-local broker holding named queues. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    queues: Arc<Mutex<HashMap<String, InMemoryQueue>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or returns the existing) queue with the given name.
    pub fn create_queue(&self, name: impl Into<String>) -> InMemoryQueue {
        let mut queues = lock(&self.queues);
        queues.entry(name.into()).or_default().clone()
    }

    pub fn queue(&self, name: &str) -> Option<InMemoryQueue> {
        lock(&self.queues).get(name).cloned()
    }
}

impl QueueResolver for InMemoryBroker {
    type Queue = InMemoryQueue;

    fn open(&mut self, queue_name: &str) -> Result<Self::Queue, QueueError> {
        self.queue(queue_name).ok_or_else(|| QueueError::NotFound {
            queue: queue_name.to_string(),
        })
    }
}

/// At-least-once queue kept in memory.
///
/// Received messages move to an in-flight set until deleted. They only become
/// visible again through [`InMemoryQueue::redeliver_in_flight`], which stands
/// in for a visibility timeout expiring. Receives never block.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    visible: VecDeque<StoredMessage>,
    in_flight: BTreeMap<String, StoredMessage>,
    deleted: Vec<String>,
    receive_failures: VecDeque<QueueError>,
    delete_failures: VecDeque<QueueError>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    receive_count: u32,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting to be received.
    pub fn visible_len(&self) -> usize {
        lock(&self.state).visible.len()
    }

    /// Number of received but not yet deleted messages.
    pub fn in_flight_len(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    /// Ids of deleted messages in deletion order.
    pub fn deleted_ids(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    /// Bodies still visible, front first.
    pub fn visible_bodies(&self) -> Vec<String> {
        lock(&self.state)
            .visible
            .iter()
            .map(|message| message.body.clone())
            .collect()
    }

    /// Makes every in-flight message visible again, as if its lease expired.
    pub fn redeliver_in_flight(&self) -> usize {
        let mut state = lock(&self.state);
        let expired = std::mem::take(&mut state.in_flight);
        let count = expired.len();
        state.visible.extend(expired.into_values());
        count
    }

    /// Queues an error returned by the next receive call.
    pub fn fail_next_receive(&self, error: QueueError) {
        lock(&self.state).receive_failures.push_back(error);
    }

    /// Queues an error returned by the next delete call.
    pub fn fail_next_delete(&self, error: QueueError) {
        lock(&self.state).delete_failures.push_back(error);
    }
}

impl QueueSink for InMemoryQueue {
    fn send(&mut self, body: &str) -> Result<String, QueueError> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let message_id = format!("msg-{}", state.next_id);
        state.visible.push_back(StoredMessage {
            message_id: message_id.clone(),
            body: body.to_string(),
            receive_count: 0,
        });
        Ok(message_id)
    }
}

impl QueuePort for InMemoryQueue {
    fn receive(
        &mut self,
        _wait: Duration,
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.receive_failures.pop_front() {
            return Err(error);
        }
        let mut batch = Vec::new();
        while batch.len() < max_messages.max(1) {
            let Some(mut stored) = state.visible.pop_front() else {
                break;
            };
            stored.receive_count += 1;
            let receipt_handle = format!("{}#{}", stored.message_id, stored.receive_count);
            batch.push(QueueMessage {
                message_id: stored.message_id.clone(),
                receipt_handle: receipt_handle.clone(),
                body: stored.body.clone(),
            });
            state.in_flight.insert(receipt_handle, stored);
        }
        Ok(batch)
    }

    fn delete(&mut self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.delete_failures.pop_front() {
            return Err(error);
        }
        if let Some(stored) = state.in_flight.remove(&message.receipt_handle) {
            state.deleted.push(stored.message_id);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
