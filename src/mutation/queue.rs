// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

struct Tail {
    seq: u64,
    done: oneshot::Receiver<()>,
}

struct Tails<K> {
    next_seq: u64,
    by_key: HashMap<K, Tail>,
}

/// First-in first-out ordering of backend writes per key.
///
/// Enqueueing is synchronous, so callers can take their place in line in
/// the same critical section that applies their local change. The write
/// itself waits for the previous ticket on the same key to be dropped.
pub struct WriteQueue<K> {
    tails: Arc<Mutex<Tails<K>>>,
}

impl<K: Eq + Hash + Clone> WriteQueue<K> {
    pub fn new() -> Self {
        Self {
            tails: Arc::new(Mutex::new(Tails {
                next_seq: 0,
                by_key: HashMap::new(),
            })),
        }
    }

    pub fn enqueue(&self, key: K) -> QueueTicket<K> {
        let (tx, rx) = oneshot::channel();
        let mut tails = self.tails.lock().unwrap_or_else(|e| e.into_inner());
        tails.next_seq += 1;
        let seq = tails.next_seq;
        let previous = tails.by_key.insert(key.clone(), Tail { seq, done: rx });
        QueueTicket {
            key,
            seq,
            previous: previous.map(|tail| tail.done),
            _done: tx,
            tails: self.tails.clone(),
        }
    }

    /// Keys with writes queued or in flight.
    pub fn busy(&self) -> usize {
        self.tails
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_key
            .len()
    }
}

impl<K: Eq + Hash + Clone> Default for WriteQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// A place in a [`WriteQueue`]. Dropping it lets the next write go.
pub struct QueueTicket<K: Eq + Hash> {
    key: K,
    seq: u64,
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
    tails: Arc<Mutex<Tails<K>>>,
}

impl<K: Eq + Hash> QueueTicket<K> {
    /// Wait until every earlier ticket on the same key has been dropped.
    pub async fn wait_turn(&mut self) {
        if let Some(previous) = self.previous.take() {
            // Err means the sender was dropped, which is the signal.
            let _ = previous.await;
        }
    }
}

impl<K: Eq + Hash> Drop for QueueTicket<K> {
    fn drop(&mut self) {
        let mut tails = self.tails.lock().unwrap_or_else(|e| e.into_inner());
        if tails.by_key.get(&self.key).is_some_and(|tail| tail.seq == self.seq) {
            tails.by_key.remove(&self.key);
        }
    }
}
