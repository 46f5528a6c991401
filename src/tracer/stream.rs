//! Fan-out of gadget output lines to stream readers.
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

/// Lines kept for readers that subscribe later.
pub const HISTORY_LEN: usize = 100;
const LIVE_BUFFER: usize = 64;

#[derive(Debug, Default)]
struct State {
    history: VecDeque<String>,
    subscribers: HashMap<u64, mpsc::Sender<String>>,
    next_id: u64,
    closed: bool,
}

/// Output stream of one tracer.
///
/// Delivery awaits each reader in turn, so a slow reader slows down the
/// publisher. Readers first receive the retained history.
#[derive(Debug, Default)]
pub struct GadgetStream {
    state: Mutex<State>,
    // Serializes publishers so every reader sees lines in history order.
    publish_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    /// Next line, `None` once the stream was closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl GadgetStream {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(HISTORY_LEN + LIVE_BUFFER);
        let mut state = self.state();
        for line in &state.history {
            // Cannot fail: the channel is empty and larger than the history.
            let _ = tx.try_send(line.clone());
        }
        let id = state.next_id;
        state.next_id += 1;
        if !state.closed {
            state.subscribers.insert(id, tx);
        }
        Subscription { id, rx }
    }

    /// Stops delivery to `subscription`; an in-flight publish never reaches it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.state().subscribers.remove(&subscription.id);
        drop(subscription);
    }

    pub async fn publish(&self, line: String) {
        let _ordered = self.publish_lock.lock().await;
        let senders: Vec<(u64, mpsc::Sender<String>)> = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            if state.history.len() == HISTORY_LEN {
                state.history.pop_front();
            }
            state.history.push_back(line.clone());
            state
                .subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        for (id, tx) in senders {
            if tx.send(line.clone()).await.is_err() {
                self.state().subscribers.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    pub fn history(&self) -> Vec<String> {
        self.state().history.iter().cloned().collect()
    }

    /// Ends every subscription once buffered lines are consumed.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.subscribers.clear();
    }
}
