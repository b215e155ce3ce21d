/*!
 * State publication for BlueFlow state machines.
 *
 * Every machine owns a [`StatePublisher`] and hands out [`StateStream`]s.
 * A new stream first yields the current snapshot, then every later
 * publication in order. Replay and live delivery are taken under the same
 * lock, so a subscriber never misses or repeats an update at the seam.
 */
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::utils::{broadcast_stream, with_timeout};

/// Default number of snapshots buffered per subscriber
pub const DEFAULT_STATE_CAPACITY: usize = 256;

#[derive(Debug)]
struct Shared<S> {
    current: S,
    sender: broadcast::Sender<S>,
}

/// Owner side of a state stream
#[derive(Debug)]
pub struct StatePublisher<S> {
    shared: Arc<Mutex<Shared<S>>>,
}

impl<S> Clone for StatePublisher<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: Clone + Debug + Send + 'static> StatePublisher<S> {
    /// Create a publisher holding `initial` with the default buffer size
    pub fn new(initial: S) -> Self {
        Self::with_capacity(initial, DEFAULT_STATE_CAPACITY)
    }

    /// Create a publisher with a specific per-subscriber buffer size
    pub fn with_capacity(initial: S, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Mutex::new(Shared {
                current: initial,
                sender,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared<S>> {
        // A poisoned lock still holds a consistent snapshot: every writer
        // replaces `current` in a single assignment.
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a copy of the current snapshot
    pub fn current(&self) -> S {
        self.lock().current.clone()
    }

    /// Replace the current snapshot and notify subscribers
    pub fn publish(&self, state: S) {
        let mut shared = self.lock();
        trace!(?state, "publishing state");
        shared.current = state.clone();
        // No receivers is not an error: the snapshot is still replayed later
        let _ = shared.sender.send(state);
    }

    /// Modify the current snapshot in place and notify subscribers
    ///
    /// The read and the publication happen under one lock, so concurrent
    /// writers never lose each other's changes.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut S),
    {
        let mut shared = self.lock();
        let mut state = shared.current.clone();
        f(&mut state);
        trace!(?state, "publishing state");
        shared.current = state.clone();
        let _ = shared.sender.send(state);
    }

    /// Subscribe to snapshots, starting with the current one
    pub fn subscribe(&self) -> StateStream<S> {
        let shared = self.lock();
        StateStream {
            pending: Some(shared.current.clone()),
            receiver: shared.sender.subscribe(),
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().sender.receiver_count()
    }
}

impl<S: Clone + Debug + PartialEq + Send + 'static> StatePublisher<S> {
    /// Publish only when the snapshot differs from the current one
    ///
    /// Returns whether a publication happened.
    pub fn publish_if_changed(&self, state: S) -> bool {
        let mut shared = self.lock();
        if shared.current == state {
            return false;
        }
        trace!(?state, "publishing state");
        shared.current = state.clone();
        let _ = shared.sender.send(state);
        true
    }
}

/// Subscriber side of a state stream
#[derive(Debug)]
pub struct StateStream<S> {
    pending: Option<S>,
    receiver: broadcast::Receiver<S>,
}

impl<S: Clone + Debug + Send + 'static> StateStream<S> {
    /// Receive the next snapshot
    ///
    /// Returns `None` once the publisher has been dropped and every
    /// buffered snapshot has been delivered.
    pub async fn next(&mut self) -> Option<S> {
        if let Some(state) = self.pending.take() {
            return Some(state);
        }

        loop {
            match self.receiver.recv().await {
                Ok(state) => return Some(state),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("State subscriber lagged, {} snapshots skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Wait for the first snapshot matching `predicate`
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<S>
    where
        F: FnMut(&S) -> bool,
    {
        while let Some(state) = self.next().await {
            if predicate(&state) {
                return Ok(state);
            }
        }
        Err(Error::channel_closed("state publisher dropped"))
    }

    /// Wait for a matching snapshot, giving up after `duration`
    pub async fn wait_for_timeout<F>(&mut self, duration: Duration, predicate: F) -> Result<S>
    where
        F: FnMut(&S) -> bool,
    {
        with_timeout(duration, self.wait_for(predicate)).await
    }

    /// Convert into a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = S> + Send + Unpin + 'static {
        stream::iter(self.pending).chain(broadcast_stream(self.receiver))
    }
}
