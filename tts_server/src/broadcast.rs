//! Fan-out of produced audio to every connected audio-channel subscriber.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a
//! subscriber that has gone away is removed, and one whose queue is full is
//! removed as lagging so a slow socket can never stall synthesis or the
//! other listeners.
//!
//! Every frame is tagged with the generation of the run that produced it.
//! [`Broadcaster::invalidate`] starts a new generation, after which frames
//! from older runs are rejected at publish time and skipped by the socket
//! writers.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use tts_core::AudioChunk;

/// What the audio channel carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFrame {
    Chunk(AudioChunk),
    /// Sent once when a run finishes on its own.
    Complete,
}

/// A frame plus the run that produced it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub generation: u64,
    pub frame: AudioFrame,
}

struct Subscribers {
    generation: u64,
    senders: HashMap<Uuid, mpsc::Sender<Delivery>>,
}

struct Inner {
    state: Mutex<Subscribers>,
    buffer: usize,
    lagged: AtomicU64,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// `buffer` is the number of frames each subscriber may have queued.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Subscribers {
                    generation: 0,
                    senders: HashMap::new(),
                }),
                buffer: buffer.max(1),
                lagged: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        // The guarded data is a map and a counter; a panic elsewhere cannot
        // leave it inconsistent.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = Uuid::new_v4();
        self.lock().senders.insert(id, tx);
        debug!(subscriber = %id, "Audio subscriber added");
        Subscription {
            id,
            rx,
            broadcaster: self.clone(),
        }
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self.lock().senders.remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "Audio subscriber removed");
        }
        removed
    }

    /// Queue `frame` for every live subscriber. Returns how many accepted it.
    ///
    /// Frames from a generation other than the current one are dropped.
    pub fn publish(&self, generation: u64, frame: AudioFrame) -> usize {
        let mut state = self.lock();
        if generation != state.generation {
            debug!(
                generation,
                current = state.generation,
                "Dropping frame from a superseded run"
            );
            return 0;
        }

        let mut delivered = 0;
        let mut lagging = Vec::new();
        state.senders.retain(|id, tx| {
            match tx.try_send(Delivery {
                generation,
                frame: frame.clone(),
            }) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Closed(_)) => false,
                Err(TrySendError::Full(_)) => {
                    lagging.push(*id);
                    false
                }
            }
        });
        drop(state);

        for id in lagging {
            self.inner.lagged.fetch_add(1, Ordering::Relaxed);
            warn!(subscriber = %id, "Audio subscriber fell behind, disconnecting it");
        }
        delivered
    }

    /// Start a new generation, orphaning every frame already produced.
    pub fn invalidate(&self) -> u64 {
        let mut state = self.lock();
        state.generation += 1;
        state.generation
    }

    pub fn current_generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().senders.len()
    }

    /// Subscribers removed so far for falling behind.
    pub fn lagged_count(&self) -> u64 {
        self.inner.lagged.load(Ordering::Relaxed)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("buffer", &self.inner.buffer)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// One audio listener. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<Delivery>,
    broadcaster: Broadcaster,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next frame, or `None` once the broadcaster has dropped this
    /// subscriber (for lagging) and the queue is drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}
