//! Traffic event bus
//!
//! In-process fan-out from the proxy (publisher) to monitor connections
//! (subscribers). The registry maps each [`SubscriberId`] to the sending
//! half of that subscriber's own bounded queue. `publish` copies the current
//! set of senders out of the registry and releases the lock before sending,
//! so registrations and removals never race with iteration.
//!
//! Each subscriber queue holds at most `buffer` events. When a subscriber
//! falls behind, the oldest undelivered events are overwritten and the
//! subscriber is told how many it missed; the publisher never waits.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::snapshot::TrafficEvent;

/// Stable handle for one registered subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell subscribers apart in logs
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

type EventSender = broadcast::Sender<Arc<TrafficEvent>>;

/// Publish/subscribe hub for captured traffic
pub struct TrafficBus {
    subscribers: RwLock<HashMap<SubscriberId, EventSender>>,
    buffer: usize,
    published: AtomicU64,
    closed: AtomicBool,
}

impl TrafficBus {
    /// Create a bus whose subscribers each buffer up to `buffer` events
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a new subscriber. It receives only events published after
    /// this call returns.
    pub async fn subscribe(&self) -> Subscription {
        let id = SubscriberId::new();
        let (tx, rx) = broadcast::channel(self.buffer);

        {
            // `close` sets the flag before clearing under this lock, so checking
            // while holding it cannot race a concurrent close
            let mut subscribers = self.subscribers.write().await;
            if self.closed.load(Ordering::Acquire) {
                // Dropping the sender makes the first recv report closed
                drop(tx);
            } else {
                subscribers.insert(id, tx);
                debug!(subscriber = %id, "Subscriber registered");
            }
        }

        Subscription {
            id,
            rx,
            dropped: 0,
        }
    }

    /// Remove a subscriber. Returns false if it was not registered, which
    /// makes repeated calls harmless.
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().await.remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "Subscriber unregistered");
        }
        removed
    }

    /// Deliver an event to every subscriber registered right now.
    /// Returns how many subscribers it was queued for.
    pub async fn publish(&self, event: TrafficEvent) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }

        let targets: Vec<(SubscriberId, EventSender)> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        self.published.fetch_add(1, Ordering::Relaxed);
        let event = Arc::new(event);

        let mut delivered = 0;
        for (id, tx) in targets {
            match tx.send(Arc::clone(&event)) {
                Ok(_) => delivered += 1,
                // Receiver already gone; its connection is tearing down
                Err(_) => debug!(subscriber = %id, "Skipped closed subscriber"),
            }
        }
        delivered
    }

    /// Number of currently registered subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Number of events published since creation
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Stop accepting events and release every subscriber. Subscribers
    /// drain what is already queued, then see the end of their stream.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained = {
            let mut subscribers = self.subscribers.write().await;
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        debug!("Event bus closed, released {} subscribers", drained);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for TrafficBus {
    fn default() -> Self {
        Self::new(crate::config::defaults::DEFAULT_SUBSCRIBER_BUFFER)
    }
}

/// Receiving side of one bus registration
pub struct Subscription {
    id: SubscriberId,
    rx: broadcast::Receiver<Arc<TrafficEvent>>,
    dropped: u64,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Total events lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next event, or `None` once the subscriber has been removed from the
    /// bus and its queue is empty
    pub async fn recv(&mut self) -> Option<Arc<TrafficEvent>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    self.dropped += missed;
                    warn!(
                        subscriber = %self.id,
                        "Subscriber lagging, dropped {} oldest events", missed
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
