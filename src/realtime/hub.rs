//! Connection registry and notification fan-out
//!
//! The registry maps a connection id to the connection's identity, role, and
//! the sending half of its bounded outbound queue. Delivery scans the registry
//! under the read lock and uses `try_send`, so a sender never waits on a slow
//! client. A connection whose queue is full (or whose writer is gone) is
//! collected during the scan and removed under the write lock afterwards.
//!
//! The registry holds the only `Sender` for each queue. Removing an entry
//! drops it, which ends the connection's writer loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::realtime::protocol::Notification;
use crate::schema::Role;

/// Process-unique connection id
pub type ConnectionId = u64;

struct Entry {
    identity: String,
    role: Role,
    tx: mpsc::Sender<Arc<Notification>>,
}

/// A freshly registered connection: its id and the receiving end of its queue
pub struct Registration {
    pub id: ConnectionId,
    pub rx: mpsc::Receiver<Arc<Notification>>,
}

/// Registry of live realtime connections
pub struct Hub {
    connections: RwLock<HashMap<ConnectionId, Entry>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Add a connection for a resolved identity and role
    pub fn register(&self, identity: impl Into<String>, role: Role) -> Registration {
        let identity = identity.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let total = {
            let mut connections = self.connections.write();
            connections.insert(
                id,
                Entry {
                    identity: identity.clone(),
                    role,
                    tx,
                },
            );
            connections.len()
        };
        tracing::info!(
            "Registered connection {} for {} ({}), {} live",
            id,
            identity,
            role,
            total
        );
        Registration { id, rx }
    }

    /// Remove a connection and release its queue. Returns whether it was present.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().remove(&id);
        match removed {
            Some(entry) => {
                tracing::info!("Unregistered connection {} for {}", id, entry.identity);
                true
            }
            None => false,
        }
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live connections for one identity
    pub fn connections_for(&self, identity: &str) -> usize {
        self.connections
            .read()
            .values()
            .filter(|entry| entry.identity == identity)
            .count()
    }

    /// Deliver to every connection of `identity`. Returns the number of queues reached.
    pub fn send(&self, identity: &str, message: Notification) -> usize {
        let message = Arc::new(stamp(message, identity));
        self.deliver(|entry| (entry.identity == identity).then(|| Arc::clone(&message)))
    }

    /// Deliver to every connection whose role matches
    pub fn send_to_role(&self, role: Role, message: Notification) -> usize {
        let message = Arc::new(message);
        self.deliver(|entry| (entry.role == role).then(|| Arc::clone(&message)))
    }

    /// Deliver to every connection of any identity in `identities`, in one
    /// registry scan. Duplicate identities in the input are sent once.
    pub fn send_to_many<I, S>(&self, identities: I, message: Notification) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets: HashMap<String, Arc<Notification>> = identities
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect::<HashSet<_>>()
            .into_iter()
            .map(|id| {
                let stamped = Arc::new(stamp(message.clone(), &id));
                (id, stamped)
            })
            .collect();
        if targets.is_empty() {
            return 0;
        }
        self.deliver(|entry| targets.get(&entry.identity).cloned())
    }

    /// Deliver to every live connection
    pub fn broadcast(&self, message: Notification) -> usize {
        let message = Arc::new(message);
        self.deliver(|_| Some(Arc::clone(&message)))
    }

    /// One registry scan: enqueue to matching connections without waiting,
    /// then drop the ones that could not take the message.
    fn deliver<F>(&self, route: F) -> usize
    where
        F: Fn(&Entry) -> Option<Arc<Notification>>,
    {
        let mut delivered = 0;
        let mut dead = Vec::new();

        {
            let connections = self.connections.read();
            for (id, entry) in connections.iter() {
                let Some(message) = route(entry) else {
                    continue;
                };
                match entry.tx.try_send(message) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            "Dropping connection {} for {}: outbound queue full",
                            id,
                            entry.identity
                        );
                        dead.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.write();
            for id in dead {
                connections.remove(&id);
            }
        }

        tracing::debug!("Delivered notification to {} connection(s)", delivered);
        delivered
    }
}

/// Address a message to `identity` unless the caller already did
fn stamp(mut message: Notification, identity: &str) -> Notification {
    if message.identity.is_none() {
        message.identity = Some(identity.to_string());
    }
    message
}
