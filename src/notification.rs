//! Chain notifier: ordered block-lifecycle events delivered to subscribers
//!
//! Callbacks run synchronously on the sender's thread. They must not block
//! and must not submit blocks to the chain state that sent them. Slow
//! consumers should use [`ChainNotifier::subscribe_channel`].

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::chain::BlockIndex;
use crate::error::ChainError;
use crate::types::Block;

/// Kind of a chain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    /// The block was accepted into the block tree, not necessarily the main chain.
    BlockAccepted,
    /// The block was connected to the main chain.
    BlockConnected,
    /// The block was disconnected from the main chain.
    BlockDisconnected,
    /// The main chain has a new tip.
    ChainTipUpdated,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationType::BlockAccepted => "NTBlockAccepted",
            NotificationType::BlockConnected => "NTBlockConnected",
            NotificationType::BlockDisconnected => "NTBlockDisconnected",
            NotificationType::ChainTipUpdated => "NTChainTipUpdated",
        };
        f.write_str(name)
    }
}

/// Payload of a tip change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipUpdatedEvent {
    /// The new tip.
    pub tip: BlockIndex,
    /// Last block shared by the old and new chains; `None` for the first tip.
    pub fork: Option<BlockIndex>,
    pub is_initial_download: bool,
}

/// A chain event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    BlockAccepted(Arc<Block>),
    BlockConnected(Arc<Block>),
    BlockDisconnected(Arc<Block>),
    ChainTipUpdated(TipUpdatedEvent),
}

impl Notification {
    pub fn kind(&self) -> NotificationType {
        match self {
            Notification::BlockAccepted(_) => NotificationType::BlockAccepted,
            Notification::BlockConnected(_) => NotificationType::BlockConnected,
            Notification::BlockDisconnected(_) => NotificationType::BlockDisconnected,
            Notification::ChainTipUpdated(_) => NotificationType::ChainTipUpdated,
        }
    }

    /// The block carried by block events.
    pub fn block(&self) -> Option<&Arc<Block>> {
        match self {
            Notification::BlockAccepted(block)
            | Notification::BlockConnected(block)
            | Notification::BlockDisconnected(block) => Some(block),
            Notification::ChainTipUpdated(_) => None,
        }
    }
}

/// Subscriber callback.
pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    callbacks: RwLock<Vec<(u64, NotificationCallback)>>,
    next_id: AtomicU64,
}

impl Subscribers {
    fn remove(&self, id: u64) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }
}

/// Registry of subscriber callbacks.
#[derive(Clone, Default)]
pub struct ChainNotifier {
    inner: Arc<Subscribers>,
}

impl fmt::Debug for ChainNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainNotifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by `subscribe`; dropping it keeps the subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    notifier: Weak<Subscribers>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the callback. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.notifier
            .upgrade()
            .map_or(false, |subscribers| subscribers.remove(self.id))
    }
}

impl ChainNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe: register a callback under the exclusive lock.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.register(id, Arc::new(callback))
    }

    fn register(&self, id: u64, callback: NotificationCallback) -> Subscription {
        self.inner.callbacks.write().push((id, callback));
        Subscription {
            id,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe through a bounded channel. The callback side never blocks:
    /// when the channel is full the notification is dropped with a warning.
    /// Once every receiver is dropped the subscription removes itself.
    pub fn subscribe_channel(&self, capacity: usize) -> (Subscription, async_channel::Receiver<Notification>) {
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::downgrade(&self.inner);
        let callback = move |notification: &Notification| match sender.try_send(notification.clone()) {
            Ok(()) => {}
            Err(err) if err.is_full() => {
                warn!(kind = %notification.kind(), "Notification channel full, dropping event");
            }
            Err(_) => {
                // Delivery works from a snapshot, so the registry lock is free here.
                if registry.upgrade().map_or(false, |subscribers| subscribers.remove(id)) {
                    debug!(subscriber = id, "Notification channel closed, unsubscribed");
                }
            }
        };
        (self.register(id, Arc::new(callback)), receiver)
    }

    /// SendNotification: snapshot the callbacks under the shared lock,
    /// release it, then invoke each callback in registration order.
    ///
    /// A faulting callback is isolated; the rest still run. Returns the
    /// number of callbacks that faulted.
    pub fn send_notification(&self, notification: Notification) -> usize {
        let callbacks: Vec<(u64, NotificationCallback)> = self.inner.callbacks.read().clone();

        let mut faults = 0;
        for (id, callback) in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&notification))) {
                faults += 1;
                let fault = ChainError::CallbackFault(panic_message(panic.as_ref()));
                error!(subscriber = id, kind = %notification.kind(), %fault, "Notification callback faulted");
            }
        }
        faults
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.callbacks.read().len()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
