//! Cancellation Registry (§4.F): a per-chat cancel event plus a short-lived
//! "pending cancel" for the race where a stop arrives before the producer
//! has registered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use uuid::Uuid;

/// A registered stream's cancellation handle. Cheap to clone; all clones
/// share the same underlying `Notify` + flag.
#[derive(Clone)]
pub struct CancelEvent {
    notify: Arc<Notify>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl CancelEvent {
    fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    fn new_set() -> Self {
        let e = Self::new();
        e.set();
        e
    }

    fn set(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Wait until cancelled. Returns immediately if already set.
    pub async fn wait(&self) {
        // `notified()` doesn't actually register the waiter until first
        // polled, which would otherwise happen only at the final `.await`
        // below — after the `is_set()` check. `enable()` forces registration
        // immediately so a `set()` (store + `notify_waiters()`) landing
        // between the check and the `.await` is still observed instead of
        // parking forever.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

enum Slot {
    /// A Stream Runtime has registered; `CancelEvent` is live.
    Live(CancelEvent),
    /// A cancel arrived before any producer registered; expires at `expires_at`.
    Pending { expires_at: Instant },
}

/// Per-chat cancellation slots (§4.F). One process-wide registry, keyed by
/// chat id.
pub struct CancellationRegistry {
    slots: DashMap<Uuid, Slot>,
    pending_ttl: Duration,
}

impl CancellationRegistry {
    pub fn new(pending_ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            pending_ttl,
        }
    }

    /// Register a fresh Stream Runtime for `chat_id`. If a non-expired
    /// pending-cancel flag exists, the returned event comes back
    /// already-signalled and the pending flag is cleared.
    pub fn register(&self, chat_id: Uuid) -> CancelEvent {
        match self.slots.get(&chat_id).map(|s| match &*s {
            Slot::Pending { expires_at } => Some(*expires_at),
            Slot::Live(_) => None,
        }) {
            Some(Some(expires_at)) if Instant::now() < expires_at => {
                let event = CancelEvent::new_set();
                self.slots.insert(chat_id, Slot::Live(event.clone()));
                event
            }
            _ => {
                let event = CancelEvent::new();
                self.slots.insert(chat_id, Slot::Live(event.clone()));
                event
            }
        }
    }

    /// Signal cancel for `chat_id`. If a producer is registered, wakes it
    /// directly; otherwise records a pending flag with a short TTL so a
    /// click that races the producer's registration is not lost.
    pub fn request_cancel(&self, chat_id: Uuid) {
        let live = self
            .slots
            .get(&chat_id)
            .map(|s| matches!(&*s, Slot::Live(_)))
            .unwrap_or(false);

        if live {
            if let Some(s) = self.slots.get(&chat_id) {
                if let Slot::Live(event) = &*s {
                    event.set();
                    return;
                }
            }
        }

        self.slots.insert(
            chat_id,
            Slot::Pending {
                expires_at: Instant::now() + self.pending_ttl,
            },
        );
    }

    /// Clear the registration (not the pending flag — there isn't one once
    /// a producer has registered).
    pub fn unregister(&self, chat_id: Uuid, event: &CancelEvent) {
        if let Some(entry) = self.slots.get(&chat_id) {
            if let Slot::Live(current) = &*entry {
                if current.is_set() == event.is_set() && Arc::ptr_eq(&current.notify, &event.notify) {
                    drop(entry);
                    self.slots.remove(&chat_id);
                }
            }
        }
    }

    pub fn is_cancelled(&self, chat_id: Uuid) -> bool {
        match self.slots.get(&chat_id) {
            Some(s) => match &*s {
                Slot::Live(event) => event.is_set(),
                Slot::Pending { expires_at } => Instant::now() < *expires_at,
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_cancel_race_is_observed_on_register() {
        let reg = CancellationRegistry::new(Duration::from_secs(5));
        let chat_id = Uuid::now_v7();

        reg.request_cancel(chat_id);
        let event = reg.register(chat_id);

        assert!(event.is_set());
        event.wait().await; // must not block
    }

    #[tokio::test]
    async fn cancel_after_register_wakes_waiter() {
        let reg = CancellationRegistry::new(Duration::from_secs(5));
        let chat_id = Uuid::now_v7();
        let event = reg.register(chat_id);
        assert!(!event.is_set());

        reg.request_cancel(chat_id);
        tokio::time::timeout(Duration::from_millis(200), event.wait())
            .await
            .expect("wait should resolve once cancelled");
        assert!(event.is_set());
    }

    #[tokio::test]
    async fn expired_pending_cancel_is_not_observed() {
        let reg = CancellationRegistry::new(Duration::from_millis(10));
        let chat_id = Uuid::now_v7();
        reg.request_cancel(chat_id);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let event = reg.register(chat_id);
        assert!(!event.is_set());
    }

    #[test]
    fn unregister_clears_live_slot() {
        let reg = CancellationRegistry::new(Duration::from_secs(5));
        let chat_id = Uuid::now_v7();
        let event = reg.register(chat_id);
        reg.unregister(chat_id, &event);
        assert!(!reg.is_cancelled(chat_id));
    }
}
