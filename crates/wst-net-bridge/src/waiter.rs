//! Readiness notification queue shared between an engine endpoint and the socket that owns it.
//!
//! The engine calls [`WaiterQueue::notify`] whenever an endpoint becomes readable, writable or
//! errored. Bridge operations that hit `WouldBlock` register interest with
//! [`WaiterQueue::register`] and park on the returned [`WaitEntry`]. Each entry carries a
//! single-permit notification, so a readiness edge that arrives between the failed attempt and the
//! `await` is not lost. Dropping the entry deregisters it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;
use tokio::sync::Notify;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u16 {
        const IN = 0x01;
        const PRI = 0x02;
        const OUT = 0x04;
        const ERR = 0x08;
        const HUP = 0x10;
    }
}

impl EventMask {
    /// Input readiness plus the error conditions that also end a read wait.
    pub fn readable() -> Self {
        Self::IN | Self::ERR | Self::HUP
    }

    /// Output readiness plus the error conditions that also end a write wait.
    pub fn writable() -> Self {
        Self::OUT | Self::ERR | Self::HUP
    }
}

#[derive(Debug)]
struct Waiter {
    mask: EventMask,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct Waiters {
    next_id: u64,
    entries: HashMap<u64, Waiter>,
}

#[derive(Debug, Default)]
pub struct WaiterQueue {
    inner: Mutex<Waiters>,
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, mask: EventMask) -> WaitEntry<'_> {
        let notify = Arc::new(Notify::new());
        let mut waiters = self.lock();
        let id = waiters.next_id;
        waiters.next_id += 1;
        waiters.entries.insert(
            id,
            Waiter {
                mask,
                notify: notify.clone(),
            },
        );
        WaitEntry {
            queue: self,
            id,
            notify,
        }
    }

    /// Wake every entry whose interest mask intersects `events`.
    pub fn notify(&self, events: EventMask) {
        let waiters = self.lock();
        for waiter in waiters.entries.values() {
            if waiter.mask.intersects(events) {
                waiter.notify.notify_one();
            }
        }
    }

    /// Union of all registered interest masks.
    pub fn interest(&self) -> EventMask {
        self.lock()
            .entries
            .values()
            .fold(EventMask::empty(), |acc, waiter| acc | waiter.mask)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unregister(&self, id: u64) {
        self.lock().entries.remove(&id);
    }
}

/// Registered interest in a [`WaiterQueue`]; deregisters on drop.
#[derive(Debug)]
pub struct WaitEntry<'a> {
    queue: &'a WaiterQueue,
    id: u64,
    notify: Arc<Notify>,
}

impl WaitEntry<'_> {
    /// Suspend until the queue is notified with a matching event.
    ///
    /// A notification delivered before this call is consumed immediately.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Drop for WaitEntry<'_> {
    fn drop(&mut self) {
        self.queue.unregister(self.id);
    }
}
