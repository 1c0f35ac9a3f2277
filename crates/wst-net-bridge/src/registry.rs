use core::fmt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{BridgeError, Result};
use crate::socket::Socket;

/// Opaque socket handle. Ids increase strictly and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(u64);

impl SocketId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Live sockets keyed by id.
#[derive(Default)]
pub struct SocketRegistry {
    sockets: RwLock<HashMap<SocketId, Arc<Socket>>>,
    next_id: AtomicU64,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SocketId, Arc<Socket>>> {
        self.sockets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SocketId, Arc<Socket>>> {
        self.sockets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve the next id. The first id handed out is 1.
    pub fn next_id(&self) -> SocketId {
        SocketId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn insert(&self, socket: Arc<Socket>) {
        self.write().insert(socket.id(), socket);
    }

    pub fn get(&self, id: SocketId) -> Result<Arc<Socket>> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or(BridgeError::UnknownSocket(id))
    }

    pub fn remove(&self, id: SocketId) -> Result<Arc<Socket>> {
        self.write()
            .remove(&id)
            .ok_or(BridgeError::UnknownSocket(id))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<SocketId> {
        let mut ids: Vec<_> = self.read().keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_increase() {
        let registry = SocketRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert_eq!(a, SocketId::new(1));
        assert!(b > a);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let registry = SocketRegistry::new();
        let id = SocketId::new(42);
        assert_eq!(registry.get(id).err(), Some(BridgeError::UnknownSocket(id)));
        assert_eq!(
            registry.remove(id).err(),
            Some(BridgeError::UnknownSocket(id))
        );
    }
}
