//! Table of live connections and their session tasks.
//!
//! An id is present from the moment its session runner is registered until
//! that runner finishes cleanup. The runner is the only party that removes
//! its own entry; shutdown only aborts handles and awaits tasks.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::net::{ConnectionHandle, ConnectionId};

/// Awaitable, cloneable handle to a spawned session runner.
pub type SessionTask = Shared<BoxFuture<'static, ()>>;

/// Wrap a spawned runner so the registry and the drain path can both await it.
pub fn session_task<T: Send + 'static>(handle: JoinHandle<T>) -> SessionTask {
    handle.map(|_| ()).boxed().shared()
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),
}

/// One tracked connection.
#[derive(Clone)]
pub struct ConnectionEntry {
    pub handle: ConnectionHandle,
    pub task: SessionTask,
}

impl ConnectionEntry {
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("handle", &self.handle)
            .field("finished", &self.task.peek().is_some())
            .finish()
    }
}

/// Concurrent id → entry map, scoped to one service instance.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<DashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection. Fails if the id is already present.
    pub fn register(
        &self,
        handle: ConnectionHandle,
        task: SessionTask,
    ) -> Result<(), RegistryError> {
        match self.entries.entry(handle.id()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(handle.id())),
            Entry::Vacant(slot) => {
                slot.insert(ConnectionEntry { handle, task });
                Ok(())
            }
        }
    }

    /// Stop tracking a connection. Returns whether it was present.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> Vec<ConnectionEntry> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
