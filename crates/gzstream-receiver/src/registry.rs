//! Active abort registry.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use gzstream_core::StreamId;
use tokio_util::sync::CancellationToken;

use crate::ReceiveError;

/// Maps each stream being received to the token that interrupts it.
///
/// Entries are inserted when a receive starts and removed either by
/// [`abort`](Self::abort) or when the [`Registration`] guard drops,
/// whichever happens first.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    entries: Mutex<HashMap<StreamId, Entry>>,
    next_serial: AtomicU64,
}

#[derive(Debug)]
struct Entry {
    serial: u64,
    token: CancellationToken,
}

impl AbortRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receive for `id`.
    ///
    /// # Errors
    /// Returns error if `id` is already being received.
    pub fn register(self: &Arc<Self>, id: StreamId) -> Result<Registration, ReceiveError> {
        let token = CancellationToken::new();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.entries();
            if entries.contains_key(&id) {
                return Err(ReceiveError::AlreadyReceiving(id));
            }
            entries.insert(
                id,
                Entry {
                    serial,
                    token: token.clone(),
                },
            );
        }
        Ok(Registration {
            registry: Arc::clone(self),
            id,
            serial,
            token,
        })
    }

    /// Abort the receive registered under `id`.
    ///
    /// Returns false if nothing is registered, e.g. the receive already
    /// concluded or never started.
    pub fn abort(&self, id: StreamId) -> bool {
        let removed = self.entries().remove(&id);
        match removed {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => {
                tracing::debug!(stream_id = %id, "abort for unregistered stream ignored");
                false
            }
        }
    }

    #[must_use]
    pub fn contains(&self, id: StreamId) -> bool {
        self.entries().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<StreamId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Guard removing a registry entry on drop.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<AbortRegistry>,
    id: StreamId,
    serial: u64,
    token: CancellationToken,
}

impl Registration {
    #[must_use]
    pub const fn id(&self) -> StreamId {
        self.id
    }

    /// Token cancelled when the sender aborts this stream.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // Already gone if `abort` won the race; never remove a later entry.
        let mut entries = self.registry.entries();
        if entries
            .get(&self.id)
            .is_some_and(|entry| entry.serial == self.serial)
        {
            entries.remove(&self.id);
        }
    }
}
