use crate::target::Target;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Identity of a registered tunnel
pub type ConnectionId = u64;

#[derive(Debug)]
struct TunnelEntry {
    peer: SocketAddr,
    target: Target,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: AtomicU64,
    closed: AtomicBool,
    tunnels: Mutex<HashMap<ConnectionId, TunnelEntry>>,
}

/// Set of established tunnels, shared by every connection task.
///
/// Entries are added once the upstream dial succeeds and removed when the
/// relay finishes. [`ConnectionRegistry::close_all`] is the hard-shutdown
/// path: it cancels every tunnel, which makes the relay drop both sockets.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tunnels(&self) -> MutexGuard<'_, HashMap<ConnectionId, TunnelEntry>> {
        self.inner
            .tunnels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a freshly dialed tunnel.
    ///
    /// The returned guard removes the entry when dropped. Registering after
    /// [`close_all`](Self::close_all) hands back an already-cancelled guard.
    pub fn register(&self, peer: SocketAddr, target: Target) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();

        let mut tunnels = self.tunnels();
        if self.inner.closed.load(Ordering::Acquire) {
            cancel.cancel();
        } else {
            let entry = TunnelEntry {
                peer,
                target,
                cancel: cancel.clone(),
            };
            tunnels.insert(id, entry);
        }
        drop(tunnels);

        Registration {
            id,
            cancel,
            registry: self.clone(),
            unregistered: false,
        }
    }

    /// Forget a tunnel. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        self.tunnels().remove(&id).is_some()
    }

    /// Cancel and forget every registered tunnel, returning how many there were.
    ///
    /// Does not wait for the relays to wind down.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(ConnectionId, TunnelEntry)> = {
            let mut tunnels = self.tunnels();
            // Flipped under the lock so a concurrent register cannot slip in.
            self.inner.closed.store(true, Ordering::Release);
            tunnels.drain().collect()
        };

        for (id, entry) in &drained {
            debug!("Closing tunnel #{} {} -> {}", id, entry.peer, entry.target);
            entry.cancel.cancel();
        }

        if !drained.is_empty() {
            info!("Closed {} active tunnels", drained.len());
        }
        drained.len()
    }

    /// Accept new tunnels again after [`close_all`](Self::close_all).
    pub fn reopen(&self) {
        let _tunnels = self.tunnels();
        self.inner.closed.store(false, Ordering::Release);
    }

    /// Number of registered tunnels
    pub fn len(&self) -> usize {
        self.tunnels().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII handle for a registered tunnel
#[derive(Debug)]
pub struct Registration {
    id: ConnectionId,
    cancel: CancellationToken,
    registry: ConnectionRegistry,
    unregistered: bool,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Token cancelled by [`ConnectionRegistry::close_all`].
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Remove the entry now instead of on drop. Idempotent.
    pub fn unregister(&mut self) {
        if !self.unregistered {
            self.registry.unregister(self.id);
            self.unregistered = true;
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unregister();
    }
}
