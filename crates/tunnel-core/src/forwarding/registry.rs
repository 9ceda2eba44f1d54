use std::{
    collections::HashMap, fmt, net::SocketAddr, sync::{
        Arc, Mutex, MutexGuard, PoisonError, atomic::{AtomicU64, Ordering}
    }, time::Instant
};

use tunnel_types::Endpoint;

/// Identifier of one forwarded connection, unique within a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForwarderId(u64);

impl ForwarderId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ForwarderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fwd-{}", self.0)
    }
}

/// Snapshot of an active forwarder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwarderInfo {
    pub id: ForwarderId,
    pub peer: SocketAddr,
    pub target: Endpoint,
    pub opened_at: Instant,
}

#[derive(Default)]
struct RegistryState {
    next_id: AtomicU64,
    active: Mutex<HashMap<ForwarderId, ForwarderInfo>>,
}

/// Set of forwarders that are currently running.
///
/// Entries are inserted by the accept loop and removed when the owning
/// [`Registration`] is dropped, whichever way the forwarder task ends.
#[derive(Clone, Default)]
pub struct ForwarderRegistry {
    state: Arc<RegistryState>,
}

impl ForwarderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and record a new forwarder.
    pub fn register(&self, peer: SocketAddr, target: Endpoint) -> Registration {
        let id = ForwarderId(self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let info = ForwarderInfo {
            id,
            peer,
            target,
            opened_at: Instant::now(),
        };
        self.lock().insert(id, info);
        Registration {
            registry: self.clone(),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: ForwarderId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Active forwarders ordered by id.
    pub fn snapshot(&self) -> Vec<ForwarderInfo> {
        let mut entries: Vec<_> = self.lock().values().cloned().collect();
        entries.sort_by_key(|info| info.id);
        entries
    }

    fn remove(&self, id: ForwarderId) {
        self.lock().remove(&id);
    }

    // a panicking holder cannot leave the map half-updated
    fn lock(&self) -> MutexGuard<'_, HashMap<ForwarderId, ForwarderInfo>> {
        self.state.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership of one forwarder in the registry; dropping it deregisters.
pub struct Registration {
    registry: ForwarderRegistry,
    id: ForwarderId,
}

impl Registration {
    pub fn id(&self) -> ForwarderId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn registration_drop_deregisters() {
        let registry = ForwarderRegistry::new();
        let first = registry.register(peer(5000), Endpoint::new("db", 5432));
        let second = registry.register(peer(5001), Endpoint::new("db", 5432));
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.len(), 2);

        drop(first);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(second.id()));

        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_ordered_by_id() {
        let registry = ForwarderRegistry::new();
        let guards: Vec<_> = (0..4)
            .map(|n| registry.register(peer(6000 + n), Endpoint::new("cache", 6379)))
            .collect();
        let ids: Vec<_> = registry.snapshot().into_iter().map(|info| info.id).collect();
        let expected: Vec<_> = guards.iter().map(Registration::id).collect();
        assert_eq!(ids, expected);
        assert_eq!(registry.snapshot()[0].id.to_string(), "fwd-1");
    }
}
