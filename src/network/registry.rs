use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::session::{Session, SessionId};

/// The authoritative set of admitted sessions.
///
/// All operations take the single internal lock for the duration of the
/// membership operation only; nothing here awaits while holding it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<SessionId, Arc<Session>>> {
        // The map stays consistent even if a holder panicked
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate an identity for a freshly accepted connection
    pub fn next_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn admit(&self, session: Arc<Session>) {
        debug!(session = %session.id(), name = %session.name(), "session admitted");
        self.sessions().insert(session.id(), session);
    }

    /// Remove a session; returns it if it was present
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions().remove(&id);
        if let Some(session) = &removed {
            debug!(session = %id, name = %session.name(), "session removed");
        }
        removed
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions().contains_key(&id)
    }

    /// First session (in admission order) with the given display name
    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions()
            .values()
            .find(|session| session.name() == name)
            .cloned()
    }

    /// Point-in-time copy of the membership, in admission order
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions().values().cloned().collect()
    }

    pub fn count_online(&self) -> usize {
        self.sessions().len()
    }

    pub fn names(&self) -> Vec<String> {
        self.sessions()
            .values()
            .map(|session| session.name().to_string())
            .collect()
    }

    /// Remove everything, handing back what was there
    pub fn drain(&self) -> Vec<Arc<Session>> {
        std::mem::take(&mut *self.sessions()).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_transfer::{FileReceiver, NamingScheme};
    use crate::network::session::SessionOptions;

    fn session(registry: &SessionRegistry, name: &str) -> Arc<Session> {
        let (session, _frames) = Session::with_channel(
            registry.next_id(),
            name,
            "127.0.0.1:9000".parse().unwrap(),
            SessionOptions::default(),
            FileReceiver::new(std::env::temp_dir(), NamingScheme::Plain),
        );
        session
    }

    #[test]
    fn ids_are_unique() {
        let registry = SessionRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn admit_lookup_remove() {
        let registry = SessionRegistry::new();
        let alice = session(&registry, "alice");
        let bob = session(&registry, "bob");
        registry.admit(alice.clone());
        registry.admit(bob.clone());

        assert_eq!(registry.count_online(), 2);
        assert_eq!(registry.lookup_by_name("bob").unwrap().id(), bob.id());
        assert!(registry.lookup_by_name("carol").is_none());

        assert!(registry.remove(alice.id()).is_some());
        assert!(!registry.contains(alice.id()));
        assert_eq!(registry.count_online(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let alice = session(&registry, "alice");
        registry.admit(alice.clone());

        assert!(registry.remove(alice.id()).is_some());
        assert!(registry.remove(alice.id()).is_none());
        assert!(registry.remove(SessionId(999)).is_none());
        assert_eq!(registry.count_online(), 0);
    }

    #[test]
    fn duplicate_names_resolve_to_first_admitted() {
        let registry = SessionRegistry::new();
        let first = session(&registry, "sam");
        let second = session(&registry, "sam");
        registry.admit(second.clone());
        registry.admit(first.clone());

        // admission order follows id allocation
        assert_eq!(registry.lookup_by_name("sam").unwrap().id(), first.id());
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let registry = SessionRegistry::new();
        let alice = session(&registry, "alice");
        let bob = session(&registry, "bob");
        registry.admit(alice.clone());
        registry.admit(bob.clone());

        let snapshot = registry.snapshot();
        registry.remove(alice.id());

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name(), "alice");
        assert_eq!(registry.names(), vec!["bob".to_string()]);
    }

    #[test]
    fn drain_empties_registry() {
        let registry = SessionRegistry::new();
        registry.admit(session(&registry, "a"));
        registry.admit(session(&registry, "b"));
        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.count_online(), 0);
    }
}
