//! Device registry:
//! replaces the source's fixed-size, mutex-guarded array of attached
//! devices with a small keyed table that the filesystem/CLI adapters
//! look up by ticket rather than reaching into process-global state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::Error;

/// Opaque identifier for a registered device, supplied by whichever
/// transport adapter discovered it (a `rusb` bus/address pair, for
/// instance). The registry itself is transport-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

struct Entry<S> {
    session: Arc<Mutex<S>>,
    /// Number of mounts/handles referencing this device. A disconnected
    /// device whose count reaches zero is eligible for teardown.
    open_count: u32,
}

type Table<S> = Arc<Mutex<HashMap<DeviceId, Entry<S>>>>;

/// Coordinates lookup of live sessions by [`DeviceId`]. One `Registry`
/// is expected per process; it owns the strong references, and callers
/// hold [`Ticket`]s rather than cloning `Arc`s directly so open-count
/// bookkeeping can't be bypassed.
pub struct Registry<S> {
    entries: Table<S>,
}

impl<S> Registry<S> {
    pub fn new() -> Registry<S> {
        Registry {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a newly opened session under `id`, starting its
    /// open count at 1. Returns the first [`Ticket`].
    pub fn insert(&self, id: DeviceId, session: S) -> Ticket<S> {
        let session = Arc::new(Mutex::new(session));
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        entries.insert(
            id,
            Entry {
                session: session.clone(),
                open_count: 1,
            },
        );
        Ticket {
            id,
            session,
            table: self.entries.clone(),
        }
    }

    /// Looks up `id`, incrementing its open count on success. Fails
    /// with `NotSupported` if nothing is registered under `id` — there
    /// is no recovery path inside the registry itself; the caller must
    /// reconnect and `insert` again.
    pub fn lookup(&self, id: DeviceId) -> Result<Ticket<S>, Error> {
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        let entry = entries.get_mut(&id).ok_or(Error::NotSupported)?;
        entry.open_count += 1;
        Ok(Ticket {
            id,
            session: entry.session.clone(),
            table: self.entries.clone(),
        })
    }

    pub fn is_registered(&self, id: DeviceId) -> bool {
        self.entries.lock().expect("registry mutex poisoned").contains_key(&id)
    }
}

/// A held reference into the registry. Dropping it decrements the
/// device's open count; the ticket whose drop brings the count to zero
/// tears the entry down.
pub struct Ticket<S> {
    id: DeviceId,
    session: Arc<Mutex<S>>,
    table: Table<S>,
}

impl<S> Ticket<S> {
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.session.lock().expect("session mutex poisoned")
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }
}

impl<S> Drop for Ticket<S> {
    fn drop(&mut self) {
        let mut entries = self.table.lock().expect("registry mutex poisoned");
        let mut drop_entry = false;
        if let Some(entry) = entries.get_mut(&self.id) {
            entry.open_count = entry.open_count.saturating_sub(1);
            drop_entry = entry.open_count == 0;
        }
        if drop_entry {
            entries.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_returns_the_same_session() {
        let registry: Registry<u32> = Registry::new();
        let id = DeviceId(1);
        let ticket = registry.insert(id, 42);
        assert_eq!(*ticket.lock(), 42);

        let ticket2 = registry.lookup(id).unwrap();
        *ticket2.lock() = 43;
        assert_eq!(*ticket.lock(), 43);
    }

    #[test]
    fn lookup_of_unknown_id_fails() {
        let registry: Registry<u32> = Registry::new();
        match registry.lookup(DeviceId(99)) {
            Err(Error::NotSupported) => {}
            other => panic!("expected NotSupported, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn last_ticket_dropped_tears_down_the_entry() {
        let registry: Registry<u32> = Registry::new();
        let id = DeviceId(1);
        let ticket = registry.insert(id, 42);
        let ticket2 = registry.lookup(id).unwrap();
        assert!(registry.is_registered(id));

        drop(ticket);
        assert!(registry.is_registered(id), "one ticket remains open");

        drop(ticket2);
        assert!(!registry.is_registered(id));
    }
}
