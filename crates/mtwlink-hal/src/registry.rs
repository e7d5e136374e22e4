//! [`ConnectivityRegistry`] – the set of currently connected peer devices.
//!
//! The base station reports link changes on its own callback thread.  The
//! registry folds those notifications into one consistent set that the
//! control loop can query at any time:
//!
//! * [`ConnectivityRegistry::notify`] inserts on `Connected` and removes on
//!   every other state, atomically.
//! * [`ConnectivityRegistry::snapshot`] copies the whole set out under the
//!   same lock, so a reader never sees half a mutation.
//!
//! No iterator over the live set is exposed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mtwlink_types::{ConnectivityState, DeviceId};
use tracing::debug;

use crate::device::{ConnectivityListener, Device};

type Members = BTreeMap<DeviceId, Arc<dyn Device>>;

/// Thread-safe set of connected devices keyed by [`DeviceId`].
#[derive(Default)]
pub struct ConnectivityRegistry {
    members: Mutex<Members>,
    changed: Condvar,
}

impl ConnectivityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a link-state change for `device`.
    ///
    /// `Connected` inserts (idempotent); any other state removes (no-op when
    /// absent).
    pub fn notify(&self, device: Arc<dyn Device>, state: ConnectivityState) {
        let mut members = self.lock();
        let id = device.id().clone();
        let changed = if state.is_connected() {
            members.insert(id.clone(), device).is_none()
        } else {
            members.remove(&id).is_some()
        };
        debug!(device = %id, ?state, members = members.len(), "connectivity changed");
        if changed {
            self.changed.notify_all();
        }
    }

    /// Copy of the current member set.
    pub fn snapshot(&self) -> ConnectedSet {
        ConnectedSet {
            members: self.lock().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.lock().contains_key(id)
    }

    /// Block until the member count differs from `known_len` or `timeout`
    /// elapses.  Returns the member count on return.
    pub fn wait_for_change(&self, known_len: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut members = self.lock();
        while members.len() == known_len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            members = self
                .changed
                .wait_timeout(members, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        members.len()
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectivityListener for ConnectivityRegistry {
    fn on_connectivity_changed(&self, device: Arc<dyn Device>, state: ConnectivityState) {
        self.notify(device, state);
    }
}

impl fmt::Debug for ConnectivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityRegistry")
            .field("members", &self.snapshot())
            .finish()
    }
}

/// Point-in-time copy of a [`ConnectivityRegistry`].
#[derive(Clone, Default)]
pub struct ConnectedSet {
    members: Members,
}

impl ConnectedSet {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.members.contains_key(id)
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Arc<dyn Device>> {
        self.members.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.members.keys()
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<dyn Device>> {
        self.members.values()
    }
}

impl PartialEq for ConnectedSet {
    fn eq(&self, other: &Self) -> bool {
        self.members.len() == other.members.len() && self.ids().eq(other.ids())
    }
}

impl fmt::Debug for ConnectedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct MockDevice {
        id: DeviceId,
    }

    impl Device for MockDevice {
        fn id(&self) -> &DeviceId {
            &self.id
        }
        fn connectivity(&self) -> ConnectivityState {
            ConnectivityState::Unknown
        }
    }

    fn device(id: &str) -> Arc<dyn Device> {
        Arc::new(MockDevice {
            id: DeviceId::new(id),
        })
    }

    #[test]
    fn connected_inserts_and_other_states_remove() {
        let registry = ConnectivityRegistry::new();
        let mtw = device("mtw-1");

        registry.notify(Arc::clone(&mtw), ConnectivityState::Connected);
        assert!(registry.contains(mtw.id()));

        registry.notify(Arc::clone(&mtw), ConnectivityState::Rejected);
        assert!(!registry.contains(mtw.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn repeated_connect_is_idempotent() {
        let registry = ConnectivityRegistry::new();
        let mtw = device("mtw-1");
        registry.notify(Arc::clone(&mtw), ConnectivityState::Connected);
        registry.notify(Arc::clone(&mtw), ConnectivityState::Connected);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removing_absent_device_is_noop() {
        let registry = ConnectivityRegistry::new();
        registry.notify(device("ghost"), ConnectivityState::Disconnected);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let registry = ConnectivityRegistry::new();
        registry.notify(device("a"), ConnectivityState::Connected);
        let before = registry.snapshot();

        registry.notify(device("b"), ConnectivityState::Connected);
        assert_eq!(before.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
        assert_ne!(before, registry.snapshot());
    }

    #[test]
    fn concurrent_notifications_keep_last_state_per_device() {
        let registry = Arc::new(ConnectivityRegistry::new());
        let mut handles = Vec::new();

        // Each thread owns one device and toggles it; the final state of
        // even-numbered devices is Connected, odd ones Disconnected.
        for n in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let dev = device(&format!("mtw-{n:02}"));
                for round in 0..500 {
                    let state = if round % 2 == 0 {
                        ConnectivityState::Connected
                    } else {
                        ConnectivityState::Disconnected
                    };
                    registry.notify(Arc::clone(&dev), state);
                }
                let last = if n % 2 == 0 {
                    ConnectivityState::Connected
                } else {
                    ConnectivityState::Wireless
                };
                registry.notify(dev, last);
            }));
        }

        // A concurrent reader must always see a whole set.
        let reader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..1_000 {
                    let snap = registry.snapshot();
                    assert_eq!(snap.len(), snap.ids().count());
                }
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        reader.join().unwrap();

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 8);
        for n in 0..16 {
            let id = DeviceId::new(format!("mtw-{n:02}"));
            assert_eq!(snap.contains(&id), n % 2 == 0, "wrong final state for {id}");
        }
    }

    #[test]
    fn wait_for_change_returns_new_count() {
        let registry = Arc::new(ConnectivityRegistry::new());
        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                registry.notify(device("mtw-1"), ConnectivityState::Connected);
            })
        };
        assert_eq!(registry.wait_for_change(0, Duration::from_secs(5)), 1);
        writer.join().unwrap();
    }

    #[test]
    fn wait_for_change_times_out_when_stable() {
        let registry = ConnectivityRegistry::new();
        assert_eq!(registry.wait_for_change(0, Duration::from_millis(10)), 0);
    }

    #[test]
    fn listener_trait_forwards_to_notify() {
        let registry = Arc::new(ConnectivityRegistry::new());
        let listener: Arc<dyn ConnectivityListener> = registry.clone();
        listener.on_connectivity_changed(device("mtw-9"), ConnectivityState::Connected);
        assert!(registry.contains(&DeviceId::new("mtw-9")));
    }
}
