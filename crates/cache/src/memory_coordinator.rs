//! Memory state and pressure notifications
//!
//! The [`MemoryCoordinator`] tracks the process memory state and fans out
//! state changes, purge requests and pressure signals to registered clients.
//! Everything here runs on the owning thread; clients are held weakly and
//! unregister through the [`Registration`] guard returned at registration.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

/// Coarse process memory state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryState {
    /// Caches may use their full budget
    Normal,
    /// Caches should shrink
    Throttled,
    /// Caches should hold nothing
    Suspended,
    /// Never a valid state to deliver to a client
    Unknown,
}

/// Memory pressure level reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressureLevel {
    None,
    Moderate,
    Critical,
}

impl MemoryPressureLevel {
    /// Pressure level for a memory utilization ratio (0.0 to 1.0)
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.75 {
            MemoryPressureLevel::None
        } else if utilization < 0.90 {
            MemoryPressureLevel::Moderate
        } else {
            MemoryPressureLevel::Critical
        }
    }
}

/// Receiver of memory coordinator notifications
pub trait MemoryCoordinatorClient {
    /// The process memory state changed
    fn on_memory_state_change(&mut self, state: MemoryState);

    /// Release as much memory as possible right now
    fn on_purge_memory(&mut self);

    /// The platform reported memory pressure
    fn on_memory_pressure(&mut self, level: MemoryPressureLevel);
}

type ClientRef = Weak<RefCell<dyn MemoryCoordinatorClient>>;

/// Process-wide registry of memory clients, injected into its users
pub struct MemoryCoordinator {
    state: Cell<MemoryState>,
    next_id: Cell<u64>,
    clients: RefCell<Vec<(u64, ClientRef)>>,
}

impl MemoryCoordinator {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(MemoryState::Normal),
            next_id: Cell::new(0),
            clients: RefCell::new(Vec::new()),
        })
    }

    /// Current memory state
    pub fn memory_state(&self) -> MemoryState {
        self.state.get()
    }

    /// Number of registrations that are still alive
    pub fn client_count(&self) -> usize {
        self.clients
            .borrow()
            .iter()
            .filter(|(_, client)| client.strong_count() > 0)
            .count()
    }

    /// Register a client. It stays registered until the guard is dropped.
    pub fn register(self: &Rc<Self>, client: ClientRef) -> Registration {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.clients.borrow_mut().push((id, client));
        tracing::trace!(id, "memory coordinator client registered");

        Registration {
            id,
            coordinator: Rc::downgrade(self),
        }
    }

    fn unregister(&self, id: u64) {
        self.clients.borrow_mut().retain(|(client_id, _)| *client_id != id);
        tracing::trace!(id, "memory coordinator client unregistered");
    }

    /// Change the memory state and notify every client
    pub fn set_memory_state(&self, state: MemoryState) {
        if self.state.replace(state) == state {
            return;
        }
        tracing::debug!(?state, "memory state changed");
        self.for_each_client(|client| client.on_memory_state_change(state));
    }

    /// Ask every client to purge
    pub fn purge_memory(&self) {
        tracing::debug!("purging memory");
        self.for_each_client(|client| client.on_purge_memory());
    }

    /// Deliver a pressure signal to every client
    pub fn notify_pressure(&self, level: MemoryPressureLevel) {
        tracing::debug!(?level, "memory pressure");
        self.for_each_client(|client| client.on_memory_pressure(level));
    }

    /// Translate a utilization reading into a pressure signal and deliver it
    pub fn report_utilization(&self, utilization: f64) -> MemoryPressureLevel {
        let level = MemoryPressureLevel::from_utilization(utilization);
        self.notify_pressure(level);
        level
    }

    fn for_each_client(&self, mut f: impl FnMut(&mut dyn MemoryCoordinatorClient)) {
        // Snapshot first so clients can register or drop while being notified.
        let live: Vec<_> = {
            let mut clients = self.clients.borrow_mut();
            clients.retain(|(_, client)| client.strong_count() > 0);
            clients.iter().filter_map(|(_, client)| client.upgrade()).collect()
        };

        for client in live {
            match client.try_borrow_mut() {
                Ok(mut client) => f(&mut *client),
                Err(_) => tracing::warn!("skipping memory client that is already in use"),
            }
        }
    }
}

impl std::fmt::Debug for MemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCoordinator")
            .field("state", &self.state.get())
            .field("clients", &self.client_count())
            .finish()
    }
}

/// Keeps a client registered with a [`MemoryCoordinator`]
///
/// Dropping the guard unregisters the client.
#[derive(Debug)]
pub struct Registration {
    id: u64,
    coordinator: Weak<MemoryCoordinator>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.unregister(self.id);
        }
    }
}
