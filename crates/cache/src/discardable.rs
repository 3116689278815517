//! Discardable handles
//!
//! A discardable handle is a lock word shared between a client and the
//! service. The client locks it while it still needs the resource; the
//! service may only reclaim the resource while the word is unlocked, and can
//! always force it into the deleted state.
//!
//! State word values:
//! - `0`: deleted, the resource is gone for good
//! - `1`: unlocked, the service may reclaim
//! - `n >= 2`: locked `n - 1` times

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const HANDLE_DELETED: u32 = 0;
const HANDLE_UNLOCKED: u32 = 1;
const HANDLE_LOCKED_ONCE: u32 = 2;

/// Service-side view of a discardable handle, as used by the transfer cache
pub trait DiscardableHandle {
    /// Release one lock held on behalf of the client, keeping the data
    fn unlock(&self);

    /// Try to reclaim the resource.
    ///
    /// Fails (returns `false`) while the handle is locked.
    fn delete(&self) -> bool;

    /// Mark the handle deleted regardless of its lock state
    fn force_delete(&self);
}

/// Client half of a discardable handle pair
///
/// Created locked once, since the client is about to hand the resource to
/// the service and still needs it.
#[derive(Clone)]
pub struct ClientDiscardableHandle {
    state: Arc<AtomicU32>,
}

impl ClientDiscardableHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU32::new(HANDLE_LOCKED_ONCE)),
        }
    }

    /// Take another lock. Fails once the service has deleted the handle.
    pub fn lock(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                if value == HANDLE_DELETED {
                    None
                } else {
                    Some(value.saturating_add(1))
                }
            })
            .is_ok()
    }

    /// Drop one lock taken with [`lock`](Self::lock) or at creation
    pub fn unlock(&self) {
        release_lock(&self.state);
    }

    pub fn is_deleted(&self) -> bool {
        self.state.load(Ordering::Acquire) == HANDLE_DELETED
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) >= HANDLE_LOCKED_ONCE
    }

    /// A service handle sharing this client's state word
    pub fn service_handle(&self) -> ServiceDiscardableHandle {
        ServiceDiscardableHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for ClientDiscardableHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientDiscardableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientDiscardableHandle")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

/// Service half of a discardable handle pair
pub struct ServiceDiscardableHandle {
    state: Arc<AtomicU32>,
}

impl fmt::Debug for ServiceDiscardableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDiscardableHandle")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

impl DiscardableHandle for ServiceDiscardableHandle {
    fn unlock(&self) {
        release_lock(&self.state);
    }

    fn delete(&self) -> bool {
        self.state
            .compare_exchange(
                HANDLE_UNLOCKED,
                HANDLE_DELETED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn force_delete(&self) {
        self.state.store(HANDLE_DELETED, Ordering::Release);
    }
}

fn release_lock(state: &AtomicU32) {
    // Never drops below unlocked, and never revives a deleted handle.
    let _ = state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
        if value >= HANDLE_LOCKED_ONCE {
            Some(value - 1)
        } else {
            None
        }
    });
}
