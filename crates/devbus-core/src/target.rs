//! Global target resolution.
//!
//! Buses and plugin clients find each other through a shared
//! [`LocalDispatcher`]. A host that needs to bridge events across an
//! embedding boundary installs its own dispatcher before any bus starts;
//! otherwise a lazily created process-wide default is used.

use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

use crate::dispatcher::LocalDispatcher;

static SHARED_TARGET: LazyLock<RwLock<Option<Arc<LocalDispatcher>>>> =
    LazyLock::new(|| RwLock::new(None));

static DEFAULT_TARGET: LazyLock<Arc<LocalDispatcher>> = LazyLock::new(LocalDispatcher::new);

/// Resolve the dispatcher buses and clients should use.
pub fn global_target() -> Arc<LocalDispatcher> {
    if let Some(shared) = SHARED_TARGET.read().as_ref() {
        return Arc::clone(shared);
    }
    Arc::clone(&DEFAULT_TARGET)
}

/// Install a host-supplied dispatcher. Returns the one it replaced.
pub fn install_shared_target(target: Arc<LocalDispatcher>) -> Option<Arc<LocalDispatcher>> {
    SHARED_TARGET.write().replace(target)
}

/// Remove the host-supplied dispatcher, falling back to the default.
pub fn clear_shared_target() -> Option<Arc<LocalDispatcher>> {
    SHARED_TARGET.write().take()
}
