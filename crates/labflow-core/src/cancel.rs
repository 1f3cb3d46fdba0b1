//! Cooperative cancellation shared between the front end and the engine.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Listener = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Shared {
    cancelled: AtomicBool,
    next_listener: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

/// A clonable flag checked before every part. Signal handlers set it; the
/// engine never clears it. A join barrier registers a listener so it wakes
/// as soon as the flag is set.
#[derive(Clone, Default)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        let listeners = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, listener) in listeners.iter() {
            listener();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Calls `listener` on every later `cancel` until the guard is dropped.
    pub(crate) fn on_cancel(&self, listener: impl Fn() + Send + Sync + 'static) -> CancelListener {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Box::new(listener)));
        CancelListener {
            shared: Arc::clone(&self.shared),
            id,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Unregisters its listener when dropped.
pub(crate) struct CancelListener {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for CancelListener {
    fn drop(&mut self) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| *id != self.id);
    }
}
