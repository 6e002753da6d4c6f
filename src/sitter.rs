//! A registry keeping promises alive until they settle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::callback::Callback;
use crate::deferred::{DeferredId, State};
use crate::promise::Promise;

type Registry = Mutex<HashMap<DeferredId, Promise>>;

/// Keeps added promises, and the chains hanging off them, alive until they
/// settle.
///
/// Chained promises only run their callbacks while somebody holds them. A
/// fire-and-forget chain is handed to a sitter instead of being stored by
/// the caller.
///
/// # Examples
///
/// ```
/// use promise_chain::{json, Callback, Promise, PromiseSitter};
///
/// let sitter = PromiseSitter::new();
/// let (deferred, promise) = Promise::pending();
/// let logged = promise.then(Callback::effect(|v| println!("got {v}")), Callback::Identity, Callback::Identity);
/// assert!(sitter.add(&logged));
/// drop(logged);
///
/// deferred.resolve(json!(1)).unwrap();
/// assert!(sitter.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct PromiseSitter {
    promises: Arc<Registry>,
}

impl PromiseSitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process wide sitter, created on first use and never dropped.
    pub fn global() -> &'static PromiseSitter {
        static GLOBAL: OnceLock<PromiseSitter> = OnceLock::new();
        GLOBAL.get_or_init(PromiseSitter::new)
    }

    /// Holds `promise` until it settles. Returns `false` for a promise which
    /// is already settled or already held.
    pub fn add(&self, promise: &Promise) -> bool {
        let id = promise.id();
        if promise.state() != State::Pending || self.contains(promise) {
            return false;
        }
        let registry = Arc::downgrade(&self.promises);
        let releasing = promise.always(Callback::effect(move |_| {
            let Some(registry) = registry.upgrade() else { return };
            let released = lock(&registry).remove(&id);
            if released.is_some() {
                tracing::trace!("sitter released deferred {id}");
            }
            drop(released);
        }));

        let mut promises = self.lock();
        // The promise may have settled since the state check, and the release
        // callback then already ran.
        if promise.state() != State::Pending || promises.contains_key(&id) {
            drop(promises);
            drop(releasing);
            return false;
        }
        promises.insert(id, releasing);
        true
    }

    /// Stops holding `promise`. Returns whether it was held.
    pub fn remove(&self, promise: &Promise) -> bool {
        let removed = self.lock().remove(&promise.id());
        removed.is_some()
    }

    pub fn contains(&self, promise: &Promise) -> bool {
        self.lock().contains_key(&promise.id())
    }

    /// Number of promises held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeferredId, Promise>> {
        lock(&self.promises)
    }
}

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<DeferredId, Promise>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
