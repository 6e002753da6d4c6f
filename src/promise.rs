//! Read-only access to the outcome of an asynchronous operation.

use std::borrow::Borrow;
use std::sync::Arc;

use crate::callback::{self, Callback};
use crate::child::ChildDeferred;
use crate::deferred::{Deferred, DeferredId, State, Subscription, Watch};
use crate::future::PromiseFuture;
use crate::scheduler::Scheduler;
use crate::Value;

/// The consumer side of a [`Deferred`].
///
/// A promise only reads the state of its deferred and attaches callbacks to
/// it; only the producer holding the deferred can settle it. Cloning a
/// promise is cheap and yields another handle on the same deferred.
///
/// # Examples
///
/// ```
/// use promise_chain::{json, Callback, Promise, State};
///
/// let (deferred, promise) = Promise::pending();
/// let doubled = promise.then(
///     Callback::transform(|v| json!(v.as_i64().unwrap_or_default() * 2)),
///     Callback::Identity,
///     Callback::Identity,
/// );
/// assert_eq!(doubled.state(), State::Pending);
///
/// deferred.resolve(json!(21)).unwrap();
/// assert_eq!(doubled.data(), json!(42));
/// ```
#[derive(Debug, Clone)]
pub struct Promise {
    deferred: Arc<Deferred>,
}

impl Promise {
    /// Creates a promise communicating the state of `deferred`.
    pub fn create(deferred: Arc<Deferred>) -> Self {
        Self { deferred }
    }

    /// A fresh pending deferred together with a promise over it.
    pub fn pending() -> (Arc<Deferred>, Self) {
        let deferred = Deferred::create();
        let promise = Self::create(Arc::clone(&deferred));
        (deferred, promise)
    }

    pub fn create_resolved(value: Value) -> Self {
        Self::create(Deferred::create_settled(Ok(value)))
    }

    pub fn create_rejected(reason: Value) -> Self {
        Self::create(Deferred::create_settled(Err(reason)))
    }

    /// Identity of the underlying deferred. Promises over the same deferred
    /// share it.
    pub fn id(&self) -> DeferredId {
        self.deferred.id()
    }

    pub fn state(&self) -> State {
        self.deferred.state()
    }

    /// The resolve value, the rejection reason or `Value::Null` while pending.
    pub fn data(&self) -> Value {
        self.deferred.data()
    }

    /// `None` while pending, else `Ok(value)` or `Err(reason)`.
    pub fn outcome(&self) -> Option<Result<Value, Value>> {
        self.deferred.outcome()
    }

    pub(crate) fn deferred(&self) -> &Arc<Deferred> {
        &self.deferred
    }

    /// Attaches callbacks for resolution, rejection and progress and returns
    /// a promise for the outcome of the callbacks, see [`Callback`].
    ///
    /// On a settled promise the matching callback runs before `then`
    /// returns. On a pending one the callbacks run when the deferred settles
    /// or is notified, as long as the returned promise is still alive: drop
    /// it and the callbacks are never called. Use a
    /// [`PromiseSitter`](crate::PromiseSitter) to keep it around.
    pub fn then(&self, resolved: Callback, rejected: Callback, notified: Callback) -> Promise {
        match self.deferred.outcome() {
            Some(Ok(value)) => return self.settled_with(resolved, &value),
            Some(Err(reason)) => return self.settled_with(rejected, &reason),
            None => {}
        }

        let child = ChildDeferred::unlinked(1, false);
        let weak = Arc::downgrade(child.deferred());
        let on_resolved = callback::settlement_handler(weak.clone(), resolved, State::Resolved);
        let on_rejected = callback::settlement_handler(weak.clone(), rejected, State::Rejected);
        let on_notified = callback::notify_handler(weak, notified);

        let watch = self.deferred.watch(
            Some(Arc::clone(&on_resolved)),
            Some(Arc::clone(&on_rejected)),
            Some(on_notified),
        );
        match watch {
            Watch::Subscribed(subscriptions) => {
                crate::child::adopt(child.deferred(), Arc::clone(&self.deferred), subscriptions)
            }
            // Settled by another thread since the check above.
            Watch::Settled(Ok(value)) => on_resolved(&value),
            Watch::Settled(Err(reason)) => on_rejected(&reason),
        }
        Promise::create(child.into_deferred())
    }

    fn settled_with(&self, callback: Callback, data: &Value) -> Promise {
        match callback {
            Callback::Identity => self.clone(),
            Callback::Effect(f) => {
                f(data);
                self.clone()
            }
            Callback::Transform(f) => Promise::create_resolved(f(data)),
            Callback::Continuation(f) => f(data),
        }
    }

    /// Runs the same callback whether the promise resolves or rejects.
    pub fn always(&self, callback: Callback) -> Promise {
        self.then(callback.clone(), callback, Callback::Identity)
    }

    /// Combines promises with "and" semantics.
    ///
    /// The returned promise resolves with a `Value::Array` of all values, in
    /// the order of `promises`, once every promise resolved. It rejects with
    /// the reason of the first promise to reject. It is never notified.
    /// Promises which are already settled are taken into account on the next
    /// turn of `scheduler`. Without promises the returned promise is resolved
    /// with an empty array right away.
    pub fn all<I>(promises: I, scheduler: &dyn Scheduler) -> Promise
    where
        I: IntoIterator,
        I::Item: Borrow<Promise>,
    {
        let parents = Self::deferreds(promises);
        if parents.is_empty() {
            return Promise::create_resolved(Value::Array(Vec::new()));
        }
        let combined = ChildDeferred::unlinked(parents.len(), true);
        combined.set_log_invalid_actions(false);
        let weak = Arc::downgrade(combined.deferred());
        combined.on_parents_resolved({
            let weak = weak.clone();
            move |values| {
                if let Some(combined) = weak.upgrade() {
                    let _ = combined.resolve(values.clone());
                }
            }
        });
        combined.on_parent_rejected(move |reason| {
            if let Some(combined) = weak.upgrade() {
                let _ = combined.reject(reason.clone());
            }
        });
        combined.link_parents(parents, Some(scheduler));
        Promise::create(combined.into_deferred())
    }

    /// Combines promises with "or" semantics.
    ///
    /// The returned promise resolves with the value of the first promise to
    /// resolve. It rejects with a `Value::Array` of all reasons, in the order
    /// of `promises`, once every promise rejected. It is never notified.
    /// Without promises the returned promise stays pending forever.
    pub fn any<I>(promises: I, scheduler: &dyn Scheduler) -> Promise
    where
        I: IntoIterator,
        I::Item: Borrow<Promise>,
    {
        let parents = Self::deferreds(promises);
        let combined = ChildDeferred::unlinked(parents.len(), true);
        combined.set_log_invalid_actions(false);
        let weak = Arc::downgrade(combined.deferred());
        combined.on_parent_resolved({
            let weak = weak.clone();
            move |value| {
                if let Some(combined) = weak.upgrade() {
                    let _ = combined.resolve(value.clone());
                }
            }
        });
        combined.on_parents_rejected(move |reasons| {
            if let Some(combined) = weak.upgrade() {
                let _ = combined.reject(reasons.clone());
            }
        });
        combined.link_parents(parents, Some(scheduler));
        Promise::create(combined.into_deferred())
    }

    fn deferreds<I>(promises: I) -> Vec<Arc<Deferred>>
    where
        I: IntoIterator,
        I::Item: Borrow<Promise>,
    {
        promises
            .into_iter()
            .map(|promise| Arc::clone(&promise.borrow().deferred))
            .collect()
    }

    /// Subscribes to the resolution of the underlying deferred.
    pub fn on_resolved<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.deferred.on_resolved(handler)
    }

    /// Subscribes to the rejection of the underlying deferred.
    pub fn on_rejected<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.deferred.on_rejected(handler)
    }

    /// Subscribes to progress of the underlying deferred.
    pub fn on_notified<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.deferred.on_notified(handler)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.deferred.unsubscribe(subscription)
    }

    /// A future completing with `Ok(value)` or `Err(reason)` once the
    /// promise settles.
    pub fn wait(&self) -> PromiseFuture {
        PromiseFuture::new(self.clone())
    }
}

impl std::future::IntoFuture for Promise {
    type Output = Result<Value, Value>;
    type IntoFuture = PromiseFuture;

    fn into_future(self) -> PromiseFuture {
        PromiseFuture::new(self)
    }
}
