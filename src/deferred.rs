//! The settlement side of an asynchronous outcome.
//!
//! A [`Deferred`] starts out pending and is settled exactly once, either by
//! [`Deferred::resolve`] or by [`Deferred::reject`]. Until then it can be
//! notified about progress any number of times. Subscribers are called
//! synchronously, in subscription order, by whoever settles the deferred.

use std::fmt::{self, Debug, Display, Formatter};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::child::Lineage;
use crate::error::Error;
use crate::Value;

/// Possible states of a [`Deferred`] or a [`Promise`](crate::Promise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// The outcome of the asynchronous operation has not been reported yet.
    Pending,
    /// The asynchronous operation completed successfully.
    Resolved,
    /// The asynchronous operation failed.
    Rejected,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Pending => "pending",
            State::Resolved => "resolved",
            State::Rejected => "rejected",
        })
    }
}

/// The operations that only apply to a pending deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Resolve,
    Reject,
    Notify,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Resolve => "resolve",
            Action::Reject => "reject",
            Action::Notify => "notify",
        })
    }
}

/// Process-unique identity of a [`Deferred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeferredId(u64);

impl DeferredId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for DeferredId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Signal {
    Resolved,
    Rejected,
    Notified,
    Destroyed,
}

/// Handle returned when subscribing to a deferred, used to unsubscribe again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    signal: Signal,
    id: u64,
}

pub(crate) type Handler = Arc<dyn Fn(&Value) + Send + Sync>;
pub(crate) type DestroyedHandler = Box<dyn FnOnce(DeferredId) + Send>;

/// Result of [`Deferred::watch`]: either the handlers were registered or the
/// deferred had already settled and the handlers were not kept.
pub(crate) enum Watch {
    Subscribed(Vec<Subscription>),
    Settled(Result<Value, Value>),
}

/// A subscriber removed from its list, dropped once the lock is released.
#[allow(dead_code)]
enum Detached {
    Handler(Handler),
    Destroyed(DestroyedHandler),
}

struct Inner {
    state: State,
    data: Value,
    next_subscription: u64,
    resolved: Vec<(u64, Handler)>,
    rejected: Vec<(u64, Handler)>,
    notified: Vec<(u64, Handler)>,
    destroyed: Vec<(u64, DestroyedHandler)>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: State::Pending,
            data: Value::Null,
            next_subscription: 0,
            resolved: Vec::new(),
            rejected: Vec::new(),
            notified: Vec::new(),
            destroyed: Vec::new(),
        }
    }

    fn subscription(&mut self, signal: Signal) -> Subscription {
        self.next_subscription += 1;
        Subscription {
            signal,
            id: self.next_subscription,
        }
    }

    fn handlers_mut(&mut self, signal: Signal) -> Option<&mut Vec<(u64, Handler)>> {
        match signal {
            Signal::Resolved => Some(&mut self.resolved),
            Signal::Rejected => Some(&mut self.rejected),
            Signal::Notified => Some(&mut self.notified),
            Signal::Destroyed => None,
        }
    }

    fn detach(&mut self, subscription: Subscription) -> Option<Detached> {
        if subscription.signal == Signal::Destroyed {
            let index = self.destroyed.iter().position(|(id, _)| *id == subscription.id)?;
            return Some(Detached::Destroyed(self.destroyed.remove(index).1));
        }
        let handlers = self.handlers_mut(subscription.signal)?;
        let index = handlers.iter().position(|(id, _)| *id == subscription.id)?;
        Some(Detached::Handler(handlers.remove(index).1))
    }

    fn outcome(&self) -> Option<Result<Value, Value>> {
        match self.state {
            State::Pending => None,
            State::Resolved => Some(Ok(self.data.clone())),
            State::Rejected => Some(Err(self.data.clone())),
        }
    }
}

/// Communicates the outcome of an asynchronous operation.
///
/// The producer of an asynchronous operation creates a deferred, wires the
/// completion of the operation to [`resolve`](Deferred::resolve),
/// [`reject`](Deferred::reject) and [`notify`](Deferred::notify), and hands a
/// [`Promise`](crate::Promise) over the deferred to its consumers.
///
/// Deferreds are shared through [`Arc`]. When the last reference goes away
/// while the deferred is still pending, it rejects itself with the reason
/// produced by [`Error::DeferredDestroyed`] so rejection subscribers still
/// get a terminal signal.
///
/// # Examples
///
/// ```
/// use promise_chain::{json, Deferred, State};
///
/// let deferred = Deferred::create();
/// deferred.notify(json!(50)).unwrap();
/// deferred.resolve(json!("done")).unwrap();
/// assert_eq!(deferred.state(), State::Resolved);
/// assert!(deferred.reject(json!("too late")).is_err());
/// assert_eq!(deferred.data(), json!("done"));
/// ```
pub struct Deferred {
    id: DeferredId,
    inner: Mutex<Inner>,
    log_invalid_actions: AtomicBool,
    lineage: Lineage,
}

impl Deferred {
    /// Creates a pending deferred.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::with_lineage(Lineage::default()))
    }

    /// Creates a deferred which is already resolved (`Ok`) or rejected (`Err`).
    pub fn create_settled(outcome: Result<Value, Value>) -> Arc<Self> {
        let deferred = Self::create();
        let settled = match outcome {
            Ok(value) => deferred.resolve(value),
            Err(reason) => deferred.reject(reason),
        };
        debug_assert!(settled.is_ok(), "a fresh deferred is pending");
        deferred
    }

    pub(crate) fn with_lineage(lineage: Lineage) -> Self {
        Self {
            id: DeferredId::next(),
            inner: Mutex::new(Inner::new()),
            log_invalid_actions: AtomicBool::new(true),
            lineage,
        }
    }

    pub fn id(&self) -> DeferredId {
        self.id
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    /// The resolve value, the rejection reason or `Value::Null` while pending.
    pub fn data(&self) -> Value {
        self.lock().data.clone()
    }

    /// State and data taken together: `None` while pending.
    pub fn outcome(&self) -> Option<Result<Value, Value>> {
        self.lock().outcome()
    }

    /// Whether calling an operation on a settled deferred logs a debug message.
    /// Enabled by default.
    pub fn set_log_invalid_actions(&self, enabled: bool) {
        self.log_invalid_actions.store(enabled, Ordering::Relaxed);
    }

    /// Communicates success of the asynchronous operation.
    ///
    /// Fails with [`Error::AlreadySettled`] if the deferred is not pending.
    pub fn resolve(&self, value: Value) -> Result<(), Error> {
        self.settle(State::Resolved, value)
    }

    /// Communicates failure of the asynchronous operation.
    ///
    /// Fails with [`Error::AlreadySettled`] if the deferred is not pending.
    pub fn reject(&self, reason: Value) -> Result<(), Error> {
        self.settle(State::Rejected, reason)
    }

    /// Communicates progress of the asynchronous operation.
    ///
    /// Progress is not retained; it only reaches the current subscribers.
    /// Subscribers run outside the deferred's lock, so a `notify` racing
    /// with a settlement on another thread may reach them after the
    /// settlement handlers ran.
    pub fn notify(&self, progress: Value) -> Result<(), Error> {
        let handlers: Vec<Handler> = {
            let inner = self.lock();
            if inner.state != State::Pending {
                let state = inner.state;
                drop(inner);
                return Err(self.invalid_action(Action::Notify, state));
            }
            inner.notified.iter().map(|(_, handler)| Arc::clone(handler)).collect()
        };
        for handler in &handlers {
            handler(&progress);
        }
        Ok(())
    }

    pub(crate) fn perform(&self, action: Action, value: Value) -> Result<(), Error> {
        match action {
            Action::Resolve => self.resolve(value),
            Action::Reject => self.reject(value),
            Action::Notify => self.notify(value),
        }
    }

    fn settle(&self, target: State, data: Value) -> Result<(), Error> {
        let handlers = self.transition(target, data.clone())?;
        for (_, handler) in &handlers {
            handler(&data);
        }
        Ok(())
    }

    /// Moves a pending deferred to `target` and hands back the handlers to
    /// run, without running them.
    fn transition(&self, target: State, data: Value) -> Result<Vec<(u64, Handler)>, Error> {
        let (resolved, rejected, notified) = {
            let mut inner = self.lock();
            if inner.state != State::Pending {
                let state = inner.state;
                drop(inner);
                let action = match target {
                    State::Rejected => Action::Reject,
                    _ => Action::Resolve,
                };
                return Err(self.invalid_action(action, state));
            }
            inner.state = target;
            inner.data = data;
            (
                mem::take(&mut inner.resolved),
                mem::take(&mut inner.rejected),
                mem::take(&mut inner.notified),
            )
        };
        // Nothing but the winning list can fire any more.
        drop(notified);
        Ok(match target {
            State::Rejected => {
                drop(resolved);
                rejected
            }
            _ => {
                drop(rejected);
                resolved
            }
        })
    }

    fn invalid_action(&self, action: Action, state: State) -> Error {
        if self.log_invalid_actions.load(Ordering::Relaxed) {
            tracing::debug!("cannot {action} deferred {} which is already {state}", self.id);
        }
        Error::AlreadySettled { action, state }
    }

    /// Subscribes to the resolution of the deferred.
    pub fn on_resolved<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(Signal::Resolved, Arc::new(handler))
    }

    /// Subscribes to the rejection of the deferred, including the rejection
    /// it gets when dropped while pending.
    pub fn on_rejected<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(Signal::Rejected, Arc::new(handler))
    }

    /// Subscribes to progress notifications.
    pub fn on_notified<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(Signal::Notified, Arc::new(handler))
    }

    /// Removes a subscriber. Returns `false` if it was not subscribed (any
    /// more), for example because the deferred has settled in between.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let detached = self.lock().detach(subscription);
        detached.is_some()
    }

    fn subscribe(&self, signal: Signal, handler: Handler) -> Subscription {
        let mut inner = self.lock();
        let subscription = inner.subscription(signal);
        if inner.state == State::Pending {
            if let Some(handlers) = inner.handlers_mut(signal) {
                handlers.push((subscription.id, handler));
            }
        }
        subscription
    }

    /// Runs `handler` with the id of this deferred when it is dropped.
    pub(crate) fn on_destroyed(&self, handler: DestroyedHandler) -> Subscription {
        let mut inner = self.lock();
        let subscription = inner.subscription(Signal::Destroyed);
        inner.destroyed.push((subscription.id, handler));
        subscription
    }

    /// Registers settlement and progress handlers, or reports the outcome if
    /// the deferred already settled. Checking and subscribing happen under
    /// one lock so no settlement can slip in between.
    pub(crate) fn watch(
        &self,
        resolved: Option<Handler>,
        rejected: Option<Handler>,
        notified: Option<Handler>,
    ) -> Watch {
        let mut inner = self.lock();
        if let Some(outcome) = inner.outcome() {
            return Watch::Settled(outcome);
        }
        let mut subscriptions = Vec::with_capacity(3);
        let handlers = [
            (Signal::Resolved, resolved),
            (Signal::Rejected, rejected),
            (Signal::Notified, notified),
        ];
        for (signal, handler) in handlers {
            let Some(handler) = handler else { continue };
            let subscription = inner.subscription(signal);
            if let Some(list) = inner.handlers_mut(signal) {
                list.push((subscription.id, handler));
                subscriptions.push(subscription);
            }
        }
        Watch::Subscribed(subscriptions)
    }

    pub(crate) fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // User code never runs under this lock, so poisoning carries no broken invariant.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for Deferred {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let (state, data) = match self.inner.try_lock() {
            Ok(inner) => (Some(inner.state), Some(inner.data.clone())),
            Err(_) => (None, None),
        };
        f.debug_struct("Deferred")
            .field("id", &self.id)
            .field("state", &state)
            .field("data", &data)
            .finish()
    }
}

impl Drop for Deferred {
    /// Rejects a still pending deferred before it goes away, then tells
    /// whoever watches for its destruction.
    ///
    /// When the drop happens while the thread unwinds from a panic, every
    /// handler still runs, but a panic raised by one is caught and logged
    /// instead of aborting the process.
    fn drop(&mut self) {
        let unwinding = thread::panicking();
        let run = |handler: &mut dyn FnMut()| {
            if !unwinding {
                return handler();
            }
            if panic::catch_unwind(AssertUnwindSafe(handler)).is_err() {
                tracing::error!("handler of deferred {} panicked while dropping during a panic", self.id);
            }
        };

        let pending = self.lock().state == State::Pending;
        if pending {
            tracing::debug!("deferred {} destroyed while still pending", self.id);
            let reason = Error::DeferredDestroyed(self.id).to_value();
            match self.transition(State::Rejected, reason.clone()) {
                Ok(handlers) => {
                    for (_, handler) in &handlers {
                        run(&mut || handler(&reason));
                    }
                }
                Err(_) => debug_assert!(false, "nobody else can settle a deferred being dropped"),
            }
        }
        let destroyed = mem::take(&mut self.lock().destroyed);
        for (_, handler) in destroyed {
            let mut handler = Some(handler);
            run(&mut || {
                if let Some(handler) = handler.take() {
                    handler(self.id)
                }
            });
        }
    }
}
