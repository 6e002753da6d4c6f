//! Deferreds that keep other deferreds alive.
//!
//! Chaining is really a chain of deferreds: every [`Promise::then`](crate::Promise::then)
//! creates a [`ChildDeferred`] holding a strong reference to the deferred of
//! the promise it was called on, and `all`/`any` create one child over every input.
//! Parents only ever see their children through weak subscriptions, so the
//! reference graph points from child to parent and never cycles.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::deferred::{Deferred, DeferredId, Handler, State, Subscription, Watch};
use crate::scheduler::Scheduler;
use crate::Value;

/// A parent held by a child together with the subscriptions the child has
/// on it. Dropping the link unsubscribes before the parent is released.
struct ParentLink {
    parent: Arc<Deferred>,
    subscriptions: Vec<Subscription>,
    // Adopted from a promise returned by a callback.
    followed: bool,
}

impl Drop for ParentLink {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            self.parent.unsubscribe(subscription);
        }
    }
}

/// Handlers for the four aggregate parent events.
#[derive(Default)]
struct Hooks {
    parent_resolved: Vec<Handler>,
    parents_resolved: Vec<Handler>,
    parent_rejected: Vec<Handler>,
    parents_rejected: Vec<Handler>,
}

/// What a recorded parent outcome has to trigger.
struct Dispatch {
    single: Vec<Handler>,
    value: Value,
    aggregate: Option<(Vec<Handler>, Value)>,
}

/// Per-parent results of a child created with result tracking.
struct Tracker {
    resolved: Vec<Option<Value>>,
    rejected: Vec<Option<Value>>,
    resolved_count: usize,
    rejected_count: usize,
    hooks: Hooks,
}

impl Tracker {
    fn new(parents: usize) -> Self {
        Self {
            resolved: vec![None; parents],
            rejected: vec![None; parents],
            resolved_count: 0,
            rejected_count: 0,
            hooks: Hooks::default(),
        }
    }

    fn record(&mut self, index: usize, outcome: Result<Value, Value>) -> Option<Dispatch> {
        let (slots, count, single, all, value) = match outcome {
            Ok(value) => (
                &mut self.resolved,
                &mut self.resolved_count,
                &self.hooks.parent_resolved,
                &self.hooks.parents_resolved,
                value,
            ),
            Err(reason) => (
                &mut self.rejected,
                &mut self.rejected_count,
                &self.hooks.parent_rejected,
                &self.hooks.parents_rejected,
                reason,
            ),
        };
        let slot = slots.get_mut(index)?;
        if slot.is_some() {
            return None;
        }
        *slot = Some(value.clone());
        *count += 1;
        let aggregate = (*count == slots.len()).then(|| {
            let values = slots.iter().map(|slot| slot.clone().unwrap_or_default()).collect();
            (all.clone(), Value::Array(values))
        });
        Some(Dispatch {
            single: single.clone(),
            value,
            aggregate,
        })
    }
}

/// The parents of a deferred. Plain deferreds have an empty lineage.
#[derive(Default)]
pub(crate) struct Lineage {
    links: Mutex<Vec<ParentLink>>,
    tracker: Option<Mutex<Tracker>>,
}

impl Lineage {
    fn links(&self) -> MutexGuard<'_, Vec<ParentLink>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, link: ParentLink) {
        self.links().push(link);
    }

    /// Pushes a followed link in place of the one followed so far, if any.
    fn replace_followed(&self, link: ParentLink) {
        let replaced = {
            let mut links = self.links();
            let previous = links
                .iter()
                .position(|link| link.followed)
                .map(|index| links.remove(index));
            links.push(link);
            previous
        };
        drop(replaced);
    }

    pub(crate) fn parents(&self) -> Vec<Arc<Deferred>> {
        self.links().iter().map(|link| Arc::clone(&link.parent)).collect()
    }

    /// Drops the link to a parent that went away underneath the child.
    fn forget(&self, parent: DeferredId) {
        let forgotten = {
            let mut links = self.links();
            links
                .iter()
                .position(|link| link.parent.id() == parent)
                .map(|index| links.remove(index))
        };
        drop(forgotten);
    }

    fn hook(&self, select: impl FnOnce(&mut Hooks) -> &mut Vec<Handler>, handler: Handler) {
        match &self.tracker {
            Some(tracker) => select(&mut lock(tracker).hooks).push(handler),
            None => tracing::debug!("parent event hook on a child without result tracking never fires"),
        }
    }

    fn parent_settled(&self, index: usize, outcome: Result<Value, Value>) {
        let Some(tracker) = &self.tracker else { return };
        let dispatch = lock(tracker).record(index, outcome);
        let Some(dispatch) = dispatch else { return };
        for handler in &dispatch.single {
            handler(&dispatch.value);
        }
        if let Some((handlers, values)) = dispatch.aggregate {
            for handler in &handlers {
                handler(&values);
            }
        }
    }
}

fn lock(tracker: &Mutex<Tracker>) -> MutexGuard<'_, Tracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`Deferred`] holding strong references to one or more parent deferreds.
///
/// Without result tracking a child only keeps its parents alive; chaining
/// wires the parents' signals to the child itself. With result tracking the
/// child observes every parent and publishes four events:
///
/// - parent resolved, with the value of that parent,
/// - parents resolved, once every parent resolved, with all values in parent order,
/// - parent rejected, with the reason of that parent,
/// - parents rejected, once every parent rejected, with all reasons in parent order.
///
/// Parents that are already settled when the child is created are replayed
/// through a [`Scheduler`], so the events never fire before control returned
/// to the creator.
#[derive(Debug, Clone)]
pub struct ChildDeferred {
    deferred: Arc<Deferred>,
}

impl ChildDeferred {
    /// Creates a pending child of a single parent.
    pub fn create(parent: Arc<Deferred>) -> Self {
        Self::create_with_parents(vec![parent], None)
    }

    /// Creates a pending child of `parents`. Passing a scheduler turns on
    /// result tracking.
    ///
    /// Parents that already settled are replayed through the scheduler. With
    /// a scheduler running tasks inline, such as [`Immediate`](crate::Immediate),
    /// the replay happens before this returns, so hooks registered afterwards
    /// never see those parents.
    pub fn create_with_parents(parents: Vec<Arc<Deferred>>, tracking: Option<&dyn Scheduler>) -> Self {
        let child = Self::unlinked(parents.len(), tracking.is_some());
        child.link_parents(parents, tracking);
        child
    }

    /// Creates a child whose parents are linked later, so hooks can be
    /// registered before any parent event is possible.
    pub(crate) fn unlinked(parents: usize, track_results: bool) -> Self {
        let lineage = Lineage {
            links: Mutex::new(Vec::with_capacity(parents)),
            tracker: track_results.then(|| Mutex::new(Tracker::new(parents))),
        };
        Self {
            deferred: Arc::new(Deferred::with_lineage(lineage)),
        }
    }

    pub(crate) fn link_parents(&self, parents: Vec<Arc<Deferred>>, tracking: Option<&dyn Scheduler>) {
        for (index, parent) in parents.into_iter().enumerate() {
            let mut subscriptions = Vec::new();
            if let Some(scheduler) = tracking {
                self.track(index, &parent, scheduler, &mut subscriptions);
            }
            adopt(&self.deferred, parent, subscriptions);
        }
    }

    fn track(&self, index: usize, parent: &Deferred, scheduler: &dyn Scheduler, subscriptions: &mut Vec<Subscription>) {
        let resolved = parent_handler(Arc::downgrade(&self.deferred), index, State::Resolved);
        let rejected = parent_handler(Arc::downgrade(&self.deferred), index, State::Rejected);
        match parent.watch(Some(resolved), Some(rejected), None) {
            Watch::Subscribed(watching) => subscriptions.extend(watching),
            Watch::Settled(outcome) => {
                tracing::trace!(
                    "replaying settled parent {} of deferred {} on the next turn",
                    parent.id(),
                    self.deferred.id()
                );
                let child = Arc::downgrade(&self.deferred);
                scheduler.schedule(Box::new(move || {
                    if let Some(child) = child.upgrade() {
                        child.lineage().parent_settled(index, outcome);
                    }
                }));
            }
        }
    }

    pub fn deferred(&self) -> &Arc<Deferred> {
        &self.deferred
    }

    pub fn into_deferred(self) -> Arc<Deferred> {
        self.deferred
    }

    /// The parents in the order they were given, followed by parents adopted
    /// while following promises returned from callbacks.
    pub fn parents(&self) -> Vec<Arc<Deferred>> {
        self.deferred.lineage().parents()
    }

    pub fn on_parent_resolved<F>(&self, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.deferred.lineage().hook(|hooks| &mut hooks.parent_resolved, Arc::new(handler));
    }

    /// The handler receives a `Value::Array` of all parent values.
    pub fn on_parents_resolved<F>(&self, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.deferred.lineage().hook(|hooks| &mut hooks.parents_resolved, Arc::new(handler));
    }

    pub fn on_parent_rejected<F>(&self, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.deferred.lineage().hook(|hooks| &mut hooks.parent_rejected, Arc::new(handler));
    }

    /// The handler receives a `Value::Array` of all parent reasons.
    pub fn on_parents_rejected<F>(&self, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.deferred.lineage().hook(|hooks| &mut hooks.parents_rejected, Arc::new(handler));
    }
}

impl Deref for ChildDeferred {
    type Target = Deferred;

    fn deref(&self) -> &Deferred {
        &self.deferred
    }
}

impl From<ChildDeferred> for Arc<Deferred> {
    fn from(child: ChildDeferred) -> Self {
        child.deferred
    }
}

/// Makes `parent` a parent of `child`, taking over `subscriptions` the child
/// already has on it, and watches for the parent going away.
pub(crate) fn adopt(child: &Arc<Deferred>, parent: Arc<Deferred>, subscriptions: Vec<Subscription>) {
    let link = link(child, parent, subscriptions, false);
    child.lineage().push(link);
}

/// Like [`adopt`] for the promise a callback returned. Only the most recent
/// such promise is followed: the link to an earlier one is dropped.
pub(crate) fn follow(child: &Arc<Deferred>, parent: Arc<Deferred>, subscriptions: Vec<Subscription>) {
    let link = link(child, parent, subscriptions, true);
    child.lineage().replace_followed(link);
}

fn link(child: &Arc<Deferred>, parent: Arc<Deferred>, mut subscriptions: Vec<Subscription>, followed: bool) -> ParentLink {
    let weak = Arc::downgrade(child);
    subscriptions.push(parent.on_destroyed(Box::new(move |parent| {
        if let Some(child) = weak.upgrade() {
            tracing::error!(
                "parent deferred {parent} is destroyed while child {} is still holding a reference",
                child.id()
            );
            child.lineage().forget(parent);
        }
    })));
    ParentLink {
        parent,
        subscriptions,
        followed,
    }
}

fn parent_handler(child: Weak<Deferred>, index: usize, state: State) -> Handler {
    Arc::new(move |data: &Value| {
        let Some(child) = child.upgrade() else { return };
        let outcome = match state {
            State::Rejected => Err(data.clone()),
            _ => Ok(data.clone()),
        };
        child.lineage().parent_settled(index, outcome);
    })
}
