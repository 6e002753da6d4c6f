//! The callbacks accepted by [`Promise::then`](crate::Promise::then).
//!
//! What a callback returns decides the shape of the chained promise, so the
//! shape is chosen once, when the callback is wrapped, and dispatched by
//! matching on [`Callback`].

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Weak};

use crate::child;
use crate::deferred::{Action, Deferred, Handler, State, Watch};
use crate::promise::Promise;
use crate::Value;

/// A callback passed to [`Promise::then`](crate::Promise::then).
///
/// | variant | resolved / rejected callback | notified callback |
/// |---|---|---|
/// | `Identity` | mirror the outcome | forward the progress |
/// | `Effect` | run, then mirror the outcome | run, then forward the progress |
/// | `Transform` | resolve with the returned value | forward the returned value |
/// | `Continuation` | adopt the returned promise | forward what the returned promise resolves or notifies with |
///
/// A `Transform` always resolves, even when it handled a rejection:
/// returning a value from a rejection callback means the failure was dealt with.
#[derive(Clone, Default)]
pub enum Callback {
    #[default]
    Identity,
    Effect(Arc<dyn Fn(&Value) + Send + Sync>),
    Transform(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
    Continuation(Arc<dyn Fn(&Value) -> Promise + Send + Sync>),
}

impl Callback {
    pub fn effect<F>(f: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Self::Effect(Arc::new(f))
    }

    pub fn transform<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self::Transform(Arc::new(f))
    }

    pub fn continuation<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Promise + Send + Sync + 'static,
    {
        Self::Continuation(Arc::new(f))
    }
}

impl Debug for Callback {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Callback::Identity => "Identity",
            Callback::Effect(_) => "Effect(..)",
            Callback::Transform(_) => "Transform(..)",
            Callback::Continuation(_) => "Continuation(..)",
        })
    }
}

/// Wraps the resolved (`state == Resolved`) or rejected callback of a
/// pending `then` so it settles `child` when the parent settles.
pub(crate) fn settlement_handler(child: Weak<Deferred>, callback: Callback, state: State) -> Handler {
    debug_assert!(state != State::Pending, "settlement handlers are for resolved or rejected parents");
    let mirror = match state {
        State::Rejected => Action::Reject,
        _ => Action::Resolve,
    };
    Arc::new(move |data: &Value| {
        let Some(child) = child.upgrade() else { return };
        match &callback {
            Callback::Identity => {
                let _ = child.perform(mirror, data.clone());
            }
            Callback::Effect(f) => {
                f(data);
                let _ = child.perform(mirror, data.clone());
            }
            Callback::Transform(f) => {
                let _ = child.resolve(f(data));
            }
            Callback::Continuation(f) => {
                let inner = f(data);
                follow(&child, &inner, Some(Action::Resolve), Some(Action::Reject), Some(Action::Notify));
            }
        }
    })
}

/// Wraps the notified callback of a pending `then`.
pub(crate) fn notify_handler(child: Weak<Deferred>, callback: Callback) -> Handler {
    Arc::new(move |progress: &Value| {
        let Some(child) = child.upgrade() else { return };
        match &callback {
            Callback::Identity => {
                let _ = child.notify(progress.clone());
            }
            Callback::Effect(f) => {
                f(progress);
                let _ = child.notify(progress.clone());
            }
            Callback::Transform(f) => {
                let _ = child.notify(f(progress));
            }
            Callback::Continuation(f) => {
                // A rejected inner promise swallows the notification.
                let inner = f(progress);
                follow(&child, &inner, Some(Action::Notify), None, Some(Action::Notify));
            }
        }
    })
}

/// Lets `child` follow `inner`: each of the inner promise's resolution,
/// rejection and progress is turned into the given action on the child, or
/// dropped for `None`. A pending inner promise becomes a parent of `child`,
/// replacing the one followed before.
fn follow(
    child: &Arc<Deferred>,
    inner: &Promise,
    on_resolved: Option<Action>,
    on_rejected: Option<Action>,
    on_notified: Option<Action>,
) {
    let forward = |action: Option<Action>| action.map(|action| forwarder(Arc::downgrade(child), action));
    let inner = Arc::clone(inner.deferred());
    match inner.watch(forward(on_resolved), forward(on_rejected), forward(on_notified)) {
        Watch::Subscribed(subscriptions) => child::follow(child, inner, subscriptions),
        Watch::Settled(Ok(value)) => {
            if let Some(action) = on_resolved {
                let _ = child.perform(action, value);
            }
        }
        Watch::Settled(Err(reason)) => {
            if let Some(action) = on_rejected {
                let _ = child.perform(action, reason);
            }
        }
    }
}

fn forwarder(target: Weak<Deferred>, action: Action) -> Handler {
    Arc::new(move |value: &Value| {
        if let Some(target) = target.upgrade() {
            let _ = target.perform(action, value.clone());
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use test_log::test;

    use super::*;

    #[test]
    fn test_default_is_identity() {
        assert!(matches!(Callback::default(), Callback::Identity));
        assert_eq!(format!("{:?}", Callback::transform(|v| v.clone())), "Transform(..)");
    }

    #[test]
    fn test_handler_ignores_dropped_child() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let child = Deferred::create();
        let handler = settlement_handler(
            Arc::downgrade(&child),
            Callback::effect(move |_| *counter.lock().unwrap() += 1),
            State::Resolved,
        );
        drop(child);
        handler(&json!(1));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_effect_mirrors_rejection() {
        let child = Deferred::create();
        let handler = settlement_handler(Arc::downgrade(&child), Callback::effect(|_| {}), State::Rejected);
        handler(&json!("e"));
        assert_eq!(child.outcome(), Some(Err(json!("e"))));
    }

    #[test]
    fn test_transform_resolves_after_rejection() {
        let child = Deferred::create();
        let handler = settlement_handler(
            Arc::downgrade(&child),
            Callback::transform(|reason| json!(format!("handled {}", reason.as_str().unwrap_or_default()))),
            State::Rejected,
        );
        handler(&json!("e"));
        assert_eq!(child.outcome(), Some(Ok(json!("handled e"))));
    }

    #[test]
    fn test_continuation_adopts_pending_inner() {
        let inner = Deferred::create();
        let promise = Promise::create(Arc::clone(&inner));
        let child = Deferred::create();
        let handler = settlement_handler(
            Arc::downgrade(&child),
            Callback::continuation(move |_| promise.clone()),
            State::Resolved,
        );
        handler(&json!(1));
        assert_eq!(child.state(), State::Pending);
        assert_eq!(child.lineage().parents().len(), 1);

        inner.resolve(json!(2)).unwrap();
        assert_eq!(child.outcome(), Some(Ok(json!(2))));
    }

    #[test]
    fn test_notify_continuation_swallows_rejection() {
        let child = Deferred::create();
        let notified = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notified);
        child.on_notified(move |v| sink.lock().unwrap().push(v.clone()));
        let handler = notify_handler(
            Arc::downgrade(&child),
            Callback::continuation(|progress| match progress.as_i64() {
                Some(n) if n > 0 => Promise::create_resolved(json!(n * 10)),
                _ => Promise::create_rejected(json!("negative")),
            }),
        );
        handler(&json!(1));
        handler(&json!(-1));
        assert_eq!(*notified.lock().unwrap(), vec![json!(10)]);
        assert_eq!(child.state(), State::Pending);
    }
}
