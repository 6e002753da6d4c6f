//! Awaiting promises from async code.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use crate::deferred::{Handler, Subscription, Watch};
use crate::promise::Promise;
use crate::Value;

/// Waits for a [`Promise`] to settle.
///
/// Created by [`Promise::wait`] or by awaiting a promise. Completes with
/// `Ok(value)` when the promise resolves and `Err(reason)` when it rejects.
/// Progress notifications are ignored.
///
/// # Examples
///
/// ```
/// use futures::executor::block_on;
/// use promise_chain::{json, Promise};
/// use std::thread;
///
/// let (deferred, promise) = Promise::pending();
/// let producer = thread::spawn(move || deferred.resolve(json!("🍓")));
/// assert_eq!(block_on(promise.wait()), Ok(json!("🍓")));
/// producer.join().expect("The producer thread has panicked").unwrap();
/// ```
#[derive(Debug)]
pub struct PromiseFuture {
    promise: Promise,
    slot: Arc<Mutex<Slot>>,
    subscriptions: Option<Vec<Subscription>>,
}

#[derive(Debug, Default)]
struct Slot {
    outcome: Option<Result<Value, Value>>,
    // Every poller is woken, not just the last one.
    wakers: Vec<Waker>,
}

impl Slot {
    fn fill(&mut self, outcome: Result<Value, Value>) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
        for waker in self.wakers.drain(..) {
            waker.wake()
        }
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PromiseFuture {
    pub(crate) fn new(promise: Promise) -> Self {
        Self {
            promise,
            slot: Arc::default(),
            subscriptions: None,
        }
    }

    /// The promise this future waits for.
    pub fn promise(&self) -> &Promise {
        &self.promise
    }

    fn filler(&self, wrap: fn(Value) -> Result<Value, Value>) -> Handler {
        let slot = Arc::downgrade(&self.slot);
        Arc::new(move |data: &Value| {
            if let Some(slot) = slot.upgrade() {
                let mut slot = lock(&slot);
                slot.fill(wrap(data.clone()));
            }
        })
    }
}

impl Future for PromiseFuture {
    type Output = Result<Value, Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        {
            let mut slot = lock(&this.slot);
            if let Some(outcome) = slot.outcome.clone() {
                return Poll::Ready(outcome);
            }
            if !slot.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                slot.wakers.push(cx.waker().clone());
            }
        }
        if this.subscriptions.is_some() {
            return Poll::Pending;
        }
        let watch = this.promise.deferred().watch(
            Some(this.filler(Ok)),
            Some(this.filler(Err)),
            None,
        );
        match watch {
            Watch::Subscribed(subscriptions) => {
                this.subscriptions = Some(subscriptions);
                Poll::Pending
            }
            Watch::Settled(outcome) => {
                lock(&this.slot).wakers.clear();
                Poll::Ready(outcome)
            }
        }
    }
}

impl Drop for PromiseFuture {
    fn drop(&mut self) {
        for subscription in self.subscriptions.take().into_iter().flatten() {
            self.promise.unsubscribe(subscription);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use futures::executor::block_on;
    use futures::task::noop_waker;
    use serde_json::json;
    use test_log::test;

    use super::*;
    use crate::callback::Callback;

    #[test]
    fn test_settled_promise_is_ready() {
        assert_eq!(block_on(Promise::create_resolved(json!(1)).wait()), Ok(json!(1)));
        let rejected = Promise::create_rejected(json!("e"));
        assert_eq!(block_on(async { rejected.await }), Err(json!("e")));
    }

    #[test]
    fn test_waits_for_other_thread() {
        let (deferred, promise) = Promise::pending();
        let chained = promise.then(
            Callback::transform(|v| json!(v.as_i64().unwrap_or_default() + 1)),
            Callback::Identity,
            Callback::Identity,
        );
        let producer = thread::spawn(move || {
            deferred.notify(json!("ignored")).unwrap();
            deferred.resolve(json!(41)).unwrap();
        });
        assert_eq!(block_on(async { chained.await }), Ok(json!(42)));
        producer.join().expect("The producer thread has panicked");
    }

    #[test]
    fn test_many_consumers() {
        let (deferred, promise) = Promise::pending();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let promise = promise.clone();
                thread::spawn(move || block_on(promise.wait()))
            })
            .collect();
        deferred.reject(json!("nope")).unwrap();
        for consumer in consumers {
            assert_eq!(consumer.join().expect("The consumer thread has panicked"), Err(json!("nope")));
        }
    }

    #[test]
    fn test_drop_unsubscribes() {
        let (deferred, promise) = Promise::pending();
        let mut future = promise.wait();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());
        let subscriptions = future.subscriptions.clone().unwrap_or_default();
        assert_eq!(subscriptions.len(), 2);

        drop(future);
        for subscription in subscriptions {
            assert!(!deferred.unsubscribe(subscription));
        }
    }
}
