use std::sync::{Arc, Mutex};
use std::thread;

use futures::executor::block_on;
use promise_chain::{
    is_destroyed_reason, json, Callback, Deferred, EventLoop, Immediate, Promise, PromiseSitter, State, Value,
};
use test_log::test;

fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |value: &Value| sink.lock().unwrap().push(value.clone()))
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut all = Vec::new();
    for rest in permutations(n - 1) {
        for position in 0..=rest.len() {
            let mut order = rest.clone();
            order.insert(position, n - 1);
            all.push(order);
        }
    }
    all
}

#[test]
fn test_resolve_fires_subscribers_once() {
    let deferred = Deferred::create();
    let promise = Promise::create(Arc::clone(&deferred));
    let (seen, record) = recorder();
    promise.on_resolved(record);

    deferred.resolve(json!("x")).unwrap();
    assert!(deferred.resolve(json!("y")).is_err());
    assert!(deferred.reject(json!("z")).is_err());
    assert!(deferred.notify(json!(1)).is_err());

    assert_eq!(promise.state(), State::Resolved);
    assert_eq!(promise.data(), json!("x"));
    assert_eq!(*seen.lock().unwrap(), vec![json!("x")]);
}

#[test]
fn test_all_rejects_when_one_input_rejected() {
    let event_loop = EventLoop::new();
    let p1 = Promise::create_resolved(json!(1));
    let p2 = Promise::create_rejected(json!("e"));
    let all = Promise::all([p1, p2], &event_loop);
    event_loop.run_until_idle();
    assert_eq!(all.state(), State::Rejected);
    assert_eq!(all.data(), json!("e"));
}

#[test]
fn test_then_transforms_resolved_value() {
    let p = Promise::create_resolved(json!(5));
    let q = p.then(
        Callback::transform(|v| json!(v.as_i64().unwrap_or_default() * 2)),
        Callback::Identity,
        Callback::Identity,
    );
    assert_eq!(q.state(), State::Resolved);
    assert_eq!(q.data(), json!(10));
}

#[test]
fn test_rejection_handler_recovers() {
    let p = Promise::create_rejected(json!("boom"));
    let q = p.then(
        Callback::Identity,
        Callback::transform(|reason| json!(format!("recovered:{}", reason.as_str().unwrap_or_default()))),
        Callback::Identity,
    );
    assert_eq!(q.state(), State::Resolved);
    assert_eq!(q.data(), json!("recovered:boom"));
}

#[test]
fn test_dropping_pending_pair_rejects() {
    let (seen, record) = recorder();
    {
        let deferred = Deferred::create();
        let promise = Promise::create(Arc::clone(&deferred));
        promise.on_rejected(record);
    }
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(is_destroyed_reason(&seen[0]));
}

#[test]
fn test_chained_notify_is_transformed() {
    let deferred = Deferred::create();
    let chained = Promise::create(Arc::clone(&deferred)).then(
        Callback::Identity,
        Callback::Identity,
        Callback::transform(|x| json!(x.as_i64().unwrap_or_default() + 1)),
    );
    let (seen, record) = recorder();
    chained.on_notified(record);
    deferred.notify(json!(1)).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![json!(2)]);
}

#[test]
fn test_effect_on_resolved_keeps_value() {
    let (seen, record) = recorder();
    let q = Promise::create_resolved(json!("v")).then(Callback::effect(record), Callback::Identity, Callback::Identity);
    assert_eq!(*seen.lock().unwrap(), vec![json!("v")]);
    assert_eq!(q.outcome(), Some(Ok(json!("v"))));
}

#[test]
fn test_all_keeps_input_order_for_every_completion_order() {
    for order in permutations(3) {
        let pairs: Vec<_> = (0..3).map(|_| Promise::pending()).collect();
        let all = Promise::all(pairs.iter().map(|(_, promise)| promise), &Immediate);
        for &index in &order {
            assert_eq!(all.state(), State::Pending, "order {order:?}");
            pairs[index].0.resolve(json!(index * 10)).unwrap();
        }
        assert_eq!(all.outcome(), Some(Ok(json!([0, 10, 20]))), "order {order:?}");
    }
}

#[test]
fn test_any_keeps_input_order_for_every_completion_order() {
    for order in permutations(3) {
        let event_loop = EventLoop::new();
        let pairs: Vec<_> = (0..3).map(|_| Promise::pending()).collect();
        // One input already rejected, replayed on the next turn.
        pairs[order[0]].0.reject(json!(format!("r{}", order[0]))).unwrap();
        let any = Promise::any(pairs.iter().map(|(_, promise)| promise), &event_loop);
        for &index in &order[1..] {
            pairs[index].0.reject(json!(format!("r{index}"))).unwrap();
        }
        assert_eq!(any.state(), State::Pending, "order {order:?}");
        event_loop.run_until_idle();
        assert_eq!(any.outcome(), Some(Err(json!(["r0", "r1", "r2"]))), "order {order:?}");
    }
}

#[test]
fn test_empty_combinators() {
    let event_loop = EventLoop::new();
    let all = Promise::all(Vec::<Promise>::new(), &event_loop);
    let any = Promise::any(Vec::<Promise>::new(), &event_loop);
    assert_eq!(all.outcome(), Some(Ok(json!([]))));
    event_loop.run_until_idle();
    assert_eq!(any.state(), State::Pending);
}

#[test]
fn test_then_on_resolved_runs_before_returning() {
    let (seen, record) = recorder();
    let _ = Promise::create_resolved(json!(1)).then(Callback::effect(record), Callback::Identity, Callback::Identity);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_continuation_chain() {
    let (first, promise) = Promise::pending();
    let second = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&second);
    let result = promise
        .then(
            Callback::continuation(move |v| {
                let (deferred, next) = Promise::pending();
                *slot.lock().unwrap() = Some((deferred, v.clone()));
                next
            }),
            Callback::Identity,
            Callback::Identity,
        )
        .then(
            Callback::transform(|v| json!(format!("got {}", v.as_str().unwrap_or_default()))),
            Callback::Identity,
            Callback::Identity,
        );

    first.resolve(json!("request")).unwrap();
    let (deferred, seen) = second.lock().unwrap().take().expect("continuation ran");
    assert_eq!(seen, json!("request"));
    assert_eq!(result.state(), State::Pending);

    deferred.resolve(json!("response")).unwrap();
    assert_eq!(result.outcome(), Some(Ok(json!("got response"))));
}

#[test]
fn test_sitter_keeps_fire_and_forget_chain() {
    let sitter = PromiseSitter::new();
    let (deferred, promise) = Promise::pending();
    let (seen, record) = recorder();
    sitter.add(&promise.then(Callback::effect(record), Callback::Identity, Callback::Identity));
    drop(promise);

    let producer = thread::spawn(move || deferred.resolve(json!("late")));
    producer.join().expect("The producer thread has panicked").unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![json!("late")]);
    assert!(sitter.is_empty());
}

#[test]
fn test_await_aggregate() {
    let (first, p1) = Promise::pending();
    let (second, p2) = Promise::pending();
    let all = Promise::all([p1, p2], &Immediate);
    let producer = thread::spawn(move || {
        second.resolve(json!("b")).unwrap();
        first.resolve(json!("a")).unwrap();
    });
    assert_eq!(block_on(all.wait()), Ok(json!(["a", "b"])));
    producer.join().expect("The producer thread has panicked");
}

#[test]
#[should_panic(expected = "handler failed")]
fn test_handler_panic_propagates_to_resolver() {
    let (deferred, promise) = Promise::pending();
    promise.on_resolved(|_| panic!("handler failed"));
    let _ = deferred.resolve(json!(1));
}
