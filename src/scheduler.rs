//! Deferring work to a later turn of the host's event loop.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A unit of work handed to a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks "on the next turn": after the code that scheduled them has
/// returned control to the event loop.
///
/// Child deferreds with result tracking use a scheduler to replay parents
/// which had already settled, so aggregate promises never settle before
/// their creator gets to see them pending. Hosts plug in whatever their
/// event loop offers.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: Task);
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn schedule(&self, task: Task) {
        (**self).schedule(task)
    }
}

/// Runs every task right away. Handy for synchronous test harnesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl Scheduler for Immediate {
    fn schedule(&self, task: Task) {
        task()
    }
}

/// A first-in, first-out task queue driven by the host.
///
/// # Examples
///
/// ```
/// use promise_chain::{json, EventLoop, Promise, State};
///
/// let event_loop = EventLoop::new();
/// let all = Promise::all([Promise::create_resolved(json!(1))], &event_loop);
/// assert_eq!(all.state(), State::Pending);
/// event_loop.run_until_idle();
/// assert_eq!(all.data(), json!([1]));
/// ```
#[derive(Default)]
pub struct EventLoop {
    queue: Mutex<VecDeque<Task>>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the tasks that were queued when the turn started. Tasks
    /// scheduled while the turn runs wait for the next one.
    ///
    /// Returns the number of tasks run.
    pub fn turn(&self) -> usize {
        let tasks = std::mem::take(&mut *self.queue());
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    /// Runs turns until no task is left. Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let count = self.turn();
            if count == 0 {
                return total;
            }
            total += count;
        }
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for EventLoop {
    fn schedule(&self, task: Task) {
        self.queue().push_back(task);
    }
}

impl Debug for EventLoop {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop").field("queued", &self.len()).finish()
    }
}
