//! Chainable deferred/promise pairs.
//!
//! A producer creates a [`Deferred`], hands out a [`Promise`] over it and
//! later settles the deferred with [`Deferred::resolve`] or
//! [`Deferred::reject`], optionally reporting progress with
//! [`Deferred::notify`] before that. Consumers chain callbacks with
//! [`Promise::then`] and combine promises with [`Promise::all`] and
//! [`Promise::any`]. Promises can also be awaited.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{json, Callback, EventLoop, Promise, State};
//!
//! let event_loop = EventLoop::new();
//! let (download, downloaded) = Promise::pending();
//! let size = downloaded.then(
//!     Callback::transform(|body| json!(body.as_str().map_or(0, str::len))),
//!     Callback::transform(|_| json!(0)),
//!     Callback::Identity,
//! );
//! let both = Promise::all([size, Promise::create_resolved(json!("cached"))], &event_loop);
//!
//! download.resolve(json!("hello")).unwrap();
//! assert_eq!(both.state(), State::Pending);
//! event_loop.run_until_idle();
//! assert_eq!(both.data(), json!([5, "cached"]));
//! ```

mod callback;
mod child;
mod deferred;
mod error;
mod future;
mod promise;
mod scheduler;
mod sitter;

/// The payload of resolutions, rejections and notifications.
pub type Value = serde_json::Value;
pub use serde_json::json;

pub use callback::Callback;
pub use child::ChildDeferred;
pub use deferred::{Action, Deferred, DeferredId, State, Subscription};
pub use error::{is_destroyed_reason, Error};
pub use future::PromiseFuture;
pub use promise::Promise;
pub use scheduler::{EventLoop, Immediate, Scheduler, Task};
pub use sitter::PromiseSitter;
