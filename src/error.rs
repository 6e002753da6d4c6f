use serde_json::json;

use crate::deferred::{Action, DeferredId, State};
use crate::Value;

/// Key marking a rejection reason produced by a deferred dropped while pending.
const DESTROYED_KEY: &str = "deferred_destroyed";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// `resolve`, `reject` or `notify` was called on a deferred that is no
    /// longer pending. The deferred is left untouched.
    #[error("cannot {action} deferred which is already {state}")]
    AlreadySettled { action: Action, state: State },
    /// The deferred was dropped before anybody settled it.
    #[error("deferred {0} destroyed while still pending")]
    DeferredDestroyed(DeferredId),
}

impl Error {
    /// Converts the error into a rejection reason.
    ///
    /// ```
    /// use promise_chain::{Deferred, Error};
    ///
    /// let deferred = Deferred::create();
    /// let reason = Error::DeferredDestroyed(deferred.id()).to_value();
    /// assert_eq!(Error::from_reason(&reason), Some(Error::DeferredDestroyed(deferred.id())));
    /// ```
    pub fn to_value(&self) -> Value {
        match self {
            Error::DeferredDestroyed(id) => json!({
                DESTROYED_KEY: id.get(),
                "message": self.to_string(),
            }),
            Error::AlreadySettled { .. } => Value::String(self.to_string()),
        }
    }

    /// Recognises reasons produced by [`Error::to_value`] for destroyed deferreds.
    pub fn from_reason(reason: &Value) -> Option<Self> {
        reason
            .get(DESTROYED_KEY)
            .and_then(Value::as_u64)
            .map(|id| Error::DeferredDestroyed(DeferredId::new(id)))
    }
}

/// Whether `reason` is the rejection a deferred receives when dropped while pending.
pub fn is_destroyed_reason(reason: &Value) -> bool {
    matches!(Error::from_reason(reason), Some(Error::DeferredDestroyed(_)))
}
