//! Block library
//!
//! The [`BlockExecutor`] runs one block at a time: it dispatches on the
//! block kind, bounds the handler with a deadline, classifies failures and
//! reports them. Handlers for every kind live in `handlers`.

pub mod catalog;
pub mod condition;
mod executor;
mod handlers;
pub mod loop_control;
mod notify;
pub mod testing;
mod wait;

pub use executor::{classify, BlockExecutor, Deadline, ExecutorConfig};
pub use handlers::sensor::sensor_unit;
pub use notify::{Admission, NotificationPolicy, NotificationRule, NotificationThrottle};
pub use wait::{cancellable_wait, secs, WaitOutcome, CANCEL_GRACE};
