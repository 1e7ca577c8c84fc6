//! Core vocabulary for the sprocket transport engine.
//!
//! This crate holds the pieces everything else is built from: the closed
//! set of error kinds, the opaque [`Message`] payload type, a small [`Url`]
//! for the supported schemes, the [`Aio`] asynchronous-I/O descriptor, and
//! the [`reap`] queue for deferred teardown.

mod aio;
mod error;
mod msg;
mod options;
pub mod reap;
mod url;

pub use aio::{Aio, AioTimeout};
pub use error::{Error, Result};
pub use msg::Message;
pub use options::OptValue;
pub use options::names;
pub use url::Url;

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique, nonzero object id (pipes, dialers, listeners).
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
