//! Stream scheduling.
//!
//! A stream is started with [`StreamBuilder::start`] (or [`start_stream`] /
//! [`start_all`] for configured streams), which spawns one scheduler task
//! and returns a [`StreamHandle`] for observing and stopping it.

mod builder;
mod handle;
mod scheduler;
mod state;

pub use builder::{start_all, start_stream, StreamBuilder};
pub use handle::StreamHandle;
pub use state::{StreamProgress, StreamState};
