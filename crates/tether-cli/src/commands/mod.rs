pub mod common;
pub mod completions;
pub mod conflicts;
pub mod enqueue;
pub mod queue;
pub mod session;
pub mod status;
pub mod sync;
