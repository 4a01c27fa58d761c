//! Services shared by every client of the engine.

mod engine;
mod local_store;

pub use engine::{EngineStatus, SyncEngine, SyncEngineBuilder};
pub use local_store::{Completion, LocalStore, ResolvedState};
