//! Foreground/background coordination.
//!
//! The background context owns a [`BackgroundSyncCoordinator`]; every
//! foreground context attaches a [`ForegroundAgent`] through
//! [`BackgroundSyncCoordinator::register_foreground`].

mod coordinator;
mod foreground;
mod message;

pub use coordinator::{BackgroundSyncCoordinator, FlushOutcome, ForegroundPort, NoopRegistrar, SyncRegistrar, SYNC_TAG};
pub use foreground::ForegroundAgent;
pub use message::{Envelope, SyncMessage};
