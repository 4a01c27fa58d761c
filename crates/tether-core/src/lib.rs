//! tether-core - Core library for Tether
//!
//! This crate contains the offline synchronization engine: the local store,
//! the durable operation queue, connectivity detection, conflict detection and
//! resolution, sync scheduling and background flush coordination. Clients
//! normally talk to a [`SyncEngine`].

pub mod background;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod models;
pub mod network;
pub mod observe;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod services;
pub mod util;

pub use config::{EntitySchema, SyncConfig};
pub use error::{Error, OperationErrorKind, Result};
pub use models::{
    CachedEntity, ConflictRecord, EntityId, EntityKind, Identity, Operation, OperationDraft, OperationId,
    Resolution,
};
pub use services::{EngineStatus, LocalStore, SyncEngine, SyncEngineBuilder};
