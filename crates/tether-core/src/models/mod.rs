//! Data models for Tether

mod conflict;
mod entity;
mod operation;
mod session;
mod snapshot;

pub use conflict::{ConflictRecord, ConflictSide, ConflictType, Resolution};
pub use entity::{
    optimistic_references, rebind_fields, CachedEntity, EntityId, EntityKind, Fields,
    OPTIMISTIC_ID_PREFIX,
};
pub use operation::{
    FailedOperation, FailureReason, Operation, OperationDraft, OperationId, OperationType,
};
pub use session::{Identity, SessionContext};
pub use snapshot::{NetworkStatusSnapshot, QueueSnapshot};
