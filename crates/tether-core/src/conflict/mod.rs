//! Conflict detection and resolution

mod detector;
mod normalize;
mod resolver;

pub use detector::{classify, ConflictDetector, Detection};
pub use normalize::values_equal;
pub use resolver::{ConflictResolver, ResolveReport};
