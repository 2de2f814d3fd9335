mod engine;
mod entry;
mod group;

pub use self::engine::{RetentionEngine, RetentionReport};
pub use self::group::CleanupGroup;
