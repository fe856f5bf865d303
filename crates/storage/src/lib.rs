pub mod conformance;
mod error;
mod memory;
mod record;
mod timestamp;
mod traits;

pub use error::StorageError;
pub use memory::{InMemoryRepository, MemorySnapshot};
pub use record::{Actor, ActorKind, AuditQuery, AuditTransition, EntityRef, StoredEntity};
pub use timestamp::Timestamp;
pub use traits::Repository;
