//! Count record persistence.

mod api;
mod record;
mod scheduler;
mod storage;

pub use api::ApiStore;
pub use record::CountRecord;
pub use scheduler::PersistenceScheduler;
pub use storage::{BatchDocument, BatchMetadata, CountStore, FileStore, read_batch};
