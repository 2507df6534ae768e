pub mod event_log;
pub mod model_store;
pub mod redb_store;
pub mod resource;

pub use event_log::JsonlEventLog;
pub use model_store::{MemoryModelStore, ModelStore, ModelStoreExt, Record};
pub use redb_store::RedbModelStore;
pub use resource::{FilesystemResourceStore, ResourceStore};
