pub mod memory;
pub mod remote;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStore;
pub use remote::RemoteStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use traits::{load_all, upsert_record, RecordStore, Upsert};
