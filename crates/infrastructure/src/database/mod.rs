pub mod mapping;
pub mod sqlite_store;

pub use sqlite_store::SqliteStore;
