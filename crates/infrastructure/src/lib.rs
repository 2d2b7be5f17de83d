pub mod database;
pub mod memory;
pub mod rpc;

pub use database::SqliteStore;
pub use memory::InMemoryStore;
pub use rpc::{HttpWorkerRpc, HttpWorkerRpcFactory};
