pub mod app;
pub mod embedded;
pub mod plans_file;
pub mod shutdown;

pub use app::Application;
pub use embedded::{EmbeddedApplication, LocalWorkerRpc, LocalWorkerRpcFactory};
pub use shutdown::ShutdownManager;
