pub mod execution_manager;
pub mod executor_registry;
pub mod executors;
pub mod heartbeat;
pub mod service;

pub use execution_manager::TaskExecutionManager;
pub use executor_registry::ExecutorRegistry;
pub use executors::{EchoExecutor, ShellExecutor, ShellTaskParams, TaskExecutor};
pub use heartbeat::HeartbeatManager;
pub use service::{WorkerService, WorkerServiceBuilder};
