pub mod app_config;
pub mod broker_worker;
pub mod database;
pub mod observability;

pub use app_config::{AppConfig, EmbeddedConfig};
pub use broker_worker::{BrokerConfig, WorkerConfig};
pub use database::{DatabaseConfig, StoreType};
pub use observability::ObservabilityConfig;
