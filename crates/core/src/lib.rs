pub mod clock;
pub mod config;
pub mod constants;
pub mod errors;
pub mod id_generator;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use errors::{SchedulerError, SchedulerResult};
pub use id_generator::{IdGenerator, IdType, UuidIdGenerator};
pub use logging::{init_logging, LogFormat};
