pub mod dag;
pub mod entities;
pub mod ports;
pub mod repositories;
pub mod value_objects;
pub mod worker;

pub use dag::{Dag, DagNode};
pub use entities::*;
pub use ports::{BrokerRpc, TaskLauncher, WorkerRpc, WorkerRpcFactory};
pub use repositories::{
    JobInstanceRepository, PlanInstanceRepository, PlanRepository, TaskRepository,
};
pub use value_objects::{
    CronType, DispatchOption, LoadBalanceType, RetryOption, ScheduleOption, ScheduleType,
};
pub use worker::{Worker, WorkerMetric, WorkerStatistics, WorkerStatus};
