//! Broker端调度：计划触发、DAG推进、任务拆分与下发

pub mod broker;
pub mod calculator;
pub mod cron_utils;
pub mod dispatch_pool;
pub mod meta_task;
pub mod plan_manager;
pub mod plan_schedule_task;
pub mod schedule_strategy;
pub mod statistics;
pub mod strategies;
pub mod task_dispatcher;
pub mod task_factory;
pub mod task_launcher;
pub mod timer_wheel;
pub mod worker_registry;


pub use broker::Broker;
pub use calculator::{ScheduleCalculator, ScheduleCalculatorFactory};
pub use dispatch_pool::{DispatchPool, TaskDispatchHandler};
pub use meta_task::{MetaTask, MetaTaskScheduler, NextFireTime};
pub use plan_manager::PlanManager;
pub use plan_schedule_task::PlanScheduleMetaTask;
pub use schedule_strategy::{truncate_millis, PlanSnapshot, Repositories, ScheduleStrategy};
pub use statistics::DispatchStatistics;
pub use strategies::{WorkerSelectStrategy, WorkerSelectorFactory};
pub use task_dispatcher::TaskDispatcher;
pub use task_factory::TaskFactory;
pub use task_launcher::{TaskDispatchMetaTask, WheelTaskLauncher};
pub use worker_registry::{WorkerHeartbeatCheckMetaTask, WorkerRegistry};
