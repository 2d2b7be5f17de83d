//! broker与worker之间的传输接口

use std::sync::Arc;

use async_trait::async_trait;
use jobflow_core::SchedulerResult;

use crate::entities::{Task, TaskResult};
use crate::worker::{Worker, WorkerMetric};

/// broker调用worker
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    fn worker_id(&self) -> &str;

    /// 探测worker并取回最新指标
    async fn ping(&self) -> SchedulerResult<WorkerMetric>;

    /// 下发任务。`Ok(false)` 是worker的业务拒绝，网络或协议异常返回 `SchedulerError::Transport`
    async fn send_task(&self, task: &Task) -> SchedulerResult<bool>;

    /// 通知worker下线
    async fn unregister(&self) -> SchedulerResult<()>;
}

pub trait WorkerRpcFactory: Send + Sync {
    fn create(&self, worker: &Worker) -> SchedulerResult<Arc<dyn WorkerRpc>>;
}

/// worker调用broker
#[async_trait]
pub trait BrokerRpc: Send + Sync {
    async fn register(&self, worker: &Worker) -> SchedulerResult<()>;

    async fn heartbeat(&self, worker_id: &str, metric: &WorkerMetric) -> SchedulerResult<()>;

    async fn unregister(&self, worker_id: &str) -> SchedulerResult<()>;

    async fn report_task_success(&self, task_id: &str, result: TaskResult) -> SchedulerResult<()>;

    async fn report_task_fail(
        &self,
        task_id: &str,
        error_msg: &str,
        error_stack_trace: Option<&str>,
    ) -> SchedulerResult<()>;
}

/// 把已持久化的任务交给下发流程
#[async_trait]
pub trait TaskLauncher: Send + Sync {
    async fn launch(&self, tasks: Vec<Task>) -> SchedulerResult<()>;
}
