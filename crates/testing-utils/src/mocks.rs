//! 传输层与下发入口的测试替身

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::{
    BrokerRpc, Task, TaskLauncher, TaskResult, Worker, WorkerMetric, WorkerRpc, WorkerRpcFactory,
};

/// worker对一次下发的应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReply {
    Accept,
    Refuse,
    TransportError,
}

/// 按脚本应答的worker，记录收到的任务
pub struct MockWorkerRpc {
    worker_id: String,
    replies: Mutex<VecDeque<SendReply>>,
    default_reply: Mutex<SendReply>,
    received: Mutex<Vec<Task>>,
    metric: Mutex<Option<WorkerMetric>>,
    unregistered: Mutex<bool>,
}

impl MockWorkerRpc {
    pub fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            replies: Mutex::new(VecDeque::new()),
            default_reply: Mutex::new(SendReply::Accept),
            received: Mutex::new(Vec::new()),
            metric: Mutex::new(Some(WorkerMetric::default())),
            unregistered: Mutex::new(false),
        }
    }

    /// 依次使用的应答，用完后回到默认应答
    pub fn script(&self, replies: &[SendReply]) {
        self.replies.lock().unwrap().extend(replies.iter().copied());
    }

    pub fn set_default_reply(&self, reply: SendReply) {
        *self.default_reply.lock().unwrap() = reply;
    }

    /// None 表示探测失败
    pub fn set_metric(&self, metric: Option<WorkerMetric>) {
        *self.metric.lock().unwrap() = metric;
    }

    /// 所有下发尝试，包括被拒绝的
    pub fn received(&self) -> Vec<Task> {
        self.received.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn is_unregistered(&self) -> bool {
        *self.unregistered.lock().unwrap()
    }
}

#[async_trait]
impl WorkerRpc for MockWorkerRpc {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn ping(&self) -> SchedulerResult<WorkerMetric> {
        self.metric
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SchedulerError::transport(format!("{} 无响应", self.worker_id)))
    }

    async fn send_task(&self, task: &Task) -> SchedulerResult<bool> {
        self.received.lock().unwrap().push(task.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.default_reply.lock().unwrap());
        match reply {
            SendReply::Accept => Ok(true),
            SendReply::Refuse => Ok(false),
            SendReply::TransportError => Err(SchedulerError::transport(format!(
                "连接 {} 被重置",
                self.worker_id
            ))),
        }
    }

    async fn unregister(&self) -> SchedulerResult<()> {
        *self.unregistered.lock().unwrap() = true;
        Ok(())
    }
}

/// 按worker id复用 MockWorkerRpc，未预置的worker按默认应答接收任务
#[derive(Default)]
pub struct MockWorkerRpcFactory {
    rpcs: Mutex<HashMap<String, Arc<MockWorkerRpc>>>,
}

impl MockWorkerRpcFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rpc(&self, worker_id: &str) -> Arc<MockWorkerRpc> {
        self.rpcs
            .lock()
            .unwrap()
            .entry(worker_id.to_string())
            .or_insert_with(|| Arc::new(MockWorkerRpc::new(worker_id)))
            .clone()
    }

    /// 所有worker收到的任务总数
    pub fn total_sends(&self) -> usize {
        self.rpcs
            .lock()
            .unwrap()
            .values()
            .map(|rpc| rpc.send_count())
            .sum()
    }
}

impl WorkerRpcFactory for MockWorkerRpcFactory {
    fn create(&self, worker: &Worker) -> SchedulerResult<Arc<dyn WorkerRpc>> {
        Ok(self.rpc(&worker.id))
    }
}

/// 只记录不下发的启动器
#[derive(Default)]
pub struct RecordingTaskLauncher {
    launched: Mutex<Vec<Task>>,
}

impl RecordingTaskLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched(&self) -> Vec<Task> {
        self.launched.lock().unwrap().clone()
    }

    /// 取出并清空已记录的任务
    pub fn take(&self) -> Vec<Task> {
        std::mem::take(&mut *self.launched.lock().unwrap())
    }
}

#[async_trait]
impl TaskLauncher for RecordingTaskLauncher {
    async fn launch(&self, tasks: Vec<Task>) -> SchedulerResult<()> {
        self.launched.lock().unwrap().extend(tasks);
        Ok(())
    }
}

/// worker收到的上报
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Success { task_id: String, result: TaskResult },
    Fail { task_id: String, error_msg: String },
}

impl Report {
    pub fn task_id(&self) -> &str {
        match self {
            Report::Success { task_id, .. } | Report::Fail { task_id, .. } => task_id,
        }
    }
}

/// 记录worker调用的broker
///
/// 心跳可以设置为返回 WorkerNotFound，上报可以设置前若干次返回传输错误
#[derive(Default)]
pub struct RecordingBrokerRpc {
    registered: Mutex<Vec<Worker>>,
    heartbeats: Mutex<Vec<(String, WorkerMetric)>>,
    unregistered: Mutex<Vec<String>>,
    reports: Mutex<Vec<Report>>,
    forget_workers: Mutex<bool>,
    report_failures: Mutex<u32>,
}

impl RecordingBrokerRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// 心跳一律返回 WorkerNotFound
    pub fn forget_workers(&self, forget: bool) {
        *self.forget_workers.lock().unwrap() = forget;
    }

    /// 接下来 n 次上报返回传输错误
    pub fn fail_reports(&self, n: u32) {
        *self.report_failures.lock().unwrap() = n;
    }

    pub fn registered(&self) -> Vec<Worker> {
        self.registered.lock().unwrap().clone()
    }

    pub fn heartbeats(&self) -> Vec<(String, WorkerMetric)> {
        self.heartbeats.lock().unwrap().clone()
    }

    pub fn unregistered(&self) -> Vec<String> {
        self.unregistered.lock().unwrap().clone()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }

    fn take_report_failure(&self) -> SchedulerResult<()> {
        let mut failures = self.report_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(SchedulerError::transport("broker不可达"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerRpc for RecordingBrokerRpc {
    async fn register(&self, worker: &Worker) -> SchedulerResult<()> {
        self.registered.lock().unwrap().push(worker.clone());
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, metric: &WorkerMetric) -> SchedulerResult<()> {
        if *self.forget_workers.lock().unwrap() {
            return Err(SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            });
        }
        self.heartbeats
            .lock()
            .unwrap()
            .push((worker_id.to_string(), metric.clone()));
        Ok(())
    }

    async fn unregister(&self, worker_id: &str) -> SchedulerResult<()> {
        self.unregistered.lock().unwrap().push(worker_id.to_string());
        Ok(())
    }

    async fn report_task_success(&self, task_id: &str, result: TaskResult) -> SchedulerResult<()> {
        self.take_report_failure()?;
        self.reports.lock().unwrap().push(Report::Success {
            task_id: task_id.to_string(),
            result,
        });
        Ok(())
    }

    async fn report_task_fail(
        &self,
        task_id: &str,
        error_msg: &str,
        _error_stack_trace: Option<&str>,
    ) -> SchedulerResult<()> {
        self.take_report_failure()?;
        self.reports.lock().unwrap().push(Report::Fail {
            task_id: task_id.to_string(),
            error_msg: error_msg.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::TaskBuilder;

    #[tokio::test]
    async fn test_scripted_replies() {
        let rpc = MockWorkerRpc::new("w1");
        rpc.script(&[SendReply::Refuse, SendReply::TransportError]);
        let task = TaskBuilder::new("t1").build();

        assert!(!rpc.send_task(&task).await.unwrap());
        assert!(rpc.send_task(&task).await.is_err());
        assert!(rpc.send_task(&task).await.unwrap());
        assert_eq!(rpc.send_count(), 3);
    }

    #[tokio::test]
    async fn test_factory_reuses_rpc() {
        let factory = MockWorkerRpcFactory::new();
        factory.rpc("w1").set_default_reply(SendReply::Refuse);
        let worker = crate::builders::WorkerBuilder::new("w1").build();
        let rpc = factory.create(&worker).unwrap();
        let task = TaskBuilder::new("t1").build();
        assert!(!rpc.send_task(&task).await.unwrap());
        assert_eq!(factory.total_sends(), 1);
    }
}
