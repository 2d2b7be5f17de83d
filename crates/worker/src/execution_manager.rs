//! worker端任务执行：有界接收，固定并发执行，结束后向broker上报

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::{BrokerRpc, Task, TaskResult};

use crate::executor_registry::ExecutorRegistry;
use crate::executors::TaskExecutor;

const REPORT_ATTEMPTS: u32 = 3;
const REPORT_BACKOFF: Duration = Duration::from_millis(200);

pub struct TaskExecutionManager {
    worker_id: String,
    registry: Arc<ExecutorRegistry>,
    reporter: Arc<dyn BrokerRpc>,
    permits: Arc<Semaphore>,
    /// 已接收未结束的任务，包括排队中的
    admitted: Arc<RwLock<HashSet<String>>>,
    concurrency: usize,
    capacity: usize,
}

impl TaskExecutionManager {
    /// 最多同时执行 concurrency 个任务，另有 queue_size 个排队位置
    pub fn new(
        worker_id: &str,
        registry: Arc<ExecutorRegistry>,
        reporter: Arc<dyn BrokerRpc>,
        concurrency: usize,
        queue_size: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            worker_id: worker_id.to_string(),
            registry,
            reporter,
            permits: Arc::new(Semaphore::new(concurrency)),
            admitted: Arc::new(RwLock::new(HashSet::new())),
            concurrency,
            capacity: concurrency + queue_size,
        }
    }

    /// 接收任务后立即返回。
    /// 执行器未知返回 DispatchFailed，容量已满返回 ResourceExhausted；
    /// 重复接收执行中的任务直接返回成功
    pub async fn submit(&self, task: Task) -> SchedulerResult<()> {
        let Some(executor) = self.registry.get(&task.executor_name) else {
            metrics::counter!("jobflow_worker_tasks_rejected_total", "reason" => "unknown_executor")
                .increment(1);
            return Err(SchedulerError::DispatchFailed(format!(
                "Worker {} 不支持执行器 {}",
                self.worker_id, task.executor_name
            )));
        };

        {
            let mut admitted = self.admitted.write().await;
            if admitted.contains(&task.id) {
                debug!("任务 {} 已在执行，忽略重复接收", task.id);
                return Ok(());
            }
            if admitted.len() >= self.capacity {
                metrics::counter!("jobflow_worker_tasks_rejected_total", "reason" => "queue_full")
                    .increment(1);
                warn!("Worker {} 任务已满({})，拒绝任务 {}", self.worker_id, self.capacity, task.id);
                return Err(SchedulerError::ResourceExhausted(format!(
                    "Worker {} 没有空闲的执行位置",
                    self.worker_id
                )));
            }
            admitted.insert(task.id.clone());
        }

        let permits = Arc::clone(&self.permits);
        let admitted = Arc::clone(&self.admitted);
        let reporter = Arc::clone(&self.reporter);
        tokio::spawn(async move {
            let result = Self::run(&permits, executor, &task).await;
            // 上报完成后才释放位置，wait_idle 返回时结果已送达
            Self::report(reporter.as_ref(), &task.id, result).await;
            admitted.write().await.remove(&task.id);
        });
        Ok(())
    }

    async fn run(
        permits: &Arc<Semaphore>,
        executor: Arc<dyn TaskExecutor>,
        task: &Task,
    ) -> SchedulerResult<TaskResult> {
        let permit = Arc::clone(permits)
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::internal("执行池已关闭"))?;
        debug!("开始执行 {}", task.entity_description());
        let result = executor.execute(task).await;
        drop(permit);
        result
    }

    /// 上报执行结果，可重试的传输异常会退避重试
    async fn report(reporter: &dyn BrokerRpc, task_id: &str, result: SchedulerResult<TaskResult>) {
        let outcome = if result.is_ok() { "succeed" } else { "failed" };
        metrics::counter!("jobflow_worker_tasks_completed_total", "outcome" => outcome).increment(1);

        for attempt in 1..=REPORT_ATTEMPTS {
            let reported = match &result {
                Ok(task_result) => {
                    reporter
                        .report_task_success(task_id, task_result.clone())
                        .await
                }
                Err(e) => {
                    let stack = format!("{e:?}");
                    reporter
                        .report_task_fail(task_id, &e.to_string(), Some(&stack))
                        .await
                }
            };
            match reported {
                Ok(()) => {
                    info!("任务 {} 执行结果已上报: {}", task_id, outcome);
                    return;
                }
                Err(e) if e.is_retryable() && attempt < REPORT_ATTEMPTS => {
                    warn!("上报任务 {} 结果失败，第{}次: {}", task_id, attempt, e);
                    tokio::time::sleep(REPORT_BACKOFF * attempt).await;
                }
                Err(e) => {
                    error!("上报任务 {} 结果失败: {}", task_id, e);
                    return;
                }
            }
        }
    }

    pub async fn is_admitted(&self, task_id: &str) -> bool {
        self.admitted.read().await.contains(task_id)
    }

    /// 已接收未结束的任务数
    pub async fn admitted_count(&self) -> usize {
        self.admitted.read().await.len()
    }

    /// 正在执行（已拿到执行许可）的任务数
    pub fn executing_count(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }

    /// 还能接收的任务数
    pub async fn available_slots(&self) -> usize {
        self.capacity.saturating_sub(self.admitted_count().await)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn executor_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// 等待所有已接收的任务结束，超时返回 false
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.admitted.read().await.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
