use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use jobflow_core::constants::{DISPATCH_FAIL, DISPATCH_FAIL_NO_WORKER};
use jobflow_core::{Clock, SchedulerError, SchedulerResult};
use jobflow_domain::{Task, TaskStatus, Worker};

use crate::statistics::DispatchStatistics;
use crate::strategies::WorkerSelectorFactory;
use crate::worker_registry::WorkerRegistry;

/// 把 DISPATCHING 状态的任务交给worker
///
/// 只修改内存中的任务，状态落库由调用方完成。
pub struct TaskDispatcher {
    registry: Arc<WorkerRegistry>,
    selectors: Arc<WorkerSelectorFactory>,
    statistics: Arc<DispatchStatistics>,
    clock: Arc<dyn Clock>,
    max_attempts: usize,
}

impl TaskDispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        selectors: Arc<WorkerSelectorFactory>,
        statistics: Arc<DispatchStatistics>,
        clock: Arc<dyn Clock>,
        max_attempts: usize,
    ) -> Self {
        Self {
            registry,
            selectors,
            statistics,
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    /// 返回 true 时任务已被worker接收，状态置为 EXECUTING；
    /// 返回 false 时任务置为 FAILED 并带上固定的失败原因
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn dispatch(&self, task: &mut Task) -> SchedulerResult<bool> {
        if task.status != TaskStatus::Dispatching {
            return Err(SchedulerError::DispatchFailed(format!(
                "任务 {} 状态为 {}，不能下发",
                task.id, task.status
            )));
        }

        metrics::counter!("jobflow_dispatch_attempts_total").increment(1);
        let accepted = match task.worker_id.clone() {
            Some(worker_id) => self.dispatch_pinned(task, &worker_id).await,
            None => self.dispatch_selected(task).await?,
        };

        match accepted {
            Some(worker_id) => {
                let now = self.clock.now();
                task.worker_id = Some(worker_id.clone());
                task.status = TaskStatus::Executing;
                task.start_at = Some(now);
                self.statistics.record_dispatch(&worker_id, now).await;
                metrics::counter!("jobflow_dispatch_success_total").increment(1);
                debug!("任务 {} 已下发到 {}", task.id, worker_id);
                Ok(true)
            }
            None => {
                if task.error_msg.is_none() {
                    task.error_msg = Some(DISPATCH_FAIL.to_string());
                }
                task.status = TaskStatus::Failed;
                task.end_at = Some(self.clock.now());
                metrics::counter!("jobflow_dispatch_failures_total").increment(1);
                warn!(
                    "任务下发失败: {} - {}",
                    task.entity_description(),
                    task.error_msg.as_deref().unwrap_or(DISPATCH_FAIL)
                );
                Ok(false)
            }
        }
    }

    /// 预先绑定worker的任务只尝试一次
    async fn dispatch_pinned(&self, task: &Task, worker_id: &str) -> Option<String> {
        let Some(rpc) = self.registry.rpc(worker_id).await else {
            warn!("任务 {} 绑定的Worker {} 已不在线", task.id, worker_id);
            return None;
        };
        match rpc.send_task(task).await {
            Ok(true) => Some(worker_id.to_string()),
            Ok(false) => {
                info!("Worker {} 拒绝任务 {}", worker_id, task.id);
                None
            }
            Err(e) => {
                warn!("下发任务 {} 到 {} 出现传输异常: {}", task.id, worker_id, e);
                None
            }
        }
    }

    /// 按负载均衡策略选择，拒绝或传输异常的worker从候选中剔除后重选
    async fn dispatch_selected(&self, task: &mut Task) -> SchedulerResult<Option<String>> {
        let candidates: Vec<Worker> = self
            .registry
            .candidates(&task.executor_name, &task.dispatch_option)
            .await;
        if candidates.is_empty() {
            task.error_msg = Some(DISPATCH_FAIL_NO_WORKER.to_string());
            return Ok(None);
        }
        self.try_candidates(task, candidates).await
    }

    /// 只有真正发出的请求才计入尝试次数，选出后已下线的worker直接剔除
    async fn try_candidates(
        &self,
        task: &mut Task,
        mut candidates: Vec<Worker>,
    ) -> SchedulerResult<Option<String>> {
        let selector = self.selectors.get(task.dispatch_option.load_balance_type);
        let mut attempt = 0;
        while attempt < self.max_attempts && !candidates.is_empty() {
            let Some(worker_id) = selector.select_worker(task, &candidates).await? else {
                debug!("策略 {} 未选出Worker", selector.name());
                break;
            };
            candidates.retain(|w| w.id != worker_id);
            let Some(rpc) = self.registry.rpc(&worker_id).await else {
                debug!("Worker {} 已下线，跳过", worker_id);
                continue;
            };
            attempt += 1;

            match rpc.send_task(task).await {
                Ok(true) => return Ok(Some(worker_id)),
                Ok(false) => {
                    info!(
                        "Worker {} 拒绝任务 {} (第{}/{}次尝试)",
                        worker_id, task.id, attempt, self.max_attempts
                    );
                }
                Err(e) => {
                    warn!(
                        "下发任务 {} 到 {} 出现传输异常 (第{}/{}次尝试): {}",
                        task.id, worker_id, attempt, self.max_attempts, e
                    );
                }
            }
        }

        task.error_msg = Some(DISPATCH_FAIL.to_string());
        Ok(None)
    }
}
