use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use jobflow_core::{Clock, SchedulerError, SchedulerResult};
use jobflow_domain::{
    DispatchOption, Worker, WorkerMetric, WorkerRpc, WorkerRpcFactory, WorkerStatus,
};

use crate::meta_task::{MetaTask, NextFireTime};

struct RegisteredWorker {
    worker: Worker,
    rpc: Arc<dyn WorkerRpc>,
}

/// 在线worker注册表
///
/// 心跳超时的worker置为 FUSING，不再参与选择；重新心跳后恢复为 RUNNING。
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, RegisteredWorker>>,
    rpc_factory: Arc<dyn WorkerRpcFactory>,
    clock: Arc<dyn Clock>,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(
        rpc_factory: Arc<dyn WorkerRpcFactory>,
        clock: Arc<dyn Clock>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            rpc_factory,
            clock,
            heartbeat_timeout,
        }
    }

    /// 注册或重新注册，重新注册时替换传输连接
    pub async fn register(&self, mut worker: Worker) -> SchedulerResult<()> {
        let rpc = self.rpc_factory.create(&worker)?;
        let now = self.clock.now();
        worker.status = WorkerStatus::Running;
        worker.registered_at = now;
        worker.last_heartbeat_at = now;

        let replaced = self
            .workers
            .write()
            .await
            .insert(worker.id.clone(), RegisteredWorker { worker: worker.clone(), rpc })
            .is_some();
        info!(
            "Worker注册{}: {} ({}), 执行器: {:?}",
            if replaced { "(覆盖)" } else { "" },
            worker.id,
            worker.rpc_address,
            worker.executors
        );
        metrics::gauge!("jobflow_registered_workers").set(self.len().await as f64);
        Ok(())
    }

    pub async fn heartbeat(&self, worker_id: &str, metric: WorkerMetric) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let entry = workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;

        if entry.worker.status == WorkerStatus::Fusing {
            info!("Worker {} 恢复心跳", worker_id);
        }
        entry.worker.status = WorkerStatus::Running;
        entry.worker.metric = metric;
        entry.worker.last_heartbeat_at = self.clock.now();
        debug!("Worker心跳: {}", worker_id);
        Ok(())
    }

    /// worker主动下线
    pub async fn unregister(&self, worker_id: &str) -> bool {
        let removed = self.workers.write().await.remove(worker_id).is_some();
        if removed {
            info!("Worker下线: {}", worker_id);
            metrics::gauge!("jobflow_registered_workers").set(self.len().await as f64);
        }
        removed
    }

    /// broker侧终止worker：通知对方下线后移出注册表
    pub async fn terminate(&self, worker_id: &str) -> bool {
        let Some(rpc) = self.rpc(worker_id).await else {
            return false;
        };
        if let Err(e) = rpc.unregister().await {
            warn!("通知Worker {} 下线失败: {}", worker_id, e);
        }
        self.unregister(worker_id).await
    }

    /// 心跳过期的 RUNNING worker 置为 FUSING，返回被熔断的id
    pub async fn expire_stale(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        let mut workers = self.workers.write().await;
        for entry in workers.values_mut() {
            if entry.worker.status == WorkerStatus::Running
                && entry.worker.heartbeat_expired(now, self.heartbeat_timeout)
            {
                entry.worker.status = WorkerStatus::Fusing;
                expired.push(entry.worker.id.clone());
            }
        }
        if !expired.is_empty() {
            warn!("Worker心跳超时，暂停分配: {:?}", expired);
        }
        expired
    }

    /// 主动探测并刷新指标，探测失败不改变状态
    pub async fn probe(&self, worker_id: &str) -> SchedulerResult<WorkerMetric> {
        let rpc = self
            .rpc(worker_id)
            .await
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        let metric = rpc.ping().await?;
        if let Some(entry) = self.workers.write().await.get_mut(worker_id) {
            entry.worker.metric = metric.clone();
        }
        Ok(metric)
    }

    /// 支持该执行器的 RUNNING worker，按id排序
    pub async fn available_workers(&self, executor_name: &str) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self
            .workers
            .read()
            .await
            .values()
            .filter(|e| e.worker.is_alive() && e.worker.supports_executor(executor_name))
            .map(|e| e.worker.clone())
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// 在 available_workers 基础上过滤资源不满足的worker
    pub async fn candidates(&self, executor_name: &str, option: &DispatchOption) -> Vec<Worker> {
        self.available_workers(executor_name)
            .await
            .into_iter()
            .filter(|w| w.meets_requirement(option))
            .collect()
    }

    pub async fn rpc(&self, worker_id: &str) -> Option<Arc<dyn WorkerRpc>> {
        self.workers
            .read()
            .await
            .get(worker_id)
            .map(|e| Arc::clone(&e.rpc))
    }

    pub async fn get(&self, worker_id: &str) -> Option<Worker> {
        self.workers
            .read()
            .await
            .get(worker_id)
            .map(|e| e.worker.clone())
    }

    pub async fn all_workers(&self) -> Vec<Worker> {
        self.workers
            .read()
            .await
            .values()
            .map(|e| e.worker.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}

/// 周期扫描心跳过期的worker
pub struct WorkerHeartbeatCheckMetaTask {
    registry: Arc<WorkerRegistry>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    next: NextFireTime,
    stopped: AtomicBool,
}

impl WorkerHeartbeatCheckMetaTask {
    pub fn new(registry: Arc<WorkerRegistry>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        let first = clock.now() + interval;
        Self {
            registry,
            clock,
            interval,
            next: NextFireTime::new(Some(first)),
            stopped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MetaTask for WorkerHeartbeatCheckMetaTask {
    fn schedule_id(&self) -> String {
        "worker-heartbeat-check".to_string()
    }

    fn task_kind(&self) -> &'static str {
        "worker_heartbeat_check"
    }

    fn schedule_at(&self) -> Option<DateTime<Utc>> {
        self.next.get()
    }

    async fn execute(&self) -> SchedulerResult<()> {
        let expired = self.registry.expire_stale().await;
        debug!("心跳检测完成，熔断 {} 个Worker", expired.len());
        Ok(())
    }

    async fn after_execute(&self, _error: Option<&SchedulerError>) {
        self.next.set(Some(self.clock.now() + self.interval));
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
