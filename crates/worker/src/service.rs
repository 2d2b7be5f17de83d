use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use jobflow_core::{SchedulerError, SchedulerResult, WorkerConfig};
use jobflow_domain::{BrokerRpc, Task, Worker, WorkerMetric, WorkerStatus};

use crate::execution_manager::TaskExecutionManager;
use crate::executor_registry::ExecutorRegistry;
use crate::executors::TaskExecutor;
use crate::heartbeat::HeartbeatManager;

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    worker_id: String,
    broker: Arc<dyn BrokerRpc>,
    registry: ExecutorRegistry,
    concurrency: usize,
    queue_size: usize,
    heartbeat_interval: Duration,
    rpc_address: String,
    tags: HashMap<String, String>,
}

impl WorkerServiceBuilder {
    pub fn new(worker_id: &str, broker: Arc<dyn BrokerRpc>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            broker,
            registry: ExecutorRegistry::new(),
            concurrency: 4,
            queue_size: 64,
            heartbeat_interval: Duration::from_secs(30),
            rpc_address: format!("local://{worker_id}"),
            tags: HashMap::new(),
        }
    }

    /// 按配置设置并发、队列与心跳，并启用配置中列出的内置执行器
    pub fn from_config(config: &WorkerConfig, broker: Arc<dyn BrokerRpc>) -> SchedulerResult<Self> {
        let registry = ExecutorRegistry::with_builtin().restrict_to(&config.executors)?;
        let mut builder = Self::new(&config.resolve_worker_id(), broker)
            .concurrency(config.concurrency)
            .queue_size(config.queue_size)
            .heartbeat_interval(Duration::from_secs(config.heartbeat_interval_seconds));
        builder.registry = registry;
        Ok(builder)
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn rpc_address(mut self, rpc_address: &str) -> Self {
        self.rpc_address = rpc_address.to_string();
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn register_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        info!("注册任务执行器: {}", executor.name());
        self.registry.register(executor);
        self
    }

    pub fn build(self) -> SchedulerResult<WorkerService> {
        if self.registry.names().is_empty() {
            return Err(SchedulerError::config_error(format!(
                "Worker {} 没有任何执行器",
                self.worker_id
            )));
        }

        let now = Utc::now();
        let worker = Worker {
            id: self.worker_id.clone(),
            name: self.worker_id.clone(),
            rpc_address: self.rpc_address,
            executors: self.registry.names(),
            tags: self.tags,
            status: WorkerStatus::Running,
            metric: WorkerMetric::default(),
            registered_at: now,
            last_heartbeat_at: now,
        };
        let manager = Arc::new(TaskExecutionManager::new(
            &self.worker_id,
            Arc::new(self.registry),
            Arc::clone(&self.broker),
            self.concurrency,
            self.queue_size,
        ));
        let heartbeat = Arc::new(HeartbeatManager::new(
            worker.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&manager),
            self.heartbeat_interval,
        ));

        Ok(WorkerService {
            worker,
            broker: self.broker,
            manager,
            heartbeat,
            terminated: AtomicBool::new(false),
        })
    }
}

/// Worker服务：向broker注册、接收任务、心跳
pub struct WorkerService {
    worker: Worker,
    broker: Arc<dyn BrokerRpc>,
    manager: Arc<TaskExecutionManager>,
    heartbeat: Arc<HeartbeatManager>,
    /// 下线后拒绝新任务，心跳不再重新注册
    terminated: AtomicBool,
}

impl WorkerService {
    pub fn builder(worker_id: &str, broker: Arc<dyn BrokerRpc>) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(worker_id, broker)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker.id
    }

    /// 注册时使用的描述，指标为当前值
    pub async fn descriptor(&self) -> Worker {
        Worker {
            metric: self.heartbeat.collect_metric().await,
            ..self.worker.clone()
        }
    }

    /// 注册并启动心跳
    pub async fn start(&self, shutdown_tx: &broadcast::Sender<()>) -> SchedulerResult<JoinHandle<()>> {
        let descriptor = self.descriptor().await;
        self.broker.register(&descriptor).await?;
        info!(
            "Worker {} 已注册，执行器: {:?}",
            self.worker.id, self.worker.executors
        );
        Ok(Arc::clone(&self.heartbeat).start(shutdown_tx.subscribe()))
    }

    /// broker下发任务。返回 false 表示拒绝：执行器未知或没有空闲位置
    pub async fn receive_task(&self, task: Task) -> SchedulerResult<bool> {
        if self.is_terminated() {
            info!("Worker {} 已下线，拒绝任务 {}", self.worker.id, task.id);
            return Ok(false);
        }
        let task_id = task.id.clone();
        match self.manager.submit(task).await {
            Ok(()) => Ok(true),
            Err(SchedulerError::ResourceExhausted(reason))
            | Err(SchedulerError::DispatchFailed(reason)) => {
                info!("Worker {} 拒绝任务 {}: {}", self.worker.id, task_id, reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn metric(&self) -> WorkerMetric {
        self.heartbeat.collect_metric().await
    }

    pub fn execution_manager(&self) -> &Arc<TaskExecutionManager> {
        &self.manager
    }

    /// broker通知下线：停止心跳并拒绝新任务，已接收的任务继续执行并上报
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.heartbeat.stop();
        info!("Worker {} 收到broker下线通知", self.worker.id);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// 等待执行中的任务结束后下线
    pub async fn stop(&self, drain_timeout: Duration) -> SchedulerResult<()> {
        let already_terminated = self.terminated.swap(true, Ordering::SeqCst);
        self.heartbeat.stop();
        if !self.manager.wait_idle(drain_timeout).await {
            warn!(
                "Worker {} 停止时仍有 {} 个任务未结束",
                self.worker.id,
                self.manager.admitted_count().await
            );
        }
        if !already_terminated {
            self.broker.unregister(&self.worker.id).await?;
        }
        info!("Worker {} 已下线", self.worker.id);
        Ok(())
    }
}
