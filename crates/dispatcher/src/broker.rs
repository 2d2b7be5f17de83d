//! Broker组装：时间轮、下发池、worker注册表与状态推进

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use jobflow_core::{BrokerConfig, Clock, IdGenerator, SchedulerResult};
use jobflow_domain::{BrokerRpc, TaskResult, Worker, WorkerMetric, WorkerRpcFactory};

use crate::calculator::ScheduleCalculatorFactory;
use crate::dispatch_pool::{DispatchPool, TaskDispatchHandler};
use crate::meta_task::MetaTaskScheduler;
use crate::plan_manager::PlanManager;
use crate::schedule_strategy::{Repositories, ScheduleStrategy};
use crate::statistics::DispatchStatistics;
use crate::strategies::WorkerSelectorFactory;
use crate::task_dispatcher::TaskDispatcher;
use crate::task_factory::TaskFactory;
use crate::task_launcher::WheelTaskLauncher;
use crate::worker_registry::{WorkerHeartbeatCheckMetaTask, WorkerRegistry};

pub struct Broker {
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
    repos: Repositories,
    registry: Arc<WorkerRegistry>,
    statistics: Arc<DispatchStatistics>,
    pool: Arc<DispatchPool>,
    scheduler: Arc<MetaTaskScheduler>,
    strategy: Arc<ScheduleStrategy>,
    plans: Arc<PlanManager>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        repos: Repositories,
        rpc_factory: Arc<dyn WorkerRpcFactory>,
        id_generator: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> SchedulerResult<Self> {
        let lfu_window = Duration::seconds(config.lfu_interval_seconds);
        let registry = Arc::new(WorkerRegistry::new(
            rpc_factory,
            Arc::clone(&clock),
            config.heartbeat_timeout(),
        ));
        let statistics = Arc::new(DispatchStatistics::new(lfu_window));
        let selectors = Arc::new(WorkerSelectorFactory::new(
            Arc::clone(&statistics),
            Arc::clone(&clock),
            lfu_window,
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&registry),
            selectors,
            Arc::clone(&statistics),
            Arc::clone(&clock),
            config.dispatch_max_attempts,
        ));

        let scheduler = Arc::new(MetaTaskScheduler::new(
            config.timer_tick(),
            config.timer_wheel_size,
            Arc::clone(&clock),
        ));
        let pool = Arc::new(DispatchPool::new(
            config.dispatch_concurrency,
            config.dispatch_queue_size,
        ));
        let launcher = Arc::new(WheelTaskLauncher::new(
            Arc::clone(&scheduler),
            Arc::clone(&pool),
        ));
        let task_factory = Arc::new(TaskFactory::new(
            Arc::clone(&repos.task),
            Arc::clone(&registry),
            Arc::clone(&id_generator),
        ));

        let strategy = Arc::new(ScheduleStrategy::new(
            repos.clone(),
            task_factory,
            dispatcher,
            launcher,
            id_generator,
            Arc::clone(&clock),
        ));
        let handler: Arc<dyn TaskDispatchHandler> = strategy.clone();
        pool.bind_handler(Arc::downgrade(&handler))?;

        let plans = Arc::new(PlanManager::new(
            repos.clone(),
            Arc::clone(&strategy),
            Arc::clone(&scheduler),
            Arc::new(ScheduleCalculatorFactory::new()),
            Arc::clone(&clock),
            config.feedback_recheck(),
        ));

        Ok(Self {
            config,
            clock,
            repos,
            registry,
            statistics,
            pool,
            scheduler,
            strategy,
            plans,
        })
    }

    /// 启动时间轮、下发池与心跳检测，并注册所有已启用计划的调度
    pub async fn start(&self, shutdown_tx: &broadcast::Sender<()>) -> SchedulerResult<Vec<JoinHandle<()>>> {
        let mut handles = vec![self.scheduler.start(shutdown_tx.subscribe())];
        handles.extend(self.pool.start(shutdown_tx));

        let heartbeat_check = WorkerHeartbeatCheckMetaTask::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
            Duration::seconds(self.config.heartbeat_check_interval_seconds as i64),
        );
        self.scheduler.schedule(Arc::new(heartbeat_check)).await;

        let plans = self.plans.start().await?;
        info!("Broker已启动，调度中的计划: {}", plans);
        Ok(handles)
    }

    pub fn plans(&self) -> &Arc<PlanManager> {
        &self.plans
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn strategy(&self) -> &Arc<ScheduleStrategy> {
        &self.strategy
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn queued_tasks(&self) -> usize {
        self.pool.queued()
    }
}

/// worker发往broker的请求
#[async_trait]
impl BrokerRpc for Broker {
    async fn register(&self, worker: &Worker) -> SchedulerResult<()> {
        self.registry.register(worker.clone()).await
    }

    async fn heartbeat(&self, worker_id: &str, metric: &WorkerMetric) -> SchedulerResult<()> {
        self.registry.heartbeat(worker_id, metric.clone()).await
    }

    async fn unregister(&self, worker_id: &str) -> SchedulerResult<()> {
        if self.registry.unregister(worker_id).await {
            self.statistics.remove_worker(worker_id).await;
        }
        Ok(())
    }

    async fn report_task_success(&self, task_id: &str, result: TaskResult) -> SchedulerResult<()> {
        self.strategy.handle_task_success(task_id, result).await
    }

    async fn report_task_fail(
        &self,
        task_id: &str,
        error_msg: &str,
        error_stack_trace: Option<&str>,
    ) -> SchedulerResult<()> {
        self.strategy
            .handle_task_fail(task_id, error_msg, error_stack_trace)
            .await
    }
}
