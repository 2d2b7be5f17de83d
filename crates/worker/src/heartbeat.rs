use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::{BrokerRpc, Worker, WorkerMetric};

use crate::execution_manager::TaskExecutionManager;

/// 内存指标无法获取时上报的默认值
const DEFAULT_AVAILABLE_RAM: u64 = 8 * 1024 * 1024 * 1024;

/// 周期向broker上报资源指标；broker不认识本worker时重新注册
pub struct HeartbeatManager {
    worker: Worker,
    broker: Arc<dyn BrokerRpc>,
    manager: Arc<TaskExecutionManager>,
    interval: Duration,
    stop: Notify,
}

impl HeartbeatManager {
    pub fn new(
        worker: Worker,
        broker: Arc<dyn BrokerRpc>,
        manager: Arc<TaskExecutionManager>,
        interval: Duration,
    ) -> Self {
        Self {
            worker,
            broker,
            manager,
            interval,
            stop: Notify::new(),
        }
    }

    /// 停止心跳循环，不再向broker注册
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    pub async fn collect_metric(&self) -> WorkerMetric {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let executing = self.manager.executing_count();
        WorkerMetric {
            available_cpu: cpus.saturating_sub(executing) as f32,
            available_ram: DEFAULT_AVAILABLE_RAM,
            available_queue_limit: self.manager.available_slots().await as u32,
            executing_tasks: executing as u32,
        }
    }

    /// 发送一次心跳
    pub async fn beat(&self) -> SchedulerResult<()> {
        let metric = self.collect_metric().await;
        match self.broker.heartbeat(&self.worker.id, &metric).await {
            Err(SchedulerError::WorkerNotFound { .. }) => {
                info!("Broker未找到Worker {}，重新注册", self.worker.id);
                let worker = Worker {
                    metric,
                    ..self.worker.clone()
                };
                self.broker.register(&worker).await
            }
            other => other,
        }
    }

    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 注册时已上报过指标，跳过立即触发的第一次
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.beat().await {
                            Ok(()) => debug!("Worker {} 心跳已发送", self.worker.id),
                            Err(e) => warn!("Worker {} 心跳失败: {}", self.worker.id, e),
                        }
                    }
                    _ = self.stop.notified() => {
                        info!("Worker {} 已下线，心跳停止", self.worker.id);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Worker {} 心跳停止", self.worker.id);
                        break;
                    }
                }
            }
        })
    }
}
