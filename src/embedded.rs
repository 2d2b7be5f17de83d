//! 嵌入式模式：broker与若干worker运行在同一进程，经进程内传输通信

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use jobflow_core::{
    AppConfig, Clock, SchedulerError, SchedulerResult, StoreType, SystemClock, UuidIdGenerator,
    WorkerConfig,
};
use jobflow_dispatcher::{Broker, Repositories};
use jobflow_domain::{BrokerRpc, Task, Worker, WorkerMetric, WorkerRpc, WorkerRpcFactory};
use jobflow_infrastructure::{InMemoryStore, SqliteStore};
use jobflow_worker::{WorkerService, WorkerServiceBuilder};

use crate::plans_file::load_plan_definitions;

/// 直接调用同进程WorkerService的传输
pub struct LocalWorkerRpc {
    service: Arc<WorkerService>,
}

impl LocalWorkerRpc {
    pub fn new(service: Arc<WorkerService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl WorkerRpc for LocalWorkerRpc {
    fn worker_id(&self) -> &str {
        self.service.worker_id()
    }

    async fn ping(&self) -> SchedulerResult<WorkerMetric> {
        Ok(self.service.metric().await)
    }

    async fn send_task(&self, task: &Task) -> SchedulerResult<bool> {
        self.service.receive_task(task.clone()).await
    }

    async fn unregister(&self) -> SchedulerResult<()> {
        self.service.terminate();
        Ok(())
    }
}

/// 按worker id查找本进程内的WorkerService
#[derive(Default)]
pub struct LocalWorkerRpcFactory {
    services: RwLock<HashMap<String, Arc<WorkerService>>>,
}

impl LocalWorkerRpcFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, service: Arc<WorkerService>) -> SchedulerResult<()> {
        self.services
            .write()
            .map_err(|_| SchedulerError::internal("本地worker表锁已损坏"))?
            .insert(service.worker_id().to_string(), service);
        Ok(())
    }
}

impl WorkerRpcFactory for LocalWorkerRpcFactory {
    fn create(&self, worker: &Worker) -> SchedulerResult<Arc<dyn WorkerRpc>> {
        let services = self
            .services
            .read()
            .map_err(|_| SchedulerError::internal("本地worker表锁已损坏"))?;
        let service = services
            .get(&worker.id)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker.id.clone(),
            })?;
        Ok(Arc::new(LocalWorkerRpc::new(Arc::clone(service))))
    }
}

/// 按配置创建存储
pub async fn create_repositories(config: &AppConfig) -> Result<Repositories> {
    let repos = match config.database.store {
        StoreType::Memory => {
            info!("使用内存存储");
            Repositories::from_store(Arc::new(InMemoryStore::new()))
        }
        StoreType::Sqlite => {
            info!("使用SQLite存储: {}", config.database.url);
            let store = SqliteStore::connect(&config.database.url, config.database.max_connections)
                .await
                .context("连接SQLite数据库失败")?;
            Repositories::from_store(Arc::new(store))
        }
    };
    Ok(repos)
}

pub struct EmbeddedApplication {
    config: AppConfig,
    broker: Arc<Broker>,
    workers: Vec<Arc<WorkerService>>,
}

impl EmbeddedApplication {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let repos = create_repositories(&config).await?;
        Self::with_repositories(config, repos, Arc::new(SystemClock))
    }

    pub fn with_repositories(
        config: AppConfig,
        repos: Repositories,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let factory = Arc::new(LocalWorkerRpcFactory::new());
        let broker = Arc::new(
            Broker::new(
                config.broker.clone(),
                repos,
                factory.clone(),
                Arc::new(UuidIdGenerator),
                clock,
            )
            .context("创建Broker失败")?,
        );

        let mut workers = Vec::new();
        if config.worker.enabled {
            let base_id = config.worker.resolve_worker_id();
            for index in 0..config.embedded.worker_count {
                let worker_config = WorkerConfig {
                    worker_id: format!("{base_id}-{index}"),
                    ..config.worker.clone()
                };
                let broker_rpc: Arc<dyn BrokerRpc> = broker.clone();
                let service = Arc::new(
                    WorkerServiceBuilder::from_config(&worker_config, broker_rpc)?
                        .rpc_address(&format!("local://{}", worker_config.worker_id))
                        .build()?,
                );
                factory.add(Arc::clone(&service))?;
                workers.push(service);
            }
        }

        Ok(Self {
            config,
            broker,
            workers,
        })
    }

    /// 启动broker与所有worker，然后加载配置的计划文件
    pub async fn start(&self, shutdown_tx: &broadcast::Sender<()>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = self
            .broker
            .start(shutdown_tx)
            .await
            .context("启动Broker失败")?;

        for worker in &self.workers {
            handles.push(worker.start(shutdown_tx).await?);
        }
        info!(
            "嵌入式应用已启动，worker数量: {}",
            self.workers.len()
        );

        if let Some(path) = &self.config.embedded.plans_file {
            let saved = self.load_plans(Path::new(path)).await?;
            info!("已从 {} 加载 {} 个计划", path, saved);
        }
        Ok(handles)
    }

    /// 保存文件中的计划并注册调度，返回保存的计划数
    pub async fn load_plans(&self, path: &Path) -> Result<usize> {
        let definitions = load_plan_definitions(path)?;
        let now = Utc::now();
        let mut saved = 0;
        for definition in definitions {
            let id = definition.id.clone();
            let (plan, info) = definition.into_plan(now);
            self.broker
                .plans()
                .save_plan(plan, info)
                .await
                .with_context(|| format!("保存计划 {id} 失败"))?;
            saved += 1;
        }
        Ok(saved)
    }

    /// 等待各worker把手上的任务执行完后下线
    pub async fn stop(&self, drain_timeout: Duration) {
        let stops = self.workers.iter().map(|worker| async move {
            if let Err(e) = worker.stop(drain_timeout).await {
                warn!("Worker {} 下线失败: {}", worker.worker_id(), e);
            }
        });
        join_all(stops).await;
        info!("嵌入式应用已停止");
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn workers(&self) -> &[Arc<WorkerService>] {
        &self.workers
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}
