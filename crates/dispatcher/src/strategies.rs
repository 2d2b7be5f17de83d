use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use rand::Rng;
use tracing::debug;

use jobflow_core::constants::{LB_APPOINT_WORKER_ID, LB_HASH_KEY};
use jobflow_core::{Clock, SchedulerResult};
use jobflow_domain::{LoadBalanceType, Task, Worker};

use crate::statistics::DispatchStatistics;

/// 从候选worker中选出一个，候选集已按执行器与资源要求过滤
#[async_trait]
pub trait WorkerSelectStrategy: Send + Sync {
    async fn select_worker(&self, task: &Task, workers: &[Worker])
        -> SchedulerResult<Option<String>>;

    fn name(&self) -> &str;
}

pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerSelectStrategy for RoundRobinStrategy {
    async fn select_worker(
        &self,
        _task: &Task,
        workers: &[Worker],
    ) -> SchedulerResult<Option<String>> {
        if workers.is_empty() {
            return Ok(None);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % workers.len();
        debug!(
            "轮询策略选择Worker: {} (索引: {}/{})",
            workers[index].id,
            index,
            workers.len()
        );
        Ok(Some(workers[index].id.clone()))
    }

    fn name(&self) -> &str {
        "RoundRobin"
    }
}

pub struct RandomStrategy;

#[async_trait]
impl WorkerSelectStrategy for RandomStrategy {
    async fn select_worker(
        &self,
        _task: &Task,
        workers: &[Worker],
    ) -> SchedulerResult<Option<String>> {
        if workers.is_empty() {
            return Ok(None);
        }
        let index = rand::rng().random_range(0..workers.len());
        Ok(Some(workers[index].id.clone()))
    }

    fn name(&self) -> &str {
        "Random"
    }
}

/// 统计窗口内下发次数最少的worker
pub struct LeastFrequentlyUsedStrategy {
    statistics: Arc<DispatchStatistics>,
    clock: Arc<dyn Clock>,
    window: Duration,
    fallback: RandomStrategy,
}

impl LeastFrequentlyUsedStrategy {
    pub fn new(statistics: Arc<DispatchStatistics>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        let window = if window <= Duration::zero() {
            Duration::minutes(10)
        } else {
            window
        };
        Self {
            statistics,
            clock,
            window,
            fallback: RandomStrategy,
        }
    }
}

#[async_trait]
impl WorkerSelectStrategy for LeastFrequentlyUsedStrategy {
    async fn select_worker(
        &self,
        task: &Task,
        workers: &[Worker],
    ) -> SchedulerResult<Option<String>> {
        let ids: Vec<&str> = workers.iter().map(|w| w.id.as_str()).collect();
        let stats = self
            .statistics
            .statistics(&ids, self.window, self.clock.now())
            .await;

        match stats.iter().min_by_key(|s| s.dispatch_times) {
            Some(least) => {
                debug!(
                    "LFU策略选择Worker: {} (下发次数: {})",
                    least.worker_id, least.dispatch_times
                );
                Ok(Some(least.worker_id.clone()))
            }
            None => self.fallback.select_worker(task, workers).await,
        }
    }

    fn name(&self) -> &str {
        "LeastFrequentlyUsed"
    }
}

/// 最久未被下发的worker，从未下发过的优先
pub struct LeastRecentlyUsedStrategy {
    statistics: Arc<DispatchStatistics>,
    clock: Arc<dyn Clock>,
}

impl LeastRecentlyUsedStrategy {
    pub fn new(statistics: Arc<DispatchStatistics>, clock: Arc<dyn Clock>) -> Self {
        Self { statistics, clock }
    }
}

#[async_trait]
impl WorkerSelectStrategy for LeastRecentlyUsedStrategy {
    async fn select_worker(
        &self,
        _task: &Task,
        workers: &[Worker],
    ) -> SchedulerResult<Option<String>> {
        let ids: Vec<&str> = workers.iter().map(|w| w.id.as_str()).collect();
        let stats = self
            .statistics
            .statistics(&ids, Duration::days(365), self.clock.now())
            .await;

        // None 排在任何时间之前
        Ok(stats
            .into_iter()
            .min_by_key(|s| s.latest_dispatch_at)
            .map(|s| s.worker_id))
    }

    fn name(&self) -> &str {
        "LeastRecentlyUsed"
    }
}

/// 一致性哈希，键取 `worker.lb.hash-key` 参数，缺省为作业id
pub struct ConsistentHashStrategy {
    virtual_nodes: usize,
}

impl ConsistentHashStrategy {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    fn ring<'a>(&self, workers: &'a [Worker]) -> BTreeMap<u64, &'a str> {
        let mut ring = BTreeMap::new();
        for worker in workers {
            for replica in 0..self.virtual_nodes {
                let key = format!("{}#{}", worker.id, replica);
                ring.insert(Self::hash_of(&key), worker.id.as_str());
            }
        }
        ring
    }
}

impl Default for ConsistentHashStrategy {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl WorkerSelectStrategy for ConsistentHashStrategy {
    async fn select_worker(
        &self,
        task: &Task,
        workers: &[Worker],
    ) -> SchedulerResult<Option<String>> {
        let ring = self.ring(workers);
        let hash_key = task
            .lb_parameters()
            .remove(LB_HASH_KEY)
            .unwrap_or_else(|| task.job_id.clone());
        let hash = Self::hash_of(hash_key.as_str());

        Ok(ring
            .range(hash..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, id)| id.to_string()))
    }

    fn name(&self) -> &str {
        "ConsistentHash"
    }
}

/// 指定worker，由 `worker.lb.appoint.worker-id` 参数给出
pub struct AppointStrategy;

#[async_trait]
impl WorkerSelectStrategy for AppointStrategy {
    async fn select_worker(
        &self,
        task: &Task,
        workers: &[Worker],
    ) -> SchedulerResult<Option<String>> {
        let Some(appointed) = task.lb_parameters().remove(LB_APPOINT_WORKER_ID) else {
            debug!("任务 {} 未指定worker", task.id);
            return Ok(None);
        };
        Ok(workers
            .iter()
            .find(|w| w.id == appointed)
            .map(|w| w.id.clone()))
    }

    fn name(&self) -> &str {
        "Appoint"
    }
}

/// 按负载均衡类型取策略实例，轮询计数等状态在实例内共享
pub struct WorkerSelectorFactory {
    strategies: HashMap<LoadBalanceType, Arc<dyn WorkerSelectStrategy>>,
}

impl WorkerSelectorFactory {
    pub fn new(
        statistics: Arc<DispatchStatistics>,
        clock: Arc<dyn Clock>,
        lfu_window: Duration,
    ) -> Self {
        let mut strategies: HashMap<LoadBalanceType, Arc<dyn WorkerSelectStrategy>> =
            HashMap::new();
        strategies.insert(LoadBalanceType::RoundRobin, Arc::new(RoundRobinStrategy::new()));
        strategies.insert(LoadBalanceType::Random, Arc::new(RandomStrategy));
        strategies.insert(
            LoadBalanceType::LeastFrequentlyUsed,
            Arc::new(LeastFrequentlyUsedStrategy::new(
                statistics.clone(),
                clock.clone(),
                lfu_window,
            )),
        );
        strategies.insert(
            LoadBalanceType::LeastRecentlyUsed,
            Arc::new(LeastRecentlyUsedStrategy::new(statistics, clock)),
        );
        strategies.insert(
            LoadBalanceType::ConsistentHash,
            Arc::new(ConsistentHashStrategy::default()),
        );
        strategies.insert(LoadBalanceType::Appoint, Arc::new(AppointStrategy));
        Self { strategies }
    }

    pub fn get(&self, load_balance_type: LoadBalanceType) -> Arc<dyn WorkerSelectStrategy> {
        self.strategies
            .get(&load_balance_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(RoundRobinStrategy::new()))
    }
}
