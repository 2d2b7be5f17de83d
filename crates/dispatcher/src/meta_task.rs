//! 元任务：注册在时间轮上、执行后自行计算下次触发时间的周期任务

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use jobflow_core::{Clock, SchedulerError, SchedulerResult};

use crate::timer_wheel::HashedWheelTimer;

#[async_trait]
pub trait MetaTask: Send + Sync {
    /// 注册表中的唯一标识
    fn schedule_id(&self) -> String;

    /// 指标标签
    fn task_kind(&self) -> &'static str;

    /// 下次触发时间，None 表示不再触发
    fn schedule_at(&self) -> Option<DateTime<Utc>>;

    async fn execute(&self) -> SchedulerResult<()>;

    /// 无论 execute 是否成功都会调用，负责重新计算 schedule_at
    async fn after_execute(&self, error: Option<&SchedulerError>);

    fn stopped(&self) -> bool;

    fn stop(&self);
}

/// 可原子读写的可选时间点，毫秒精度
pub struct NextFireTime(AtomicI64);

impl NextFireTime {
    const NONE: i64 = i64::MIN;

    pub fn new(at: Option<DateTime<Utc>>) -> Self {
        let fire = Self(AtomicI64::new(Self::NONE));
        fire.set(at);
        fire
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        match self.0.load(Ordering::SeqCst) {
            Self::NONE => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    pub fn set(&self, at: Option<DateTime<Utc>>) {
        let millis = at.map(|t| t.timestamp_millis()).unwrap_or(Self::NONE);
        self.0.store(millis, Ordering::SeqCst);
    }
}

/// 元任务调度器：维护注册表，并把到期的元任务交给 tokio 执行
pub struct MetaTaskScheduler {
    timer: Arc<HashedWheelTimer<Arc<dyn MetaTask>>>,
    registry: RwLock<HashMap<String, Arc<dyn MetaTask>>>,
    clock: Arc<dyn Clock>,
}

impl MetaTaskScheduler {
    pub fn new(tick: std::time::Duration, wheel_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            timer: Arc::new(HashedWheelTimer::new(tick, wheel_size)),
            registry: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn start(self: &Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let scheduler = Arc::downgrade(self);
        self.timer.start(
            move |task| {
                if let Some(scheduler) = scheduler.upgrade() {
                    tokio::spawn(async move { scheduler.fire(task).await });
                }
            },
            shutdown_rx,
        )
    }

    /// 注册并按 schedule_at 挂到时间轮；同一 id 已注册时忽略，返回 false
    pub async fn schedule(&self, task: Arc<dyn MetaTask>) -> bool {
        let id = task.schedule_id();
        {
            let mut registry = self.registry.write().await;
            if registry.contains_key(&id) {
                debug!("元任务已注册，忽略: {}", id);
                return false;
            }
            registry.insert(id.clone(), Arc::clone(&task));
        }

        match task.schedule_at() {
            Some(at) => {
                self.arm(task, at).await;
                true
            }
            None => {
                debug!("元任务 {} 没有触发时间，不注册", id);
                self.registry.write().await.remove(&id);
                false
            }
        }
    }

    /// 停止并移除，已挂在时间轮上的触发会被跳过
    pub async fn unschedule(&self, schedule_id: &str) -> bool {
        match self.registry.write().await.remove(schedule_id) {
            Some(task) => {
                task.stop();
                info!("元任务已停止: {}", schedule_id);
                true
            }
            None => false,
        }
    }

    pub async fn is_scheduled(&self, schedule_id: &str) -> bool {
        self.registry.read().await.contains_key(schedule_id)
    }

    pub async fn registered_count(&self) -> usize {
        self.registry.read().await.len()
    }

    async fn arm(&self, task: Arc<dyn MetaTask>, at: DateTime<Utc>) {
        let delay = (at - self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        self.timer.new_timeout(delay, task).await;
    }

    async fn remove_if_current(&self, task: &Arc<dyn MetaTask>) {
        let id = task.schedule_id();
        let mut registry = self.registry.write().await;
        if registry
            .get(&id)
            .is_some_and(|registered| Arc::ptr_eq(registered, task))
        {
            registry.remove(&id);
        }
    }

    async fn fire(&self, task: Arc<dyn MetaTask>) {
        if task.stopped() {
            self.remove_if_current(&task).await;
            return;
        }

        metrics::counter!("jobflow_meta_task_fired_total", "kind" => task.task_kind()).increment(1);
        let result = task.execute().await;
        if let Err(e) = &result {
            error!("元任务执行失败 id:{} - {}", task.schedule_id(), e);
            metrics::counter!("jobflow_meta_task_errors_total", "kind" => task.task_kind())
                .increment(1);
        }
        task.after_execute(result.as_ref().err()).await;

        if task.stopped() {
            self.remove_if_current(&task).await;
            return;
        }
        match task.schedule_at() {
            Some(at) => self.arm(task, at).await,
            None => self.remove_if_current(&task).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::SystemClock;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    struct CountingTask {
        id: String,
        runs: AtomicUsize,
        max_runs: usize,
        fail: bool,
        next: NextFireTime,
        stopped: AtomicBool,
        errors_seen: AtomicUsize,
    }

    impl CountingTask {
        fn new(id: &str, max_runs: usize, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                runs: AtomicUsize::new(0),
                max_runs,
                fail,
                next: NextFireTime::new(Some(Utc::now())),
                stopped: AtomicBool::new(false),
                errors_seen: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MetaTask for CountingTask {
        fn schedule_id(&self) -> String {
            self.id.clone()
        }

        fn task_kind(&self) -> &'static str {
            "test"
        }

        fn schedule_at(&self) -> Option<DateTime<Utc>> {
            self.next.get()
        }

        async fn execute(&self) -> SchedulerResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SchedulerError::internal("boom"));
            }
            Ok(())
        }

        async fn after_execute(&self, error: Option<&SchedulerError>) {
            if error.is_some() {
                self.errors_seen.fetch_add(1, Ordering::SeqCst);
            }
            if self.runs.load(Ordering::SeqCst) >= self.max_runs {
                self.next.set(None);
            } else {
                self.next
                    .set(Some(Utc::now() + chrono::Duration::milliseconds(10)));
            }
        }

        fn stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn scheduler() -> (Arc<MetaTaskScheduler>, broadcast::Sender<()>) {
        let scheduler = Arc::new(MetaTaskScheduler::new(
            Duration::from_millis(5),
            64,
            Arc::new(SystemClock),
        ));
        let (tx, rx) = broadcast::channel(1);
        scheduler.start(rx);
        (scheduler, tx)
    }

    async fn wait_runs(task: &CountingTask, expected: usize) {
        for _ in 0..200 {
            if task.runs.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_rearms_until_schedule_at_none() {
        let (scheduler, _shutdown) = scheduler();
        let task = CountingTask::new("counting", 3, false);
        assert!(scheduler.schedule(task.clone()).await);
        assert!(!scheduler.schedule(task.clone()).await);

        wait_runs(&task, 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_scheduled("counting").await);
    }

    #[tokio::test]
    async fn test_failing_task_is_still_rearmed() {
        let (scheduler, _shutdown) = scheduler();
        let task = CountingTask::new("failing", 2, true);
        scheduler.schedule(task.clone()).await;

        wait_runs(&task, 2).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 2);
        assert_eq!(task.errors_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unscheduled_task_is_skipped() {
        let (scheduler, _shutdown) = scheduler();
        let task = CountingTask::new("stopped", 100, false);
        task.next
            .set(Some(Utc::now() + chrono::Duration::milliseconds(50)));
        scheduler.schedule(task.clone()).await;
        assert!(scheduler.unschedule("stopped").await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.registered_count().await, 0);
    }

    #[test]
    fn test_next_fire_time_millis() {
        let fire = NextFireTime::new(None);
        assert_eq!(fire.get(), None);
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        fire.set(Some(at));
        assert_eq!(fire.get(), Some(at));
    }
}
