use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::{Task, TaskLauncher};

use crate::dispatch_pool::DispatchPool;
use crate::meta_task::{MetaTask, MetaTaskScheduler, NextFireTime};

/// 到达触发时间后把任务提交到下发池，只触发一次
pub struct TaskDispatchMetaTask {
    task: Task,
    pool: Arc<DispatchPool>,
    next: NextFireTime,
    stopped: AtomicBool,
}

impl TaskDispatchMetaTask {
    pub fn new(task: Task, pool: Arc<DispatchPool>) -> Self {
        let next = NextFireTime::new(Some(task.trigger_at));
        Self {
            task,
            pool,
            next,
            stopped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MetaTask for TaskDispatchMetaTask {
    fn schedule_id(&self) -> String {
        format!("task-dispatch-{}", self.task.id)
    }

    fn task_kind(&self) -> &'static str {
        "task_dispatch"
    }

    fn schedule_at(&self) -> Option<DateTime<Utc>> {
        self.next.get()
    }

    async fn execute(&self) -> SchedulerResult<()> {
        // 队列满时下发池已通过 reject_task 处理任务
        self.pool.try_submit(self.task.clone()).await
    }

    async fn after_execute(&self, _error: Option<&SchedulerError>) {
        self.next.set(None);
        self.stop();
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// 经由时间轮在任务触发时间把任务交给下发池
pub struct WheelTaskLauncher {
    scheduler: Arc<MetaTaskScheduler>,
    pool: Arc<DispatchPool>,
}

impl WheelTaskLauncher {
    pub fn new(scheduler: Arc<MetaTaskScheduler>, pool: Arc<DispatchPool>) -> Self {
        Self { scheduler, pool }
    }
}

#[async_trait]
impl TaskLauncher for WheelTaskLauncher {
    async fn launch(&self, tasks: Vec<Task>) -> SchedulerResult<()> {
        for task in tasks {
            let task_id = task.id.clone();
            let meta_task = Arc::new(TaskDispatchMetaTask::new(task, Arc::clone(&self.pool)));
            if !self.scheduler.schedule(meta_task).await {
                debug!("任务 {} 已在等待下发，忽略重复启动", task_id);
            }
        }
        Ok(())
    }
}
