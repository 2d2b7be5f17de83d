//! 计划、作业、任务的状态推进
//!
//! 所有推进都是条件更新，返回0说明其他参与者已经处理过，直接按成功返回。
//! 作业完成由最后一个到达终态的任务判定：只有把待完成计数减到0的那次调用才会继续。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use jobflow_core::constants::{
    DISPATCH_FAIL, DISPATCH_QUEUE_FULL, EMPTY_TASKS, JOB_FAIL, TASK_FAIL,
};
use jobflow_core::{Clock, IdGenerator, IdType, SchedulerError, SchedulerResult};
use jobflow_domain::{
    Dag, JobInfo, JobInstance, JobInstanceRepository, JobStatus, PlanInfo, PlanInstance,
    PlanInstanceRepository, PlanRepository, Task, TaskLauncher, TaskRepository, TaskResult,
    TaskStatus, TriggerType,
};

use crate::dispatch_pool::TaskDispatchHandler;
use crate::task_dispatcher::TaskDispatcher;
use crate::task_factory::TaskFactory;

/// 调度用到的全部仓储
#[derive(Clone)]
pub struct Repositories {
    pub plan: Arc<dyn PlanRepository>,
    pub plan_instance: Arc<dyn PlanInstanceRepository>,
    pub job_instance: Arc<dyn JobInstanceRepository>,
    pub task: Arc<dyn TaskRepository>,
}

impl Repositories {
    /// 同一个存储实现全部仓储接口
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: PlanRepository
            + PlanInstanceRepository
            + JobInstanceRepository
            + TaskRepository
            + 'static,
    {
        Self {
            plan: store.clone(),
            plan_instance: store.clone(),
            job_instance: store.clone(),
            task: store,
        }
    }
}

/// 计划某个版本及其作业DAG
pub struct PlanSnapshot {
    pub info: PlanInfo,
    pub dag: Dag<JobInfo>,
}

impl PlanSnapshot {
    pub fn new(info: PlanInfo) -> SchedulerResult<Self> {
        let dag = info.dag()?;
        Ok(Self { info, dag })
    }

    fn job(&self, job_id: &str) -> SchedulerResult<&JobInfo> {
        self.dag.node(job_id).ok_or_else(|| {
            SchedulerError::InvalidDag(format!(
                "计划 {} 版本 {} 中没有作业 {}",
                self.info.plan_id, self.info.version, job_id
            ))
        })
    }
}

/// 触发时间统一到毫秒，与存储及时间轮的精度一致
pub fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

pub struct ScheduleStrategy {
    repos: Repositories,
    task_factory: Arc<TaskFactory>,
    dispatcher: Arc<TaskDispatcher>,
    launcher: Arc<dyn TaskLauncher>,
    id_generator: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    snapshots: RwLock<HashMap<(String, String), Arc<PlanSnapshot>>>,
}

impl ScheduleStrategy {
    pub fn new(
        repos: Repositories,
        task_factory: Arc<TaskFactory>,
        dispatcher: Arc<TaskDispatcher>,
        launcher: Arc<dyn TaskLauncher>,
        id_generator: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repos,
            task_factory,
            dispatcher,
            launcher,
            id_generator,
            clock,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// 计划版本不可变，按 (plan_id, version) 缓存
    pub async fn load_snapshot(
        &self,
        plan_id: &str,
        version: &str,
    ) -> SchedulerResult<Arc<PlanSnapshot>> {
        let key = (plan_id.to_string(), version.to_string());
        if let Some(snapshot) = self.snapshots.read().await.get(&key) {
            return Ok(Arc::clone(snapshot));
        }

        let info = self
            .repos
            .plan
            .find_info(plan_id, version)
            .await?
            .ok_or_else(|| SchedulerError::PlanInfoNotFound {
                plan_id: plan_id.to_string(),
                version: version.to_string(),
            })?;
        let snapshot = Arc::new(PlanSnapshot::new(info)?);
        self.snapshots
            .write()
            .await
            .insert(key, Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// 生成计划实例并启动根作业。同一 (plan_id, trigger_at, trigger_type) 只会生成一次，重复时返回 None
    #[instrument(skip(self))]
    pub async fn schedule_plan(
        &self,
        plan_id: &str,
        trigger_at: DateTime<Utc>,
        trigger_type: TriggerType,
    ) -> SchedulerResult<Option<PlanInstance>> {
        let trigger_at = truncate_millis(trigger_at);
        let plan = self
            .repos
            .plan
            .find_by_id(plan_id)
            .await?
            .ok_or_else(|| SchedulerError::PlanNotFound {
                id: plan_id.to_string(),
            })?;

        if let Some(existing) = self
            .repos
            .plan_instance
            .find_by_trigger(plan_id, trigger_at, trigger_type)
            .await?
        {
            metrics::counter!("jobflow_duplicate_triggers_total").increment(1);
            debug!("计划 {} 在 {} 已触发过: {}", plan_id, trigger_at, existing.id);
            return Ok(None);
        }

        let snapshot = self
            .load_snapshot(&plan.id, &plan.current_version)
            .await?;
        let instance = PlanInstance::new(
            self.id_generator.generate_id(IdType::PlanInstance),
            &plan,
            trigger_type,
            trigger_at,
        );
        if !self.repos.plan_instance.create_if_absent(&instance).await? {
            metrics::counter!("jobflow_duplicate_triggers_total").increment(1);
            debug!("计划 {} 在 {} 已被其他调度方触发", plan_id, trigger_at);
            return Ok(None);
        }
        metrics::counter!("jobflow_plan_instances_created_total").increment(1);
        info!(
            "创建计划实例 {}: {}, 触发时间: {}, 触发类型: {}",
            instance.id,
            plan.entity_description(),
            trigger_at,
            trigger_type
        );

        let mut finished = false;
        for root in snapshot.dag.roots() {
            let launched = self
                .launch_job_instance(&snapshot, &instance, root, 0, trigger_type, trigger_at)
                .await?;
            finished |= launched.is_some();
        }
        if finished {
            self.propagate(&snapshot, &instance.id).await?;
        }
        Ok(Some(instance))
    }

    /// 手动触发，不经过调度计算器
    pub async fn trigger_plan_manually(&self, plan_id: &str) -> SchedulerResult<Option<PlanInstance>> {
        self.schedule_plan(plan_id, self.clock.now(), TriggerType::Api)
            .await
    }

    /// 创建作业实例及其首阶段任务。
    /// 首阶段没有任务时作业直接成功，返回该实例，由调用方继续推进DAG
    pub async fn launch_job_instance(
        &self,
        snapshot: &PlanSnapshot,
        plan_instance: &PlanInstance,
        job_info: &JobInfo,
        attempt: u32,
        trigger_type: TriggerType,
        trigger_at: DateTime<Utc>,
    ) -> SchedulerResult<Option<JobInstance>> {
        let mut job_instance = job_info.new_instance(
            self.id_generator.generate_id(IdType::JobInstance),
            plan_instance,
            attempt,
            trigger_type,
            trigger_at,
        );
        let tasks = self
            .task_factory
            .create_root_tasks(job_info, &job_instance)
            .await?;
        job_instance.pending_tasks = tasks.len() as i64;

        if !self.repos.job_instance.create_if_absent(&job_instance).await? {
            debug!(
                "作业 {} 第{}次执行已存在，计划实例: {}",
                job_info.id, attempt, plan_instance.id
            );
            return Ok(None);
        }
        debug!(
            "创建{}，计划: {}",
            job_instance.entity_description(),
            snapshot.info.plan_id
        );

        if tasks.is_empty() {
            info!("{} 没有任务({})，直接完成", job_instance.entity_description(), EMPTY_TASKS);
            let now = self.clock.now();
            if self.repos.job_instance.succeed(&job_instance.id, now).await? == 0 {
                return Ok(None);
            }
            job_instance.status = JobStatus::Succeed;
            job_instance.end_at = Some(now);
            return Ok(Some(job_instance));
        }

        self.repos.task.save_all(&tasks).await?;
        self.launcher.launch(tasks).await?;
        Ok(None)
    }

    /// 下发池取出任务后的处理：SCHEDULING -> DISPATCHING -> 交给worker
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn dispatch_task(&self, mut task: Task) -> SchedulerResult<()> {
        if self.repos.task.dispatching(&task.id).await? == 0 {
            debug!("任务 {} 已不在 SCHEDULING 状态，跳过下发", task.id);
            return Ok(());
        }
        task.status = TaskStatus::Dispatching;

        let now = self.clock.now();
        self.repos
            .job_instance
            .executing(&task.job_instance_id, now)
            .await?;
        self.repos
            .plan_instance
            .executing(&task.plan_instance_id, now)
            .await?;

        match self.dispatcher.dispatch(&mut task).await {
            Ok(true) => {
                let worker_id = task.worker_id.clone().unwrap_or_default();
                let affected = self
                    .repos
                    .task
                    .executing(&task.id, &worker_id, task.start_at.unwrap_or(now))
                    .await?;
                if affected == 0 {
                    debug!("任务 {} 在记录下发结果前已被worker上报", task.id);
                }
                Ok(())
            }
            Ok(false) => {
                let reason = task.error_msg.clone().unwrap_or_else(|| DISPATCH_FAIL.to_string());
                self.fail_task(&task.id, TaskStatus::Failed, &reason, None)
                    .await
            }
            Err(e) => {
                warn!("任务 {} 下发异常: {}", task.id, e);
                self.fail_task(&task.id, TaskStatus::Failed, DISPATCH_FAIL, Some(&e.to_string()))
                    .await
            }
        }
    }

    /// worker上报成功
    #[instrument(skip(self, result))]
    pub async fn handle_task_success(&self, task_id: &str, result: TaskResult) -> SchedulerResult<()> {
        let now = self.clock.now();
        if self.repos.task.succeed(task_id, now, &result).await? == 0 {
            return self.ignore_duplicate(task_id).await;
        }
        let task = self.find_task(task_id).await?;
        self.on_task_completed(&task).await
    }

    /// worker上报失败
    #[instrument(skip(self, error_stack_trace))]
    pub async fn handle_task_fail(
        &self,
        task_id: &str,
        error_msg: &str,
        error_stack_trace: Option<&str>,
    ) -> SchedulerResult<()> {
        let error_msg = if error_msg.is_empty() { TASK_FAIL } else { error_msg };
        self.fail_task(task_id, TaskStatus::Failed, error_msg, error_stack_trace)
            .await
    }

    /// 非终态 -> status，成功推进后参与作业完成判定
    pub async fn fail_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error_msg: &str,
        error_stack_trace: Option<&str>,
    ) -> SchedulerResult<()> {
        let now = self.clock.now();
        let affected = self
            .repos
            .task
            .fail(task_id, status, now, error_msg, error_stack_trace)
            .await?;
        if affected == 0 {
            return self.ignore_duplicate(task_id).await;
        }
        warn!("任务 {} 失败: {}", task_id, error_msg);
        let task = self.find_task(task_id).await?;
        self.on_task_completed(&task).await
    }

    async fn find_task(&self, task_id: &str) -> SchedulerResult<Task> {
        self.repos
            .task
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            })
    }

    /// 条件更新未生效：任务已到终态时按空操作处理，任务不存在时报错
    async fn ignore_duplicate(&self, task_id: &str) -> SchedulerResult<()> {
        let task = self.find_task(task_id).await?;
        debug!("任务 {} 已处于 {}，忽略重复上报", task_id, task.status);
        Ok(())
    }

    async fn on_task_completed(&self, task: &Task) -> SchedulerResult<()> {
        let remaining = self
            .repos
            .job_instance
            .complete_stage_task(&task.job_instance_id, task.task_type)
            .await?;
        match remaining {
            Some(0) => {}
            Some(remaining) => {
                debug!(
                    "作业实例 {} 的 {} 阶段还有 {} 个任务未完成",
                    task.job_instance_id, task.task_type, remaining
                );
                return Ok(());
            }
            None => {
                debug!(
                    "作业实例 {} 已不在 {} 阶段",
                    task.job_instance_id, task.task_type
                );
                return Ok(());
            }
        }

        let job_instance = self
            .repos
            .job_instance
            .find_by_id(&task.job_instance_id)
            .await?
            .ok_or_else(|| SchedulerError::JobInstanceNotFound {
                id: task.job_instance_id.clone(),
            })?;
        if job_instance.status.is_completed() {
            return Ok(());
        }

        let siblings = self
            .repos
            .task
            .find_by_job_instance_and_type(&job_instance.id, task.task_type)
            .await?;
        let snapshot = self
            .load_snapshot(&job_instance.plan_id, &job_instance.plan_version)
            .await?;

        match siblings.iter().find(|t| t.status != TaskStatus::Succeed) {
            None => match self.advance_job(&snapshot, &job_instance).await {
                Err(e) if e.is_fatal() => {
                    error!("{} 无法推进: {}", job_instance.entity_description(), e);
                    Err(e)
                }
                other => other,
            },
            Some(failed) => {
                let reason = failed.error_msg.clone().unwrap_or_else(|| JOB_FAIL.to_string());
                self.handle_job_fail(&snapshot, &job_instance, &reason).await
            }
        }
    }

    /// 当前阶段全部成功：生成下一阶段任务，没有下一阶段则作业成功
    async fn advance_job(
        &self,
        snapshot: &PlanSnapshot,
        job_instance: &JobInstance,
    ) -> SchedulerResult<()> {
        let job_info = snapshot.job(&job_instance.job_id)?;
        let mut stage = job_instance.stage;
        loop {
            let Some(next) = TaskFactory::next_task_type(job_instance.job_type, stage)? else {
                return self.handle_job_success(snapshot, job_instance).await;
            };

            let tasks = self
                .task_factory
                .create_tasks(job_info, job_instance, next)
                .await?;
            let advanced = self
                .repos
                .job_instance
                .advance_stage(&job_instance.id, stage, next, tasks.len() as i64)
                .await?;
            if advanced == 0 {
                debug!("{} 已由其他调度方推进", job_instance.entity_description());
                return Ok(());
            }

            if tasks.is_empty() {
                warn!(
                    "{} 的 {} 阶段{}",
                    job_instance.entity_description(),
                    next,
                    EMPTY_TASKS
                );
                stage = next;
                continue;
            }

            info!(
                "{} 进入 {} 阶段，任务数: {}",
                job_instance.entity_description(),
                next,
                tasks.len()
            );
            self.repos.task.save_all(&tasks).await?;
            return self.launcher.launch(tasks).await;
        }
    }

    async fn handle_job_success(
        &self,
        snapshot: &PlanSnapshot,
        job_instance: &JobInstance,
    ) -> SchedulerResult<()> {
        let now = self.clock.now();
        if self.repos.job_instance.succeed(&job_instance.id, now).await? == 0 {
            return Ok(());
        }
        info!("{} 执行成功", job_instance.entity_description());
        self.propagate(snapshot, &job_instance.plan_instance_id)
            .await
    }

    /// 作业失败：有剩余重试次数时重新触发，否则按 terminate_with_fail 终止计划或继续DAG
    async fn handle_job_fail(
        &self,
        snapshot: &PlanSnapshot,
        job_instance: &JobInstance,
        error_msg: &str,
    ) -> SchedulerResult<()> {
        let now = self.clock.now();
        if self
            .repos
            .job_instance
            .fail(&job_instance.id, now, error_msg)
            .await?
            == 0
        {
            return Ok(());
        }
        warn!("{} 执行失败: {}", job_instance.entity_description(), error_msg);

        let job_info = snapshot.job(&job_instance.job_id)?;
        if job_info.retry_option.can_retry(job_instance.attempt) {
            let plan_instance = self.find_plan_instance(&job_instance.plan_instance_id).await?;
            if plan_instance.status.is_completed() {
                return Ok(());
            }
            let trigger_at = truncate_millis(now + job_info.retry_option.retry_interval());
            info!(
                "作业 {} 将在 {} 重试，第{}/{}次",
                job_info.id,
                trigger_at,
                job_instance.attempt + 1,
                job_info.retry_option.retry
            );
            let finished = self
                .launch_job_instance(
                    snapshot,
                    &plan_instance,
                    job_info,
                    job_instance.attempt + 1,
                    TriggerType::Retry,
                    trigger_at,
                )
                .await?;
            if finished.is_some() {
                return self.propagate(snapshot, &plan_instance.id).await;
            }
            return Ok(());
        }

        if job_instance.terminate_with_fail {
            if self
                .repos
                .plan_instance
                .fail(&job_instance.plan_instance_id, now, error_msg)
                .await?
                == 1
            {
                warn!(
                    "计划实例 {} 因作业 {} 失败而终止",
                    job_instance.plan_instance_id, job_instance.job_id
                );
            }
            return Ok(());
        }

        self.propagate(snapshot, &job_instance.plan_instance_id)
            .await
    }

    async fn find_plan_instance(&self, id: &str) -> SchedulerResult<PlanInstance> {
        self.repos
            .plan_instance
            .find_by_id(id)
            .await?
            .ok_or_else(|| SchedulerError::PlanInstanceNotFound { id: id.to_string() })
    }

    /// 启动父作业都已满足的子作业；所有作业都满足时计划实例成功。
    /// 新启动的作业若立即完成，继续下一轮
    async fn propagate(&self, snapshot: &PlanSnapshot, plan_instance_id: &str) -> SchedulerResult<()> {
        loop {
            let plan_instance = self.find_plan_instance(plan_instance_id).await?;
            if plan_instance.status.is_completed() {
                return Ok(());
            }

            let instances = self
                .repos
                .job_instance
                .find_by_plan_instance(plan_instance_id)
                .await?;
            let ready: Vec<JobInfo> = {
                let mut latest: HashMap<&str, &JobInstance> = HashMap::new();
                for instance in &instances {
                    let current = latest.entry(instance.job_id.as_str()).or_insert(instance);
                    if instance.attempt > current.attempt {
                        *current = instance;
                    }
                }
                let satisfied =
                    |job_id: &str| latest.get(job_id).is_some_and(|i| i.is_satisfied());

                if snapshot.dag.nodes().all(|job| satisfied(&job.id)) {
                    let now = self.clock.now();
                    if self.repos.plan_instance.succeed(plan_instance_id, now).await? == 1 {
                        info!("计划实例 {} 执行成功", plan_instance_id);
                    }
                    return Ok(());
                }

                snapshot
                    .dag
                    .nodes()
                    .filter(|job| !latest.contains_key(job.id.as_str()))
                    .filter(|job| snapshot.dag.is_triggerable(&job.id, &satisfied))
                    .cloned()
                    .collect()
            };

            let mut finished = false;
            let trigger_at = truncate_millis(self.clock.now());
            for job in &ready {
                let launched = self
                    .launch_job_instance(
                        snapshot,
                        &plan_instance,
                        job,
                        0,
                        plan_instance.trigger_type,
                        trigger_at,
                    )
                    .await?;
                finished |= launched.is_some();
            }
            if !finished {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl TaskDispatchHandler for ScheduleStrategy {
    async fn dispatch_task(&self, task: Task) {
        let task_id = task.id.clone();
        if let Err(e) = ScheduleStrategy::dispatch_task(self, task).await {
            error!("处理任务 {} 下发失败: {}", task_id, e);
        }
    }

    async fn reject_task(&self, task: Task) {
        if let Err(e) = self
            .fail_task(&task.id, TaskStatus::DispatchFailed, DISPATCH_QUEUE_FULL, None)
            .await
        {
            error!("记录任务 {} 下发拒绝失败: {}", task.id, e);
        }
    }
}
