//! 内存存储，适用于嵌入式部署与测试。
//!
//! 每个条件更新都在同一把写锁内完成“检查旧状态 + 写入新状态”，与数据库的
//! `update ... where status = ?` 语义一致。

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobflow_core::SchedulerResult;
use jobflow_domain::{
    JobInstance, JobInstanceRepository, JobStatus, Plan, PlanInfo, PlanInstance,
    PlanInstanceRepository, PlanRepository, PlanStatus, Task, TaskRepository, TaskResult,
    TaskStatus, TaskType, TriggerType,
};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct StoreState {
    plans: HashMap<String, Plan>,
    plan_infos: HashMap<(String, String), PlanInfo>,
    plan_instances: HashMap<String, PlanInstance>,
    /// (plan_id, trigger_at, trigger_type) -> plan_instance_id
    plan_instance_keys: HashMap<(String, DateTime<Utc>, TriggerType), String>,
    job_instances: HashMap<String, JobInstance>,
    /// (plan_instance_id, job_id, attempt) -> job_instance_id
    job_instance_keys: HashMap<(String, String, u32), String>,
    tasks: HashMap<String, Task>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 测试辅助：所有任务
    pub async fn all_tasks(&self) -> Vec<Task> {
        self.state.read().await.tasks.values().cloned().collect()
    }
}

#[async_trait]
impl PlanRepository for InMemoryStore {
    async fn save(&self, plan: &Plan) -> SchedulerResult<()> {
        let mut state = self.state.write().await;
        state.plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn find_by_id(&self, plan_id: &str) -> SchedulerResult<Option<Plan>> {
        Ok(self.state.read().await.plans.get(plan_id).cloned())
    }

    async fn find_enabled(&self) -> SchedulerResult<Vec<Plan>> {
        let state = self.state.read().await;
        let mut plans: Vec<Plan> = state.plans.values().filter(|p| p.enabled).cloned().collect();
        plans.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plans)
    }

    async fn save_info(&self, info: &PlanInfo) -> SchedulerResult<bool> {
        let mut state = self.state.write().await;
        match state
            .plan_infos
            .entry((info.plan_id.clone(), info.version.clone()))
        {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(info.clone());
                Ok(true)
            }
        }
    }

    async fn find_info(&self, plan_id: &str, version: &str) -> SchedulerResult<Option<PlanInfo>> {
        let state = self.state.read().await;
        Ok(state
            .plan_infos
            .get(&(plan_id.to_string(), version.to_string()))
            .cloned())
    }

    async fn update_version(
        &self,
        plan_id: &str,
        old_version: &str,
        new_version: &str,
    ) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        match state.plans.get_mut(plan_id) {
            Some(plan) if plan.current_version == old_version => {
                plan.current_version = new_version.to_string();
                plan.updated_at = Utc::now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn update_enabled(&self, plan_id: &str, enabled: bool) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        match state.plans.get_mut(plan_id) {
            Some(plan) if plan.enabled != enabled => {
                plan.enabled = enabled;
                plan.updated_at = Utc::now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

fn plan_transition(
    instance: Option<&mut PlanInstance>,
    expected: &[PlanStatus],
    apply: impl FnOnce(&mut PlanInstance),
) -> u64 {
    match instance {
        Some(instance) if expected.contains(&instance.status) => {
            apply(instance);
            1
        }
        _ => 0,
    }
}

#[async_trait]
impl PlanInstanceRepository for InMemoryStore {
    async fn create_if_absent(&self, instance: &PlanInstance) -> SchedulerResult<bool> {
        let mut state = self.state.write().await;
        let key = (
            instance.plan_id.clone(),
            instance.trigger_at,
            instance.trigger_type,
        );
        if state.plan_instance_keys.contains_key(&key) {
            debug!("计划实例已存在: {:?}", key);
            return Ok(false);
        }
        state.plan_instance_keys.insert(key, instance.id.clone());
        state
            .plan_instances
            .insert(instance.id.clone(), instance.clone());
        Ok(true)
    }

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<PlanInstance>> {
        Ok(self.state.read().await.plan_instances.get(id).cloned())
    }

    async fn find_by_trigger(
        &self,
        plan_id: &str,
        trigger_at: DateTime<Utc>,
        trigger_type: TriggerType,
    ) -> SchedulerResult<Option<PlanInstance>> {
        let state = self.state.read().await;
        Ok(state
            .plan_instance_keys
            .get(&(plan_id.to_string(), trigger_at, trigger_type))
            .and_then(|id| state.plan_instances.get(id))
            .cloned())
    }

    async fn find_latest(&self, plan_id: &str) -> SchedulerResult<Option<PlanInstance>> {
        let state = self.state.read().await;
        Ok(state
            .plan_instances
            .values()
            .filter(|i| i.plan_id == plan_id)
            .max_by_key(|i| i.trigger_at)
            .cloned())
    }

    async fn find_by_plan(&self, plan_id: &str) -> SchedulerResult<Vec<PlanInstance>> {
        let state = self.state.read().await;
        let mut instances: Vec<PlanInstance> = state
            .plan_instances
            .values()
            .filter(|i| i.plan_id == plan_id)
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.trigger_at);
        Ok(instances)
    }

    async fn executing(&self, id: &str, start_at: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        Ok(plan_transition(
            state.plan_instances.get_mut(id),
            &[PlanStatus::Scheduling],
            |i| {
                i.status = PlanStatus::Executing;
                i.start_at = Some(start_at);
            },
        ))
    }

    async fn succeed(&self, id: &str, feedback_at: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        Ok(plan_transition(
            state.plan_instances.get_mut(id),
            &[PlanStatus::Scheduling, PlanStatus::Executing],
            |i| {
                i.status = PlanStatus::Succeed;
                i.feedback_at = Some(feedback_at);
            },
        ))
    }

    async fn fail(
        &self,
        id: &str,
        feedback_at: DateTime<Utc>,
        error_msg: &str,
    ) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        Ok(plan_transition(
            state.plan_instances.get_mut(id),
            &[PlanStatus::Scheduling, PlanStatus::Executing],
            |i| {
                i.status = PlanStatus::Failed;
                i.feedback_at = Some(feedback_at);
                i.error_msg = Some(error_msg.to_string());
            },
        ))
    }
}

fn job_transition(
    instance: Option<&mut JobInstance>,
    expected: &[JobStatus],
    apply: impl FnOnce(&mut JobInstance),
) -> u64 {
    match instance {
        Some(instance) if expected.contains(&instance.status) => {
            apply(instance);
            1
        }
        _ => 0,
    }
}

#[async_trait]
impl JobInstanceRepository for InMemoryStore {
    async fn create_if_absent(&self, instance: &JobInstance) -> SchedulerResult<bool> {
        let mut state = self.state.write().await;
        let key = (
            instance.plan_instance_id.clone(),
            instance.job_id.clone(),
            instance.attempt,
        );
        if state.job_instance_keys.contains_key(&key) {
            debug!("作业实例已存在: {:?}", key);
            return Ok(false);
        }
        state.job_instance_keys.insert(key, instance.id.clone());
        state
            .job_instances
            .insert(instance.id.clone(), instance.clone());
        Ok(true)
    }

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<JobInstance>> {
        Ok(self.state.read().await.job_instances.get(id).cloned())
    }

    async fn find_by_plan_instance(
        &self,
        plan_instance_id: &str,
    ) -> SchedulerResult<Vec<JobInstance>> {
        let state = self.state.read().await;
        let mut instances: Vec<JobInstance> = state
            .job_instances
            .values()
            .filter(|i| i.plan_instance_id == plan_instance_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| (&a.job_id, a.attempt).cmp(&(&b.job_id, b.attempt)));
        Ok(instances)
    }

    async fn executing(&self, id: &str, start_at: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        Ok(job_transition(
            state.job_instances.get_mut(id),
            &[JobStatus::Scheduling],
            |i| {
                i.status = JobStatus::Executing;
                i.start_at = Some(start_at);
            },
        ))
    }

    async fn advance_stage(
        &self,
        id: &str,
        from: TaskType,
        to: TaskType,
        pending_tasks: i64,
    ) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        match state.job_instances.get_mut(id) {
            Some(instance) if instance.stage == from && !instance.status.is_completed() => {
                instance.stage = to;
                instance.pending_tasks = pending_tasks;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn complete_stage_task(
        &self,
        id: &str,
        stage: TaskType,
    ) -> SchedulerResult<Option<i64>> {
        let mut state = self.state.write().await;
        match state.job_instances.get_mut(id) {
            Some(instance) if instance.stage == stage => {
                instance.pending_tasks -= 1;
                Ok(Some(instance.pending_tasks))
            }
            _ => Ok(None),
        }
    }

    async fn succeed(&self, id: &str, end_at: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        Ok(job_transition(
            state.job_instances.get_mut(id),
            &[JobStatus::Scheduling, JobStatus::Executing],
            |i| {
                i.status = JobStatus::Succeed;
                i.end_at = Some(end_at);
            },
        ))
    }

    async fn fail(&self, id: &str, end_at: DateTime<Utc>, error_msg: &str) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        Ok(job_transition(
            state.job_instances.get_mut(id),
            &[JobStatus::Scheduling, JobStatus::Executing],
            |i| {
                i.status = JobStatus::Failed;
                i.end_at = Some(end_at);
                i.error_msg = Some(error_msg.to_string());
            },
        ))
    }
}

fn task_transition(
    task: Option<&mut Task>,
    expected: &[TaskStatus],
    apply: impl FnOnce(&mut Task),
) -> u64 {
    match task {
        Some(task) if expected.contains(&task.status) => {
            apply(task);
            1
        }
        _ => 0,
    }
}

#[async_trait]
impl TaskRepository for InMemoryStore {
    async fn save_all(&self, tasks: &[Task]) -> SchedulerResult<()> {
        let mut state = self.state.write().await;
        for task in tasks {
            state.tasks.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        Ok(self.state.read().await.tasks.get(id).cloned())
    }

    async fn find_by_job_instance(&self, job_instance_id: &str) -> SchedulerResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.job_instance_id == job_instance_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn find_by_job_instance_and_type(
        &self,
        job_instance_id: &str,
        task_type: TaskType,
    ) -> SchedulerResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.job_instance_id == job_instance_id && t.task_type == task_type)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn dispatching(&self, id: &str) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        Ok(task_transition(
            state.tasks.get_mut(id),
            &[TaskStatus::Scheduling],
            |t| t.status = TaskStatus::Dispatching,
        ))
    }

    async fn executing(
        &self,
        id: &str,
        worker_id: &str,
        start_at: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        Ok(task_transition(
            state.tasks.get_mut(id),
            &[TaskStatus::Dispatching],
            |t| {
                t.status = TaskStatus::Executing;
                t.worker_id = Some(worker_id.to_string());
                t.start_at = Some(start_at);
            },
        ))
    }

    async fn succeed(
        &self,
        id: &str,
        end_at: DateTime<Utc>,
        result: &TaskResult,
    ) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        Ok(task_transition(
            state.tasks.get_mut(id),
            &[TaskStatus::Dispatching, TaskStatus::Executing],
            |t| {
                t.status = TaskStatus::Succeed;
                t.end_at = Some(end_at);
                t.result = Some(result.clone());
            },
        ))
    }

    async fn fail(
        &self,
        id: &str,
        status: TaskStatus,
        end_at: DateTime<Utc>,
        error_msg: &str,
        error_stack_trace: Option<&str>,
    ) -> SchedulerResult<u64> {
        let mut state = self.state.write().await;
        Ok(task_transition(
            state.tasks.get_mut(id),
            &[
                TaskStatus::Scheduling,
                TaskStatus::Dispatching,
                TaskStatus::Executing,
            ],
            |t| {
                t.status = status;
                t.end_at = Some(end_at);
                t.error_msg = Some(error_msg.to_string());
                t.error_stack_trace = error_stack_trace.map(str::to_string);
            },
        ))
    }
}
