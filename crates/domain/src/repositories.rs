//! 持久化接口
//!
//! 所有状态推进都是条件更新：`update ... where id = ? and status in (期望的旧状态)`，
//! 返回受影响行数。返回0表示其他参与者已经推进了该实体，调用方按成功的空操作处理。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobflow_core::SchedulerResult;

use crate::entities::{
    JobInstance, Plan, PlanInfo, PlanInstance, Task, TaskResult, TaskStatus, TaskType, TriggerType,
};

#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn save(&self, plan: &Plan) -> SchedulerResult<()>;

    async fn find_by_id(&self, plan_id: &str) -> SchedulerResult<Option<Plan>>;

    async fn find_enabled(&self) -> SchedulerResult<Vec<Plan>>;

    /// 保存一个不可变的计划版本，版本已存在时不覆盖并返回 false
    async fn save_info(&self, info: &PlanInfo) -> SchedulerResult<bool>;

    async fn find_info(&self, plan_id: &str, version: &str) -> SchedulerResult<Option<PlanInfo>>;

    /// 切换当前版本，仅当当前版本仍为 old_version 时成功
    async fn update_version(
        &self,
        plan_id: &str,
        old_version: &str,
        new_version: &str,
    ) -> SchedulerResult<u64>;

    async fn update_enabled(&self, plan_id: &str, enabled: bool) -> SchedulerResult<u64>;
}

#[async_trait]
pub trait PlanInstanceRepository: Send + Sync {
    /// 按 (plan_id, trigger_at, trigger_type) 唯一插入，已存在时返回 false
    async fn create_if_absent(&self, instance: &PlanInstance) -> SchedulerResult<bool>;

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<PlanInstance>>;

    async fn find_by_trigger(
        &self,
        plan_id: &str,
        trigger_at: DateTime<Utc>,
        trigger_type: TriggerType,
    ) -> SchedulerResult<Option<PlanInstance>>;

    /// 最近一次触发的实例
    async fn find_latest(&self, plan_id: &str) -> SchedulerResult<Option<PlanInstance>>;

    async fn find_by_plan(&self, plan_id: &str) -> SchedulerResult<Vec<PlanInstance>>;

    /// SCHEDULING -> EXECUTING
    async fn executing(&self, id: &str, start_at: DateTime<Utc>) -> SchedulerResult<u64>;

    /// SCHEDULING|EXECUTING -> SUCCEED
    async fn succeed(&self, id: &str, feedback_at: DateTime<Utc>) -> SchedulerResult<u64>;

    /// SCHEDULING|EXECUTING -> FAILED
    async fn fail(
        &self,
        id: &str,
        feedback_at: DateTime<Utc>,
        error_msg: &str,
    ) -> SchedulerResult<u64>;
}

#[async_trait]
pub trait JobInstanceRepository: Send + Sync {
    /// 按 (plan_instance_id, job_id, attempt) 唯一插入，已存在时返回 false
    async fn create_if_absent(&self, instance: &JobInstance) -> SchedulerResult<bool>;

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<JobInstance>>;

    async fn find_by_plan_instance(&self, plan_instance_id: &str)
        -> SchedulerResult<Vec<JobInstance>>;

    /// SCHEDULING -> EXECUTING
    async fn executing(&self, id: &str, start_at: DateTime<Utc>) -> SchedulerResult<u64>;

    /// 阶段推进：仅当处于 from 阶段且未完成时，切到 to 阶段并重置待完成任务数
    async fn advance_stage(
        &self,
        id: &str,
        from: TaskType,
        to: TaskType,
        pending_tasks: i64,
    ) -> SchedulerResult<u64>;

    /// 原子递减 stage 阶段的待完成任务数，返回递减后的值；阶段不匹配时返回 None
    async fn complete_stage_task(&self, id: &str, stage: TaskType) -> SchedulerResult<Option<i64>>;

    /// SCHEDULING|EXECUTING -> SUCCEED
    async fn succeed(&self, id: &str, end_at: DateTime<Utc>) -> SchedulerResult<u64>;

    /// SCHEDULING|EXECUTING -> FAILED
    async fn fail(&self, id: &str, end_at: DateTime<Utc>, error_msg: &str) -> SchedulerResult<u64>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn save_all(&self, tasks: &[Task]) -> SchedulerResult<()>;

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Task>>;

    async fn find_by_job_instance(&self, job_instance_id: &str) -> SchedulerResult<Vec<Task>>;

    async fn find_by_job_instance_and_type(
        &self,
        job_instance_id: &str,
        task_type: TaskType,
    ) -> SchedulerResult<Vec<Task>>;

    /// SCHEDULING -> DISPATCHING
    async fn dispatching(&self, id: &str) -> SchedulerResult<u64>;

    /// DISPATCHING -> EXECUTING，记录接收的worker
    async fn executing(
        &self,
        id: &str,
        worker_id: &str,
        start_at: DateTime<Utc>,
    ) -> SchedulerResult<u64>;

    /// DISPATCHING|EXECUTING -> SUCCEED
    async fn succeed(
        &self,
        id: &str,
        end_at: DateTime<Utc>,
        result: &TaskResult,
    ) -> SchedulerResult<u64>;

    /// 非终态 -> status（FAILED 或 DISPATCH_FAILED）
    async fn fail(
        &self,
        id: &str,
        status: TaskStatus,
        end_at: DateTime<Utc>,
        error_msg: &str,
        error_stack_trace: Option<&str>,
    ) -> SchedulerResult<u64>;
}
