use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobflow_core::SchedulerResult;
use serde::{Deserialize, Serialize};

use crate::dag::{Dag, DagNode};
use crate::value_objects::{
    string_enum, DispatchOption, RetryOption, ScheduleOption, ScheduleType,
};

/// 作业/任务属性
pub type Attributes = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    /// 调度触发
    Schedule,
    /// 手动触发
    Api,
    /// 失败重试触发
    Retry,
}

string_enum!(TriggerType {
    Schedule => "SCHEDULE",
    Api => "API",
    Retry => "RETRY",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Scheduling,
    Executing,
    Succeed,
    Failed,
}

string_enum!(PlanStatus {
    Scheduling => "SCHEDULING",
    Executing => "EXECUTING",
    Succeed => "SUCCEED",
    Failed => "FAILED",
});

impl PlanStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, PlanStatus::Succeed | PlanStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Scheduling,
    Executing,
    Succeed,
    Failed,
}

string_enum!(JobStatus {
    Scheduling => "SCHEDULING",
    Executing => "EXECUTING",
    Succeed => "SUCCEED",
    Failed => "FAILED",
});

impl JobStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobStatus::Succeed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Scheduling,
    Dispatching,
    Executing,
    Succeed,
    Failed,
    DispatchFailed,
}

string_enum!(TaskStatus {
    Scheduling => "SCHEDULING",
    Dispatching => "DISPATCHING",
    Executing => "EXECUTING",
    Succeed => "SUCCEED",
    Failed => "FAILED",
    DispatchFailed => "DISPATCH_FAILED",
});

impl TaskStatus {
    /// 终态不会再被覆盖
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeed | TaskStatus::Failed | TaskStatus::DispatchFailed
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Dispatching | TaskStatus::Executing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Normal,
    Broadcast,
    Map,
    MapReduce,
}

string_enum!(JobType {
    Normal => "NORMAL",
    Broadcast => "BROADCAST",
    Map => "MAP",
    MapReduce => "MAP_REDUCE",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Standalone,
    Broadcast,
    Sharding,
    Map,
    Reduce,
}

string_enum!(TaskType {
    Standalone => "STANDALONE",
    Broadcast => "BROADCAST",
    Sharding => "SHARDING",
    Map => "MAP",
    Reduce => "REDUCE",
});

/// 计划：可复用的执行模板，指向当前生效的版本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub current_version: String,
    pub enabled: bool,
    pub trigger_type: TriggerType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn entity_description(&self) -> String {
        format!("计划 '{}' (ID: {}, 版本: {})", self.name, self.id, self.current_version)
    }
}

/// 计划某个版本的不可变快照：作业DAG与调度配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanInfo {
    pub plan_id: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub schedule_option: ScheduleOption,
    pub jobs: Vec<JobInfo>,
    pub created_at: DateTime<Utc>,
}

impl PlanInfo {
    /// 构建作业DAG，存在环或引用不存在的作业时失败
    pub fn dag(&self) -> SchedulerResult<Dag<JobInfo>> {
        Dag::new(self.jobs.clone())
    }

    /// 版本生效前的完整校验
    pub fn validate(&self) -> SchedulerResult<Dag<JobInfo>> {
        self.schedule_option.validate()?;
        self.dag()
    }

    /// 内容是否一致，不比较创建时间。只能手动触发的版本不比较调度起始时间
    pub fn same_content(&self, other: &PlanInfo) -> bool {
        let both_manual = self.schedule_option.schedule_type == ScheduleType::None
            && other.schedule_option.schedule_type == ScheduleType::None;
        self.plan_id == other.plan_id
            && self.version == other.version
            && self.description == other.description
            && self.jobs == other.jobs
            && (both_manual || self.schedule_option == other.schedule_option)
    }
}

fn default_true() -> bool {
    true
}

/// DAG中的一个作业节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    #[serde(default)]
    pub children_ids: Vec<String>,
    pub executor_name: String,
    pub job_type: JobType,
    #[serde(default)]
    pub dispatch_option: DispatchOption,
    #[serde(default)]
    pub retry_option: RetryOption,
    /// 失败时是否终止整个计划实例
    #[serde(default = "default_true")]
    pub terminate_with_fail: bool,
    #[serde(default)]
    pub attributes: Attributes,
}

impl DagNode for JobInfo {
    fn id(&self) -> &str {
        &self.id
    }

    fn parent_ids(&self) -> &[String] {
        &self.parent_ids
    }

    fn children_ids(&self) -> &[String] {
        &self.children_ids
    }
}

impl JobInfo {
    /// 生成此作业在某个计划实例中的一次执行
    pub fn new_instance(
        &self,
        id: String,
        plan_instance: &PlanInstance,
        attempt: u32,
        trigger_type: TriggerType,
        trigger_at: DateTime<Utc>,
    ) -> JobInstance {
        JobInstance {
            id,
            plan_id: plan_instance.plan_id.clone(),
            plan_version: plan_instance.plan_version.clone(),
            plan_instance_id: plan_instance.id.clone(),
            job_id: self.id.clone(),
            job_type: self.job_type,
            status: JobStatus::Scheduling,
            stage: first_stage(self.job_type),
            pending_tasks: 0,
            attempt,
            trigger_type,
            trigger_at,
            start_at: None,
            end_at: None,
            attributes: self.attributes.clone(),
            terminate_with_fail: self.terminate_with_fail,
            error_msg: None,
        }
    }
}

/// 作业类型对应的第一个任务阶段
pub fn first_stage(job_type: JobType) -> TaskType {
    match job_type {
        JobType::Normal => TaskType::Standalone,
        JobType::Broadcast => TaskType::Broadcast,
        JobType::Map | JobType::MapReduce => TaskType::Sharding,
    }
}

/// 计划的一次运行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanInstance {
    pub id: String,
    pub plan_id: String,
    pub plan_version: String,
    pub status: PlanStatus,
    pub trigger_type: TriggerType,
    pub trigger_at: DateTime<Utc>,
    pub start_at: Option<DateTime<Utc>>,
    /// 运行结束（成功或失败）的时间，固定延迟调度依赖它计算下次触发
    pub feedback_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
}

impl PlanInstance {
    pub fn new(
        id: String,
        plan: &Plan,
        trigger_type: TriggerType,
        trigger_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            plan_id: plan.id.clone(),
            plan_version: plan.current_version.clone(),
            status: PlanStatus::Scheduling,
            trigger_type,
            trigger_at,
            start_at: None,
            feedback_at: None,
            error_msg: None,
        }
    }
}

/// 作业在计划实例中的一次执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: String,
    pub plan_id: String,
    pub plan_version: String,
    pub plan_instance_id: String,
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    /// 当前执行中的任务阶段
    pub stage: TaskType,
    /// 当前阶段尚未到达终态的任务数
    pub pending_tasks: i64,
    /// 第几次执行，0为首次
    pub attempt: u32,
    pub trigger_type: TriggerType,
    pub trigger_at: DateTime<Utc>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub attributes: Attributes,
    pub terminate_with_fail: bool,
    pub error_msg: Option<String>,
}

impl JobInstance {
    /// 下游作业可以继续：成功，或失败但不终止计划
    pub fn is_satisfied(&self) -> bool {
        match self.status {
            JobStatus::Succeed => true,
            JobStatus::Failed => !self.terminate_with_fail,
            _ => false,
        }
    }

    pub fn entity_description(&self) -> String {
        format!(
            "作业实例 {} (作业: {}, 第{}次执行)",
            self.id, self.job_id, self.attempt
        )
    }
}

/// 任务执行结果。分片任务通过 sub_task_attributes 返回每个分片的属性
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskResult {
    pub result_attributes: Attributes,
    pub sub_task_attributes: Vec<Attributes>,
}

impl TaskResult {
    pub fn with_attributes(result_attributes: Attributes) -> Self {
        Self {
            result_attributes,
            sub_task_attributes: Vec::new(),
        }
    }

    pub fn with_sub_tasks(sub_task_attributes: Vec<Attributes>) -> Self {
        Self {
            result_attributes: Attributes::new(),
            sub_task_attributes,
        }
    }
}

/// 远程执行单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub plan_id: String,
    pub plan_version: String,
    pub plan_instance_id: String,
    pub job_id: String,
    pub job_instance_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub executor_name: String,
    pub dispatch_option: DispatchOption,
    /// 预先指定或下发成功后记录的worker
    pub worker_id: Option<String>,
    pub trigger_at: DateTime<Utc>,
    pub job_attributes: Attributes,
    /// MAP任务对应的分片属性
    pub map_attributes: Option<Attributes>,
    /// REDUCE任务汇总的MAP结果
    pub reduce_attributes: Vec<Attributes>,
    pub result: Option<TaskResult>,
    pub error_msg: Option<String>,
    pub error_stack_trace: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (类型: {}, 作业实例: {})",
            self.id, self.task_type, self.job_instance_id
        )
    }

    /// 作业属性中以 `worker.lb.` 开头的字符串参数
    pub fn lb_parameters(&self) -> HashMap<String, String> {
        self.job_attributes
            .iter()
            .filter(|(key, _)| key.starts_with(jobflow_core::constants::LB_PARAM_PREFIX))
            .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
            .collect()
    }
}
