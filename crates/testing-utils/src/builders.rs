//! 测试实体构造器，默认值可直接使用，按需覆盖

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use jobflow_domain::{
    Attributes, DispatchOption, JobInfo, JobType, LoadBalanceType, Plan, PlanInfo, RetryOption,
    ScheduleOption, Task, TaskStatus, TaskType, TriggerType, Worker, WorkerMetric, WorkerStatus,
};

use crate::helpers::TestEnv;

pub struct JobInfoBuilder {
    job: JobInfo,
}

impl JobInfoBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            job: JobInfo {
                id: id.to_string(),
                description: String::new(),
                parent_ids: vec![],
                children_ids: vec![],
                executor_name: "echo".to_string(),
                job_type: JobType::Normal,
                dispatch_option: DispatchOption::default(),
                retry_option: RetryOption::default(),
                terminate_with_fail: true,
                attributes: HashMap::new(),
            },
        }
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job.job_type = job_type;
        self
    }

    pub fn with_executor(mut self, executor_name: &str) -> Self {
        self.job.executor_name = executor_name.to_string();
        self
    }

    pub fn with_parents(mut self, parent_ids: &[&str]) -> Self {
        self.job.parent_ids = parent_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_children(mut self, children_ids: &[&str]) -> Self {
        self.job.children_ids = children_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_retry(mut self, retry: u32, interval: Duration) -> Self {
        self.job.retry_option = RetryOption::new(retry, interval);
        self
    }

    pub fn with_load_balance(mut self, load_balance_type: LoadBalanceType) -> Self {
        self.job.dispatch_option.load_balance_type = load_balance_type;
        self
    }

    pub fn continue_on_fail(mut self) -> Self {
        self.job.terminate_with_fail = false;
        self
    }

    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.job.attributes.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> JobInfo {
        self.job
    }
}

/// 同时构造计划与其当前版本
pub struct PlanInfoBuilder {
    plan: Plan,
    info: PlanInfo,
}

impl PlanInfoBuilder {
    pub fn new(id: &str) -> Self {
        let now = TestEnv::epoch();
        Self {
            plan: Plan {
                id: id.to_string(),
                name: id.to_string(),
                current_version: "v1".to_string(),
                enabled: true,
                trigger_type: TriggerType::Schedule,
                created_at: now,
                updated_at: now,
            },
            info: PlanInfo {
                plan_id: id.to_string(),
                version: "v1".to_string(),
                description: String::new(),
                schedule_option: ScheduleOption::none(now),
                jobs: vec![],
                created_at: now,
            },
        }
    }

    pub fn with_schedule(mut self, schedule_option: ScheduleOption) -> Self {
        self.info.schedule_option = schedule_option;
        self
    }

    pub fn with_job(mut self, job: JobInfo) -> Self {
        self.info.jobs.push(job);
        self
    }

    pub fn with_jobs(mut self, jobs: Vec<JobInfo>) -> Self {
        self.info.jobs.extend(jobs);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.plan.enabled = false;
        self
    }

    pub fn build(self) -> (Plan, PlanInfo) {
        (self.plan, self.info)
    }
}

pub struct WorkerBuilder {
    worker: Worker,
}

impl WorkerBuilder {
    pub fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            worker: Worker {
                id: id.to_string(),
                name: id.to_string(),
                rpc_address: format!("local://{id}"),
                executors: vec!["echo".to_string(), "shell".to_string()],
                tags: HashMap::new(),
                status: WorkerStatus::Running,
                metric: WorkerMetric {
                    available_cpu: 4.0,
                    available_ram: 8 * 1024 * 1024 * 1024,
                    available_queue_limit: 64,
                    executing_tasks: 0,
                },
                registered_at: now,
                last_heartbeat_at: now,
            },
        }
    }

    pub fn with_executors(mut self, executors: &[&str]) -> Self {
        self.worker.executors = executors.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.worker.status = status;
        self
    }

    pub fn with_metric(mut self, metric: WorkerMetric) -> Self {
        self.worker.metric = metric;
        self
    }

    pub fn with_heartbeat_at(mut self, at: DateTime<Utc>) -> Self {
        self.worker.last_heartbeat_at = at;
        self
    }

    pub fn build(self) -> Worker {
        self.worker
    }
}

pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            task: Task {
                id: id.to_string(),
                plan_id: "plan-1".to_string(),
                plan_version: "v1".to_string(),
                plan_instance_id: "pi-1".to_string(),
                job_id: "job-1".to_string(),
                job_instance_id: "ji-1".to_string(),
                task_type: TaskType::Standalone,
                status: TaskStatus::Scheduling,
                executor_name: "echo".to_string(),
                dispatch_option: DispatchOption::default(),
                worker_id: None,
                trigger_at: TestEnv::epoch(),
                job_attributes: Attributes::new(),
                map_attributes: None,
                reduce_attributes: vec![],
                result: None,
                error_msg: None,
                error_stack_trace: None,
                start_at: None,
                end_at: None,
            },
        }
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task.task_type = task_type;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_executor(mut self, executor_name: &str) -> Self {
        self.task.executor_name = executor_name.to_string();
        self
    }

    pub fn with_job_instance(mut self, job_instance_id: &str) -> Self {
        self.task.job_instance_id = job_instance_id.to_string();
        self
    }

    pub fn with_worker(mut self, worker_id: &str) -> Self {
        self.task.worker_id = Some(worker_id.to_string());
        self
    }

    pub fn with_load_balance(mut self, load_balance_type: LoadBalanceType) -> Self {
        self.task.dispatch_option.load_balance_type = load_balance_type;
        self
    }

    pub fn with_job_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.task.job_attributes.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}
