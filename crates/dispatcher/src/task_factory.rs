//! 作业实例拆分为任务
//!
//! 每个作业类型对应一条任务阶段流水线：
//! NORMAL: STANDALONE；BROADCAST: BROADCAST；MAP: SHARDING -> MAP；MAP_REDUCE: SHARDING -> MAP -> REDUCE。

use std::sync::Arc;

use tracing::{debug, info};

use jobflow_core::{IdGenerator, IdType, SchedulerError, SchedulerResult};
use jobflow_domain::{
    Attributes, JobInfo, JobInstance, JobType, Task, TaskRepository, TaskStatus, TaskType,
};

use crate::worker_registry::WorkerRegistry;

pub struct TaskFactory {
    task_repo: Arc<dyn TaskRepository>,
    registry: Arc<WorkerRegistry>,
    id_generator: Arc<dyn IdGenerator>,
}

impl TaskFactory {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        registry: Arc<WorkerRegistry>,
        id_generator: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            task_repo,
            registry,
            id_generator,
        }
    }

    /// 已完成 completed 阶段后的下一个阶段，None 表示作业的所有阶段都已完成
    pub fn next_task_type(
        job_type: JobType,
        completed: TaskType,
    ) -> SchedulerResult<Option<TaskType>> {
        match (job_type, completed) {
            (JobType::Normal, TaskType::Standalone) => Ok(None),
            (JobType::Broadcast, TaskType::Broadcast) => Ok(None),
            (JobType::Map, TaskType::Sharding) => Ok(Some(TaskType::Map)),
            (JobType::Map, TaskType::Map) => Ok(None),
            (JobType::MapReduce, TaskType::Sharding) => Ok(Some(TaskType::Map)),
            (JobType::MapReduce, TaskType::Map) => Ok(Some(TaskType::Reduce)),
            (JobType::MapReduce, TaskType::Reduce) => Ok(None),
            (job_type, task_type) => Err(SchedulerError::UnsupportedStage {
                job_type: job_type.to_string(),
                task_type: task_type.to_string(),
            }),
        }
    }

    /// 作业实例首个阶段的任务
    pub async fn create_root_tasks(
        &self,
        job_info: &JobInfo,
        job_instance: &JobInstance,
    ) -> SchedulerResult<Vec<Task>> {
        self.create_tasks(job_info, job_instance, job_instance.stage)
            .await
    }

    /// 生成 task_type 阶段的任务，只构造不持久化
    pub async fn create_tasks(
        &self,
        job_info: &JobInfo,
        job_instance: &JobInstance,
        task_type: TaskType,
    ) -> SchedulerResult<Vec<Task>> {
        let tasks = match task_type {
            TaskType::Standalone | TaskType::Sharding => {
                vec![self.new_task(job_info, job_instance, task_type)]
            }
            TaskType::Broadcast => self.broadcast_tasks(job_info, job_instance).await,
            TaskType::Map => self.map_tasks(job_info, job_instance).await?,
            TaskType::Reduce => vec![self.reduce_task(job_info, job_instance).await?],
        };

        debug!(
            "作业实例 {} 生成 {} 个 {} 任务",
            job_instance.id,
            tasks.len(),
            task_type
        );
        Ok(tasks)
    }

    /// 每个当前可用的worker一个任务，预先绑定worker
    async fn broadcast_tasks(&self, job_info: &JobInfo, job_instance: &JobInstance) -> Vec<Task> {
        let workers = self
            .registry
            .candidates(&job_info.executor_name, &job_info.dispatch_option)
            .await;
        if workers.is_empty() {
            info!(
                "广播作业 {} 没有可用的Worker，执行器: {}",
                job_info.id, job_info.executor_name
            );
        }

        workers
            .into_iter()
            .map(|worker| {
                let mut task = self.new_task(job_info, job_instance, TaskType::Broadcast);
                task.worker_id = Some(worker.id);
                task
            })
            .collect()
    }

    /// 分片任务返回的每组属性对应一个MAP任务
    async fn map_tasks(
        &self,
        job_info: &JobInfo,
        job_instance: &JobInstance,
    ) -> SchedulerResult<Vec<Task>> {
        let sharding = self
            .task_repo
            .find_by_job_instance_and_type(&job_instance.id, TaskType::Sharding)
            .await?;

        Ok(sharding
            .into_iter()
            .filter(|t| t.status == TaskStatus::Succeed)
            .flat_map(|t| t.result.map(|r| r.sub_task_attributes).unwrap_or_default())
            .map(|attributes| {
                let mut task = self.new_task(job_info, job_instance, TaskType::Map);
                task.map_attributes = Some(attributes);
                task
            })
            .collect())
    }

    /// 汇总所有成功MAP任务的结果
    async fn reduce_task(
        &self,
        job_info: &JobInfo,
        job_instance: &JobInstance,
    ) -> SchedulerResult<Task> {
        let mut maps = self
            .task_repo
            .find_by_job_instance_and_type(&job_instance.id, TaskType::Map)
            .await?;
        maps.sort_by(|a, b| a.id.cmp(&b.id));

        let reduce_attributes: Vec<Attributes> = maps
            .into_iter()
            .filter(|t| t.status == TaskStatus::Succeed)
            .map(|t| t.result.map(|r| r.result_attributes).unwrap_or_default())
            .collect();

        let mut task = self.new_task(job_info, job_instance, TaskType::Reduce);
        task.reduce_attributes = reduce_attributes;
        Ok(task)
    }

    fn new_task(&self, job_info: &JobInfo, job_instance: &JobInstance, task_type: TaskType) -> Task {
        Task {
            id: self.id_generator.generate_id(IdType::Task),
            plan_id: job_instance.plan_id.clone(),
            plan_version: job_instance.plan_version.clone(),
            plan_instance_id: job_instance.plan_instance_id.clone(),
            job_id: job_instance.job_id.clone(),
            job_instance_id: job_instance.id.clone(),
            task_type,
            status: TaskStatus::Scheduling,
            executor_name: job_info.executor_name.clone(),
            dispatch_option: job_info.dispatch_option.clone(),
            worker_id: None,
            trigger_at: job_instance.trigger_at,
            job_attributes: job_instance.attributes.clone(),
            map_attributes: None,
            reduce_attributes: Vec::new(),
            result: None,
            error_msg: None,
            error_stack_trace: None,
            start_at: None,
            end_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jobflow_core::{ManualClock, UuidIdGenerator};
    use jobflow_domain::{Plan, PlanInstance, TaskResult, TriggerType};
    use jobflow_infrastructure::InMemoryStore;
    use jobflow_testing_utils::{JobInfoBuilder, MockWorkerRpcFactory, WorkerBuilder};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryStore>,
        registry: Arc<WorkerRegistry>,
        factory: TaskFactory,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(WorkerRegistry::new(
            Arc::new(MockWorkerRpcFactory::new()),
            Arc::new(ManualClock::new(Utc::now())),
            Duration::seconds(90),
        ));
        let factory = TaskFactory::new(
            store.clone(),
            registry.clone(),
            Arc::new(UuidIdGenerator),
        );
        Fixture {
            store,
            registry,
            factory,
        }
    }

    fn instance(job: &JobInfo) -> JobInstance {
        let now = Utc::now();
        let plan = Plan {
            id: "plan-1".to_string(),
            name: "plan-1".to_string(),
            current_version: "v1".to_string(),
            enabled: true,
            trigger_type: TriggerType::Schedule,
            created_at: now,
            updated_at: now,
        };
        let plan_instance = PlanInstance::new("pi-1".to_string(), &plan, TriggerType::Schedule, now);
        job.new_instance("ji-1".to_string(), &plan_instance, 0, TriggerType::Schedule, now)
    }

    #[test]
    fn test_stage_pipeline() {
        use JobType::*;
        assert_eq!(TaskFactory::next_task_type(Normal, TaskType::Standalone).unwrap(), None);
        assert_eq!(TaskFactory::next_task_type(Broadcast, TaskType::Broadcast).unwrap(), None);
        assert_eq!(
            TaskFactory::next_task_type(Map, TaskType::Sharding).unwrap(),
            Some(TaskType::Map)
        );
        assert_eq!(TaskFactory::next_task_type(Map, TaskType::Map).unwrap(), None);
        assert_eq!(
            TaskFactory::next_task_type(MapReduce, TaskType::Map).unwrap(),
            Some(TaskType::Reduce)
        );
        assert_eq!(TaskFactory::next_task_type(MapReduce, TaskType::Reduce).unwrap(), None);
    }

    #[test]
    fn test_unknown_stage_is_fatal() {
        let err = TaskFactory::next_task_type(JobType::Normal, TaskType::Map).unwrap_err();
        assert!(matches!(err, SchedulerError::UnsupportedStage { .. }));
        assert!(err.is_fatal());
        assert!(TaskFactory::next_task_type(JobType::Map, TaskType::Reduce).is_err());
    }

    #[tokio::test]
    async fn test_standalone_single_unpinned_task() {
        let f = fixture();
        let job = JobInfoBuilder::new("job-1")
            .with_attribute("k", json!("v"))
            .build();
        let ji = instance(&job);

        let tasks = f.factory.create_root_tasks(&job, &ji).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::Standalone);
        assert_eq!(tasks[0].status, TaskStatus::Scheduling);
        assert!(tasks[0].worker_id.is_none());
        assert_eq!(tasks[0].trigger_at, ji.trigger_at);
        assert_eq!(tasks[0].job_attributes.get("k"), Some(&json!("v")));
    }

    #[tokio::test]
    async fn test_broadcast_pins_each_available_worker() {
        let f = fixture();
        f.registry.register(WorkerBuilder::new("w1").build()).await.unwrap();
        f.registry.register(WorkerBuilder::new("w2").build()).await.unwrap();
        f.registry
            .register(WorkerBuilder::new("w3").with_executors(&["shell"]).build())
            .await
            .unwrap();
        f.registry.register(WorkerBuilder::new("w4").build()).await.unwrap();
        f.registry.unregister("w4").await;

        let job = JobInfoBuilder::new("job-1").with_type(JobType::Broadcast).build();
        let tasks = f.factory.create_root_tasks(&job, &instance(&job)).await.unwrap();

        let pinned: Vec<_> = tasks.iter().filter_map(|t| t.worker_id.clone()).collect();
        assert_eq!(pinned, vec!["w1", "w2"]);
        assert!(tasks.iter().all(|t| t.task_type == TaskType::Broadcast));
    }

    #[tokio::test]
    async fn test_broadcast_without_workers_is_empty() {
        let f = fixture();
        let job = JobInfoBuilder::new("job-1").with_type(JobType::Broadcast).build();
        let tasks = f.factory.create_root_tasks(&job, &instance(&job)).await.unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_map_and_reduce_from_previous_results() {
        let f = fixture();
        let job = JobInfoBuilder::new("job-1").with_type(JobType::MapReduce).build();
        let ji = instance(&job);

        let mut sharding = f.factory.create_root_tasks(&job, &ji).await.unwrap();
        assert_eq!(sharding.len(), 1);
        assert_eq!(sharding[0].task_type, TaskType::Sharding);

        let shards: Vec<Attributes> = (0..3)
            .map(|i| Attributes::from([("shard".to_string(), json!(i))]))
            .collect();
        sharding[0].status = TaskStatus::Succeed;
        sharding[0].result = Some(TaskResult::with_sub_tasks(shards));
        f.store.save_all(&sharding).await.unwrap();

        let mut maps = f.factory.create_tasks(&job, &ji, TaskType::Map).await.unwrap();
        assert_eq!(maps.len(), 3);
        let shard_values: Vec<_> = maps
            .iter()
            .map(|t| t.map_attributes.as_ref().unwrap()["shard"].clone())
            .collect();
        assert_eq!(shard_values, vec![json!(0), json!(1), json!(2)]);

        for (i, task) in maps.iter_mut().enumerate() {
            task.status = TaskStatus::Succeed;
            task.result = Some(TaskResult::with_attributes(Attributes::from([(
                "sum".to_string(),
                json!(i * 10),
            )])));
        }
        // 失败的MAP任务不参与汇总
        maps[2].status = TaskStatus::Failed;
        f.store.save_all(&maps).await.unwrap();

        let reduce = f.factory.create_tasks(&job, &ji, TaskType::Reduce).await.unwrap();
        assert_eq!(reduce.len(), 1);
        assert_eq!(reduce[0].task_type, TaskType::Reduce);
        assert_eq!(reduce[0].reduce_attributes.len(), 2);
    }
}
