#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::broadcast;

    use jobflow::embedded::create_repositories;
    use jobflow::EmbeddedApplication;
    use jobflow_core::{AppConfig, BrokerConfig, StoreType, SystemClock, WorkerConfig};
    use jobflow_dispatcher::Repositories;
    use jobflow_domain::{JobType, PlanInstance, PlanStatus, TaskStatus, TaskType, TriggerType};
    use jobflow_infrastructure::InMemoryStore;
    use jobflow_testing_utils::{JobInfoBuilder, PlanInfoBuilder, TestEnv};

    fn test_config(worker_count: usize) -> AppConfig {
        let mut config = AppConfig {
            broker: BrokerConfig {
                timer_tick_ms: 10,
                timer_wheel_size: 64,
                dispatch_concurrency: 2,
                feedback_recheck_ms: 50,
                ..Default::default()
            },
            worker: WorkerConfig {
                worker_id: "embedded".to_string(),
                concurrency: 2,
                queue_size: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        config.embedded.worker_count = worker_count;
        config
    }

    struct Running {
        app: EmbeddedApplication,
        shutdown_tx: broadcast::Sender<()>,
    }

    impl Running {
        async fn start(config: AppConfig, repos: Repositories) -> Self {
            TestEnv::init_logging();
            let app =
                EmbeddedApplication::with_repositories(config, repos, Arc::new(SystemClock)).unwrap();
            let (shutdown_tx, _) = broadcast::channel(8);
            app.start(&shutdown_tx).await.unwrap();
            Self { app, shutdown_tx }
        }

        async fn in_memory(worker_count: usize) -> Self {
            Self::start(
                test_config(worker_count),
                Repositories::from_store(Arc::new(InMemoryStore::new())),
            )
            .await
        }

        fn repos(&self) -> Repositories {
            self.app.broker().repositories().clone()
        }

        /// 等待计划实例结束，返回最终状态
        async fn wait_finished(&self, instance_id: &str) -> PlanInstance {
            let repos = self.repos();
            let id = instance_id.to_string();
            let finished = TestEnv::wait_for(
                move || {
                    let repos = repos.clone();
                    let id = id.clone();
                    async move {
                        repos
                            .plan_instance
                            .find_by_id(&id)
                            .await
                            .ok()
                            .flatten()
                            .is_some_and(|p| p.status.is_completed())
                    }
                },
                Duration::from_secs(5),
            )
            .await;
            assert!(finished, "计划实例 {instance_id} 未在时限内结束");
            self.repos()
                .plan_instance
                .find_by_id(instance_id)
                .await
                .unwrap()
                .unwrap()
        }

        async fn stop(self) {
            self.app.stop(Duration::from_secs(2)).await;
            let _ = self.shutdown_tx.send(());
        }
    }

    #[tokio::test]
    async fn test_workers_register_on_start() {
        let r = Running::in_memory(2).await;
        let mut ids: Vec<String> = r
            .app
            .workers()
            .iter()
            .map(|w| w.worker_id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["embedded-0", "embedded-1"]);
        for id in &ids {
            assert!(r.app.broker().registry().get(id).await.is_some());
        }
        r.stop().await;
    }

    #[tokio::test]
    async fn test_terminated_worker_does_not_come_back() {
        let mut config = test_config(2);
        config.worker.heartbeat_interval_seconds = 1;
        let r = Running::start(
            config,
            Repositories::from_store(Arc::new(InMemoryStore::new())),
        )
        .await;
        let registry = r.app.broker().registry();

        assert!(registry.terminate("embedded-0").await);
        let terminated = r
            .app
            .workers()
            .iter()
            .find(|w| w.worker_id() == "embedded-0")
            .unwrap();
        assert!(terminated.is_terminated());

        // 超过一个心跳周期后仍不在候选集中
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(registry.get("embedded-0").await.is_none());
        assert!(registry.get("embedded-1").await.is_some());
        r.stop().await;
    }

    #[tokio::test]
    async fn test_dag_plan_runs_to_success() {
        let r = Running::in_memory(2).await;
        let (plan, info) = PlanInfoBuilder::new("etl")
            .with_jobs(vec![
                JobInfoBuilder::new("extract")
                    .with_children(&["load"])
                    .with_attribute("source", json!("db"))
                    .build(),
                JobInfoBuilder::new("load").with_parents(&["extract"]).build(),
            ])
            .build();
        r.app.broker().plans().save_plan(plan, info).await.unwrap();

        let instance = r.app.broker().plans().trigger_plan("etl").await.unwrap().unwrap();
        assert_eq!(instance.trigger_type, TriggerType::Api);

        let finished = r.wait_finished(&instance.id).await;
        assert_eq!(finished.status, PlanStatus::Succeed);
        assert!(finished.feedback_at.is_some());

        let jobs = r
            .repos()
            .job_instance
            .find_by_plan_instance(&instance.id)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);
        for job in &jobs {
            let tasks = r.repos().task.find_by_job_instance(&job.id).await.unwrap();
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].status, TaskStatus::Succeed);
            assert!(tasks[0].worker_id.as_deref().unwrap().starts_with("embedded-"));
        }
        r.stop().await;
    }

    #[tokio::test]
    async fn test_map_reduce_across_workers() {
        let r = Running::in_memory(2).await;
        let (plan, info) = PlanInfoBuilder::new("mr")
            .with_job(
                JobInfoBuilder::new("count")
                    .with_type(JobType::MapReduce)
                    .with_attribute("shards", json!(3))
                    .build(),
            )
            .build();
        r.app.broker().plans().save_plan(plan, info).await.unwrap();
        let instance = r.app.broker().plans().trigger_plan("mr").await.unwrap().unwrap();

        let finished = r.wait_finished(&instance.id).await;
        assert_eq!(finished.status, PlanStatus::Succeed);

        let job = r
            .repos()
            .job_instance
            .find_by_plan_instance(&instance.id)
            .await
            .unwrap()
            .remove(0);
        let tasks = r.repos().task.find_by_job_instance(&job.id).await.unwrap();
        let count = |t: TaskType| tasks.iter().filter(|task| task.task_type == t).count();
        assert_eq!(count(TaskType::Sharding), 1);
        assert_eq!(count(TaskType::Map), 3);
        assert_eq!(count(TaskType::Reduce), 1);

        let reduce = tasks
            .iter()
            .find(|t| t.task_type == TaskType::Reduce)
            .unwrap();
        let result = reduce.result.as_ref().unwrap();
        assert_eq!(result.result_attributes.get("reduced"), Some(&json!(3)));
        r.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_runs_on_every_worker() {
        let r = Running::in_memory(3).await;
        let (plan, info) = PlanInfoBuilder::new("bc")
            .with_job(JobInfoBuilder::new("all").with_type(JobType::Broadcast).build())
            .build();
        r.app.broker().plans().save_plan(plan, info).await.unwrap();
        let instance = r.app.broker().plans().trigger_plan("bc").await.unwrap().unwrap();

        let finished = r.wait_finished(&instance.id).await;
        assert_eq!(finished.status, PlanStatus::Succeed);

        let job = r
            .repos()
            .job_instance
            .find_by_plan_instance(&instance.id)
            .await
            .unwrap()
            .remove(0);
        let tasks = r.repos().task.find_by_job_instance(&job.id).await.unwrap();
        let mut workers: Vec<String> = tasks.iter().filter_map(|t| t.worker_id.clone()).collect();
        workers.sort();
        assert_eq!(workers, vec!["embedded-0", "embedded-1", "embedded-2"]);
        r.stop().await;
    }

    #[tokio::test]
    async fn test_failed_job_fails_plan() {
        let r = Running::in_memory(1).await;
        let (plan, info) = PlanInfoBuilder::new("bad")
            .with_jobs(vec![
                JobInfoBuilder::new("first")
                    .with_children(&["second"])
                    .with_attribute("fail", json!("磁盘已满"))
                    .build(),
                JobInfoBuilder::new("second").with_parents(&["first"]).build(),
            ])
            .build();
        r.app.broker().plans().save_plan(plan, info).await.unwrap();
        let instance = r.app.broker().plans().trigger_plan("bad").await.unwrap().unwrap();

        let finished = r.wait_finished(&instance.id).await;
        assert_eq!(finished.status, PlanStatus::Failed);

        let jobs = r
            .repos()
            .job_instance
            .find_by_plan_instance(&instance.id)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        let tasks = r.repos().task.find_by_job_instance(&jobs[0].id).await.unwrap();
        assert!(tasks[0].error_msg.as_deref().unwrap().contains("磁盘已满"));
        r.stop().await;
    }

    #[tokio::test]
    async fn test_shell_job_end_to_end() {
        let r = Running::in_memory(1).await;
        let (plan, info) = PlanInfoBuilder::new("sh")
            .with_job(
                JobInfoBuilder::new("hello")
                    .with_executor("shell")
                    .with_attribute("command", json!("echo hello"))
                    .build(),
            )
            .build();
        r.app.broker().plans().save_plan(plan, info).await.unwrap();
        let instance = r.app.broker().plans().trigger_plan("sh").await.unwrap().unwrap();

        let finished = r.wait_finished(&instance.id).await;
        assert_eq!(finished.status, PlanStatus::Succeed);

        let job = r
            .repos()
            .job_instance
            .find_by_plan_instance(&instance.id)
            .await
            .unwrap()
            .remove(0);
        let task = r
            .repos()
            .task
            .find_by_job_instance(&job.id)
            .await
            .unwrap()
            .remove(0);
        let result = task.result.unwrap();
        assert_eq!(result.result_attributes.get("stdout"), Some(&json!("hello")));
        r.stop().await;
    }

    #[tokio::test]
    async fn test_plans_file_is_loaded_and_scheduled() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        let start_at = chrono::Utc::now().to_rfc3339();
        write!(
            file,
            r#"[
                {{
                    "id": "every-100ms",
                    "schedule_option": {{
                        "schedule_type": "FIXED_RATE",
                        "schedule_start_at": "{start_at}",
                        "schedule_interval_ms": 100
                    }},
                    "jobs": [{{"id": "tick", "executor_name": "echo", "job_type": "NORMAL"}}]
                }},
                {{
                    "id": "manual",
                    "jobs": [{{"id": "once", "executor_name": "echo", "job_type": "NORMAL"}}]
                }}
            ]"#
        )
        .unwrap();

        let mut config = test_config(1);
        config.embedded.plans_file = Some(file.path().to_str().unwrap().to_string());
        let r = Running::start(config, Repositories::from_store(Arc::new(InMemoryStore::new()))).await;

        assert!(r.app.broker().plans().is_scheduled("every-100ms").await);
        assert!(!r.app.broker().plans().is_scheduled("manual").await);

        let repos = r.repos();
        let fired = TestEnv::wait_for(
            move || {
                let repos = repos.clone();
                async move {
                    repos
                        .plan_instance
                        .find_by_plan("every-100ms")
                        .await
                        .map(|all| {
                            all.iter()
                                .filter(|p| p.status == PlanStatus::Succeed)
                                .count()
                                >= 2
                        })
                        .unwrap_or(false)
                }
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(fired);

        r.app.broker().plans().disable_plan("every-100ms").await.unwrap();
        r.stop().await;
    }

    #[tokio::test]
    async fn test_sqlite_store_pipeline() {
        let mut config = test_config(1);
        config.database.store = StoreType::Sqlite;
        config.database.url = "sqlite::memory:".to_string();
        let repos = create_repositories(&config).await.unwrap();
        let r = Running::start(config, repos).await;

        let (plan, info) = PlanInfoBuilder::new("persisted")
            .with_jobs(vec![
                JobInfoBuilder::new("a").with_children(&["b"]).build(),
                JobInfoBuilder::new("b").with_parents(&["a"]).build(),
            ])
            .build();
        r.app.broker().plans().save_plan(plan, info).await.unwrap();
        let instance = r
            .app
            .broker()
            .plans()
            .trigger_plan("persisted")
            .await
            .unwrap()
            .unwrap();

        let finished = r.wait_finished(&instance.id).await;
        assert_eq!(finished.status, PlanStatus::Succeed);
        r.stop().await;
    }
}
