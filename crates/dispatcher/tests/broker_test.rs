#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::broadcast;

    use jobflow_core::{BrokerConfig, SchedulerError, SystemClock, UuidIdGenerator};
    use jobflow_dispatcher::{Broker, Repositories};
    use jobflow_domain::{
        BrokerRpc, PlanStatus, ScheduleOption, TaskResult, TaskStatus, WorkerMetric,
    };
    use jobflow_infrastructure::InMemoryStore;
    use jobflow_testing_utils::{
        JobInfoBuilder, MockWorkerRpcFactory, PlanInfoBuilder, TestEnv, WorkerBuilder,
    };

    struct Running {
        broker: Arc<Broker>,
        rpcs: Arc<MockWorkerRpcFactory>,
        shutdown_tx: broadcast::Sender<()>,
    }

    async fn start_broker() -> Running {
        TestEnv::init_logging();
        let config = BrokerConfig {
            timer_tick_ms: 10,
            timer_wheel_size: 64,
            dispatch_concurrency: 2,
            feedback_recheck_ms: 50,
            ..Default::default()
        };
        let rpcs = Arc::new(MockWorkerRpcFactory::new());
        let broker = Arc::new(
            Broker::new(
                config,
                Repositories::from_store(Arc::new(InMemoryStore::new())),
                rpcs.clone(),
                Arc::new(UuidIdGenerator),
                Arc::new(SystemClock),
            )
            .unwrap(),
        );
        let (shutdown_tx, _) = broadcast::channel(8);
        broker.start(&shutdown_tx).await.unwrap();
        Running {
            broker,
            rpcs,
            shutdown_tx,
        }
    }

    #[tokio::test]
    async fn test_manual_trigger_end_to_end() {
        let r = start_broker().await;
        r.broker
            .register(&WorkerBuilder::new("w1").build())
            .await
            .unwrap();

        let (plan, info) = PlanInfoBuilder::new("p1")
            .with_schedule(ScheduleOption::none(chrono::Utc::now()))
            .with_job(JobInfoBuilder::new("a").build())
            .build();
        r.broker.plans().save_plan(plan, info).await.unwrap();
        let instance = r.broker.plans().trigger_plan("p1").await.unwrap().unwrap();

        let rpc = r.rpcs.rpc("w1");
        let probe = rpc.clone();
        let received = TestEnv::wait_for(
            move || {
                let probe = probe.clone();
                async move { probe.send_count() == 1 }
            },
            Duration::from_secs(3),
        )
        .await;
        assert!(received);

        let task = rpc.received().remove(0);
        assert_eq!(task.plan_instance_id, instance.id);

        // 等待broker记录下发结果
        let repos = r.broker.repositories().clone();
        let task_id = task.id.clone();
        let executing = TestEnv::wait_for(
            move || {
                let repos = repos.clone();
                let task_id = task_id.clone();
                async move {
                    repos
                        .task
                        .find_by_id(&task_id)
                        .await
                        .ok()
                        .flatten()
                        .is_some_and(|t| t.status == TaskStatus::Executing)
                }
            },
            Duration::from_secs(3),
        )
        .await;
        assert!(executing);
        assert_eq!(r.broker.queued_tasks(), 0);

        r.broker
            .report_task_success(&task.id, TaskResult::default())
            .await
            .unwrap();
        let status = r
            .broker
            .repositories()
            .plan_instance
            .find_by_id(&instance.id)
            .await
            .unwrap()
            .unwrap()
            .status;
        assert_eq!(status, PlanStatus::Succeed);
        let _ = r.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_fixed_rate_plan_keeps_firing() {
        let r = start_broker().await;
        r.broker
            .register(&WorkerBuilder::new("w1").build())
            .await
            .unwrap();

        let (plan, info) = PlanInfoBuilder::new("p1")
            .with_schedule(ScheduleOption::fixed_rate(
                chrono::Utc::now(),
                chrono::Duration::milliseconds(200),
            ))
            .with_job(JobInfoBuilder::new("a").build())
            .build();
        r.broker.plans().save_plan(plan, info).await.unwrap();

        let repos = r.broker.repositories().clone();
        let fired = TestEnv::wait_for(
            move || {
                let repos = repos.clone();
                async move {
                    repos
                        .plan_instance
                        .find_by_plan("p1")
                        .await
                        .map(|i| i.len() >= 3)
                        .unwrap_or(false)
                }
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(fired);

        r.broker.plans().disable_plan("p1").await.unwrap();
        assert!(!r.broker.plans().is_scheduled("p1").await);
        let _ = r.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_no_worker_fails_plan() {
        let r = start_broker().await;
        let (plan, info) = PlanInfoBuilder::new("p1")
            .with_job(JobInfoBuilder::new("a").build())
            .build();
        r.broker.plans().save_plan(plan, info).await.unwrap();
        let instance = r.broker.plans().trigger_plan("p1").await.unwrap().unwrap();

        let repos = r.broker.repositories().clone();
        let id = instance.id.clone();
        let failed = TestEnv::wait_for(
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
                        .is_some_and(|i| i.status == PlanStatus::Failed)
                }
            },
            Duration::from_secs(3),
        )
        .await;
        assert!(failed);
        let _ = r.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let r = start_broker().await;
        let err = r
            .broker
            .heartbeat("ghost", &WorkerMetric::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::WorkerNotFound { .. }));

        r.broker
            .register(&WorkerBuilder::new("w1").build())
            .await
            .unwrap();
        r.broker
            .heartbeat("w1", &WorkerMetric::default())
            .await
            .unwrap();
        assert_eq!(r.broker.registry().len().await, 1);

        r.broker.unregister("w1").await.unwrap();
        assert!(r.broker.registry().is_empty().await);
        // 重复下线不报错
        r.broker.unregister("w1").await.unwrap();
        let _ = r.shutdown_tx.send(());
    }
}
