#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use jobflow_core::{BrokerConfig, Clock, ManualClock, SchedulerError, UuidIdGenerator};
    use jobflow_dispatcher::{
        Broker, MetaTask, PlanScheduleMetaTask, ScheduleCalculatorFactory,
    };
    use jobflow_domain::{CronType, PlanStatus, ScheduleOption, TriggerType};
    use jobflow_infrastructure::InMemoryStore;
    use jobflow_testing_utils::{JobInfoBuilder, MockWorkerRpcFactory, PlanInfoBuilder, TestEnv};

    fn broker(clock: Arc<ManualClock>) -> Broker {
        TestEnv::init_logging();
        let store = Arc::new(InMemoryStore::new());
        Broker::new(
            BrokerConfig::default(),
            jobflow_dispatcher::Repositories::from_store(store),
            Arc::new(MockWorkerRpcFactory::new()),
            Arc::new(UuidIdGenerator),
            clock,
        )
        .unwrap()
    }

    fn schedule_task(broker: &Broker, clock: Arc<ManualClock>, plan_id: &str) -> PlanScheduleMetaTask {
        PlanScheduleMetaTask::new(
            plan_id,
            broker.strategy().clone(),
            broker.repositories().clone(),
            Arc::new(ScheduleCalculatorFactory::new()),
            clock,
            Duration::seconds(1),
        )
    }

    fn plan(id: &str, option: ScheduleOption) -> PlanInfoBuilder {
        PlanInfoBuilder::new(id)
            .with_schedule(option)
            .with_job(JobInfoBuilder::new("a").build())
    }

    #[tokio::test]
    async fn test_save_plan_registers_schedule() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());
        let (p, info) = plan(
            "p1",
            ScheduleOption::fixed_rate(TestEnv::epoch(), Duration::seconds(60)),
        )
        .build();

        broker.plans().save_plan(p, info).await.unwrap();
        assert!(broker.plans().is_scheduled("p1").await);

        let saved = broker.repositories().plan.find_by_id("p1").await.unwrap().unwrap();
        assert_eq!(saved.current_version, "v1");
        assert!(saved.enabled);
    }

    #[tokio::test]
    async fn test_manual_only_plan_is_not_scheduled() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());
        let (p, info) = plan("p1", ScheduleOption::none(TestEnv::epoch())).build();

        broker.plans().save_plan(p, info).await.unwrap();
        assert!(!broker.plans().is_scheduled("p1").await);

        let instance = broker.plans().trigger_plan("p1").await.unwrap().unwrap();
        assert_eq!(instance.trigger_type, TriggerType::Api);
    }

    #[tokio::test]
    async fn test_invalid_plans_are_rejected() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());

        let (p, info) = plan(
            "bad-cron",
            ScheduleOption::cron(TestEnv::epoch(), "not a cron", CronType::Unix),
        )
        .build();
        let err = broker.plans().save_plan(p, info).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));

        let (p, info) = PlanInfoBuilder::new("cyclic")
            .with_jobs(vec![
                JobInfoBuilder::new("a").with_parents(&["b"]).build(),
                JobInfoBuilder::new("b").with_parents(&["a"]).build(),
            ])
            .build();
        let err = broker.plans().save_plan(p, info).await.unwrap_err();
        assert!(matches!(err, SchedulerError::CyclicGraph(_)));

        let (p, info) = plan(
            "no-interval",
            ScheduleOption::fixed_rate(TestEnv::epoch(), Duration::zero()),
        )
        .build();
        let err = broker.plans().save_plan(p, info).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));

        assert!(broker
            .repositories()
            .plan
            .find_by_id("bad-cron")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_new_version_becomes_current() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());
        let (p, info) = plan("p1", ScheduleOption::none(TestEnv::epoch())).build();
        broker.plans().save_plan(p.clone(), info.clone()).await.unwrap();

        let mut v2 = info.clone();
        v2.version = "v2".to_string();
        v2.jobs.push(JobInfoBuilder::new("b").with_parents(&["a"]).build());
        broker.plans().save_plan(p, v2).await.unwrap();

        let repo = &broker.repositories().plan;
        let saved = repo.find_by_id("p1").await.unwrap().unwrap();
        assert_eq!(saved.current_version, "v2");
        // 旧版本保持不变
        let v1 = repo.find_info("p1", "v1").await.unwrap().unwrap();
        assert_eq!(v1.jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_saved_version_is_immutable() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());
        let (p, info) = plan("p1", ScheduleOption::none(TestEnv::epoch())).build();
        broker.plans().save_plan(p.clone(), info.clone()).await.unwrap();
        let instance = broker.plans().trigger_plan("p1").await.unwrap().unwrap();
        assert_eq!(instance.plan_version, "v1");

        // 原样重复保存不报错，创建时间不同也视为同一内容
        let mut same = info.clone();
        same.created_at = TestEnv::epoch() + Duration::hours(1);
        broker.plans().save_plan(p.clone(), same).await.unwrap();

        let mut changed = info.clone();
        changed.jobs = vec![JobInfoBuilder::new("zzz").build()];
        let err = broker.plans().save_plan(p, changed).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));

        let stored = broker
            .repositories()
            .plan
            .find_info("p1", &instance.plan_version)
            .await
            .unwrap()
            .unwrap();
        let job_ids: Vec<&str> = stored.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(job_ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_disable_and_enable() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());
        let (p, info) = plan(
            "p1",
            ScheduleOption::fixed_rate(TestEnv::epoch(), Duration::seconds(60)),
        )
        .build();
        broker.plans().save_plan(p, info).await.unwrap();

        broker.plans().disable_plan("p1").await.unwrap();
        assert!(!broker.plans().is_scheduled("p1").await);

        broker.plans().enable_plan("p1").await.unwrap();
        assert!(broker.plans().is_scheduled("p1").await);

        let err = broker.plans().enable_plan("missing").await.unwrap_err();
        assert!(matches!(err, SchedulerError::PlanNotFound { .. }));
    }

    #[tokio::test]
    async fn test_start_registers_enabled_plans() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());
        let repo = &broker.repositories().plan;
        for (id, enabled) in [("p1", true), ("p2", false), ("p3", true)] {
            let mut builder = plan(
                id,
                ScheduleOption::fixed_rate(TestEnv::epoch(), Duration::seconds(60)),
            );
            if !enabled {
                builder = builder.disabled();
            }
            let (p, info) = builder.build();
            repo.save_info(&info).await.unwrap();
            repo.save(&p).await.unwrap();
        }

        assert_eq!(broker.plans().start().await.unwrap(), 2);
        assert!(broker.plans().is_scheduled("p1").await);
        assert!(!broker.plans().is_scheduled("p2").await);
    }

    #[tokio::test]
    async fn test_fixed_rate_fires_on_interval() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());
        let (p, info) = plan(
            "p1",
            ScheduleOption::fixed_rate(TestEnv::epoch(), Duration::seconds(60)),
        )
        .build();
        broker.repositories().plan.save_info(&info).await.unwrap();
        broker.repositories().plan.save(&p).await.unwrap();

        let task = schedule_task(&broker, clock.clone(), "p1");
        task.refresh().await.unwrap();
        assert_eq!(task.schedule_at(), Some(TestEnv::epoch()));

        task.execute().await.unwrap();
        task.after_execute(None).await;
        assert_eq!(task.schedule_at(), Some(TestEnv::epoch() + Duration::seconds(60)));

        clock.advance(Duration::seconds(60));
        task.execute().await.unwrap();
        task.after_execute(None).await;
        assert_eq!(task.schedule_at(), Some(TestEnv::epoch() + Duration::seconds(120)));

        let instances = broker
            .repositories()
            .plan_instance
            .find_by_plan("p1")
            .await
            .unwrap();
        let mut triggers: Vec<_> = instances.iter().map(|i| i.trigger_at).collect();
        triggers.sort();
        assert_eq!(
            triggers,
            vec![TestEnv::epoch(), TestEnv::epoch() + Duration::seconds(60)]
        );
    }

    #[tokio::test]
    async fn test_fixed_rate_catches_up_to_now() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());
        let (p, info) = plan(
            "p1",
            ScheduleOption::fixed_rate(TestEnv::epoch(), Duration::seconds(60)),
        )
        .build();
        broker.repositories().plan.save_info(&info).await.unwrap();
        broker.repositories().plan.save(&p).await.unwrap();

        let task = schedule_task(&broker, clock.clone(), "p1");
        task.refresh().await.unwrap();
        task.execute().await.unwrap();

        // 错过多个周期后只触发一次
        clock.advance(Duration::minutes(10));
        task.after_execute(None).await;
        assert_eq!(task.schedule_at(), Some(clock.now()));
    }

    #[tokio::test]
    async fn test_fixed_delay_waits_for_feedback() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());
        let (p, info) = plan(
            "p1",
            ScheduleOption::fixed_delay(TestEnv::epoch(), Duration::seconds(30)),
        )
        .build();
        let repos = broker.repositories().clone();
        repos.plan.save_info(&info).await.unwrap();
        repos.plan.save(&p).await.unwrap();

        let task = schedule_task(&broker, clock.clone(), "p1");
        task.refresh().await.unwrap();
        task.execute().await.unwrap();
        task.after_execute(None).await;

        // 上次运行未结束，只做复查
        assert!(task.is_recheck());
        assert_eq!(task.schedule_at(), Some(clock.now() + Duration::seconds(1)));
        clock.advance(Duration::seconds(1));
        task.execute().await.unwrap();
        task.after_execute(None).await;
        assert!(task.is_recheck());
        assert_eq!(repos.plan_instance.find_by_plan("p1").await.unwrap().len(), 1);

        let instance = repos.plan_instance.find_latest("p1").await.unwrap().unwrap();
        let feedback_at = TestEnv::epoch() + Duration::seconds(5);
        repos.plan_instance.succeed(&instance.id, feedback_at).await.unwrap();

        task.after_execute(None).await;
        assert!(!task.is_recheck());
        assert_eq!(task.schedule_at(), Some(feedback_at + Duration::seconds(30)));

        clock.set(feedback_at + Duration::seconds(30));
        task.execute().await.unwrap();
        let instances = repos.plan_instance.find_by_plan("p1").await.unwrap();
        assert_eq!(instances.len(), 2);
        assert!(instances
            .iter()
            .any(|i| i.status == PlanStatus::Succeed && i.trigger_at == TestEnv::epoch()));
    }

    #[tokio::test]
    async fn test_failed_trigger_backs_off() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());
        let (p, info) = plan(
            "p1",
            ScheduleOption::fixed_rate(TestEnv::epoch(), Duration::seconds(60)),
        )
        .build();
        let repos = broker.repositories().clone();
        repos.plan.save_info(&info).await.unwrap();
        repos.plan.save(&p).await.unwrap();

        let task = schedule_task(&broker, clock.clone(), "p1");
        task.refresh().await.unwrap();
        clock.advance(Duration::minutes(5));

        // 触发时间早已过去，失败后不立即重试
        task.after_execute(Some(&SchedulerError::Database("locked".to_string())))
            .await;
        assert!(!task.stopped());
        assert!(task.is_recheck());
        assert_eq!(task.schedule_at(), Some(clock.now() + Duration::seconds(1)));

        // 复查后恢复正常计算
        clock.advance(Duration::seconds(1));
        task.execute().await.unwrap();
        task.after_execute(None).await;
        assert!(!task.is_recheck());
        assert_eq!(task.schedule_at(), Some(clock.now()));
        assert!(repos.plan_instance.find_by_plan("p1").await.unwrap().is_empty());

        task.after_execute(Some(&SchedulerError::InvalidDag("a".to_string())))
            .await;
        assert!(task.stopped());
    }

    #[tokio::test]
    async fn test_disabled_plan_stops_schedule() {
        let clock = Arc::new(ManualClock::new(TestEnv::epoch()));
        let broker = broker(clock.clone());
        let (p, info) = plan(
            "p1",
            ScheduleOption::fixed_rate(TestEnv::epoch(), Duration::seconds(60)),
        )
        .build();
        let repos = broker.repositories().clone();
        repos.plan.save_info(&info).await.unwrap();
        repos.plan.save(&p).await.unwrap();

        let task = schedule_task(&broker, clock.clone(), "p1");
        task.refresh().await.unwrap();
        repos.plan.update_enabled("p1", false).await.unwrap();

        task.execute().await.unwrap();
        assert!(task.stopped());
        assert!(task.schedule_at().is_none());
        assert!(repos.plan_instance.find_by_plan("p1").await.unwrap().is_empty());
    }
}
