use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, instrument};

use jobflow_core::{Clock, SchedulerError, SchedulerResult};
use jobflow_domain::{Plan, PlanInfo, PlanInstance, ScheduleType};

use crate::calculator::ScheduleCalculatorFactory;
use crate::meta_task::{MetaTask, MetaTaskScheduler};
use crate::plan_schedule_task::PlanScheduleMetaTask;
use crate::schedule_strategy::{Repositories, ScheduleStrategy};

/// 计划的保存、启停与手动触发，并维护每个计划在时间轮上的调度元任务
pub struct PlanManager {
    repos: Repositories,
    strategy: Arc<ScheduleStrategy>,
    scheduler: Arc<MetaTaskScheduler>,
    calculators: Arc<ScheduleCalculatorFactory>,
    clock: Arc<dyn Clock>,
    feedback_recheck: Duration,
}

impl PlanManager {
    pub fn new(
        repos: Repositories,
        strategy: Arc<ScheduleStrategy>,
        scheduler: Arc<MetaTaskScheduler>,
        calculators: Arc<ScheduleCalculatorFactory>,
        clock: Arc<dyn Clock>,
        feedback_recheck: Duration,
    ) -> Self {
        Self {
            repos,
            strategy,
            scheduler,
            calculators,
            clock,
            feedback_recheck,
        }
    }

    /// 保存计划及其一个版本，并切换为当前版本
    #[instrument(skip(self, plan, info), fields(plan_id = %plan.id, version = %info.version))]
    pub async fn save_plan(&self, plan: Plan, info: PlanInfo) -> SchedulerResult<()> {
        if info.plan_id != plan.id {
            return Err(SchedulerError::config_error(format!(
                "计划版本 {} 不属于计划 {}",
                info.plan_id, plan.id
            )));
        }
        info.validate()?;
        if info.schedule_option.schedule_type != ScheduleType::None {
            // 提前暴露无法解析的CRON表达式
            self.calculators
                .calculate(&info.schedule_option, None, None, self.clock.now())?;
        }

        if !self.repos.plan.save_info(&info).await? {
            // 已有版本不可变，只允许原样重复保存
            let stored = self
                .repos
                .plan
                .find_info(&info.plan_id, &info.version)
                .await?
                .ok_or_else(|| SchedulerError::PlanInfoNotFound {
                    plan_id: info.plan_id.clone(),
                    version: info.version.clone(),
                })?;
            if !stored.same_content(&info) {
                return Err(SchedulerError::config_error(format!(
                    "计划 {} 的版本 {} 已存在且内容不同，请使用新的版本号",
                    info.plan_id, info.version
                )));
            }
            debug!("计划 {} 的版本 {} 已存在，内容一致", info.plan_id, info.version);
        }
        match self.repos.plan.find_by_id(&plan.id).await? {
            Some(existing) => {
                if existing.current_version != info.version {
                    let affected = self
                        .repos
                        .plan
                        .update_version(&plan.id, &existing.current_version, &info.version)
                        .await?;
                    if affected == 0 {
                        return Err(SchedulerError::internal(format!(
                            "计划 {} 的版本已被并发修改",
                            plan.id
                        )));
                    }
                }
                if existing.enabled != plan.enabled {
                    self.repos
                        .plan
                        .update_enabled(&plan.id, plan.enabled)
                        .await?;
                }
            }
            None => {
                let plan = Plan {
                    current_version: info.version.clone(),
                    ..plan
                };
                self.repos.plan.save(&plan).await?;
            }
        }
        info!("计划 {} 已保存，当前版本: {}", info.plan_id, info.version);
        self.reschedule(&info.plan_id).await
    }

    pub async fn enable_plan(&self, plan_id: &str) -> SchedulerResult<()> {
        self.require_plan(plan_id).await?;
        if self.repos.plan.update_enabled(plan_id, true).await? == 1 {
            info!("计划 {} 已启用", plan_id);
        }
        self.reschedule(plan_id).await
    }

    pub async fn disable_plan(&self, plan_id: &str) -> SchedulerResult<()> {
        self.require_plan(plan_id).await?;
        if self.repos.plan.update_enabled(plan_id, false).await? == 1 {
            info!("计划 {} 已禁用", plan_id);
        }
        self.scheduler.unschedule(&Self::schedule_id(plan_id)).await;
        Ok(())
    }

    /// 立即触发一次，触发类型为 API
    pub async fn trigger_plan(&self, plan_id: &str) -> SchedulerResult<Option<PlanInstance>> {
        self.require_plan(plan_id).await?;
        self.strategy.trigger_plan_manually(plan_id).await
    }

    /// 为所有已启用的计划注册调度元任务，返回注册数量
    pub async fn start(&self) -> SchedulerResult<usize> {
        let plans = self.repos.plan.find_enabled().await?;
        let mut scheduled = 0;
        for plan in plans {
            self.reschedule(&plan.id).await?;
            if self.is_scheduled(&plan.id).await {
                scheduled += 1;
            }
        }
        info!("已为 {} 个计划注册调度", scheduled);
        Ok(scheduled)
    }

    pub async fn is_scheduled(&self, plan_id: &str) -> bool {
        self.scheduler.is_scheduled(&Self::schedule_id(plan_id)).await
    }

    /// 替换计划的调度元任务；禁用或只支持手动触发的计划不注册
    async fn reschedule(&self, plan_id: &str) -> SchedulerResult<()> {
        self.scheduler.unschedule(&Self::schedule_id(plan_id)).await;

        let task = Arc::new(PlanScheduleMetaTask::new(
            plan_id,
            Arc::clone(&self.strategy),
            self.repos.clone(),
            Arc::clone(&self.calculators),
            Arc::clone(&self.clock),
            self.feedback_recheck,
        ));
        task.refresh().await?;
        if task.stopped() {
            debug!("计划 {} 无需周期调度", plan_id);
            return Ok(());
        }
        if let Some(at) = task.schedule_at() {
            self.scheduler.schedule(task).await;
            info!("计划 {} 首次触发时间: {}", plan_id, at);
        }
        Ok(())
    }

    async fn require_plan(&self, plan_id: &str) -> SchedulerResult<Plan> {
        self.repos
            .plan
            .find_by_id(plan_id)
            .await?
            .ok_or_else(|| SchedulerError::PlanNotFound {
                id: plan_id.to_string(),
            })
    }

    fn schedule_id(plan_id: &str) -> String {
        format!("plan-schedule-{plan_id}")
    }
}
