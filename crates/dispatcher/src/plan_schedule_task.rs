use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use jobflow_core::{Clock, SchedulerError, SchedulerResult};
use jobflow_domain::{ScheduleType, TriggerType};

use crate::calculator::ScheduleCalculatorFactory;
use crate::meta_task::{MetaTask, NextFireTime};
use crate::schedule_strategy::{truncate_millis, Repositories, ScheduleStrategy};

/// 计划的周期触发
///
/// 每次执行后根据最近一次计划实例的触发时间与反馈时间计算下次触发。
/// 固定延迟计划在上次运行尚未反馈时，按复查间隔空转等待。
pub struct PlanScheduleMetaTask {
    plan_id: String,
    strategy: Arc<ScheduleStrategy>,
    repos: Repositories,
    calculators: Arc<ScheduleCalculatorFactory>,
    clock: Arc<dyn Clock>,
    feedback_recheck: Duration,
    next: NextFireTime,
    /// 本次触发只是复查反馈，不生成计划实例
    recheck: AtomicBool,
    stopped: AtomicBool,
}

impl PlanScheduleMetaTask {
    pub fn new(
        plan_id: &str,
        strategy: Arc<ScheduleStrategy>,
        repos: Repositories,
        calculators: Arc<ScheduleCalculatorFactory>,
        clock: Arc<dyn Clock>,
        feedback_recheck: Duration,
    ) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            strategy,
            repos,
            calculators,
            clock,
            feedback_recheck,
            next: NextFireTime::new(None),
            recheck: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn is_recheck(&self) -> bool {
        self.recheck.load(Ordering::SeqCst)
    }

    /// 重新计算下次触发时间；计划不存在、已禁用或不再需要触发时停止
    pub async fn refresh(&self) -> SchedulerResult<()> {
        let now = self.clock.now();
        let Some(plan) = self.repos.plan.find_by_id(&self.plan_id).await? else {
            info!("计划 {} 已不存在，停止调度", self.plan_id);
            self.stop();
            return Ok(());
        };
        if !plan.enabled {
            info!("计划 {} 已禁用，停止调度", self.plan_id);
            self.stop();
            return Ok(());
        }

        let snapshot = self
            .strategy
            .load_snapshot(&plan.id, &plan.current_version)
            .await?;
        let option = &snapshot.info.schedule_option;
        if option.schedule_type == ScheduleType::None {
            debug!("计划 {} 只支持手动触发", self.plan_id);
            self.stop();
            return Ok(());
        }

        let latest = self.repos.plan_instance.find_latest(&plan.id).await?;
        let last_trigger_at = latest.as_ref().map(|i| i.trigger_at);
        let last_feedback_at = latest.as_ref().and_then(|i| i.feedback_at);

        match self
            .calculators
            .calculate(option, last_trigger_at, last_feedback_at, now)?
        {
            Some(at) => {
                self.recheck.store(false, Ordering::SeqCst);
                self.next.set(Some(truncate_millis(at)));
                debug!("计划 {} 下次触发时间: {}", self.plan_id, at);
            }
            None if option.schedule_type == ScheduleType::FixedDelay => {
                self.recheck.store(true, Ordering::SeqCst);
                self.next.set(Some(now + self.feedback_recheck));
                debug!("计划 {} 等待上次运行反馈", self.plan_id);
            }
            None => {
                info!("计划 {} 没有后续触发时间，停止调度", self.plan_id);
                self.stop();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MetaTask for PlanScheduleMetaTask {
    fn schedule_id(&self) -> String {
        format!("plan-schedule-{}", self.plan_id)
    }

    fn task_kind(&self) -> &'static str {
        "plan_schedule"
    }

    fn schedule_at(&self) -> Option<DateTime<Utc>> {
        self.next.get()
    }

    async fn execute(&self) -> SchedulerResult<()> {
        if self.is_recheck() {
            return Ok(());
        }
        let Some(trigger_at) = self.next.get() else {
            return Ok(());
        };

        let enabled = self
            .repos
            .plan
            .find_by_id(&self.plan_id)
            .await?
            .is_some_and(|p| p.enabled);
        if !enabled {
            self.stop();
            return Ok(());
        }

        self.strategy
            .schedule_plan(&self.plan_id, trigger_at, TriggerType::Schedule)
            .await
            .map(|_| ())
    }

    async fn after_execute(&self, error: Option<&SchedulerError>) {
        if self.stopped() {
            return;
        }
        if let Some(e) = error {
            if e.is_fatal() {
                error!("计划 {} 触发失败且无法恢复，停止调度: {}", self.plan_id, e);
                self.stop();
                return;
            }
            // 触发失败后按复查间隔退避，不在每个tick上重试
            warn!("计划 {} 触发失败，稍后重试: {}", self.plan_id, e);
            self.recheck.store(true, Ordering::SeqCst);
            self.next
                .set(Some(self.clock.now() + self.feedback_recheck));
            return;
        }
        if let Err(e) = self.refresh().await {
            if e.is_fatal() {
                error!("计划 {} 调度配置错误，停止调度: {}", self.plan_id, e);
                self.stop();
            } else {
                warn!("计划 {} 计算下次触发失败，稍后重试: {}", self.plan_id, e);
                self.recheck.store(true, Ordering::SeqCst);
                self.next
                    .set(Some(self.clock.now() + self.feedback_recheck));
            }
        }
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.next.set(None);
    }
}
