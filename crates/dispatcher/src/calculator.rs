//! 调度时间计算
//!
//! 计算器是纯函数：给定调度配置、上次触发时间、上次反馈时间与当前时间，
//! 返回下次触发时间；`None` 表示暂不触发。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::{ScheduleOption, ScheduleType};

use crate::cron_utils::CronScheduler;

pub trait ScheduleCalculator: Send + Sync {
    fn schedule_type(&self) -> ScheduleType;

    fn can_calculate(&self, option: &ScheduleOption) -> bool {
        option.schedule_type == self.schedule_type()
    }

    fn calculate(
        &self,
        option: &ScheduleOption,
        last_trigger_at: Option<DateTime<Utc>>,
        last_feedback_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>>;
}

/// 首次触发：开始时间加延迟，不早于当前时间
fn first_trigger_at(option: &ScheduleOption, now: DateTime<Utc>) -> DateTime<Utc> {
    option.start_schedule_at().max(now)
}

fn require_interval(option: &ScheduleOption) -> SchedulerResult<chrono::Duration> {
    let interval = option.interval();
    if interval <= chrono::Duration::zero() {
        return Err(SchedulerError::config_error(format!(
            "{} 调度缺少间隔配置",
            option.schedule_type
        )));
    }
    Ok(interval)
}

pub struct FixedRateCalculator;

impl ScheduleCalculator for FixedRateCalculator {
    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::FixedRate
    }

    fn calculate(
        &self,
        option: &ScheduleOption,
        last_trigger_at: Option<DateTime<Utc>>,
        _last_feedback_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let interval = require_interval(option)?;
        let next = match last_trigger_at {
            Some(last) => (last + interval).max(now),
            None => first_trigger_at(option, now),
        };
        Ok(Some(next))
    }
}

pub struct FixedDelayCalculator;

impl ScheduleCalculator for FixedDelayCalculator {
    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::FixedDelay
    }

    fn calculate(
        &self,
        option: &ScheduleOption,
        last_trigger_at: Option<DateTime<Utc>>,
        last_feedback_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let interval = require_interval(option)?;
        match (last_trigger_at, last_feedback_at) {
            (None, None) => Ok(Some(first_trigger_at(option, now))),
            (_, Some(feedback)) => Ok(Some((feedback + interval).max(now))),
            (Some(trigger), None) => {
                debug!("上次触发 {} 尚未反馈，等待执行结束", trigger);
                Ok(None)
            }
        }
    }
}

pub struct CronCalculator;

impl ScheduleCalculator for CronCalculator {
    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::Cron
    }

    fn calculate(
        &self,
        option: &ScheduleOption,
        last_trigger_at: Option<DateTime<Utc>>,
        _last_feedback_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let expression = option
            .schedule_cron
            .as_deref()
            .filter(|expr| !expr.trim().is_empty())
            .ok_or_else(|| SchedulerError::config_error("CRON调度缺少表达式"))?;
        let scheduler = CronScheduler::new(expression, option.schedule_cron_type)?;

        // 开始时间之前不触发，同一时刻不重复触发
        let mut from = now.max(option.start_schedule_at() - chrono::Duration::milliseconds(1));
        if let Some(last) = last_trigger_at {
            from = from.max(last);
        }
        Ok(scheduler.next_execution_time(from))
    }
}

/// 按调度类型选出唯一的计算器
pub struct ScheduleCalculatorFactory {
    calculators: HashMap<ScheduleType, Arc<dyn ScheduleCalculator>>,
}

impl ScheduleCalculatorFactory {
    pub fn new() -> Self {
        let mut factory = Self {
            calculators: HashMap::new(),
        };
        factory.register(Arc::new(FixedRateCalculator));
        factory.register(Arc::new(FixedDelayCalculator));
        factory.register(Arc::new(CronCalculator));
        factory
    }

    pub fn register(&mut self, calculator: Arc<dyn ScheduleCalculator>) {
        self.calculators
            .insert(calculator.schedule_type(), calculator);
    }

    pub fn calculator(&self, option: &ScheduleOption) -> SchedulerResult<Arc<dyn ScheduleCalculator>> {
        self.calculators
            .get(&option.schedule_type)
            .filter(|c| c.can_calculate(option))
            .cloned()
            .ok_or_else(|| {
                SchedulerError::config_error(format!(
                    "没有支持调度类型 {} 的计算器",
                    option.schedule_type
                ))
            })
    }

    pub fn calculate(
        &self,
        option: &ScheduleOption,
        last_trigger_at: Option<DateTime<Utc>>,
        last_feedback_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        self.calculator(option)?
            .calculate(option, last_trigger_at, last_feedback_at, now)
    }
}

impl Default for ScheduleCalculatorFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use jobflow_domain::CronType;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_fixed_rate_first_fire() {
        let option = ScheduleOption::fixed_rate(t0(), Duration::seconds(10))
            .with_delay(Duration::seconds(5));
        let calc = FixedRateCalculator;

        let before_start = t0() - Duration::seconds(30);
        assert_eq!(
            calc.calculate(&option, None, None, before_start).unwrap(),
            Some(t0() + Duration::seconds(5))
        );

        let after_start = t0() + Duration::minutes(1);
        assert_eq!(
            calc.calculate(&option, None, None, after_start).unwrap(),
            Some(after_start)
        );
    }

    #[test]
    fn test_fixed_rate_never_before_last_plus_interval_or_now() {
        let option = ScheduleOption::fixed_rate(t0(), Duration::seconds(10));
        let calc = FixedRateCalculator;
        let last = t0() + Duration::seconds(100);

        for offset in [0, 5, 10, 50, 500] {
            let now = last + Duration::seconds(offset);
            let next = calc
                .calculate(&option, Some(last), None, now)
                .unwrap()
                .unwrap();
            assert!(next >= last + Duration::seconds(10));
            assert!(next >= now);
        }
    }

    #[test]
    fn test_fixed_delay_waits_for_feedback() {
        let option = ScheduleOption::fixed_delay(t0(), Duration::seconds(10));
        let calc = FixedDelayCalculator;
        let trigger = t0() + Duration::seconds(20);

        assert_eq!(
            calc.calculate(&option, Some(trigger), None, trigger + Duration::seconds(1))
                .unwrap(),
            None
        );

        let feedback = trigger + Duration::seconds(3);
        assert_eq!(
            calc.calculate(&option, Some(trigger), Some(feedback), feedback)
                .unwrap(),
            Some(feedback + Duration::seconds(10))
        );

        let late = feedback + Duration::seconds(60);
        assert_eq!(
            calc.calculate(&option, Some(trigger), Some(feedback), late)
                .unwrap(),
            Some(late)
        );
    }

    #[test]
    fn test_fixed_delay_first_fire_like_fixed_rate() {
        let option = ScheduleOption::fixed_delay(t0(), Duration::seconds(10))
            .with_delay(Duration::seconds(2));
        let rate = ScheduleOption::fixed_rate(t0(), Duration::seconds(10))
            .with_delay(Duration::seconds(2));
        let now = t0() - Duration::seconds(1);
        assert_eq!(
            FixedDelayCalculator
                .calculate(&option, None, None, now)
                .unwrap(),
            FixedRateCalculator
                .calculate(&rate, None, None, now)
                .unwrap()
        );
    }

    #[test]
    fn test_missing_interval_is_fatal() {
        let option = ScheduleOption::fixed_rate(t0(), Duration::zero());
        let err = FixedRateCalculator
            .calculate(&option, None, None, t0())
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_cron_next_fire() {
        let option = ScheduleOption::cron(t0(), "0 0 * * * ?", CronType::Quartz);
        let now = t0() + Duration::minutes(30);
        assert_eq!(
            CronCalculator.calculate(&option, None, None, now).unwrap(),
            Some(t0() + Duration::hours(1))
        );

        // 已在 01:00 触发过，不重复
        let last = t0() + Duration::hours(1);
        assert_eq!(
            CronCalculator
                .calculate(&option, Some(last), None, last)
                .unwrap(),
            Some(t0() + Duration::hours(2))
        );
    }

    #[test]
    fn test_cron_unix_dialect() {
        // 2024-01-01 是周一，Unix下周一为1
        let option = ScheduleOption::cron(t0(), "30 9 * * 1", CronType::Unix);
        let next = CronCalculator
            .calculate(&option, None, None, t0())
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).unwrap());
    }

    #[test]
    fn test_invalid_cron_is_fatal() {
        let option = ScheduleOption::cron(t0(), "not a cron", CronType::Quartz);
        let err = CronCalculator
            .calculate(&option, None, None, t0())
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_factory_selects_by_type() {
        let factory = ScheduleCalculatorFactory::new();
        let option = ScheduleOption::fixed_rate(t0(), Duration::seconds(1));
        assert_eq!(
            factory.calculator(&option).unwrap().schedule_type(),
            ScheduleType::FixedRate
        );

        let none = ScheduleOption::none(t0());
        assert!(matches!(factory.calculator(&none), Err(e) if e.is_fatal()));
    }
}
