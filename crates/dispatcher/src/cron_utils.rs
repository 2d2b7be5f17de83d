use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::CronType;

/// CRON表达式解析，支持Quartz与Unix两种方言
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    pub fn new(cron_expr: &str, cron_type: CronType) -> SchedulerResult<Self> {
        let normalized = Self::normalize(cron_expr, cron_type)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { schedule })
    }

    /// 严格晚于 from 的下一次触发时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 转换为 cron crate 接受的 `秒 分 时 日 月 周 [年]` 格式，周日为1
    fn normalize(cron_expr: &str, cron_type: CronType) -> SchedulerResult<String> {
        let fields: Vec<&str> = cron_expr.split_whitespace().collect();
        let invalid = |message: &str| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: message.to_string(),
        };

        match cron_type {
            CronType::Quartz => {
                if fields.len() != 6 && fields.len() != 7 {
                    return Err(invalid("Quartz表达式需要6或7个字段"));
                }
                Ok(fields
                    .iter()
                    .map(|f| if *f == "?" { "*" } else { f })
                    .collect::<Vec<_>>()
                    .join(" "))
            }
            CronType::Unix => {
                if fields.len() != 5 {
                    return Err(invalid("Unix表达式需要5个字段"));
                }
                let day_of_week = shift_day_of_week(fields[4]);
                Ok(format!(
                    "0 {} {} {} {} {}",
                    fields[0], fields[1], fields[2], fields[3], day_of_week
                ))
            }
        }
    }
}

/// Unix的周字段 0-6（7也表示周日）平移到 1-7，步长不变
fn shift_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (item, None),
            };
            let shifted = match base.split_once('-') {
                Some((start, end)) => format!("{}-{}", shift_day(start), shift_day(end)),
                None => shift_day(base),
            };
            match step {
                Some(step) => format!("{shifted}/{step}"),
                None => shifted,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_day(value: &str) -> String {
    match value.parse::<u32>() {
        Ok(7) => "1".to_string(),
        Ok(day) => (day + 1).to_string(),
        Err(_) => value.to_string(),
    }
}
