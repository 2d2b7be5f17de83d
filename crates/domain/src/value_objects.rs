use chrono::{DateTime, Duration, Utc};
use jobflow_core::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};

/// 为枚举生成 as_str / FromStr，字符串与serde的序列化名一致
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = jobflow_core::SchedulerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(jobflow_core::SchedulerError::Serialization(format!(
                        "无效的{}: {s}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

pub(crate) use string_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleType {
    /// 不自动调度，只能手动触发
    None,
    FixedRate,
    FixedDelay,
    Cron,
}

string_enum!(ScheduleType {
    None => "NONE",
    FixedRate => "FIXED_RATE",
    FixedDelay => "FIXED_DELAY",
    Cron => "CRON",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CronType {
    /// 秒 分 时 日 月 周 [年]，支持 `?`
    #[default]
    Quartz,
    /// 分 时 日 月 周，周日为0
    Unix,
}

string_enum!(CronType {
    Quartz => "QUARTZ",
    Unix => "UNIX",
});

/// 计划的调度配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOption {
    pub schedule_type: ScheduleType,
    pub schedule_start_at: DateTime<Utc>,
    /// 首次触发相对开始时间的延迟（毫秒）
    #[serde(default)]
    pub schedule_delay_ms: u64,
    /// FIXED_RATE / FIXED_DELAY 的间隔（毫秒）
    #[serde(default)]
    pub schedule_interval_ms: u64,
    #[serde(default)]
    pub schedule_cron: Option<String>,
    #[serde(default)]
    pub schedule_cron_type: CronType,
}

impl ScheduleOption {
    pub fn none(start_at: DateTime<Utc>) -> Self {
        Self {
            schedule_type: ScheduleType::None,
            schedule_start_at: start_at,
            schedule_delay_ms: 0,
            schedule_interval_ms: 0,
            schedule_cron: None,
            schedule_cron_type: CronType::Quartz,
        }
    }

    pub fn fixed_rate(start_at: DateTime<Utc>, interval: Duration) -> Self {
        Self {
            schedule_type: ScheduleType::FixedRate,
            schedule_interval_ms: interval.num_milliseconds().max(0) as u64,
            ..Self::none(start_at)
        }
    }

    pub fn fixed_delay(start_at: DateTime<Utc>, interval: Duration) -> Self {
        Self {
            schedule_type: ScheduleType::FixedDelay,
            schedule_interval_ms: interval.num_milliseconds().max(0) as u64,
            ..Self::none(start_at)
        }
    }

    pub fn cron(start_at: DateTime<Utc>, expression: &str, cron_type: CronType) -> Self {
        Self {
            schedule_type: ScheduleType::Cron,
            schedule_cron: Some(expression.to_string()),
            schedule_cron_type: cron_type,
            ..Self::none(start_at)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.schedule_delay_ms = delay.num_milliseconds().max(0) as u64;
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::milliseconds(self.schedule_delay_ms as i64)
    }

    pub fn interval(&self) -> Duration {
        Duration::milliseconds(self.schedule_interval_ms as i64)
    }

    /// 首次可触发时间 = 开始时间 + 延迟
    pub fn start_schedule_at(&self) -> DateTime<Utc> {
        self.schedule_start_at + self.delay()
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        match self.schedule_type {
            ScheduleType::FixedRate | ScheduleType::FixedDelay => {
                if self.schedule_interval_ms == 0 {
                    return Err(SchedulerError::config_error(format!(
                        "{}调度必须配置大于0的间隔",
                        self.schedule_type
                    )));
                }
            }
            ScheduleType::Cron => {
                let blank = self
                    .schedule_cron
                    .as_deref()
                    .map(|c| c.trim().is_empty())
                    .unwrap_or(true);
                if blank {
                    return Err(SchedulerError::config_error("CRON调度必须配置表达式"));
                }
            }
            ScheduleType::None => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalanceType {
    #[default]
    RoundRobin,
    Random,
    LeastFrequentlyUsed,
    LeastRecentlyUsed,
    ConsistentHash,
    Appoint,
}

string_enum!(LoadBalanceType {
    RoundRobin => "ROUND_ROBIN",
    Random => "RANDOM",
    LeastFrequentlyUsed => "LEAST_FREQUENTLY_USED",
    LeastRecentlyUsed => "LEAST_RECENTLY_USED",
    ConsistentHash => "CONSISTENT_HASH",
    Appoint => "APPOINT",
});

/// 作业下发配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchOption {
    pub load_balance_type: LoadBalanceType,
    /// 需要的CPU核数，0表示不限制
    pub cpu_requirement: f32,
    /// 需要的内存字节数，0表示不限制
    pub ram_requirement: u64,
}

impl DispatchOption {
    pub fn with_load_balance(load_balance_type: LoadBalanceType) -> Self {
        Self {
            load_balance_type,
            ..Default::default()
        }
    }
}

/// 作业失败后的重试配置
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOption {
    /// 最多重新触发的次数
    pub retry: u32,
    pub retry_interval_ms: u64,
}

impl RetryOption {
    pub fn new(retry: u32, retry_interval: Duration) -> Self {
        Self {
            retry,
            retry_interval_ms: retry_interval.num_milliseconds().max(0) as u64,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::milliseconds(self.retry_interval_ms as i64)
    }

    /// 第 attempt 次执行（从0开始）失败后是否还能重试
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.retry
    }
}
