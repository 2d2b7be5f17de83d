use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broker端调度与下发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub enabled: bool,
    /// 时间轮刻度（毫秒）
    pub timer_tick_ms: u64,
    /// 时间轮槽位数
    pub timer_wheel_size: usize,
    /// 下发线程池并发数
    pub dispatch_concurrency: usize,
    /// 下发队列容量，满时直接拒绝
    pub dispatch_queue_size: usize,
    /// 单次下发最多尝试的worker数
    pub dispatch_max_attempts: usize,
    /// 固定延迟计划等待反馈时的复查间隔（毫秒）
    pub feedback_recheck_ms: u64,
    /// 心跳超时时间（秒）
    pub heartbeat_timeout_seconds: i64,
    /// 心跳过期检测间隔（秒）
    pub heartbeat_check_interval_seconds: u64,
    /// LFU统计窗口（秒）
    pub lfu_interval_seconds: i64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timer_tick_ms: 100,
            timer_wheel_size: 512,
            dispatch_concurrency: 8,
            dispatch_queue_size: 1024,
            dispatch_max_attempts: 3,
            feedback_recheck_ms: 1000,
            heartbeat_timeout_seconds: 90,
            heartbeat_check_interval_seconds: 30,
            lfu_interval_seconds: 600,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timer_tick_ms == 0 {
            return Err(anyhow::anyhow!("时间轮刻度必须大于0"));
        }

        if self.timer_wheel_size == 0 {
            return Err(anyhow::anyhow!("时间轮槽位数必须大于0"));
        }

        if self.dispatch_concurrency == 0 {
            return Err(anyhow::anyhow!("下发并发数必须大于0"));
        }

        if self.dispatch_queue_size == 0 {
            return Err(anyhow::anyhow!("下发队列容量必须大于0"));
        }

        if self.dispatch_max_attempts == 0 {
            return Err(anyhow::anyhow!("下发尝试次数必须大于0"));
        }

        if self.heartbeat_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("心跳超时时间必须大于0"));
        }

        if self.heartbeat_check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳检测间隔必须大于0"));
        }

        if self.lfu_interval_seconds <= 0 {
            return Err(anyhow::anyhow!("LFU统计窗口必须大于0"));
        }

        Ok(())
    }

    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms)
    }

    pub fn feedback_recheck(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.feedback_recheck_ms as i64)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_seconds)
    }
}

/// Worker端执行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 为空时按主机名生成
    pub worker_id: String,
    pub executors: Vec<String>,
    /// 同时执行的任务数
    pub concurrency: usize,
    /// 等待执行的任务队列容量
    pub queue_size: usize,
    pub heartbeat_interval_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: String::new(),
            executors: vec!["shell".to_string(), "echo".to_string()],
            concurrency: 4,
            queue_size: 64,
            heartbeat_interval_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.executors.is_empty() {
            return Err(anyhow::anyhow!("至少需要配置一个执行器"));
        }

        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("Worker并发数必须大于0"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        Ok(())
    }

    /// 配置的worker_id，未配置时使用 主机名-随机串
    pub fn resolve_worker_id(&self) -> String {
        if !self.worker_id.is_empty() {
            return self.worker_id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "worker".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{host}-{}", &suffix[..8])
    }
}
