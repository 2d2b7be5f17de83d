use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::{string_enum, DispatchOption};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Running,
    /// 心跳超时，暂不参与选择
    Fusing,
    Terminated,
}

string_enum!(WorkerStatus {
    Running => "RUNNING",
    Fusing => "FUSING",
    Terminated => "TERMINATED",
});

/// worker心跳上报的资源指标
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerMetric {
    pub available_cpu: f32,
    /// 可用内存，字节
    pub available_ram: u64,
    /// 任务队列剩余可排队数
    pub available_queue_limit: u32,
    pub executing_tasks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    /// 传输层地址，HTTP传输为 base url
    pub rpc_address: String,
    pub executors: Vec<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub status: WorkerStatus,
    pub metric: WorkerMetric,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Worker {
    pub fn is_alive(&self) -> bool {
        self.status == WorkerStatus::Running
    }

    pub fn supports_executor(&self, executor_name: &str) -> bool {
        self.executors.iter().any(|e| e == executor_name)
    }

    /// 资源是否满足作业的下发要求
    pub fn meets_requirement(&self, option: &DispatchOption) -> bool {
        if option.cpu_requirement > 0.0 && self.metric.available_cpu < option.cpu_requirement {
            return false;
        }
        if option.ram_requirement > 0 && self.metric.available_ram < option.ram_requirement {
            return false;
        }
        true
    }

    pub fn heartbeat_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat_at > timeout
    }
}

/// 下发统计，供LFU/LRU策略使用
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerStatistics {
    pub worker_id: String,
    /// 统计窗口内的下发次数
    pub dispatch_times: u64,
    pub latest_dispatch_at: Option<DateTime<Utc>>,
}
