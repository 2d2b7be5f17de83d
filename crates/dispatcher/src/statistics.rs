use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use jobflow_domain::WorkerStatistics;

/// 下发记录，LFU/LRU 策略据此选择worker
pub struct DispatchStatistics {
    records: RwLock<HashMap<String, VecDeque<DateTime<Utc>>>>,
    /// 超出窗口的记录在写入时清理
    retention: Duration,
}

impl DispatchStatistics {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub async fn record_dispatch(&self, worker_id: &str, at: DateTime<Utc>) {
        let mut records = self.records.write().await;
        let history = records.entry(worker_id.to_string()).or_default();
        history.push_back(at);
        while history
            .front()
            .is_some_and(|first| at - *first > self.retention)
        {
            history.pop_front();
        }
    }

    /// 指定worker在 [now - window, now] 内的统计，没有记录的worker计为0次
    pub async fn statistics(
        &self,
        worker_ids: &[&str],
        window: Duration,
        now: DateTime<Utc>,
    ) -> Vec<WorkerStatistics> {
        let records = self.records.read().await;
        let since = now - window;
        worker_ids
            .iter()
            .map(|worker_id| {
                let history = records.get(*worker_id);
                WorkerStatistics {
                    worker_id: worker_id.to_string(),
                    dispatch_times: history
                        .map(|h| h.iter().filter(|at| **at >= since).count() as u64)
                        .unwrap_or(0),
                    latest_dispatch_at: history.and_then(|h| h.back().copied()),
                }
            })
            .collect()
    }

    pub async fn remove_worker(&self, worker_id: &str) {
        self.records.write().await.remove(worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_window_counts() {
        let stats = DispatchStatistics::new(Duration::minutes(10));
        let now = Utc::now();
        stats.record_dispatch("w1", now - Duration::minutes(20)).await;
        stats.record_dispatch("w1", now - Duration::minutes(1)).await;
        stats.record_dispatch("w1", now).await;
        stats.record_dispatch("w2", now - Duration::minutes(5)).await;

        let result = stats
            .statistics(&["w1", "w2", "w3"], Duration::minutes(10), now)
            .await;
        assert_eq!(result[0].dispatch_times, 2);
        assert_eq!(result[0].latest_dispatch_at, Some(now));
        assert_eq!(result[1].dispatch_times, 1);
        assert_eq!(result[2].dispatch_times, 0);
        assert_eq!(result[2].latest_dispatch_at, None);
    }
}
