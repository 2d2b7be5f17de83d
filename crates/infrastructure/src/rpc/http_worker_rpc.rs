//! broker到worker的HTTP传输

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::{Task, Worker, WorkerMetric, WorkerRpc, WorkerRpcFactory};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct SendTaskResponse {
    accepted: bool,
}

pub struct HttpWorkerRpc {
    worker_id: String,
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpWorkerRpc {
    pub fn new(worker_id: String, base_url: String, http_client: reqwest::Client) -> Self {
        Self {
            worker_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/worker/v1/{}", self.base_url, path)
    }

    async fn check_status(response: reqwest::Response) -> SchedulerResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(SchedulerError::transport(format!("HTTP {status} - {body}")))
    }
}

#[async_trait]
impl WorkerRpc for HttpWorkerRpc {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn ping(&self) -> SchedulerResult<WorkerMetric> {
        let response = self
            .http_client
            .get(self.url("ping"))
            .send()
            .await
            .map_err(|e| SchedulerError::transport(format!("探测worker {} 失败: {e}", self.worker_id)))?;
        let response = Self::check_status(response).await?;
        response
            .json::<WorkerMetric>()
            .await
            .map_err(|e| SchedulerError::transport(format!("解析worker指标失败: {e}")))
    }

    async fn send_task(&self, task: &Task) -> SchedulerResult<bool> {
        debug!("向worker {} 下发任务 {}", self.worker_id, task.id);
        let response = self
            .http_client
            .post(self.url("tasks"))
            .json(task)
            .send()
            .await
            .map_err(|e| SchedulerError::transport(format!("下发任务到 {} 失败: {e}", self.worker_id)))?;
        let response = Self::check_status(response).await?;
        let reply = response
            .json::<SendTaskResponse>()
            .await
            .map_err(|e| SchedulerError::transport(format!("解析下发响应失败: {e}")))?;
        Ok(reply.accepted)
    }

    async fn unregister(&self) -> SchedulerResult<()> {
        let response = self
            .http_client
            .post(self.url("unregister"))
            .send()
            .await
            .map_err(|e| SchedulerError::transport(format!("通知worker {} 下线失败: {e}", self.worker_id)))?;
        if let Err(e) = Self::check_status(response).await {
            warn!("worker {} 下线通知未成功: {}", self.worker_id, e);
        }
        Ok(())
    }
}

/// 按worker的 rpc_address 创建HTTP客户端，共享一个连接池
pub struct HttpWorkerRpcFactory {
    http_client: reqwest::Client,
}

impl HttpWorkerRpcFactory {
    pub fn new(request_timeout: Duration) -> SchedulerResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SchedulerError::internal(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { http_client })
    }
}

impl WorkerRpcFactory for HttpWorkerRpcFactory {
    fn create(&self, worker: &Worker) -> SchedulerResult<Arc<dyn WorkerRpc>> {
        if !worker.rpc_address.starts_with("http://") && !worker.rpc_address.starts_with("https://") {
            return Err(SchedulerError::config_error(format!(
                "worker {} 的地址不是HTTP地址: {}",
                worker.id, worker.rpc_address
            )));
        }
        Ok(Arc::new(HttpWorkerRpc::new(
            worker.id.clone(),
            worker.rpc_address.clone(),
            self.http_client.clone(),
        )))
    }
}
