use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

use jobflow_core::AppConfig;

use crate::embedded::EmbeddedApplication;
use crate::shutdown::ShutdownManager;

/// 进程级应用：指标导出与嵌入式broker/worker的生命周期
pub struct Application {
    embedded: EmbeddedApplication,
    drain_timeout: Duration,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        if config.observability.metrics_enabled {
            install_metrics_exporter(&config.observability.metrics_bind_address)?;
        }
        let embedded = EmbeddedApplication::new(config).await?;
        Ok(Self {
            embedded,
            drain_timeout: Duration::from_secs(30),
        })
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn embedded(&self) -> &EmbeddedApplication {
        &self.embedded
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, shutdown: &ShutdownManager) -> Result<()> {
        let mut shutdown_rx = shutdown.subscribe();
        let handles = self.embedded.start(shutdown.sender()).await?;

        let _ = shutdown_rx.recv().await;
        info!("开始停止应用");

        self.embedded.stop(self.drain_timeout).await;
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("后台任务异常退出: {e}");
            }
        }
        Ok(())
    }
}

fn install_metrics_exporter(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("启动Prometheus指标导出失败")?;
    info!("Prometheus指标导出监听于 {}", addr);
    Ok(())
}
