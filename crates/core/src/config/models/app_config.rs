use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    broker_worker::{BrokerConfig, WorkerConfig},
    database::DatabaseConfig,
    observability::ObservabilityConfig,
};

/// 嵌入式模式：broker与若干worker运行在同一进程
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedConfig {
    pub worker_count: usize,
    /// 启动时加载的计划定义文件（JSON）
    pub plans_file: Option<String>,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            plans_file: None,
        }
    }
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
    pub embedded: EmbeddedConfig,
}

impl AppConfig {
    /// 加载顺序：默认值 -> TOML配置文件 -> 环境变量（前缀 JOBFLOW，分隔符 `__`）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/jobflow.toml", "jobflow.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("JOBFLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate().context("Broker配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.database.validate().context("数据库配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        if self.embedded.worker_count == 0 && self.worker.enabled {
            return Err(anyhow::anyhow!("嵌入式模式下worker数量必须大于0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreType;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.database.store, StoreType::Memory);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            [broker]
            timer_tick_ms = 50
            dispatch_max_attempts = 5

            [database]
            store = "sqlite"
            url = "sqlite://jobflow.db"
        "#;

        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.broker.timer_tick_ms, 50);
        assert_eq!(config.broker.dispatch_max_attempts, 5);
        assert_eq!(config.broker.timer_wheel_size, 512);
        assert_eq!(config.database.store, StoreType::Sqlite);
        assert_eq!(config.worker.concurrency, 4);
    }

    #[test]
    fn test_invalid_log_format_rejected() {
        let toml_str = r#"
            [observability]
            log_format = "xml"
        "#;
        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.broker.dispatch_queue_size, config.broker.dispatch_queue_size);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [worker]
            worker_id = "worker-file"
            concurrency = 2

            [embedded]
            worker_count = 3
            "#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.worker.worker_id, "worker-file");
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.embedded.worker_count, 3);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/jobflow.toml")).is_err());
    }
}
