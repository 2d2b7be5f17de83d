use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("不支持的作业阶段组合: job_type={job_type}, task_type={task_type}")]
    UnsupportedStage { job_type: String, task_type: String },

    #[error("检测到循环依赖: {0}")]
    CyclicGraph(String),

    #[error("无效的DAG: {0}")]
    InvalidDag(String),

    #[error("计划未找到: {id}")]
    PlanNotFound { id: String },

    #[error("计划版本未找到: plan_id={plan_id}, version={version}")]
    PlanInfoNotFound { plan_id: String, version: String },

    #[error("计划实例未找到: {id}")]
    PlanInstanceNotFound { id: String },

    #[error("作业实例未找到: {id}")]
    JobInstanceNotFound { id: String },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },

    #[error("任务下发失败: {0}")]
    DispatchFailed(String),

    #[error("网络传输错误: {0}")]
    Transport(String),

    #[error("资源耗尽: {0}")]
    ResourceExhausted(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// 配置类错误不可重试，需要人工介入
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Configuration(_)
                | SchedulerError::InvalidCron { .. }
                | SchedulerError::UnsupportedStage { .. }
                | SchedulerError::CyclicGraph(_)
                | SchedulerError::InvalidDag(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Transport(_)
                | SchedulerError::Timeout(_)
                | SchedulerError::Database(_)
                | SchedulerError::ResourceExhausted(_)
        )
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        SchedulerError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for SchedulerError {
    fn from(err: config::ConfigError) -> Self {
        SchedulerError::Configuration(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors_are_not_retryable() {
        let err = SchedulerError::UnsupportedStage {
            job_type: "NORMAL".to_string(),
            task_type: "MAP".to_string(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());

        let err = SchedulerError::InvalidCron {
            expr: "bad".to_string(),
            message: "parse".to_string(),
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn test_transport_error_is_retryable() {
        let err = SchedulerError::transport("connection refused");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "网络传输错误: connection refused");
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: SchedulerError = parse_err.into();
        assert!(matches!(err, SchedulerError::Serialization(_)));
    }
}
