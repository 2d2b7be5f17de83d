use std::collections::HashMap;
use std::sync::Arc;

use jobflow_core::{SchedulerError, SchedulerResult};

use crate::executors::{EchoExecutor, ShellExecutor, TaskExecutor};

/// 按名称查找执行器，启动后只读
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置的 shell 与 echo 执行器
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellExecutor));
        registry.register(Arc::new(EchoExecutor));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    /// 只保留配置中启用的执行器，配置了未知执行器时报错
    pub fn restrict_to(&self, enabled: &[String]) -> SchedulerResult<Self> {
        let mut restricted = Self::new();
        for name in enabled {
            let executor = self.get(name).ok_or_else(|| {
                SchedulerError::config_error(format!("未知的执行器: {name}"))
            })?;
            restricted.register(executor);
        }
        Ok(restricted)
    }
}
