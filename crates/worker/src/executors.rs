use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::{Attributes, Task, TaskResult, TaskType};

/// 在worker上执行某一类任务
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 注册名，与作业的 executor_name 对应
    fn name(&self) -> &str;

    async fn execute(&self, task: &Task) -> SchedulerResult<TaskResult>;
}

/// 回显执行器
///
/// 普通任务原样返回作业属性；分片任务按 `shards` 属性拆出子任务；
/// 汇总任务返回MAP结果的个数。
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

impl EchoExecutor {
    pub const NAME: &'static str = "echo";
}

#[async_trait]
impl TaskExecutor for EchoExecutor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, task: &Task) -> SchedulerResult<TaskResult> {
        if let Some(fail) = task.job_attributes.get("fail").and_then(Value::as_str) {
            return Err(SchedulerError::TaskExecution(fail.to_string()));
        }

        let result = match task.task_type {
            TaskType::Sharding => {
                let shards = task
                    .job_attributes
                    .get("shards")
                    .and_then(Value::as_u64)
                    .unwrap_or(1);
                let sub_tasks = (0..shards)
                    .map(|index| Attributes::from([("shard".to_string(), json!(index))]))
                    .collect();
                TaskResult::with_sub_tasks(sub_tasks)
            }
            TaskType::Map => {
                TaskResult::with_attributes(task.map_attributes.clone().unwrap_or_default())
            }
            TaskType::Reduce => TaskResult::with_attributes(Attributes::from([(
                "reduced".to_string(),
                json!(task.reduce_attributes.len()),
            )])),
            TaskType::Standalone | TaskType::Broadcast => {
                TaskResult::with_attributes(task.job_attributes.clone())
            }
        };
        debug!("echo 执行完成: {}", task.entity_description());
        Ok(result)
    }
}

/// Shell任务参数，取自作业属性
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellTaskParams {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
}

impl ShellTaskParams {
    pub fn from_task(task: &Task) -> SchedulerResult<Self> {
        let value = Value::Object(task.job_attributes.clone().into_iter().collect());
        let params: ShellTaskParams = serde_json::from_value(value)?;
        if params.command.trim().is_empty() {
            return Err(SchedulerError::TaskExecution(format!(
                "任务 {} 缺少 command 属性",
                task.id
            )));
        }
        Ok(params)
    }
}

/// 通过 `sh -c` 执行命令
///
/// 任务上下文以环境变量传入：`JOBFLOW_TASK_ID`、`JOBFLOW_TASK_TYPE`，
/// 以及JSON编码的 `JOBFLOW_MAP_ATTRIBUTES`、`JOBFLOW_REDUCE_ATTRIBUTES`。
/// 分片任务的标准输出每行是一个子任务，能解析为JSON对象时按对象使用。
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub const NAME: &'static str = "shell";

    fn sub_tasks(stdout: &str) -> Vec<Attributes> {
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(map)) => map.into_iter().collect(),
                _ => Attributes::from([("line".to_string(), json!(line))]),
            })
            .collect()
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, task: &Task) -> SchedulerResult<TaskResult> {
        let params = ShellTaskParams::from_task(task)?;
        let start = Instant::now();
        info!("执行Shell任务 {}: {}", task.id, params.command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&params.command)
            .arg("sh")
            .args(&params.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("JOBFLOW_TASK_ID", &task.id)
            .env("JOBFLOW_TASK_TYPE", task.task_type.as_str());
        if let Some(map_attributes) = &task.map_attributes {
            cmd.env("JOBFLOW_MAP_ATTRIBUTES", serde_json::to_string(map_attributes)?);
        }
        if !task.reduce_attributes.is_empty() {
            cmd.env(
                "JOBFLOW_REDUCE_ATTRIBUTES",
                serde_json::to_string(&task.reduce_attributes)?,
            );
        }
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&params.env);

        let child = cmd
            .spawn()
            .map_err(|e| SchedulerError::TaskExecution(format!("启动Shell命令失败: {e}")))?;
        let output = match params.timeout_ms {
            Some(timeout_ms) => {
                tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output())
                    .await
                    .map_err(|_| {
                        SchedulerError::Timeout(format!(
                            "Shell任务 {} 超过 {}ms 未结束",
                            task.id, timeout_ms
                        ))
                    })?
            }
            None => child.wait_with_output().await,
        }
        .map_err(|e| SchedulerError::TaskExecution(format!("等待进程结束失败: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if !output.status.success() {
            let code = output.status.code();
            warn!("Shell任务 {} 失败，退出码: {:?}", task.id, code);
            let detail = if stderr.is_empty() {
                format!("命令执行失败，退出码: {code:?}")
            } else {
                stderr
            };
            return Err(SchedulerError::TaskExecution(detail));
        }

        info!("Shell任务 {} 完成，耗时 {}ms", task.id, elapsed_ms);
        if task.task_type == TaskType::Sharding {
            return Ok(TaskResult::with_sub_tasks(Self::sub_tasks(&stdout)));
        }

        let mut attributes = Attributes::new();
        attributes.insert("stdout".to_string(), json!(stdout));
        if !stderr.is_empty() {
            attributes.insert("stderr".to_string(), json!(stderr));
        }
        attributes.insert("exit_code".to_string(), json!(0));
        attributes.insert("execution_time_ms".to_string(), json!(elapsed_ms));
        Ok(TaskResult::with_attributes(attributes))
    }
}
