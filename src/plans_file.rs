//! 启动时从JSON文件加载的计划定义

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobflow_domain::{JobInfo, Plan, PlanInfo, ScheduleOption, TriggerType};

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "1".to_string()
}

/// 文件中的一个计划，同时描述计划本身与它的版本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    /// 缺省时只能手动触发
    #[serde(default)]
    pub schedule_option: Option<ScheduleOption>,
    pub jobs: Vec<JobInfo>,
}

impl PlanDefinition {
    pub fn into_plan(self, now: DateTime<Utc>) -> (Plan, PlanInfo) {
        let name = if self.name.is_empty() {
            self.id.clone()
        } else {
            self.name
        };
        let plan = Plan {
            id: self.id.clone(),
            name,
            current_version: self.version.clone(),
            enabled: self.enabled,
            trigger_type: TriggerType::Schedule,
            created_at: now,
            updated_at: now,
        };
        let info = PlanInfo {
            plan_id: self.id,
            version: self.version,
            description: self.description,
            schedule_option: self
                .schedule_option
                .unwrap_or_else(|| ScheduleOption::none(now)),
            jobs: self.jobs,
            created_at: now,
        };
        (plan, info)
    }
}

pub fn parse_plan_definitions(json: &str) -> Result<Vec<PlanDefinition>> {
    serde_json::from_str(json).context("解析计划定义失败")
}

pub fn load_plan_definitions(path: &Path) -> Result<Vec<PlanDefinition>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("读取计划文件失败: {}", path.display()))?;
    parse_plan_definitions(&content)
        .with_context(|| format!("计划文件格式错误: {}", path.display()))
}

/// 只校验不保存，返回通过校验的计划数
pub fn check_plan_definitions(definitions: &[PlanDefinition]) -> Result<usize> {
    let now = Utc::now();
    for definition in definitions {
        let (_, info) = definition.clone().into_plan(now);
        info.validate()
            .with_context(|| format!("计划 {} 校验失败", definition.id))?;
    }
    Ok(definitions.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLANS: &str = r#"[
        {
            "id": "nightly",
            "schedule_option": {
                "schedule_type": "CRON",
                "schedule_start_at": "2024-01-01T00:00:00Z",
                "schedule_cron": "0 0 2 * * ?"
            },
            "jobs": [
                {"id": "extract", "executor_name": "echo", "job_type": "NORMAL", "children_ids": ["load"]},
                {"id": "load", "executor_name": "echo", "job_type": "NORMAL", "parent_ids": ["extract"]}
            ]
        },
        {
            "id": "adhoc",
            "name": "手动计划",
            "enabled": false,
            "jobs": [{"id": "only", "executor_name": "shell", "job_type": "NORMAL"}]
        }
    ]"#;

    #[test]
    fn test_parse_defaults() {
        let definitions = parse_plan_definitions(PLANS).unwrap();
        assert_eq!(definitions.len(), 2);

        let (plan, info) = definitions[1].clone().into_plan(Utc::now());
        assert_eq!(plan.name, "手动计划");
        assert!(!plan.enabled);
        assert_eq!(plan.current_version, "1");
        assert_eq!(info.schedule_option.schedule_type, jobflow_domain::ScheduleType::None);

        let (plan, info) = definitions[0].clone().into_plan(Utc::now());
        assert_eq!(plan.name, "nightly");
        assert_eq!(info.jobs.len(), 2);
        assert!(info.jobs[0].terminate_with_fail);
    }

    #[test]
    fn test_check_rejects_cycle() {
        let definitions = parse_plan_definitions(PLANS).unwrap();
        assert_eq!(check_plan_definitions(&definitions).unwrap(), 2);

        let cyclic = parse_plan_definitions(
            r#"[{"id": "loop", "jobs": [
                {"id": "a", "executor_name": "echo", "job_type": "NORMAL", "parent_ids": ["b"], "children_ids": ["b"]},
                {"id": "b", "executor_name": "echo", "job_type": "NORMAL", "parent_ids": ["a"], "children_ids": ["a"]}
            ]}]"#,
        )
        .unwrap();
        assert!(check_plan_definitions(&cyclic).is_err());
    }

    #[test]
    fn test_bundled_plans_are_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/plans.json");
        let definitions = load_plan_definitions(&path).unwrap();
        assert_eq!(check_plan_definitions(&definitions).unwrap(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(load_plan_definitions(Path::new("/nonexistent/plans.json")).is_err());
    }
}
