use std::fmt;

/// 需要生成全局唯一id的实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdType {
    Plan,
    PlanInstance,
    JobInstance,
    Task,
    Worker,
}

impl IdType {
    fn prefix(&self) -> &'static str {
        match self {
            IdType::Plan => "plan",
            IdType::PlanInstance => "pi",
            IdType::JobInstance => "ji",
            IdType::Task => "task",
            IdType::Worker => "worker",
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

pub trait IdGenerator: Send + Sync {
    fn generate_id(&self, id_type: IdType) -> String;
}

/// 基于uuid v4的id生成器，id形如 `task-<32位hex>`
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate_id(&self, id_type: IdType) -> String {
        format!("{}-{}", id_type.prefix(), uuid::Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_and_prefixed() {
        let generator = UuidIdGenerator;
        let ids: HashSet<String> = (0..100)
            .map(|_| generator.generate_id(IdType::Task))
            .collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| id.starts_with("task-")));
        assert!(generator
            .generate_id(IdType::PlanInstance)
            .starts_with("pi-"));
    }
}
