use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobflow_core::SchedulerResult;
use jobflow_domain::{
    JobInstance, JobInstanceRepository, Plan, PlanInfo, PlanInstance, PlanInstanceRepository,
    PlanRepository, Task, TaskRepository, TaskResult, TaskStatus, TaskType, TriggerType,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use super::mapping::MappingHelpers;

const PLAN_INSTANCE_COLUMNS: &str =
    "id, plan_id, plan_version, status, trigger_type, trigger_at, start_at, feedback_at, error_msg";

const JOB_INSTANCE_COLUMNS: &str = "id, plan_id, plan_version, plan_instance_id, job_id, job_type, \
     status, stage, pending_tasks, attempt, trigger_type, trigger_at, start_at, end_at, attributes, \
     terminate_with_fail, error_msg";

const TASK_COLUMNS: &str = "id, plan_id, plan_version, plan_instance_id, job_id, job_instance_id, \
     task_type, status, executor_name, dispatch_option, worker_id, trigger_at, job_attributes, \
     map_attributes, reduce_attributes, result, error_msg, error_stack_trace, start_at, end_at";

/// 基于SQLite的存储，所有状态推进都是带旧状态条件的单条UPDATE
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 连接数据库并执行建表。内存库只能使用单连接，否则每个连接各自一份数据
    pub async fn connect(database_url: &str, max_connections: u32) -> SchedulerResult<Self> {
        debug!("连接SQLite数据库: {}", database_url);

        let in_memory = database_url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .min_connections(1)
        };

        let pool = pool_options.connect_with(connect_options).await?;
        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> SchedulerResult<()> {
        debug!("执行SQLite建表");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                current_version TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                trigger_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS plan_infos (
                plan_id TEXT NOT NULL,
                version TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                schedule_option TEXT NOT NULL,
                jobs TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (plan_id, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS plan_instances (
                id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                plan_version TEXT NOT NULL,
                status TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                trigger_at TEXT NOT NULL,
                start_at TEXT,
                feedback_at TEXT,
                error_msg TEXT,
                UNIQUE (plan_id, trigger_at, trigger_type)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS job_instances (
                id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                plan_version TEXT NOT NULL,
                plan_instance_id TEXT NOT NULL,
                job_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                pending_tasks INTEGER NOT NULL DEFAULT 0,
                attempt INTEGER NOT NULL DEFAULT 0,
                trigger_type TEXT NOT NULL,
                trigger_at TEXT NOT NULL,
                start_at TEXT,
                end_at TEXT,
                attributes TEXT NOT NULL DEFAULT '{}',
                terminate_with_fail INTEGER NOT NULL DEFAULT 1,
                error_msg TEXT,
                UNIQUE (plan_instance_id, job_id, attempt)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                plan_version TEXT NOT NULL,
                plan_instance_id TEXT NOT NULL,
                job_id TEXT NOT NULL,
                job_instance_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                executor_name TEXT NOT NULL,
                dispatch_option TEXT NOT NULL,
                worker_id TEXT,
                trigger_at TEXT NOT NULL,
                job_attributes TEXT NOT NULL DEFAULT '{}',
                map_attributes TEXT,
                reduce_attributes TEXT NOT NULL DEFAULT '[]',
                result TEXT,
                error_msg TEXT,
                error_stack_trace TEXT,
                start_at TEXT,
                end_at TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_plan_instances_plan_id ON plan_instances(plan_id)",
            "CREATE INDEX IF NOT EXISTS idx_job_instances_plan_instance_id ON job_instances(plan_instance_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_job_instance_id ON tasks(job_instance_id)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(pool).await?;
        }

        Ok(())
    }

    fn row_to_plan(row: &SqliteRow) -> SchedulerResult<Plan> {
        Ok(Plan {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            current_version: row.try_get("current_version")?,
            enabled: row.try_get("enabled")?,
            trigger_type: MappingHelpers::parse_enum(row, "trigger_type")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_plan_info(row: &SqliteRow) -> SchedulerResult<PlanInfo> {
        Ok(PlanInfo {
            plan_id: row.try_get("plan_id")?,
            version: row.try_get("version")?,
            description: row.try_get("description")?,
            schedule_option: MappingHelpers::parse_json(row, "schedule_option")?,
            jobs: MappingHelpers::parse_json(row, "jobs")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_plan_instance(row: &SqliteRow) -> SchedulerResult<PlanInstance> {
        Ok(PlanInstance {
            id: row.try_get("id")?,
            plan_id: row.try_get("plan_id")?,
            plan_version: row.try_get("plan_version")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            trigger_type: MappingHelpers::parse_enum(row, "trigger_type")?,
            trigger_at: row.try_get("trigger_at")?,
            start_at: row.try_get("start_at")?,
            feedback_at: row.try_get("feedback_at")?,
            error_msg: row.try_get("error_msg")?,
        })
    }

    fn row_to_job_instance(row: &SqliteRow) -> SchedulerResult<JobInstance> {
        let attempt: i64 = row.try_get("attempt")?;
        Ok(JobInstance {
            id: row.try_get("id")?,
            plan_id: row.try_get("plan_id")?,
            plan_version: row.try_get("plan_version")?,
            plan_instance_id: row.try_get("plan_instance_id")?,
            job_id: row.try_get("job_id")?,
            job_type: MappingHelpers::parse_enum(row, "job_type")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            stage: MappingHelpers::parse_enum(row, "stage")?,
            pending_tasks: row.try_get("pending_tasks")?,
            attempt: attempt.max(0) as u32,
            trigger_type: MappingHelpers::parse_enum(row, "trigger_type")?,
            trigger_at: row.try_get("trigger_at")?,
            start_at: row.try_get("start_at")?,
            end_at: row.try_get("end_at")?,
            attributes: MappingHelpers::parse_json(row, "attributes")?,
            terminate_with_fail: row.try_get("terminate_with_fail")?,
            error_msg: row.try_get("error_msg")?,
        })
    }

    fn row_to_task(row: &SqliteRow) -> SchedulerResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            plan_id: row.try_get("plan_id")?,
            plan_version: row.try_get("plan_version")?,
            plan_instance_id: row.try_get("plan_instance_id")?,
            job_id: row.try_get("job_id")?,
            job_instance_id: row.try_get("job_instance_id")?,
            task_type: MappingHelpers::parse_enum(row, "task_type")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            executor_name: row.try_get("executor_name")?,
            dispatch_option: MappingHelpers::parse_json(row, "dispatch_option")?,
            worker_id: row.try_get("worker_id")?,
            trigger_at: row.try_get("trigger_at")?,
            job_attributes: MappingHelpers::parse_json(row, "job_attributes")?,
            map_attributes: MappingHelpers::parse_optional_json(row, "map_attributes")?,
            reduce_attributes: MappingHelpers::parse_json(row, "reduce_attributes")?,
            result: MappingHelpers::parse_optional_json(row, "result")?,
            error_msg: row.try_get("error_msg")?,
            error_stack_trace: row.try_get("error_stack_trace")?,
            start_at: row.try_get("start_at")?,
            end_at: row.try_get("end_at")?,
        })
    }

    async fn fetch_plan_instances(
        &self,
        sql: &str,
        plan_id: &str,
    ) -> SchedulerResult<Vec<PlanInstance>> {
        let rows = sqlx::query(sql).bind(plan_id).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_plan_instance).collect()
    }

    async fn fetch_tasks(&self, sql: &str, binds: &[&str]) -> SchedulerResult<Vec<Task>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }
}

#[async_trait]
impl PlanRepository for SqliteStore {
    #[instrument(skip(self, plan), fields(plan_id = %plan.id))]
    async fn save(&self, plan: &Plan) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (id, name, current_version, enabled, trigger_type, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                current_version = excluded.current_version,
                enabled = excluded.enabled,
                trigger_type = excluded.trigger_type,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&plan.id)
        .bind(&plan.name)
        .bind(&plan.current_version)
        .bind(plan.enabled)
        .bind(plan.trigger_type.as_str())
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, plan_id: &str) -> SchedulerResult<Option<Plan>> {
        let row = sqlx::query("SELECT * FROM plans WHERE id = ?1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_plan).transpose()
    }

    async fn find_enabled(&self) -> SchedulerResult<Vec<Plan>> {
        let rows = sqlx::query("SELECT * FROM plans WHERE enabled = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_plan).collect()
    }

    async fn save_info(&self, info: &PlanInfo) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO plan_infos (plan_id, version, description, schedule_option, jobs, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&info.plan_id)
        .bind(&info.version)
        .bind(&info.description)
        .bind(MappingHelpers::to_json(&info.schedule_option)?)
        .bind(MappingHelpers::to_json(&info.jobs)?)
        .bind(info.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_info(&self, plan_id: &str, version: &str) -> SchedulerResult<Option<PlanInfo>> {
        let row = sqlx::query("SELECT * FROM plan_infos WHERE plan_id = ?1 AND version = ?2")
            .bind(plan_id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_plan_info).transpose()
    }

    async fn update_version(
        &self,
        plan_id: &str,
        old_version: &str,
        new_version: &str,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE plans SET current_version = ?1, updated_at = ?2 WHERE id = ?3 AND current_version = ?4",
        )
        .bind(new_version)
        .bind(Utc::now())
        .bind(plan_id)
        .bind(old_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn update_enabled(&self, plan_id: &str, enabled: bool) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE plans SET enabled = ?1, updated_at = ?2 WHERE id = ?3 AND enabled = ?4",
        )
        .bind(enabled)
        .bind(Utc::now())
        .bind(plan_id)
        .bind(!enabled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PlanInstanceRepository for SqliteStore {
    #[instrument(skip(self, instance), fields(plan_instance_id = %instance.id))]
    async fn create_if_absent(&self, instance: &PlanInstance) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO plan_instances
                (id, plan_id, plan_version, status, trigger_type, trigger_at, start_at, feedback_at, error_msg)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.plan_id)
        .bind(&instance.plan_version)
        .bind(instance.status.as_str())
        .bind(instance.trigger_type.as_str())
        .bind(instance.trigger_at)
        .bind(instance.start_at)
        .bind(instance.feedback_at)
        .bind(&instance.error_msg)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<PlanInstance>> {
        let sql = format!("SELECT {PLAN_INSTANCE_COLUMNS} FROM plan_instances WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_plan_instance).transpose()
    }

    async fn find_by_trigger(
        &self,
        plan_id: &str,
        trigger_at: DateTime<Utc>,
        trigger_type: TriggerType,
    ) -> SchedulerResult<Option<PlanInstance>> {
        let sql = format!(
            "SELECT {PLAN_INSTANCE_COLUMNS} FROM plan_instances \
             WHERE plan_id = ?1 AND trigger_at = ?2 AND trigger_type = ?3"
        );
        let row = sqlx::query(&sql)
            .bind(plan_id)
            .bind(trigger_at)
            .bind(trigger_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_plan_instance).transpose()
    }

    async fn find_latest(&self, plan_id: &str) -> SchedulerResult<Option<PlanInstance>> {
        let sql = format!(
            "SELECT {PLAN_INSTANCE_COLUMNS} FROM plan_instances WHERE plan_id = ?1 \
             ORDER BY trigger_at DESC LIMIT 1"
        );
        Ok(self.fetch_plan_instances(&sql, plan_id).await?.into_iter().next())
    }

    async fn find_by_plan(&self, plan_id: &str) -> SchedulerResult<Vec<PlanInstance>> {
        let sql = format!(
            "SELECT {PLAN_INSTANCE_COLUMNS} FROM plan_instances WHERE plan_id = ?1 ORDER BY trigger_at"
        );
        self.fetch_plan_instances(&sql, plan_id).await
    }

    async fn executing(&self, id: &str, start_at: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE plan_instances SET status = 'EXECUTING', start_at = ?1 \
             WHERE id = ?2 AND status = 'SCHEDULING'",
        )
        .bind(start_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn succeed(&self, id: &str, feedback_at: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE plan_instances SET status = 'SUCCEED', feedback_at = ?1 \
             WHERE id = ?2 AND status IN ('SCHEDULING', 'EXECUTING')",
        )
        .bind(feedback_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail(
        &self,
        id: &str,
        feedback_at: DateTime<Utc>,
        error_msg: &str,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE plan_instances SET status = 'FAILED', feedback_at = ?1, error_msg = ?2 \
             WHERE id = ?3 AND status IN ('SCHEDULING', 'EXECUTING')",
        )
        .bind(feedback_at)
        .bind(error_msg)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobInstanceRepository for SqliteStore {
    #[instrument(skip(self, instance), fields(job_instance_id = %instance.id))]
    async fn create_if_absent(&self, instance: &JobInstance) -> SchedulerResult<bool> {
        let sql = format!(
            "INSERT OR IGNORE INTO job_instances ({JOB_INSTANCE_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        );
        let result = sqlx::query(&sql)
            .bind(&instance.id)
            .bind(&instance.plan_id)
            .bind(&instance.plan_version)
            .bind(&instance.plan_instance_id)
            .bind(&instance.job_id)
            .bind(instance.job_type.as_str())
            .bind(instance.status.as_str())
            .bind(instance.stage.as_str())
            .bind(instance.pending_tasks)
            .bind(instance.attempt as i64)
            .bind(instance.trigger_type.as_str())
            .bind(instance.trigger_at)
            .bind(instance.start_at)
            .bind(instance.end_at)
            .bind(MappingHelpers::to_json(&instance.attributes)?)
            .bind(instance.terminate_with_fail)
            .bind(&instance.error_msg)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<JobInstance>> {
        let sql = format!("SELECT {JOB_INSTANCE_COLUMNS} FROM job_instances WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_job_instance).transpose()
    }

    async fn find_by_plan_instance(
        &self,
        plan_instance_id: &str,
    ) -> SchedulerResult<Vec<JobInstance>> {
        let sql = format!(
            "SELECT {JOB_INSTANCE_COLUMNS} FROM job_instances WHERE plan_instance_id = ?1 \
             ORDER BY job_id, attempt"
        );
        let rows = sqlx::query(&sql)
            .bind(plan_instance_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_job_instance).collect()
    }

    async fn executing(&self, id: &str, start_at: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE job_instances SET status = 'EXECUTING', start_at = ?1 \
             WHERE id = ?2 AND status = 'SCHEDULING'",
        )
        .bind(start_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn advance_stage(
        &self,
        id: &str,
        from: TaskType,
        to: TaskType,
        pending_tasks: i64,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE job_instances SET stage = ?1, pending_tasks = ?2 \
             WHERE id = ?3 AND stage = ?4 AND status IN ('SCHEDULING', 'EXECUTING')",
        )
        .bind(to.as_str())
        .bind(pending_tasks)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn complete_stage_task(
        &self,
        id: &str,
        stage: TaskType,
    ) -> SchedulerResult<Option<i64>> {
        let row = sqlx::query(
            "UPDATE job_instances SET pending_tasks = pending_tasks - 1 \
             WHERE id = ?1 AND stage = ?2 RETURNING pending_tasks",
        )
        .bind(id)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("pending_tasks")?)),
            None => Ok(None),
        }
    }

    async fn succeed(&self, id: &str, end_at: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE job_instances SET status = 'SUCCEED', end_at = ?1 \
             WHERE id = ?2 AND status IN ('SCHEDULING', 'EXECUTING')",
        )
        .bind(end_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail(&self, id: &str, end_at: DateTime<Utc>, error_msg: &str) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE job_instances SET status = 'FAILED', end_at = ?1, error_msg = ?2 \
             WHERE id = ?3 AND status IN ('SCHEDULING', 'EXECUTING')",
        )
        .bind(end_at)
        .bind(error_msg)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TaskRepository for SqliteStore {
    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn save_all(&self, tasks: &[Task]) -> SchedulerResult<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO tasks ({TASK_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
        );

        let mut tx = self.pool.begin().await?;
        for task in tasks {
            let map_attributes = task
                .map_attributes
                .as_ref()
                .map(MappingHelpers::to_json)
                .transpose()?;
            let result = task.result.as_ref().map(MappingHelpers::to_json).transpose()?;

            sqlx::query(&sql)
                .bind(&task.id)
                .bind(&task.plan_id)
                .bind(&task.plan_version)
                .bind(&task.plan_instance_id)
                .bind(&task.job_id)
                .bind(&task.job_instance_id)
                .bind(task.task_type.as_str())
                .bind(task.status.as_str())
                .bind(&task.executor_name)
                .bind(MappingHelpers::to_json(&task.dispatch_option)?)
                .bind(&task.worker_id)
                .bind(task.trigger_at)
                .bind(MappingHelpers::to_json(&task.job_attributes)?)
                .bind(map_attributes)
                .bind(MappingHelpers::to_json(&task.reduce_attributes)?)
                .bind(result)
                .bind(&task.error_msg)
                .bind(&task.error_stack_trace)
                .bind(task.start_at)
                .bind(task.end_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        Ok(self.fetch_tasks(&sql, &[id]).await?.into_iter().next())
    }

    async fn find_by_job_instance(&self, job_instance_id: &str) -> SchedulerResult<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE job_instance_id = ?1 ORDER BY id");
        self.fetch_tasks(&sql, &[job_instance_id]).await
    }

    async fn find_by_job_instance_and_type(
        &self,
        job_instance_id: &str,
        task_type: TaskType,
    ) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE job_instance_id = ?1 AND task_type = ?2 ORDER BY id"
        );
        self.fetch_tasks(&sql, &[job_instance_id, task_type.as_str()])
            .await
    }

    async fn dispatching(&self, id: &str) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'DISPATCHING' WHERE id = ?1 AND status = 'SCHEDULING'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn executing(
        &self,
        id: &str,
        worker_id: &str,
        start_at: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'EXECUTING', worker_id = ?1, start_at = ?2 \
             WHERE id = ?3 AND status = 'DISPATCHING'",
        )
        .bind(worker_id)
        .bind(start_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn succeed(
        &self,
        id: &str,
        end_at: DateTime<Utc>,
        result: &TaskResult,
    ) -> SchedulerResult<u64> {
        let outcome = sqlx::query(
            "UPDATE tasks SET status = 'SUCCEED', end_at = ?1, result = ?2 \
             WHERE id = ?3 AND status IN ('DISPATCHING', 'EXECUTING')",
        )
        .bind(end_at)
        .bind(MappingHelpers::to_json(result)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected())
    }

    async fn fail(
        &self,
        id: &str,
        status: TaskStatus,
        end_at: DateTime<Utc>,
        error_msg: &str,
        error_stack_trace: Option<&str>,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, end_at = ?2, error_msg = ?3, error_stack_trace = ?4 \
             WHERE id = ?5 AND status IN ('SCHEDULING', 'DISPATCHING', 'EXECUTING')",
        )
        .bind(status.as_str())
        .bind(end_at)
        .bind(error_msg)
        .bind(error_stack_trace)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
