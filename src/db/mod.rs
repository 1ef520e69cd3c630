pub mod models;
pub use models::*;

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
pub use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// 打开（必要时创建）数据库文件并执行迁移
pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    // Windows 路径需要转换反斜杠为正斜杠
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid database path"))?
        .replace('\\', "/");

    let pool = SqlitePoolOptions::new()
        .max_connections(5) // SQLite 单文件，不需要太多连接
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(&format!("sqlite:{}?mode=rwc", db_path_str))
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// 内存数据库（测试和临时运行使用）
///
/// 每个连接都是独立的内存库，所以只保留一个且永不回收。
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

impl SyncJob {
    /// 从数据库加载所有任务
    pub async fn load_all(pool: &SqlitePool) -> Result<Vec<SyncJob>> {
        let rows =
            sqlx::query_as::<_, SyncJobRow>("SELECT * FROM sync_jobs ORDER BY created_at DESC, id")
                .fetch_all(pool)
                .await?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.try_into()?);
        }
        Ok(jobs)
    }

    /// 从数据库加载单个任务
    pub async fn load(pool: &SqlitePool, id: &str) -> Result<Option<SyncJob>> {
        let row = sqlx::query_as::<_, SyncJobRow>("SELECT * FROM sync_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        match row {
            Some(r) => Ok(Some(r.try_into()?)),
            None => Ok(None),
        }
    }

    /// 保存到数据库
    pub async fn save(&self, pool: &SqlitePool) -> Result<()> {
        let options = serde_json::to_string(&self.options)?;
        let schedule = serde_json::to_string(&self.schedule)?;

        sqlx::query(
            r#"
            INSERT INTO sync_jobs (id, name, source_path, dest_path, options, schedule,
                                   schedule_status, enabled, last_run_status, last_run_at,
                                   next_run_at, last_change_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                source_path = excluded.source_path,
                dest_path = excluded.dest_path,
                options = excluded.options,
                schedule = excluded.schedule,
                schedule_status = excluded.schedule_status,
                enabled = excluded.enabled,
                last_run_status = excluded.last_run_status,
                last_run_at = excluded.last_run_at,
                next_run_at = excluded.next_run_at,
                last_change_at = excluded.last_change_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(&self.source_path)
        .bind(&self.dest_path)
        .bind(&options)
        .bind(&schedule)
        .bind(self.schedule_status.as_str())
        .bind(self.enabled)
        .bind(self.last_run_status.map(|s| s.as_str()))
        .bind(self.last_run_at)
        .bind(self.next_run_at)
        .bind(self.last_change_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// 从数据库删除
    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_jobs WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// 到期需要运行的任务
    pub async fn load_due(pool: &SqlitePool, now: i64) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query_as::<_, SyncJobRow>(
            "SELECT * FROM sync_jobs
             WHERE enabled = 1 AND schedule_status = 'scheduled'
               AND next_run_at IS NOT NULL AND next_run_at <= ?
             ORDER BY next_run_at, id",
        )
        .bind(now)
        .fetch_all(pool)
        .await?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.try_into()?);
        }
        Ok(jobs)
    }
}

impl SyncLog {
    /// 写入一条同步历史，返回记录 id
    pub async fn insert(pool: &SqlitePool, log: &SyncLog) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_logs (job_id, start_time, end_time, status, files_copied,
                                   files_updated, files_deleted, files_skipped, files_failed,
                                   bytes_transferred, conflict_count, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.job_id)
        .bind(log.start_time)
        .bind(log.end_time)
        .bind(log.status.as_str())
        .bind(log.files_copied as i64)
        .bind(log.files_updated as i64)
        .bind(log.files_deleted as i64)
        .bind(log.files_skipped as i64)
        .bind(log.files_failed as i64)
        .bind(log.bytes_transferred as i64)
        .bind(log.conflict_count as i64)
        .bind(&log.error_message)
        .execute(pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// 读取任务历史（最新在前）
    pub async fn history(pool: &SqlitePool, job_id: &str, limit: i64) -> Result<Vec<SyncLog>> {
        let rows = sqlx::query_as::<_, SyncLogRow>(
            "SELECT * FROM sync_logs WHERE job_id = ? ORDER BY start_time DESC, id DESC LIMIT ?",
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(SyncLog::from).collect())
    }

    /// 只保留最近 `keep` 条
    pub async fn prune(pool: &SqlitePool, job_id: &str, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM sync_logs WHERE job_id = ? AND id NOT IN
             (SELECT id FROM sync_logs WHERE job_id = ? ORDER BY start_time DESC, id DESC LIMIT ?)",
        )
        .bind(job_id)
        .bind(job_id)
        .bind(keep)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_job(pool: &SqlitePool, job_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sync_logs WHERE job_id = ?")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conflict::ConflictPolicy;

    #[tokio::test]
    async fn test_job_roundtrip() {
        let pool = connect_in_memory().await.unwrap();
        let options = SyncOptions {
            mode: SyncMode::Echo,
            direction: SyncDirection::Bidirectional,
            conflict_policy: ConflictPolicy::NewerWins,
            ..Default::default()
        };
        let job = SyncJob::new(
            "docs".into(),
            "/a".into(),
            "/b".into(),
            options.clone(),
            crate::core::schedule::Trigger::Interval { seconds: 3600 },
        );
        job.save(&pool).await.unwrap();

        let loaded = SyncJob::load(&pool, &job.id).await.unwrap().unwrap();
        assert_eq!(loaded.options, options);
        assert_eq!(loaded.schedule_status, job.schedule_status);
        assert_eq!(loaded.next_run_at, job.next_run_at);

        let updated = loaded.with_last_run(SyncStatus::Completed, 100);
        updated.save(&pool).await.unwrap();
        let reloaded = SyncJob::load(&pool, &job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_run_status, Some(SyncStatus::Completed));
        assert_eq!(reloaded.last_run_at, Some(100));

        assert_eq!(SyncJob::load_all(&pool).await.unwrap().len(), 1);
        SyncJob::delete(&pool, &job.id).await.unwrap();
        assert!(SyncJob::load(&pool, &job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_newest_first_and_prune() {
        let pool = connect_in_memory().await.unwrap();
        for i in 0..3 {
            let log = SyncLog {
                id: 0,
                job_id: "job".into(),
                start_time: 100 + i,
                end_time: Some(200 + i),
                status: SyncStatus::Completed,
                files_copied: i as u32,
                files_updated: 0,
                files_deleted: 0,
                files_skipped: 0,
                files_failed: 0,
                bytes_transferred: 10,
                conflict_count: 0,
                error_message: None,
            };
            SyncLog::insert(&pool, &log).await.unwrap();
        }

        let history = SyncLog::history(&pool, "job", 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].start_time, 102);

        assert_eq!(SyncLog::prune(&pool, "job", 1).await.unwrap(), 2);
        let history = SyncLog::history(&pool, "job", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].files_copied, 2);
    }
}
