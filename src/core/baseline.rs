//! 基线管理 - 保存上次完整成功同步后两侧的快照，并保证同一任务不会并发运行

use crate::core::error::SyncError;
use crate::core::snapshot::{Entry, Side, Snapshot};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// 基线：任务上次完整成功后两侧的快照
#[derive(Debug, Clone)]
pub struct Baseline {
    pub job_id: String,
    pub source: Snapshot,
    pub dest: Snapshot,
    pub captured_at: i64,
}

impl Baseline {
    pub fn new(job_id: impl Into<String>, source: Snapshot, dest: Snapshot) -> Self {
        Self {
            job_id: job_id.into(),
            source,
            dest,
            captured_at: chrono::Utc::now().timestamp(),
        }
    }

    /// 空基线（没有历史时使用，所有差异都会被视为潜在冲突）
    pub fn empty(
        job_id: impl Into<String>,
        source_root: &Path,
        dest_root: &Path,
        case_sensitive: bool,
    ) -> Self {
        Self::new(
            job_id,
            Snapshot::empty(source_root, case_sensitive),
            Snapshot::empty(dest_root, case_sensitive),
        )
    }

    pub fn side(&self, side: Side) -> &Snapshot {
        match side {
            Side::Source => &self.source,
            Side::Destination => &self.dest,
        }
    }
}

/// 数据库行
#[derive(Debug, sqlx::FromRow)]
struct BaselineRow {
    source_root: String,
    dest_root: String,
    captured_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BaselineEntryRow {
    side: String,
    file_path: String,
    file_size: i64,
    modified_time: i64,
    is_dir: bool,
    checksum: Option<String>,
}

/// 基线存储
#[derive(Clone)]
pub struct BaselineStore {
    db: Arc<SqlitePool>,
    locks: JobLocks,
}

impl BaselineStore {
    pub fn new(db: Arc<SqlitePool>, locks: JobLocks) -> Self {
        Self { db, locks }
    }

    /// 获取任务的独占运行锁
    pub fn lock_job(&self, job_id: &str) -> Result<JobLease, SyncError> {
        self.locks.try_acquire(job_id)
    }

    /// 加载任务基线，不存在时返回 None
    pub async fn load(
        &self,
        job_id: &str,
        case_sensitive: bool,
    ) -> Result<Option<Baseline>, SyncError> {
        let header = sqlx::query_as::<_, BaselineRow>(
            "SELECT source_root, dest_root, captured_at FROM baselines WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&*self.db)
        .await?;

        let Some(header) = header else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, BaselineEntryRow>(
            "SELECT side, file_path, file_size, modified_time, is_dir, checksum
             FROM baseline_entries WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_all(&*self.db)
        .await?;

        let source_root = PathBuf::from(&header.source_root);
        let dest_root = PathBuf::from(&header.dest_root);
        let mut source_entries = Vec::new();
        let mut dest_entries = Vec::new();

        for row in rows {
            let (root, bucket) = if row.side == Side::Source.as_str() {
                (&source_root, &mut source_entries)
            } else {
                (&dest_root, &mut dest_entries)
            };
            bucket.push(Entry {
                absolute_path: root.join(&row.file_path),
                relative_path: row.file_path,
                size: row.file_size.max(0) as u64,
                modified_time: row.modified_time,
                is_dir: row.is_dir,
                checksum: row.checksum,
            });
        }

        debug!(
            "加载基线 {}: 源 {} 条, 目标 {} 条",
            job_id,
            source_entries.len(),
            dest_entries.len()
        );

        let mut source =
            Snapshot::from_entries(source_root, case_sensitive, source_entries, Vec::new());
        let mut dest = Snapshot::from_entries(dest_root, case_sensitive, dest_entries, Vec::new());
        source.captured_at = header.captured_at;
        dest.captured_at = header.captured_at;

        Ok(Some(Baseline {
            job_id: job_id.to_string(),
            source,
            dest,
            captured_at: header.captured_at,
        }))
    }

    /// 加载基线，不存在时返回 `BaselineUnavailable`
    pub async fn require(&self, job_id: &str, case_sensitive: bool) -> Result<Baseline, SyncError> {
        self.load(job_id, case_sensitive)
            .await?
            .ok_or_else(|| SyncError::BaselineUnavailable(job_id.to_string()))
    }

    /// 整体替换任务基线（单个事务）
    pub async fn save(&self, baseline: &Baseline) -> Result<(), SyncError> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM baseline_entries WHERE job_id = ?")
            .bind(&baseline.job_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"INSERT INTO baselines (job_id, source_root, dest_root, captured_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(job_id) DO UPDATE SET
                   source_root = excluded.source_root,
                   dest_root = excluded.dest_root,
                   captured_at = excluded.captured_at"#,
        )
        .bind(&baseline.job_id)
        .bind(baseline.source.root.to_string_lossy().to_string())
        .bind(baseline.dest.root.to_string_lossy().to_string())
        .bind(baseline.captured_at)
        .execute(&mut *tx)
        .await?;

        for side in [Side::Source, Side::Destination] {
            for entry in baseline.side(side).entries() {
                sqlx::query(
                    r#"INSERT INTO baseline_entries
                       (job_id, side, file_path, file_size, modified_time, is_dir, checksum)
                       VALUES (?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(&baseline.job_id)
                .bind(side.as_str())
                .bind(&entry.relative_path)
                .bind(entry.size as i64)
                .bind(entry.modified_time)
                .bind(entry.is_dir)
                .bind(&entry.checksum)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        info!(
            "已提交任务 {} 的基线 (源 {} 条, 目标 {} 条)",
            baseline.job_id,
            baseline.source.len(),
            baseline.dest.len()
        );
        Ok(())
    }

    /// 删除任务基线
    pub async fn delete(&self, job_id: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM baseline_entries WHERE job_id = ?")
            .bind(job_id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM baselines WHERE job_id = ?")
            .bind(job_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

/// 进程内的任务运行锁表
#[derive(Debug, Clone, Default)]
pub struct JobLocks {
    running: Arc<Mutex<HashSet<String>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试获取任务锁，已被持有时返回 `JobBusy`
    pub fn try_acquire(&self, job_id: &str) -> Result<JobLease, SyncError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(job_id.to_string()) {
            return Err(SyncError::JobBusy(job_id.to_string()));
        }
        debug!("获取任务锁: {}", job_id);
        Ok(JobLease {
            job_id: job_id.to_string(),
            running: self.running.clone(),
        })
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(job_id)
    }
}

/// 任务锁租约，drop 时释放（完成、失败、取消都会走到这里）
#[derive(Debug)]
pub struct JobLease {
    job_id: String,
    running: Arc<Mutex<HashSet<String>>>,
}

impl JobLease {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.job_id);
        debug!("释放任务锁: {}", self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> Arc<SqlitePool> {
        Arc::new(crate::db::connect_in_memory().await.unwrap())
    }

    fn entry(root: &str, path: &str, size: u64, is_dir: bool) -> Entry {
        Entry {
            relative_path: path.to_string(),
            absolute_path: PathBuf::from(root).join(path),
            size,
            modified_time: 42,
            is_dir,
            checksum: if is_dir { None } else { Some(format!("h{}", size)) },
        }
    }

    #[test]
    fn test_job_lock_is_exclusive_and_released_on_drop() {
        let locks = JobLocks::new();
        let lease = locks.try_acquire("job").unwrap();
        assert!(matches!(locks.try_acquire("job"), Err(SyncError::JobBusy(_))));
        assert!(locks.try_acquire("other").is_ok());
        assert!(locks.is_running("job"));
        drop(lease);
        assert!(!locks.is_running("job"));
        assert!(locks.try_acquire("job").is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let store = BaselineStore::new(memory_pool().await, JobLocks::new());
        assert!(store.load("job", true).await.unwrap().is_none());
        assert!(matches!(
            store.require("job", true).await,
            Err(SyncError::BaselineUnavailable(_))
        ));

        let source = Snapshot::from_entries(
            "/src",
            true,
            vec![entry("/src", "d", 0, true), entry("/src", "d/a.txt", 10, false)],
            Vec::new(),
        );
        let dest = Snapshot::from_entries(
            "/dst",
            true,
            vec![entry("/dst", "b.txt", 3, false)],
            Vec::new(),
        );
        store.save(&Baseline::new("job", source, dest)).await.unwrap();

        let loaded = store.require("job", true).await.unwrap();
        assert_eq!(loaded.source.len(), 2);
        assert_eq!(loaded.dest.len(), 1);
        let a = loaded.source.get("d/a.txt").unwrap();
        assert_eq!(a.size, 10);
        assert_eq!(a.checksum.as_deref(), Some("h10"));
        assert_eq!(a.absolute_path, PathBuf::from("/src/d/a.txt"));
        assert!(loaded.source.get("d").unwrap().is_dir);

        // 再次保存会整体替换
        let empty = Baseline::empty("job", Path::new("/src"), Path::new("/dst"), true);
        store.save(&empty).await.unwrap();
        let loaded = store.require("job", true).await.unwrap();
        assert!(loaded.source.is_empty());
        assert!(loaded.dest.is_empty());

        store.delete("job").await.unwrap();
        assert!(store.load("job", true).await.unwrap().is_none());
    }
}
