//! 同步流水线：扫描 → 分类/比较 → 规划 → 执行 → 提交基线 → 写历史

use crate::config::EngineConfig;
use crate::core::baseline::{Baseline, BaselineStore, JobLease, JobLocks};
use crate::core::comparator::{CompareConfig, FileComparator};
use crate::core::conflict::{ConflictClassifier, ConflictResolution, ConflictStore};
use crate::core::error::SyncError;
use crate::core::executor::{
    send_progress, ExecutorConfig, PausedRun, SyncControl, SyncExecutor, SyncPhase, SyncProgress,
    SyncResult,
};
use crate::core::planner::{Plan, SyncPlanner};
use crate::core::scanner::{CompiledFilters, FileScanner, ScanConfig};
use crate::core::snapshot::{Side, Snapshot};
use crate::db::{SyncDirection, SyncLog, SyncMode, SyncOptions, SyncStatus};
use crate::storage::Storage;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 扫描完成、计划已生成的一次运行
struct Prepared {
    plan: Plan,
    source: Arc<dyn Storage>,
    dest: Arc<dyn Storage>,
}

/// 同步引擎
#[derive(Clone)]
pub struct SyncEngine {
    db: Arc<SqlitePool>,
    config: EngineConfig,
    baselines: BaselineStore,
    conflicts: ConflictStore,
}

impl SyncEngine {
    pub fn new(db: Arc<SqlitePool>, config: EngineConfig, locks: JobLocks) -> Self {
        Self {
            baselines: BaselineStore::new(db.clone(), locks),
            conflicts: ConflictStore::new(db.clone()),
            db,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn conflicts(&self) -> &ConflictStore {
        &self.conflicts
    }

    /// 临时运行（没有任务记录）使用的稳定任务键，由两个根目录决定
    pub fn job_key(source: &Path, dest: &Path) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        hasher.update(dest.to_string_lossy().as_bytes());
        let hex = hasher.finalize().to_hex();
        format!("adhoc-{}", &hex.as_str()[..16])
    }

    /// 获取任务的独占运行锁
    pub fn lock_job(&self, job_id: &str) -> Result<JobLease, SyncError> {
        self.baselines.lock_job(job_id)
    }

    fn comparator(&self, options: &SyncOptions) -> FileComparator {
        FileComparator::with_config(CompareConfig {
            time_tolerance_seconds: self.config.time_tolerance_seconds,
            use_checksum: true,
            ignore_mtime: false,
            case_sensitive: options.case_sensitive(),
        })
    }

    fn executor(
        &self,
        source: Arc<dyn Storage>,
        dest: Arc<dyn Storage>,
        options: &SyncOptions,
    ) -> SyncExecutor {
        SyncExecutor::new(
            source,
            dest,
            ExecutorConfig {
                max_retries: self.config.max_retries,
                retry_base_delay_ms: self.config.retry_base_delay_ms,
                fail_fast: options.fail_fast,
            },
        )
    }

    /// 扫描一侧目录
    async fn capture(
        &self,
        storage: &dyn Storage,
        options: &SyncOptions,
        control: Option<&SyncControl>,
    ) -> Result<Snapshot, SyncError> {
        let config = ScanConfig {
            filters: options.filters.clone(),
            verify_with_hash: options.verify_with_hash,
            case_sensitive: options.case_sensitive(),
        };
        let mut scanner = FileScanner::with_config(self.config.hash_workers, config);
        if let Some(control) = control {
            scanner = scanner.with_cancel(control.token());
        }
        Ok(scanner.capture(storage).await?)
    }

    /// 校验选项、扫描两侧并生成计划
    async fn prepare(
        &self,
        job_id: &str,
        source_root: &Path,
        dest_root: &Path,
        options: &SyncOptions,
        control: Option<&SyncControl>,
    ) -> Result<Prepared, SyncError> {
        if !source_root.is_dir() {
            return Err(SyncError::Planning(format!(
                "源目录不存在: {}",
                source_root.display()
            )));
        }
        if source_root == dest_root {
            return Err(SyncError::Planning("源目录和目标目录相同".to_string()));
        }
        if dest_root.is_file() {
            return Err(SyncError::Planning(format!(
                "目标路径是一个文件: {}",
                dest_root.display()
            )));
        }
        CompiledFilters::compile(&options.filters)
            .map_err(|e| SyncError::Planning(format!("过滤规则无效: {}", e)))?;

        let source = crate::storage::create_storage(source_root)?;
        let dest = crate::storage::create_storage(dest_root)?;

        let source_snapshot = self.capture(source.as_ref(), options, control).await?;
        let dest_snapshot = self.capture(dest.as_ref(), options, control).await?;

        let scanned = [
            (Side::Source, &source_snapshot),
            (Side::Destination, &dest_snapshot),
        ];
        let mut warnings: Vec<String> = scanned
            .into_iter()
            .flat_map(|(side, snapshot)| {
                snapshot
                    .errors()
                    .iter()
                    .map(move |e| format!("扫描{} {}: {}", side_name(side), e.path, e.message))
            })
            .collect();

        let comparator = self.comparator(options);
        let planner = SyncPlanner::new(source_root, dest_root, comparator.clone());
        let case_sensitive = options.case_sensitive();

        let plan = match options.direction {
            SyncDirection::Bidirectional => {
                let baseline = match self.baselines.load(job_id, case_sensitive).await? {
                    Some(b) => b,
                    None => {
                        warn!("任务 {} 没有基线，按全量比较处理", job_id);
                        warnings.push("没有可用的基线，两侧所有差异都视为潜在冲突".to_string());
                        Baseline::empty(job_id, source_root, dest_root, case_sensitive)
                    }
                };
                let classifier =
                    ConflictClassifier::new(comparator.clone(), options.conflict_policy);
                let mut classification =
                    classifier.classify(&baseline, &source_snapshot, &dest_snapshot);
                let resolutions = self.resolutions(job_id, options).await?;
                classification.apply_resolutions(&resolutions);
                debug!(
                    "分类结果: 单侧变化 {}, 冲突 {}, 未变化 {}",
                    classification.auto_changes.len(),
                    classification.conflicts.len(),
                    classification.unchanged
                );
                planner.plan_bidirectional(&classification, options.mode)
            }
            direction => {
                let diffs = comparator.diff(&source_snapshot, &dest_snapshot);
                let baseline = if options.mode == SyncMode::Echo {
                    self.baselines.load(job_id, case_sensitive).await?
                } else {
                    None
                };
                let origin = if direction == SyncDirection::DestinationToSource {
                    Side::Destination
                } else {
                    Side::Source
                };
                let previously_synced = baseline.as_ref().map(|b| b.side(origin));
                planner.plan(&diffs, options.mode, direction, previously_synced)?
            }
        };

        Ok(Prepared {
            plan: plan.with_warnings(warnings),
            source,
            dest,
        })
    }

    /// 已保存的冲突决定加上本次选项中的决定，后者优先
    async fn resolutions(
        &self,
        job_id: &str,
        options: &SyncOptions,
    ) -> Result<HashMap<String, ConflictResolution>, SyncError> {
        let mut resolutions = self.conflicts.decisions(job_id).await?;
        if !resolutions.is_empty() {
            debug!("任务 {} 有 {} 个已保存的冲突决定", job_id, resolutions.len());
        }
        resolutions.extend(
            options
                .conflict_resolutions
                .iter()
                .map(|(path, resolution)| (path.clone(), *resolution)),
        );
        Ok(resolutions)
    }

    /// 预览同步（只扫描和规划，不修改任何文件）
    pub async fn preview_sync(
        &self,
        job_id: &str,
        source_root: &Path,
        dest_root: &Path,
        options: &SyncOptions,
    ) -> Result<Plan, SyncError> {
        info!("预览同步: {} -> {}", source_root.display(), dest_root.display());
        Ok(self.prepare(job_id, source_root, dest_root, options, None).await?.plan)
    }

    /// 运行一次同步，调用方需先持有该任务的运行锁
    pub async fn run_sync(
        &self,
        lease: &JobLease,
        source_root: &Path,
        dest_root: &Path,
        options: &SyncOptions,
        progress_tx: Option<mpsc::Sender<SyncProgress>>,
        control: &SyncControl,
    ) -> Result<SyncResult, SyncError> {
        let job_id = lease.job_id();
        let start_time = chrono::Utc::now().timestamp();

        info!(
            "开始同步任务 {}: {} -> {} ({:?}, {:?})",
            job_id,
            source_root.display(),
            dest_root.display(),
            options.mode,
            options.direction
        );
        send_progress(&progress_tx, SyncProgress::phase(job_id, SyncPhase::Scanning));

        let prepared = match self
            .prepare(job_id, source_root, dest_root, options, Some(control))
            .await
        {
            Ok(p) => p,
            Err(e) if control.is_cancelled() => {
                info!("同步任务 {} 在扫描阶段被取消", job_id);
                let mut result = SyncResult::failed(job_id, start_time, e.to_string());
                result.status = SyncStatus::Cancelled;
                self.log_result(&result).await;
                return Ok(result);
            }
            Err(e) => {
                error!("同步任务 {} 准备失败: {}", job_id, e);
                self.log_result(&SyncResult::failed(job_id, start_time, e.to_string()))
                    .await;
                return Err(e);
            }
        };

        send_progress(&progress_tx, SyncProgress::phase(job_id, SyncPhase::Planning));
        self.conflicts.clear_pending(job_id).await?;
        self.conflicts
            .record_conflicts(job_id, prepared.plan.conflicts())
            .await?;

        let executor = self.executor(prepared.source, prepared.dest, options);
        let result = executor
            .execute(prepared.plan, job_id, progress_tx, control)
            .await;

        Ok(self.finish(result, source_root, dest_root, options).await)
    }

    /// 从暂停处继续执行
    pub async fn resume_sync(
        &self,
        lease: &JobLease,
        paused: PausedRun,
        options: &SyncOptions,
        progress_tx: Option<mpsc::Sender<SyncProgress>>,
        control: &SyncControl,
    ) -> Result<SyncResult, SyncError> {
        let source_root = paused.plan().source_root().to_path_buf();
        let dest_root = paused.plan().dest_root().to_path_buf();
        info!(
            "继续同步任务 {}: 剩余 {} 个动作",
            lease.job_id(),
            paused.remaining()
        );

        let executor = self.executor(
            crate::storage::create_storage(&source_root)?,
            crate::storage::create_storage(&dest_root)?,
            options,
        );
        let result = executor
            .resume(paused, lease.job_id(), progress_tx, control)
            .await;

        Ok(self.finish(result, &source_root, &dest_root, options).await)
    }

    /// 收尾：判定最终状态，完全成功时提交基线，写入历史
    async fn finish(
        &self,
        mut result: SyncResult,
        source_root: &Path,
        dest_root: &Path,
        options: &SyncOptions,
    ) -> SyncResult {
        let pending = result.conflicts.iter().filter(|c| c.is_pending()).count();
        if result.status == SyncStatus::Completed && pending > 0 {
            info!("{} 个冲突等待处理，本次不提交基线", pending);
            result.status = SyncStatus::AwaitingDecision;
        }

        if result.status == SyncStatus::Completed {
            let skipped: Vec<String> = result
                .conflicts
                .iter()
                .filter(|c| c.resolution == Some(ConflictResolution::Skip))
                .map(|c| c.path.clone())
                .collect();
            match self
                .commit_baseline(&result.job_id, source_root, dest_root, options, &skipped)
                .await
            {
                Ok(()) => result.baseline_committed = true,
                Err(e) => {
                    warn!("提交基线失败: {}", e);
                    result.warnings.push(format!("提交基线失败: {}", e));
                }
            }
            if let Err(e) = self.conflicts.mark_applied(&result.job_id).await {
                warn!("更新冲突决定失败: {}", e);
            }
        }

        self.log_result(&result).await;
        info!(
            "同步任务 {} 结束: {} (耗时 {} ms)",
            result.job_id, result.status, result.duration_ms
        );
        result
    }

    /// 重新扫描两侧并整体替换基线
    ///
    /// 跳过的冲突路径保留旧基线条目（没有旧条目则不记录），下次运行仍会报告冲突。
    async fn commit_baseline(
        &self,
        job_id: &str,
        source_root: &Path,
        dest_root: &Path,
        options: &SyncOptions,
        skipped: &[String],
    ) -> Result<(), SyncError> {
        let source = crate::storage::create_storage(source_root)?;
        let dest = crate::storage::create_storage(dest_root)?;
        let mut source_snapshot = self.capture(source.as_ref(), options, None).await?;
        let mut dest_snapshot = self.capture(dest.as_ref(), options, None).await?;

        if !skipped.is_empty() {
            let case_sensitive = options.case_sensitive();
            let previous = self
                .baselines
                .load(job_id, case_sensitive)
                .await?
                .unwrap_or_else(|| Baseline::empty(job_id, source_root, dest_root, case_sensitive));
            debug!("{} 个跳过的冲突保留旧基线", skipped.len());
            source_snapshot = source_snapshot.with_paths_from(&previous.source, skipped);
            dest_snapshot = dest_snapshot.with_paths_from(&previous.dest, skipped);
        }

        self.baselines
            .save(&Baseline::new(job_id, source_snapshot, dest_snapshot))
            .await
    }

    /// 写入同步历史，只保留最近 history_limit 条
    async fn log_result(&self, result: &SyncResult) {
        let log = SyncLog {
            id: 0,
            job_id: result.job_id.clone(),
            start_time: result.start_time,
            end_time: Some(result.end_time),
            status: result.status,
            files_copied: result.files_copied,
            files_updated: result.files_updated,
            files_deleted: result.files_deleted,
            files_skipped: result.files_skipped,
            files_failed: result.files_failed,
            bytes_transferred: result.bytes_transferred,
            conflict_count: result.conflicts.len() as u32,
            error_message: result.error_summary(),
        };

        if let Err(e) = SyncLog::insert(&self.db, &log).await {
            warn!("记录同步日志失败: {}", e);
            return;
        }
        if let Err(e) = SyncLog::prune(&self.db, &result.job_id, self.config.history_limit).await {
            warn!("清理同步日志失败: {}", e);
        }
    }

    /// 读取同步历史（最新在前）
    pub async fn history(&self, job_id: &str, limit: i64) -> Result<Vec<SyncLog>, SyncError> {
        Ok(SyncLog::history(&self.db, job_id, limit).await?)
    }

    /// 删除任务相关的基线、冲突和历史
    pub async fn forget_job(&self, job_id: &str) -> Result<(), SyncError> {
        self.baselines.delete(job_id).await?;
        self.conflicts.delete_job(job_id).await?;
        SyncLog::delete_job(&self.db, job_id).await?;
        debug!("已清除任务 {} 的同步状态", job_id);
        Ok(())
    }
}

fn side_name(side: Side) -> &'static str {
    match side {
        Side::Source => "源",
        Side::Destination => "目标",
    }
}
