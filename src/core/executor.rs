//! 计划执行器：按顺序执行动作，支持取消、暂停续传、临时错误重试和进度上报

use crate::core::conflict::ConflictRecord;
use crate::core::error::{is_transient, ActionError};
use crate::core::planner::{Action, ActionKind, Plan};
use crate::core::snapshot::Side;
use crate::db::SyncStatus;
use crate::storage::Storage;
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 运行控制：取消和暂停都只在动作之间生效
#[derive(Debug, Clone, Default)]
pub struct SyncControl {
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
}

impl SyncControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// 清除暂停标志（续传前调用）
    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 是否是同一次运行的句柄（克隆共享同一状态）
    pub fn same_run(&self, other: &SyncControl) -> bool {
        Arc::ptr_eq(&self.paused, &other.paused)
    }
}

/// 运行阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Scanning,
    Planning,
    Syncing,
    Finished,
}

/// 同步进度
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub job_id: String,
    pub phase: SyncPhase,
    pub current_file: String,
    pub files_total: usize,
    pub files_done: usize,
    pub files_failed: usize,
    pub bytes_total: u64,
    pub bytes_done: u64,
    /// 0-100
    pub percent: f64,
}

impl SyncProgress {
    pub fn phase(job_id: &str, phase: SyncPhase) -> Self {
        Self {
            job_id: job_id.to_string(),
            phase,
            current_file: String::new(),
            files_total: 0,
            files_done: 0,
            files_failed: 0,
            bytes_total: 0,
            bytes_done: 0,
            percent: 0.0,
        }
    }
}

/// 发送进度，通道已满时丢弃，不阻塞执行
pub fn send_progress(tx: &Option<mpsc::Sender<SyncProgress>>, progress: SyncProgress) {
    if let Some(tx) = tx {
        let _ = tx.try_send(progress);
    }
}

/// 执行配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 临时错误的最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟（毫秒），按 2 的幂退避
    pub retry_base_delay_ms: u64,
    /// 第一个失败后停止，剩余动作记为跳过
    pub fail_fast: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 500,
            fail_fast: false,
        }
    }
}

/// 执行统计
#[derive(Debug, Clone, Default)]
struct Tally {
    files_copied: u32,
    files_updated: u32,
    files_deleted: u32,
    files_skipped: u32,
    files_failed: u32,
    dirs_created: u32,
    files_renamed: u32,
    bytes_transferred: u64,
    actions_done: usize,
    errors: Vec<ActionError>,
    elapsed: Duration,
}

impl Tally {
    fn record(&mut self, kind: ActionKind, bytes: u64) {
        match kind {
            ActionKind::Copy => self.files_copied += 1,
            ActionKind::Update => self.files_updated += 1,
            ActionKind::Delete => self.files_deleted += 1,
            ActionKind::Skip => self.files_skipped += 1,
            ActionKind::CreateDir => self.dirs_created += 1,
            ActionKind::Rename => self.files_renamed += 1,
        }
        self.bytes_transferred += bytes;
    }

    fn succeeded(&self) -> u32 {
        self.files_copied
            + self.files_updated
            + self.files_deleted
            + self.dirs_created
            + self.files_renamed
    }
}

/// 暂停的运行，可从下一个未执行的动作继续
#[derive(Debug)]
pub struct PausedRun {
    plan: Plan,
    next_action: usize,
    tally: Tally,
}

impl PausedRun {
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn next_action(&self) -> usize {
        self.next_action
    }

    pub fn remaining(&self) -> usize {
        self.plan.actions().len().saturating_sub(self.next_action)
    }
}

/// 同步结果，部分完成时同样给出完整统计
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub job_id: String,
    pub status: SyncStatus,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: u64,
    pub files_copied: u32,
    pub files_updated: u32,
    pub files_deleted: u32,
    pub files_skipped: u32,
    pub files_failed: u32,
    pub dirs_created: u32,
    pub files_renamed: u32,
    pub bytes_transferred: u64,
    pub errors: Vec<ActionError>,
    pub warnings: Vec<String>,
    pub conflicts: Vec<ConflictRecord>,
    pub baseline_committed: bool,
    #[serde(skip)]
    pub paused: Option<PausedRun>,
}

impl SyncResult {
    /// 规划前就失败（扫描出错、计划无效等）
    pub fn failed(job_id: &str, start_time: i64, message: String) -> Self {
        let end_time = chrono::Utc::now().timestamp();
        Self {
            job_id: job_id.to_string(),
            status: SyncStatus::Failed,
            start_time,
            end_time,
            duration_ms: ((end_time - start_time).max(0) * 1000) as u64,
            files_copied: 0,
            files_updated: 0,
            files_deleted: 0,
            files_skipped: 0,
            files_failed: 0,
            dirs_created: 0,
            files_renamed: 0,
            bytes_transferred: 0,
            errors: Vec::new(),
            warnings: vec![message],
            conflicts: Vec::new(),
            baseline_committed: false,
            paused: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Completed
    }

    /// 错误摘要（写入历史记录）
    pub fn error_summary(&self) -> Option<String> {
        let messages: Vec<String> = self
            .errors
            .iter()
            .map(|e| e.to_string())
            .chain(
                (self.status == SyncStatus::Failed)
                    .then(|| self.warnings.clone())
                    .unwrap_or_default(),
            )
            .collect();
        (!messages.is_empty()).then(|| messages.join("; "))
    }
}

/// 计划执行器
pub struct SyncExecutor {
    source: Arc<dyn Storage>,
    dest: Arc<dyn Storage>,
    config: ExecutorConfig,
}

impl SyncExecutor {
    pub fn new(source: Arc<dyn Storage>, dest: Arc<dyn Storage>, config: ExecutorConfig) -> Self {
        Self { source, dest, config }
    }

    fn storage(&self, side: Side) -> &dyn Storage {
        match side {
            Side::Source => self.source.as_ref(),
            Side::Destination => self.dest.as_ref(),
        }
    }

    /// 执行计划
    pub async fn execute(
        &self,
        plan: Plan,
        job_id: &str,
        progress_tx: Option<mpsc::Sender<SyncProgress>>,
        control: &SyncControl,
    ) -> SyncResult {
        self.run(plan, 0, Tally::default(), job_id, progress_tx, control).await
    }

    /// 从暂停处继续
    pub async fn resume(
        &self,
        paused: PausedRun,
        job_id: &str,
        progress_tx: Option<mpsc::Sender<SyncProgress>>,
        control: &SyncControl,
    ) -> SyncResult {
        info!("继续执行: 从第 {} 个动作开始", paused.next_action + 1);
        control.unpause();
        self.run(paused.plan, paused.next_action, paused.tally, job_id, progress_tx, control)
            .await
    }

    async fn run(
        &self,
        plan: Plan,
        start: usize,
        mut tally: Tally,
        job_id: &str,
        progress_tx: Option<mpsc::Sender<SyncProgress>>,
        control: &SyncControl,
    ) -> SyncResult {
        let start_time = chrono::Utc::now().timestamp();
        let started = Instant::now();
        let files_total = plan.total_files();
        let bytes_total = plan.total_bytes();

        info!(
            "开始执行计划: {} 个动作, {} 字节",
            plan.actions().len(),
            bytes_total
        );

        let mut stopped_by_failure = false;
        let mut cancelled = false;
        let mut paused_at = None;

        for (index, action) in plan.actions().iter().enumerate().skip(start) {
            if control.is_cancelled() {
                info!("同步已取消，剩余 {} 个动作未执行", plan.actions().len() - index);
                cancelled = true;
                break;
            }
            if control.is_paused() {
                info!("同步已暂停于第 {} 个动作", index + 1);
                paused_at = Some(index);
                break;
            }
            if stopped_by_failure {
                tally.files_skipped += 1;
                continue;
            }

            send_progress(
                &progress_tx,
                SyncProgress {
                    job_id: job_id.to_string(),
                    phase: SyncPhase::Syncing,
                    current_file: action.path.clone(),
                    files_total,
                    files_done: tally.actions_done,
                    files_failed: tally.files_failed as usize,
                    bytes_total,
                    bytes_done: tally.bytes_transferred,
                    percent: percent(
                        tally.actions_done,
                        files_total,
                        tally.bytes_transferred,
                        bytes_total,
                    ),
                },
            );

            if action.kind == ActionKind::Skip {
                debug!("跳过: {} ({})", action.path, action.reason);
                tally.record(ActionKind::Skip, 0);
                continue;
            }

            match self.execute_with_retry(action, control).await {
                Ok(bytes) => {
                    tally.record(action.kind, bytes);
                    tally.actions_done += 1;
                }
                Err(err) => {
                    error!("动作失败: {}", err);
                    tally.files_failed += 1;
                    tally.actions_done += 1;
                    tally.errors.push(err);
                    if self.config.fail_fast {
                        warn!("fail-fast: 停止执行，剩余动作记为跳过");
                        stopped_by_failure = true;
                    }
                }
            }
        }

        tally.elapsed += started.elapsed();
        let end_time = chrono::Utc::now().timestamp();

        let status = if cancelled {
            SyncStatus::Cancelled
        } else if paused_at.is_some() {
            SyncStatus::Paused
        } else if tally.files_failed > 0 {
            if tally.succeeded() > 0 {
                SyncStatus::PartiallyCompleted
            } else {
                SyncStatus::Failed
            }
        } else {
            SyncStatus::Completed
        };

        send_progress(
            &progress_tx,
            SyncProgress {
                job_id: job_id.to_string(),
                phase: SyncPhase::Finished,
                current_file: String::new(),
                files_total,
                files_done: tally.actions_done,
                files_failed: tally.files_failed as usize,
                bytes_total,
                bytes_done: tally.bytes_transferred,
                percent: percent(
                    tally.actions_done,
                    files_total,
                    tally.bytes_transferred,
                    bytes_total,
                ),
            },
        );

        info!(
            "执行结束 ({}): 复制 {}, 更新 {}, 删除 {}, 跳过 {}, 失败 {}",
            status,
            tally.files_copied,
            tally.files_updated,
            tally.files_deleted,
            tally.files_skipped,
            tally.files_failed
        );

        let warnings = plan.warnings().to_vec();
        let conflicts = plan.conflicts().to_vec();
        let paused = paused_at.map(|next_action| PausedRun {
            plan,
            next_action,
            tally: tally.clone(),
        });

        SyncResult {
            job_id: job_id.to_string(),
            status,
            start_time,
            end_time,
            duration_ms: tally.elapsed.as_millis() as u64,
            files_copied: tally.files_copied,
            files_updated: tally.files_updated,
            files_deleted: tally.files_deleted,
            files_skipped: tally.files_skipped,
            files_failed: tally.files_failed,
            dirs_created: tally.dirs_created,
            files_renamed: tally.files_renamed,
            bytes_transferred: tally.bytes_transferred,
            errors: tally.errors,
            warnings,
            conflicts,
            baseline_committed: false,
            paused,
        }
    }

    /// 带重试的动作执行，只有临时错误才重试
    async fn execute_with_retry(
        &self,
        action: &Action,
        control: &SyncControl,
    ) -> Result<u64, ActionError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match self.execute_action(action).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => e,
            };

            let transient = is_transient(&err);
            let failure = ActionError {
                path: action.path.clone(),
                action: action.kind.to_string(),
                message: format!("{:#}", err),
                attempts: attempt,
                transient,
            };

            if !transient || attempt > self.config.max_retries {
                return Err(failure);
            }

            // 指数退避
            let backoff = 1u64 << (attempt - 1).min(16);
            let delay = self.config.retry_base_delay_ms.saturating_mul(backoff);
            warn!(
                "操作失败，{}ms 后重试 ({}/{}): {}",
                delay, attempt, self.config.max_retries, failure.message
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = control.cancel.cancelled() => return Err(failure),
            }
        }
    }

    /// 执行单个动作，返回传输的字节数
    async fn execute_action(&self, action: &Action) -> Result<u64> {
        let target = self.storage(action.target);

        match action.kind {
            ActionKind::Copy | ActionKind::Update => {
                let from = self.storage(action.target.other());
                debug!(
                    "复制: {}:{} -> {}:{}",
                    action.target.other(),
                    action.read_path(),
                    action.target,
                    action.path
                );
                let mut reader = from
                    .open(action.read_path())
                    .await
                    .with_context(|| format!("读取失败: {}", action.read_path()))?;
                let bytes = target
                    .write_from(&action.path, &mut reader, action.modified_time)
                    .await
                    .with_context(|| format!("写入失败: {}", action.path))?;
                Ok(bytes)
            }
            ActionKind::Delete => {
                debug!("删除: {}:{}", action.target, action.path);
                target.delete(&action.path).await?;
                Ok(0)
            }
            ActionKind::CreateDir => {
                debug!("创建目录: {}:{}", action.target, action.path);
                target.create_dir(&action.path).await?;
                Ok(0)
            }
            ActionKind::Rename => {
                let from = action
                    .from_path
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("改名动作缺少原路径: {}", action.path))?;
                debug!("改名: {}:{} -> {}", action.target, from, action.path);
                target.rename(from, &action.path).await?;
                Ok(0)
            }
            ActionKind::Skip => Ok(0),
        }
    }
}

fn percent(done: usize, total: usize, bytes_done: u64, bytes_total: u64) -> f64 {
    if bytes_total > 0 {
        (bytes_done as f64 / bytes_total as f64 * 100.0).min(100.0)
    } else if total > 0 {
        (done as f64 / total as f64 * 100.0).min(100.0)
    } else {
        100.0
    }
}
