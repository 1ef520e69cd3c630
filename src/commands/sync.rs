//! 同步相关命令：预览、运行、取消、暂停/继续、历史、冲突

use crate::core::conflict::{ConflictResolution, StoredConflict};
use crate::core::executor::{SyncControl, SyncProgress, SyncResult};
use crate::core::line_diff::{diff_lines, Hunk};
use crate::core::planner::Plan;
use crate::core::{JobLease, SyncEngine, SyncError};
use crate::db::{SyncJob, SyncLog, SyncOptions, SyncStatus};
use crate::{AppState, Controls};
use scopeguard::ScopeGuard;
use std::path::Path;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, info};

const DEFAULT_HISTORY_LIMIT: i64 = 20;

/// 占用一个并发运行名额
pub(crate) async fn acquire_slot(state: &AppState) -> Result<OwnedSemaphorePermit, SyncError> {
    state
        .job_slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| SyncError::Storage(e.into()))
}

/// 登记控制句柄，在持有运行锁期间执行同步；暂停的运行保存起来等待继续
pub(crate) async fn run_with_lease(
    state: &AppState,
    lease: &JobLease,
    source: &Path,
    dest: &Path,
    options: &SyncOptions,
    progress_tx: Option<mpsc::Sender<SyncProgress>>,
) -> Result<SyncResult, SyncError> {
    let job_id = lease.job_id().to_string();
    let control = register_control(state, &job_id).await;
    let cleanup = cleanup_on_drop(state, &job_id, &control);

    state.paused_runs.lock().await.remove(&job_id);
    let outcome = state
        .engine
        .run_sync(lease, source, dest, options, progress_tx, &control)
        .await;
    unregister_control(&state.controls, &job_id, &control).await;
    ScopeGuard::into_inner(cleanup);

    let mut result = outcome?;
    keep_paused(state, &job_id, &mut result, options).await;
    Ok(result)
}

async fn register_control(state: &AppState, job_id: &str) -> SyncControl {
    let control = SyncControl::new();
    state
        .controls
        .lock()
        .await
        .insert(job_id.to_string(), control.clone());
    control
}

/// 移除控制句柄；同一任务已登记了新的运行时保留新的
async fn unregister_control(controls: &Controls, job_id: &str, control: &SyncControl) {
    let mut controls = controls.lock().await;
    if controls.get(job_id).is_some_and(|c| c.same_run(control)) {
        controls.remove(job_id);
    }
}

type ControlSlot = (Controls, String, SyncControl);

/// 运行中途被丢弃（调用方放弃等待）时补做清理
fn cleanup_on_drop(
    state: &AppState,
    job_id: &str,
    control: &SyncControl,
) -> ScopeGuard<ControlSlot, impl FnOnce(ControlSlot)> {
    scopeguard::guard(
        (state.controls.clone(), job_id.to_string(), control.clone()),
        |(controls, job_id, control)| {
            tokio::spawn(async move {
                unregister_control(&controls, &job_id, &control).await;
            });
        },
    )
}

async fn keep_paused(
    state: &AppState,
    job_id: &str,
    result: &mut SyncResult,
    options: &SyncOptions,
) {
    if let Some(paused) = result.paused.take() {
        debug!("保存暂停的运行: {} (剩余 {} 个动作)", job_id, paused.remaining());
        state
            .paused_runs
            .lock()
            .await
            .insert(job_id.to_string(), (paused, options.clone()));
    }
}

/// 预览两个目录之间的同步计划（不修改任何文件）
pub async fn preview_sync(
    state: &AppState,
    source: &Path,
    dest: &Path,
    options: &SyncOptions,
) -> Result<Plan, SyncError> {
    let job_id = SyncEngine::job_key(source, dest);
    state.engine.preview_sync(&job_id, source, dest, options).await
}

/// 预览任务的同步计划
pub async fn preview_job(state: &AppState, job_id: &str) -> Result<Plan, SyncError> {
    let job = super::job::get_job(state, job_id).await?;
    state
        .engine
        .preview_sync(
            &job.id,
            Path::new(&job.source_path),
            Path::new(&job.dest_path),
            &job.options,
        )
        .await
}

/// 同步两个目录（没有任务记录，按目录对生成任务键）
pub async fn run_sync(
    state: &AppState,
    source: &Path,
    dest: &Path,
    options: &SyncOptions,
    progress_tx: Option<mpsc::Sender<SyncProgress>>,
) -> Result<SyncResult, SyncError> {
    let job_id = SyncEngine::job_key(source, dest);
    let _permit = acquire_slot(state).await?;
    let lease = state.engine.lock_job(&job_id)?;
    run_with_lease(state, &lease, source, dest, options, progress_tx).await
}

/// 取消正在运行的同步，返回是否找到该任务
pub async fn cancel_sync(state: &AppState, job_id: &str) -> bool {
    let dropped = state.paused_runs.lock().await.remove(job_id).is_some();
    match state.controls.lock().await.get(job_id) {
        Some(control) => {
            info!("请求取消同步任务: {}", job_id);
            control.cancel();
            true
        }
        None => dropped,
    }
}

/// 暂停正在运行的同步（在当前动作完成后生效）
pub async fn pause_sync(state: &AppState, job_id: &str) -> bool {
    match state.controls.lock().await.get(job_id) {
        Some(control) => {
            info!("请求暂停同步任务: {}", job_id);
            control.pause();
            true
        }
        None => false,
    }
}

/// 是否有暂停的运行等待继续
pub async fn has_paused_run(state: &AppState, job_id: &str) -> bool {
    state.paused_runs.lock().await.contains_key(job_id)
}

/// 从暂停处继续同步
pub async fn resume_sync(
    state: &AppState,
    job_id: &str,
    progress_tx: Option<mpsc::Sender<SyncProgress>>,
) -> Result<SyncResult, SyncError> {
    let _permit = acquire_slot(state).await?;
    let lease = state.engine.lock_job(job_id)?;

    let (paused, options) = state
        .paused_runs
        .lock()
        .await
        .remove(job_id)
        .ok_or_else(|| SyncError::Planning(format!("任务 {} 没有暂停的运行", job_id)))?;

    let control = register_control(state, job_id).await;
    let cleanup = cleanup_on_drop(state, job_id, &control);

    let outcome = state
        .engine
        .resume_sync(&lease, paused, &options, progress_tx, &control)
        .await;
    unregister_control(&state.controls, job_id, &control).await;
    ScopeGuard::into_inner(cleanup);

    let mut result = outcome?;
    keep_paused(state, job_id, &mut result, &options).await;

    // 任务记录跟随最终结果
    if let Some(job) = SyncJob::load(&state.db, job_id).await? {
        job.with_last_run(result.status, result.end_time)
            .save(&state.db)
            .await?;
    }
    Ok(result)
}

/// 获取同步历史（最新在前）
pub async fn get_sync_history(
    state: &AppState,
    job_id: &str,
    limit: Option<i64>,
) -> Result<Vec<SyncLog>, SyncError> {
    state
        .engine
        .history(job_id, limit.unwrap_or(DEFAULT_HISTORY_LIMIT).max(1))
        .await
}

/// 最近一次运行的状态
pub async fn last_status(state: &AppState, job_id: &str) -> Result<Option<SyncStatus>, SyncError> {
    Ok(get_sync_history(state, job_id, Some(1))
        .await?
        .first()
        .map(|log| log.status))
}

/// 等待调用方决定的冲突
pub async fn get_pending_conflicts(
    state: &AppState,
    job_id: &str,
) -> Result<Vec<StoredConflict>, SyncError> {
    Ok(state.engine.conflicts().get_pending_conflicts(job_id).await?)
}

/// 记录调用方对某个冲突的决定，下一次运行（或预览）会按它处理该路径
pub async fn resolve_conflict(
    state: &AppState,
    conflict_id: i64,
    resolution: ConflictResolution,
) -> Result<(), SyncError> {
    info!("冲突 {} 决定为 {}", conflict_id, resolution);
    Ok(state
        .engine
        .conflicts()
        .resolve_conflict(conflict_id, resolution)
        .await?)
}

/// 冲突文本文件的行级差异（源为 A，目标为 B）
pub async fn get_conflict_diff(
    source: &Path,
    dest: &Path,
    path: &str,
    context: usize,
) -> Result<Vec<Hunk>, SyncError> {
    let a = read_text(&source.join(path)).await?;
    let b = read_text(&dest.join(path)).await?;
    Ok(diff_lines(&a, &b, context))
}

/// 读取文本文件，不存在时视为空文本
async fn read_text(path: &Path) -> Result<String, SyncError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(SyncError::Storage(e.into())),
    };
    String::from_utf8(bytes)
        .map_err(|_| SyncError::Storage(anyhow::anyhow!("不是文本文件: {}", path.display())))
}
