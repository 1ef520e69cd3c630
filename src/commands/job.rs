//! 任务管理命令：创建、修改、删除、启停、运行，以及供外部调度器使用的查询

use crate::core::conflict::ConflictResolution;
use crate::core::executor::{SyncProgress, SyncResult};
use crate::core::schedule::{ScheduleStatus, Trigger};
use crate::core::SyncError;
use crate::db::{SyncJob, SyncOptions, SyncStatus};
use crate::AppState;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 获取所有同步任务
pub async fn get_jobs(state: &AppState) -> Result<Vec<SyncJob>, SyncError> {
    Ok(SyncJob::load_all(&state.db).await?)
}

/// 获取单个任务，不存在时返回 `JobNotFound`
pub async fn get_job(state: &AppState, job_id: &str) -> Result<SyncJob, SyncError> {
    SyncJob::load(&state.db, job_id)
        .await?
        .ok_or_else(|| SyncError::JobNotFound(job_id.to_string()))
}

fn validate_paths(source_path: &str, dest_path: &str) -> Result<(), SyncError> {
    if source_path.trim().is_empty() || dest_path.trim().is_empty() {
        return Err(SyncError::Planning("源目录和目标目录不能为空".to_string()));
    }
    if Path::new(source_path) == Path::new(dest_path) {
        return Err(SyncError::Planning("源目录和目标目录相同".to_string()));
    }
    Ok(())
}

/// 创建新的同步任务
pub async fn create_job(
    state: &AppState,
    name: String,
    source_path: String,
    dest_path: String,
    options: SyncOptions,
    schedule: Trigger,
) -> Result<SyncJob, SyncError> {
    validate_paths(&source_path, &dest_path)?;
    schedule.validate()?;

    let job = SyncJob::new(name, source_path, dest_path, options, schedule);
    job.save(&state.db).await?;

    info!("创建同步任务: {} ({})", job.name, job.id);
    Ok(job)
}

/// 更新同步任务；目录、模式或方向变化时旧基线作废
pub async fn update_job(
    state: &AppState,
    job_id: &str,
    name: String,
    source_path: String,
    dest_path: String,
    options: SyncOptions,
    schedule: Trigger,
) -> Result<SyncJob, SyncError> {
    validate_paths(&source_path, &dest_path)?;
    schedule.validate()?;
    let _lease = state.engine.lock_job(job_id)?;
    let job = get_job(state, job_id).await?;

    let roots_changed = job.source_path != source_path || job.dest_path != dest_path;
    let semantics_changed =
        job.options.mode != options.mode || job.options.direction != options.direction;
    let now = chrono::Utc::now().timestamp();
    let schedule_state = job.schedule_state().with_trigger(schedule, now);

    let updated = SyncJob {
        name,
        source_path,
        dest_path,
        options,
        ..job
    }
    .with_schedule_state(schedule_state);
    updated.save(&state.db).await?;

    if roots_changed {
        info!("任务 {} 的目录已变化，清除旧基线", job_id);
        state.engine.baselines().delete(job_id).await?;
    } else if semantics_changed {
        info!("任务 {} 的同步模式或方向已变化，清除旧基线", job_id);
        state.engine.baselines().delete(job_id).await?;
    }
    Ok(updated)
}

/// 删除同步任务（连同基线、冲突记录和历史）
pub async fn delete_job(state: &AppState, job_id: &str) -> Result<(), SyncError> {
    let _lease = state.engine.lock_job(job_id)?;
    get_job(state, job_id).await?;

    SyncJob::delete(&state.db, job_id).await?;
    state.engine.forget_job(job_id).await?;
    state.paused_runs.lock().await.remove(job_id);

    info!("删除同步任务: {}", job_id);
    Ok(())
}

/// 启用或停用任务
pub async fn set_job_enabled(
    state: &AppState,
    job_id: &str,
    enabled: bool,
) -> Result<SyncJob, SyncError> {
    let job = get_job(state, job_id).await?;
    if job.enabled == enabled {
        return Ok(job);
    }

    let now = chrono::Utc::now().timestamp();
    let schedule_state = if enabled {
        job.schedule_state().enable(now)?
    } else {
        job.schedule_state().disable()?
    };

    let updated = job.with_schedule_state(schedule_state);
    updated.save(&state.db).await?;
    info!("任务 {} 已{}", job_id, if enabled { "启用" } else { "停用" });
    Ok(updated)
}

/// 运行任务
///
/// 通过 `resolve_conflict` 保存的决定会自动应用；`resolutions` 是本次运行额外的决定，
/// 同一路径以它为准。
pub async fn run_job(
    state: &AppState,
    job_id: &str,
    resolutions: HashMap<String, ConflictResolution>,
    progress_tx: Option<mpsc::Sender<SyncProgress>>,
) -> Result<SyncResult, SyncError> {
    let job = get_job(state, job_id).await?;
    if !job.enabled {
        return Err(SyncError::JobDisabled(job_id.to_string()));
    }

    let _permit = super::sync::acquire_slot(state).await?;
    let lease = state.engine.lock_job(job_id)?;

    // 等待名额期间任务可能已被修改
    let job = get_job(state, job_id).await?;
    let started_at = chrono::Utc::now().timestamp();
    let running = job.schedule_state().start(started_at)?;
    let job = job.with_schedule_state(running.clone());
    job.save(&state.db).await?;

    let mut options = job.options.clone();
    options.conflict_resolutions.extend(resolutions);

    let outcome = super::sync::run_with_lease(
        state,
        &lease,
        Path::new(&job.source_path),
        Path::new(&job.dest_path),
        &options,
        progress_tx,
    )
    .await;

    // 运行期间可能记录了新的变化
    let latest = SyncJob::load(&state.db, job_id).await?.unwrap_or(job);
    let running = crate::core::schedule::ScheduleState {
        last_change: latest.last_change_at,
        ..running
    };

    let (status, finished_at) = match &outcome {
        Ok(result) => (result.status, result.end_time),
        Err(e) => {
            warn!("任务 {} 运行失败: {}", job_id, e);
            (SyncStatus::Failed, chrono::Utc::now().timestamp())
        }
    };
    let finished = running.finish(status.schedule_outcome(), finished_at)?;
    latest
        .with_schedule_state(finished)
        .with_last_run(status, finished_at)
        .save(&state.db)
        .await?;

    outcome
}

/// 到期需要运行的任务（供外部调度器轮询）
pub async fn due_jobs(state: &AppState, now: i64) -> Result<Vec<SyncJob>, SyncError> {
    Ok(SyncJob::load_due(&state.db, now).await?)
}

/// 记录目录变化（OnChange 触发器据此推迟下一次运行）
pub async fn note_change(state: &AppState, job_id: &str, at: i64) -> Result<SyncJob, SyncError> {
    let job = get_job(state, job_id).await?;
    let schedule_state = job.schedule_state().note_change(at);
    let updated = job.with_schedule_state(schedule_state);
    updated.save(&state.db).await?;
    Ok(updated)
}

/// 启动时处理上次异常退出时仍处于运行中的任务
pub async fn recover_interrupted_jobs(state: &AppState) -> Result<usize, SyncError> {
    let now = chrono::Utc::now().timestamp();
    let mut recovered = 0;

    for job in SyncJob::load_all(&state.db).await? {
        if job.schedule_status != ScheduleStatus::Running {
            continue;
        }
        warn!("任务 {} 上次运行被中断，标记为已取消", job.id);
        let finished = job.schedule_state().finish(ScheduleStatus::Cancelled, now)?;
        job.with_schedule_state(finished)
            .with_last_run(SyncStatus::Cancelled, now)
            .save(&state.db)
            .await?;
        recovered += 1;
    }

    Ok(recovered)
}
