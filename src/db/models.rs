use crate::core::conflict::{ConflictPolicy, ConflictResolution};
use crate::core::scanner::ScanFilters;
use crate::core::schedule::{ScheduleState, ScheduleStatus, Trigger};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 同步模式：决定仅目标侧存在的条目如何处理
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// 目标与源完全一致（删除目标多余文件）
    Mirror,
    /// 只复制新文件和较新的文件，不删除
    Update,
    /// 与 Mirror 类似，但只删除上次同步过的文件
    Echo,
    /// 只添加新文件，不覆盖不删除
    Contribute,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Mirror
    }
}

/// 同步方向（哪一侧可写）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    SourceToDestination,
    DestinationToSource,
    Bidirectional,
}

impl Default for SyncDirection {
    fn default() -> Self {
        SyncDirection::SourceToDestination
    }
}

/// 同步选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub direction: SyncDirection,
    pub conflict_policy: ConflictPolicy,
    pub filters: ScanFilters,
    /// 扫描时计算内容 hash
    pub verify_with_hash: bool,
    /// 路径大小写策略，None 使用平台默认
    pub case_sensitive: Option<bool>,
    /// 遇到第一个失败即停止，剩余动作记为跳过
    pub fail_fast: bool,
    /// 调用方对冲突路径的决定（用于 Ask 之后继续）
    pub conflict_resolutions: HashMap<String, ConflictResolution>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            direction: SyncDirection::default(),
            conflict_policy: ConflictPolicy::default(),
            filters: ScanFilters::default(),
            verify_with_hash: false,
            case_sensitive: None,
            fail_fast: false,
            conflict_resolutions: HashMap::new(),
        }
    }
}

impl SyncOptions {
    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
            .unwrap_or_else(crate::core::snapshot::default_case_sensitive)
    }
}

/// 同步结果状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// 全部动作成功
    Completed,
    /// 部分动作失败
    PartiallyCompleted,
    Failed,
    Cancelled,
    /// 暂停，可从下一个动作继续
    Paused,
    /// 存在等待调用方决定的冲突
    AwaitingDecision,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Completed => "completed",
            SyncStatus::PartiallyCompleted => "partially_completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
            SyncStatus::Paused => "paused",
            SyncStatus::AwaitingDecision => "awaiting_decision",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "completed" => SyncStatus::Completed,
            "partially_completed" => SyncStatus::PartiallyCompleted,
            "failed" => SyncStatus::Failed,
            "cancelled" => SyncStatus::Cancelled,
            "paused" => SyncStatus::Paused,
            "awaiting_decision" => SyncStatus::AwaitingDecision,
            _ => return None,
        })
    }

    /// 对应的调度结束状态
    pub fn schedule_outcome(self) -> ScheduleStatus {
        match self {
            SyncStatus::Completed | SyncStatus::AwaitingDecision => ScheduleStatus::Completed,
            SyncStatus::PartiallyCompleted | SyncStatus::Failed => ScheduleStatus::Failed,
            SyncStatus::Cancelled | SyncStatus::Paused => ScheduleStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 同步任务（不可变记录，更新时生成新值再写回）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub id: String,
    pub name: String,
    pub source_path: String,
    pub dest_path: String,
    pub options: SyncOptions,
    pub schedule: Trigger,
    pub schedule_status: ScheduleStatus,
    pub enabled: bool,
    pub last_run_status: Option<SyncStatus>,
    pub last_run_at: Option<i64>,
    pub next_run_at: Option<i64>,
    pub last_change_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SyncJob {
    /// 创建新任务
    pub fn new(
        name: String,
        source_path: String,
        dest_path: String,
        options: SyncOptions,
        schedule: Trigger,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        let state = ScheduleState::new(schedule.clone(), now);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            source_path,
            dest_path,
            options,
            schedule,
            schedule_status: state.status,
            enabled: true,
            last_run_status: None,
            last_run_at: None,
            next_run_at: state.next_run,
            last_change_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 当前调度状态
    pub fn schedule_state(&self) -> ScheduleState {
        ScheduleState {
            trigger: self.schedule.clone(),
            status: self.schedule_status,
            last_completion: self.last_run_at,
            last_change: self.last_change_at,
            next_run: self.next_run_at,
            started_at: None,
        }
    }

    /// 写回新的调度状态
    pub fn with_schedule_state(self, state: ScheduleState) -> Self {
        Self {
            schedule: state.trigger,
            schedule_status: state.status,
            enabled: state.status != ScheduleStatus::Disabled,
            last_run_at: state.last_completion,
            last_change_at: state.last_change,
            next_run_at: state.next_run,
            updated_at: chrono::Utc::now().timestamp(),
            ..self
        }
    }

    /// 记录最近一次运行结果
    pub fn with_last_run(self, status: SyncStatus, at: i64) -> Self {
        Self {
            last_run_status: Some(status),
            last_run_at: Some(at),
            updated_at: chrono::Utc::now().timestamp(),
            ..self
        }
    }
}

/// 同步历史记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub id: i64,
    pub job_id: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: SyncStatus,
    pub files_copied: u32,
    pub files_updated: u32,
    pub files_deleted: u32,
    pub files_skipped: u32,
    pub files_failed: u32,
    pub bytes_transferred: u64,
    pub conflict_count: u32,
    pub error_message: Option<String>,
}

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncJobRow {
    pub id: String,
    pub name: String,
    pub source_path: String,
    pub dest_path: String,
    pub options: String,
    pub schedule: String,
    pub schedule_status: String,
    pub enabled: bool,
    pub last_run_status: Option<String>,
    pub last_run_at: Option<i64>,
    pub next_run_at: Option<i64>,
    pub last_change_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<SyncJobRow> for SyncJob {
    type Error = anyhow::Error;

    fn try_from(row: SyncJobRow) -> Result<Self, Self::Error> {
        let options: SyncOptions = serde_json::from_str(&row.options)?;
        let schedule: Trigger = serde_json::from_str(&row.schedule)?;
        let schedule_status = ScheduleStatus::parse(&row.schedule_status)
            .ok_or_else(|| anyhow::anyhow!("Invalid schedule status: {}", row.schedule_status))?;

        Ok(SyncJob {
            id: row.id,
            name: row.name,
            source_path: row.source_path,
            dest_path: row.dest_path,
            options,
            schedule,
            schedule_status,
            enabled: row.enabled,
            last_run_status: row.last_run_status.as_deref().and_then(SyncStatus::parse),
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            last_change_at: row.last_change_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncLogRow {
    pub id: i64,
    pub job_id: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: String,
    pub files_copied: i64,
    pub files_updated: i64,
    pub files_deleted: i64,
    pub files_skipped: i64,
    pub files_failed: i64,
    pub bytes_transferred: i64,
    pub conflict_count: i64,
    pub error_message: Option<String>,
}

impl From<SyncLogRow> for SyncLog {
    fn from(row: SyncLogRow) -> Self {
        SyncLog {
            id: row.id,
            job_id: row.job_id,
            start_time: row.start_time,
            end_time: row.end_time,
            status: SyncStatus::parse(&row.status).unwrap_or(SyncStatus::Failed),
            files_copied: row.files_copied.max(0) as u32,
            files_updated: row.files_updated.max(0) as u32,
            files_deleted: row.files_deleted.max(0) as u32,
            files_skipped: row.files_skipped.max(0) as u32,
            files_failed: row.files_failed.max(0) as u32,
            bytes_transferred: row.bytes_transferred.max(0) as u64,
            conflict_count: row.conflict_count.max(0) as u32,
            error_message: row.error_message,
        }
    }
}
