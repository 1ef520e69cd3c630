//! 同步错误分类

use serde::{Deserialize, Serialize};
use std::io;

/// 引擎级错误（需要调用方区分处理的失败）
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// 选项无效或互相矛盾，无法生成计划
    #[error("无法生成同步计划: {0}")]
    Planning(String),
    /// 任务没有可用基线（首次同步或基线已丢失）
    #[error("任务 {0} 没有可用的基线")]
    BaselineUnavailable(String),
    #[error("任务不存在: {0}")]
    JobNotFound(String),
    #[error("任务已禁用: {0}")]
    JobDisabled(String),
    /// 同一任务已有一次运行持有锁
    #[error("任务 {0} 正在运行")]
    JobBusy(String),
    #[error("无效的调度状态转换: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<sqlx::migrate::MigrateError> for SyncError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        SyncError::Storage(e.into())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Storage(e.into())
    }
}

/// 扫描时的单条软错误，附加在快照上，不中断遍历
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanError {
    pub path: String,
    pub message: String,
}

impl ScanError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// 单个动作执行失败的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionError {
    pub path: String,
    pub action: String,
    pub message: String,
    /// 实际尝试次数（含首次）
    pub attempts: u32,
    pub transient: bool,
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}: {} (尝试 {} 次)",
            self.action, self.path, self.message, self.attempts
        )
    }
}

/// 判断错误是否为可重试的临时 I/O 错误（共享冲突、文件被锁定等）
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(is_transient_io)
}

fn is_transient_io(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    match err.raw_os_error() {
        // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
        #[cfg(windows)]
        Some(32) | Some(33) => true,
        // EBUSY / ETXTBSY（EAGAIN 已映射为 WouldBlock）
        #[cfg(unix)]
        Some(16) | Some(26) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_detection() {
        let busy = anyhow::Error::new(io::Error::new(io::ErrorKind::WouldBlock, "locked"));
        assert!(is_transient(&busy));

        let wrapped = anyhow::Error::new(io::Error::new(io::ErrorKind::TimedOut, "slow"))
            .context("复制失败");
        assert!(is_transient(&wrapped));

        let missing = anyhow::Error::new(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(!is_transient(&missing));

        assert!(!is_transient(&anyhow::anyhow!("plain message")));
    }
}
