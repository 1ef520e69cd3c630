//! 日志相关命令

use crate::core::SyncError;
use crate::logging::LogConfig;
use crate::AppState;

/// 获取日志配置
pub async fn get_log_config(state: &AppState) -> LogConfig {
    LogConfig::load(&state.config_dir)
}

/// 设置日志配置（下次启动时生效）
pub async fn set_log_config(
    state: &AppState,
    enabled: Option<bool>,
    max_size_mb: Option<u32>,
    level: Option<String>,
) -> Result<LogConfig, SyncError> {
    let mut config = LogConfig::load(&state.config_dir);

    if let Some(e) = enabled {
        config.enabled = e;
    }
    if let Some(size) = max_size_mb {
        // 限制范围 1-100 MB
        config.max_size_mb = size.clamp(1, 100);
    }
    if let Some(l) = level {
        if !LogConfig::is_valid_level(&l) {
            return Err(SyncError::Planning(format!("无效的日志级别: {}", l)));
        }
        config.level = l.to_lowercase();
    }

    config
        .save(&state.config_dir)
        .map_err(|e| SyncError::Storage(e.into()))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_log_config_validates_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_in_memory().await.unwrap();
        let state = AppState::with_pool(pool, dir.path().to_path_buf());

        let config = set_log_config(&state, Some(false), Some(500), Some("DEBUG".into()))
            .await
            .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.max_size_mb, 100);
        assert_eq!(config.level, "debug");
        assert_eq!(get_log_config(&state).await, config);

        assert!(set_log_config(&state, None, None, Some("loud".into())).await.is_err());
    }
}
