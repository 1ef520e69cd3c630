use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod logging;
pub mod storage;

pub use crate::config::EngineConfig;
pub use crate::core::{Plan, SyncControl, SyncEngine, SyncError, SyncResult};
pub use db::models::{SyncDirection, SyncJob, SyncMode, SyncOptions, SyncStatus};

/// 暂停的运行及其选项，等待 resume
pub type PausedRuns = Arc<Mutex<HashMap<String, (core::PausedRun, SyncOptions)>>>;

/// 正在运行的任务的取消/暂停控制
pub type Controls = Arc<Mutex<HashMap<String, SyncControl>>>;

/// 应用状态，在各命令之间共享
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub config_dir: PathBuf,
    pub engine: SyncEngine,
    /// 同时运行的任务数限制
    pub job_slots: Arc<Semaphore>,
    pub controls: Controls,
    pub paused_runs: PausedRuns,
}

impl AppState {
    pub async fn new() -> anyhow::Result<Self> {
        let config_dir = dirs::data_dir();
        std::fs::create_dir_all(&config_dir)?;

        let db = db::connect(&config_dir.join("foldersync.db")).await?;
        let state = Self::with_pool(db, config_dir);
        commands::job::recover_interrupted_jobs(&state).await?;
        Ok(state)
    }

    /// 使用已打开的连接池（测试中使用内存数据库）
    pub fn with_pool(db: SqlitePool, config_dir: PathBuf) -> Self {
        let config = EngineConfig::load(&config_dir);
        tracing::debug!("引擎配置: {:?}", config);

        let db = Arc::new(db);
        Self {
            job_slots: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            engine: SyncEngine::new(db.clone(), config, core::JobLocks::new()),
            db,
            config_dir,
            controls: Arc::new(Mutex::new(HashMap::new())),
            paused_runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 清理资源（退出前调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");

        // 1. 取消所有正在进行的同步任务
        {
            let controls = self.controls.lock().await;
            for (job_id, control) in controls.iter() {
                tracing::debug!("取消同步任务: {}", job_id);
                control.cancel();
            }
        }

        // 2. 丢弃暂停的运行
        self.paused_runs.lock().await.clear();

        // 3. 关闭数据库连接池
        tracing::debug!("关闭数据库连接池...");
        self.db.close().await;

        tracing::info!("资源清理完成");
    }
}

/// 平台目录
pub mod dirs {
    use std::path::PathBuf;

    const APP_DIR: &str = "foldersync";

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        }
    }

    /// 默认应用目录
    pub fn default_data_dir() -> PathBuf {
        config_dir()
            .map(|p| p.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(".foldersync"))
    }

    /// 数据目录：默认目录的 config.json 可以用 `data_path` 指向另一个已存在的目录
    pub fn data_dir() -> PathBuf {
        let default_dir = default_data_dir();
        std::fs::read_to_string(default_dir.join("config.json"))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("data_path")?.as_str().map(PathBuf::from))
            .filter(|p| p.is_dir())
            .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
            .unwrap_or(default_dir)
    }
}
