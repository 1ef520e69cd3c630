//! 应用配置模块

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// 引擎配置（config.json 的 "engine" 段）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// 同时运行的任务数上限
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// 扫描时并行计算 hash 的数量
    #[serde(default = "default_hash_workers")]
    pub hash_workers: usize,
    /// 临时错误的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 修改时间容差（秒），FAT 等文件系统只有 2 秒精度
    #[serde(default = "default_time_tolerance_seconds")]
    pub time_tolerance_seconds: i64,
    /// 每个任务保留的历史记录条数
    #[serde(default = "default_history_limit")]
    pub history_limit: i64,
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_hash_workers() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_time_tolerance_seconds() -> i64 {
    2
}

fn default_history_limit() -> i64 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            hash_workers: default_hash_workers(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            time_tolerance_seconds: default_time_tolerance_seconds(),
            history_limit: default_history_limit(),
        }
    }
}

impl EngineConfig {
    /// 从配置文件加载引擎配置
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "engine").unwrap_or_default()
    }

    /// 保存引擎配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "engine", self)
    }
}

/// 读取 config.json 中的一个段，文件或段不存在、格式错误时返回 None
pub(crate) fn load_section<T: DeserializeOwned>(config_dir: &Path, section: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join("config.json")).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    serde_json::from_value(config.get(section)?.clone()).ok()
}

/// 写回 config.json 中的一个段，保留其余内容
pub(crate) fn save_section<T: Serialize>(
    config_dir: &Path,
    section: &str,
    value: &T,
) -> io::Result<()> {
    let config_file = config_dir.join("config.json");

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[section] = serde_json::to_value(value)?;

    let content = serde_json::to_string_pretty(&config)?;
    fs::write(&config_file, content)?;

    Ok(())
}
