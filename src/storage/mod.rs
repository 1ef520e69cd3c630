pub mod local;

use crate::core::error::ScanError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use local::LocalStorage;

/// 列举得到的文件信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// 相对根目录的路径（`/` 分隔）
    pub path: String,
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
    pub hidden: bool,
    pub system: bool,
}

/// 一次列举的结果：文件列表加上遍历中遇到的软错误
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub files: Vec<FileInfo>,
    pub errors: Vec<ScanError>,
}

/// 流式读取的文件内容
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// 流式 hash 的读缓冲大小
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// 文件元数据（用于快速检查）
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
}

/// 文件操作接口，所有路径都相对于存储根目录
#[async_trait]
pub trait Storage: Send + Sync {
    /// 递归列出所有文件和目录
    async fn list_files(&self) -> Result<Listing>;

    /// 获取文件元数据，不存在时返回 None
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>>;

    /// 打开文件用于流式读取
    async fn open(&self, path: &str) -> Result<FileReader>;

    /// 从流写入文件（父目录不存在时自动创建），可选地设置修改时间，返回写入的字节数
    async fn write_from(
        &self,
        path: &str,
        reader: &mut FileReader,
        modified_time: Option<i64>,
    ) -> Result<u64>;

    /// 写入整个文件
    async fn write(&self, path: &str, data: Vec<u8>, modified_time: Option<i64>) -> Result<()> {
        let mut reader: FileReader = Box::new(std::io::Cursor::new(data));
        self.write_from(path, &mut reader, modified_time).await?;
        Ok(())
    }

    /// 同一存储内重命名
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// 删除文件或空目录；路径不存在视为成功
    async fn delete(&self, path: &str) -> Result<()>;

    /// 创建目录（含父目录）
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// 计算文件内容 hash
    async fn hash(&self, path: &str) -> Result<String> {
        let mut reader = self.open(path).await?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// 根目录
    fn root(&self) -> &Path;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;

    /// 相对路径对应的绝对路径
    fn absolute(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.root().to_path_buf()
        } else {
            self.root().join(path)
        }
    }
}

/// 计算内容 hash（BLAKE3，十六进制）
pub fn calculate_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// 为目录创建存储实例
pub fn create_storage(root: &Path) -> Result<Arc<dyn Storage>> {
    tracing::info!("初始化本地存储: {}", root.display());
    Ok(Arc::new(LocalStorage::new(root)?) as Arc<dyn Storage>)
}
