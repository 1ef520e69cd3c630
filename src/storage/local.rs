use super::{FileInfo, FileMeta, FileReader, Listing, Storage, HASH_BUFFER_SIZE};
use crate::core::error::ScanError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

/// 常见的系统文件名
const SYSTEM_FILE_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini", "ehthumbs.db"];

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        let name = format!("local:{}", base_path.display());
        Ok(Self { base_path, name })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        self.absolute(path)
    }

    /// 规范化路径分隔符（统一使用 /）
    fn normalize_path(path: &str) -> String {
        path.replace('\\', "/")
    }

    fn unix_seconds(metadata: &std::fs::Metadata) -> i64 {
        metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    #[cfg(windows)]
    fn attribute_flags(metadata: &std::fs::Metadata) -> (bool, bool) {
        use std::os::windows::fs::MetadataExt;
        const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
        const FILE_ATTRIBUTE_SYSTEM: u32 = 0x4;
        let attrs = metadata.file_attributes();
        (
            attrs & FILE_ATTRIBUTE_HIDDEN != 0,
            attrs & FILE_ATTRIBUTE_SYSTEM != 0,
        )
    }

    #[cfg(not(windows))]
    fn attribute_flags(_metadata: &std::fs::Metadata) -> (bool, bool) {
        (false, false)
    }

    fn walk(base: &Path) -> Listing {
        let mut listing = Listing::default();

        // 无法打开的目录由 walkdir 报告错误并跳过其子树
        for item in WalkDir::new(base).follow_links(false).min_depth(1) {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .and_then(|p| p.strip_prefix(base).ok())
                        .map(|p| Self::normalize_path(&p.to_string_lossy()))
                        .unwrap_or_default();
                    listing.errors.push(ScanError::new(path, e.to_string()));
                    continue;
                }
            };

            let relative = match entry.path().strip_prefix(base) {
                Ok(p) => Self::normalize_path(&p.to_string_lossy()),
                Err(_) => continue,
            };

            if entry.path_is_symlink() {
                listing
                    .errors
                    .push(ScanError::new(relative, "符号链接或重解析点未跟随"));
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    listing.errors.push(ScanError::new(relative, e.to_string()));
                    continue;
                }
            };

            let file_name = entry.file_name().to_string_lossy();
            let (attr_hidden, attr_system) = Self::attribute_flags(&metadata);

            listing.files.push(FileInfo {
                path: relative,
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                modified_time: Self::unix_seconds(&metadata),
                is_dir: metadata.is_dir(),
                hidden: attr_hidden || file_name.starts_with('.'),
                system: attr_system || SYSTEM_FILE_NAMES.contains(&file_name.as_ref()),
            });
        }

        listing
    }

    fn hash_file(path: &Path) -> Result<String> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// 把流写入临时文件，返回字节数
    async fn stream_to(temp_path: &Path, reader: &mut FileReader) -> Result<u64> {
        let mut file = fs::File::create(temp_path)
            .await
            .with_context(|| format!("创建 {} 失败", temp_path.display()))?;
        let written = tokio::io::copy(reader, &mut file)
            .await
            .with_context(|| format!("写入 {} 失败", temp_path.display()))?;
        file.flush().await?;
        Ok(written)
    }

    /// 同目录下的临时文件名，写完后原子重命名
    fn temp_path_for(full_path: &Path) -> PathBuf {
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        full_path.with_file_name(format!(
            ".{}.{}.partial",
            file_name,
            uuid::Uuid::new_v4().simple()
        ))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn list_files(&self) -> Result<Listing> {
        let base = self.base_path.clone();

        if !base.exists() {
            tracing::debug!("根目录不存在，视为空目录: {}", base.display());
            return Ok(Listing::default());
        }

        // 使用 spawn_blocking 避免阻塞 async runtime
        let listing = tokio::task::spawn_blocking(move || Self::walk(&base)).await?;
        Ok(listing)
    }

    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        let full_path = self.resolve_path(path);

        match fs::symlink_metadata(&full_path).await {
            Ok(metadata) => Ok(Some(FileMeta {
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                modified_time: Self::unix_seconds(&metadata),
                is_dir: metadata.is_dir(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, path: &str) -> Result<FileReader> {
        let full_path = self.resolve_path(path);
        let file = fs::File::open(&full_path)
            .await
            .with_context(|| format!("读取 {} 失败", full_path.display()))?;
        Ok(Box::new(file))
    }

    async fn write_from(
        &self,
        path: &str,
        reader: &mut FileReader,
        modified_time: Option<i64>,
    ) -> Result<u64> {
        let full_path = self.resolve_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = Self::temp_path_for(&full_path);
        let written = match Self::stream_to(&temp_path, reader).await {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        if let Some(mtime) = modified_time {
            let temp = temp_path.clone();
            tokio::task::spawn_blocking(move || {
                filetime::set_file_mtime(&temp, filetime::FileTime::from_unix_time(mtime, 0))
            })
            .await??;
        }

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(anyhow::Error::new(e)
                .context(format!("替换 {} 失败", full_path.display())));
        }

        Ok(written)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&from_path, &to_path)
            .await
            .with_context(|| format!("重命名 {} 失败", from_path.display()))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);

        let metadata = match fs::symlink_metadata(&full_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        // 目录只删除空目录，子项由计划中更深的删除动作先行处理
        if metadata.is_dir() {
            fs::remove_dir(&full_path)
                .await
                .with_context(|| format!("删除目录 {} 失败", full_path.display()))?;
        } else {
            fs::remove_file(&full_path)
                .await
                .with_context(|| format!("删除文件 {} 失败", full_path.display()))?;
        }

        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);
        fs::create_dir_all(&full_path).await?;
        Ok(())
    }

    async fn hash(&self, path: &str) -> Result<String> {
        let full_path = self.resolve_path(path);
        tokio::task::spawn_blocking(move || Self::hash_file(&full_path)).await?
    }

    fn root(&self) -> &Path {
        &self.base_path
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::calculate_hash;

    #[tokio::test]
    async fn test_write_preserves_mtime_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();

        storage
            .write("nested/a.txt", b"hello".to_vec(), Some(1_700_000_000))
            .await
            .unwrap();

        let meta = storage.stat("nested/a.txt").await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.modified_time, 1_700_000_000);

        let listing = storage.list_files().await.unwrap();
        let mut paths: Vec<_> = listing.files.iter().map(|f| f.path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec!["nested".to_string(), "nested/a.txt".to_string()]);
        assert!(listing.errors.is_empty());
    }

    #[tokio::test]
    async fn test_hash_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let data = vec![7u8; HASH_BUFFER_SIZE * 2 + 13];
        storage.write("big.bin", data.clone(), None).await.unwrap();

        assert_eq!(storage.hash("big.bin").await.unwrap(), calculate_hash(&data));
    }

    #[tokio::test]
    async fn test_stream_copy_between_roots() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let from = LocalStorage::new(src.path()).unwrap();
        let to = LocalStorage::new(dst.path()).unwrap();
        let data: Vec<u8> = (0..3 * 1024 * 1024 + 7).map(|i| (i % 251) as u8).collect();
        std::fs::write(src.path().join("large.bin"), &data).unwrap();

        let mut reader = from.open("large.bin").await.unwrap();
        let written = to
            .write_from("copy/large.bin", &mut reader, Some(1_700_000_000))
            .await
            .unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(std::fs::read(dst.path().join("copy/large.bin")).unwrap(), data);
        let meta = to.stat("copy/large.bin").await.unwrap().unwrap();
        assert_eq!(meta.modified_time, 1_700_000_000);
        let leftovers: Vec<_> = std::fs::read_dir(dst.path().join("copy"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        assert!(storage.open("missing.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_refuses_non_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        storage.write("d/keep.txt", b"x".to_vec(), None).await.unwrap();

        assert!(storage.delete("d").await.is_err());
        storage.delete("d/keep.txt").await.unwrap();
        storage.delete("d").await.unwrap();
        storage.delete("d").await.unwrap();
        assert!(storage.stat("d").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hidden_and_system_flags() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        storage.write(".env", b"x".to_vec(), None).await.unwrap();
        storage.write("Thumbs.db", b"x".to_vec(), None).await.unwrap();

        let listing = storage.list_files().await.unwrap();
        let env = listing.files.iter().find(|f| f.path == ".env").unwrap();
        let thumbs = listing.files.iter().find(|f| f.path == "Thumbs.db").unwrap();
        assert!(env.hidden);
        assert!(thumbs.system);
    }
}
