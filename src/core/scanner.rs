use crate::core::error::ScanError;
use crate::core::snapshot::{default_case_sensitive, Entry, Snapshot};
use crate::storage::{FileInfo, Storage};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 扫描过滤规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanFilters {
    /// 仅包含匹配的文件（空表示不限制）
    pub include_patterns: Vec<String>,
    /// 排除规则（glob patterns），匹配的目录连同子树一起排除
    pub exclude_patterns: Vec<String>,
    /// 是否包含隐藏文件
    pub include_hidden: bool,
    /// 是否包含系统文件（Thumbs.db、.DS_Store 等）
    pub include_system: bool,
    /// 最大文件大小（0 表示不限制）
    pub max_file_size: u64,
}

impl Default for ScanFilters {
    fn default() -> Self {
        Self {
            include_patterns: vec![],
            exclude_patterns: vec![
                ".git/**".to_string(),
                ".svn/**".to_string(),
                "*.partial".to_string(),
                "~$*".to_string(),
            ],
            include_hidden: true,
            include_system: false,
            max_file_size: 0,
        }
    }
}

/// 编译后的过滤规则
#[derive(Debug, Clone)]
pub struct CompiledFilters {
    include: Option<GlobSet>,
    exclude: GlobSet,
    include_hidden: bool,
    include_system: bool,
    max_file_size: u64,
}

impl CompiledFilters {
    pub fn compile(filters: &ScanFilters) -> Result<Self> {
        let include = if filters.include_patterns.is_empty() {
            None
        } else {
            Some(build_globset(&filters.include_patterns)?)
        };

        Ok(Self {
            include,
            exclude: build_globset(&filters.exclude_patterns)?,
            include_hidden: filters.include_hidden,
            include_system: filters.include_system,
            max_file_size: filters.max_file_size,
        })
    }

    /// 路径本身是否命中排除规则
    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude.is_match(path)
    }

    /// 是否配置了包含规则
    pub fn has_include(&self) -> bool {
        self.include.is_some()
    }

    fn include_matches(&self, path: &str) -> bool {
        self.include
            .as_ref()
            .map(|set| set.is_match(path))
            .unwrap_or(true)
    }

    fn accepts(&self, file: &FileInfo) -> bool {
        if self.is_excluded(&file.path) {
            return false;
        }
        if file.hidden && !self.include_hidden {
            return false;
        }
        if file.system && !self.include_system {
            return false;
        }
        if file.is_dir {
            return true;
        }
        if self.max_file_size > 0 && file.size > self.max_file_size {
            return false;
        }
        self.include_matches(&file.path)
    }
}

/// 构建 GlobSet：不含 `/` 的模式在任意层级匹配，`dir/**` 同时匹配目录本身
fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.trim().trim_start_matches("./");
        if pattern.is_empty() {
            continue;
        }
        builder.add(Glob::new(pattern)?);
        if !pattern.contains('/') {
            builder.add(Glob::new(&format!("**/{}", pattern))?);
        }
        if let Some(dir) = pattern.strip_suffix("/**") {
            builder.add(Glob::new(dir)?);
        }
    }
    Ok(builder.build()?)
}

/// 扫描配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub filters: ScanFilters,
    /// 是否计算内容 hash（大目录树的主要开销）
    pub verify_with_hash: bool,
    pub case_sensitive: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            filters: ScanFilters::default(),
            verify_with_hash: false,
            case_sensitive: default_case_sensitive(),
        }
    }
}

/// 文件扫描器：遍历目录树生成快照
pub struct FileScanner {
    max_concurrent: usize,
    config: ScanConfig,
    cancel: Option<CancellationToken>,
}

impl FileScanner {
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_config(max_concurrent, ScanConfig::default())
    }

    pub fn with_config(max_concurrent: usize, config: ScanConfig) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            config,
            cancel: None,
        }
    }

    /// 附加取消令牌
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// 扫描存储并生成快照
    pub async fn capture(&self, storage: &dyn Storage) -> Result<Snapshot> {
        if self.is_cancelled() {
            return Err(anyhow::anyhow!("操作已取消"));
        }

        info!("开始扫描: {}", storage.name());

        let filters = CompiledFilters::compile(&self.config.filters)?;
        let listing = storage.list_files().await?;
        let mut errors = listing.errors;

        let mut files = listing.files;
        // 保证父目录先于子项出现
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let mut excluded_dirs: HashSet<String> = HashSet::new();
        let mut entries = Vec::with_capacity(files.len());
        let mut excluded_count = 0usize;

        for file in files {
            if entries.len() % 1000 == 0 && self.is_cancelled() {
                return Err(anyhow::anyhow!("操作已取消"));
            }

            if has_excluded_ancestor(&file.path, &excluded_dirs) {
                excluded_count += 1;
                continue;
            }

            if !filters.accepts(&file) {
                debug!("排除: {}", file.path);
                if file.is_dir {
                    excluded_dirs.insert(file.path.clone());
                }
                excluded_count += 1;
                continue;
            }

            entries.push(Entry {
                absolute_path: storage.absolute(&file.path),
                relative_path: file.path,
                size: file.size,
                modified_time: file.modified_time,
                is_dir: file.is_dir,
                checksum: None,
            });
        }

        if filters.has_include() {
            let before = entries.len();
            prune_dirs_without_included_files(&filters, &mut entries);
            excluded_count += before - entries.len();
        }

        if self.config.verify_with_hash {
            self.hash_entries(storage, &mut entries, &mut errors).await?;
        }

        if !errors.is_empty() {
            warn!("扫描 {} 时有 {} 个条目无法读取", storage.name(), errors.len());
        }

        let snapshot = Snapshot::from_entries(
            storage.root().to_path_buf(),
            self.config.case_sensitive,
            entries,
            errors,
        );

        info!(
            "扫描完成: {} 个文件, {} 个目录, {} 个被排除",
            snapshot.file_count(),
            snapshot.len() - snapshot.file_count(),
            excluded_count
        );

        Ok(snapshot)
    }

    /// 受限并发地计算文件 hash；失败的条目记为软错误
    async fn hash_entries(
        &self,
        storage: &dyn Storage,
        entries: &mut [Entry],
        errors: &mut Vec<ScanError>,
    ) -> Result<()> {
        let targets: Vec<(usize, String)> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_dir)
            .map(|(i, e)| (i, e.relative_path.clone()))
            .collect();

        debug!("计算 {} 个文件的 hash...", targets.len());

        let results: Vec<(usize, String, Result<String>)> = stream::iter(targets)
            .map(|(index, path)| async move {
                let hash = storage.hash(&path).await;
                (index, path, hash)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        if self.is_cancelled() {
            return Err(anyhow::anyhow!("操作已取消"));
        }

        for (index, path, hash) in results {
            match hash {
                Ok(h) => entries[index].checksum = Some(h),
                Err(e) => errors.push(ScanError::new(path, format!("计算 hash 失败: {}", e))),
            }
        }

        Ok(())
    }
}

/// 有包含规则时，只保留规则命中的目录和含有被包含文件的目录
fn prune_dirs_without_included_files(filters: &CompiledFilters, entries: &mut Vec<Entry>) {
    let mut needed: HashSet<String> = HashSet::new();
    for entry in entries.iter().filter(|e| !e.is_dir) {
        let path = entry.relative_path.as_str();
        let mut end = path.len();
        while let Some(pos) = path[..end].rfind('/') {
            // 父目录已记录时更上层也已记录
            if !needed.insert(path[..pos].to_string()) {
                break;
            }
            end = pos;
        }
    }
    entries.retain(|e| {
        !e.is_dir || needed.contains(&e.relative_path) || filters.include_matches(&e.relative_path)
    });
}

fn has_excluded_ancestor(path: &str, excluded_dirs: &HashSet<String>) -> bool {
    if excluded_dirs.is_empty() {
        return false;
    }
    let mut end = 0;
    while let Some(pos) = path[end..].find('/') {
        end += pos;
        if excluded_dirs.contains(&path[..end]) {
            return true;
        }
        end += 1;
    }
    false
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    fn write(root: &std::path::Path, path: &str, content: &str) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    #[test]
    fn test_globset_semantics() {
        let filters = CompiledFilters::compile(&ScanFilters {
            exclude_patterns: vec!["*.log".into(), "build/**".into(), "Thumbs.db".into()],
            ..Default::default()
        })
        .unwrap();

        assert!(filters.is_excluded("a/b/c.log"));
        assert!(filters.is_excluded("build"));
        assert!(filters.is_excluded("build/out.o"));
        assert!(filters.is_excluded("photos/Thumbs.db"));
        assert!(!filters.is_excluded("src/build.rs"));
    }

    #[test]
    fn test_excluded_ancestor() {
        let mut dirs = HashSet::new();
        dirs.insert("a/b".to_string());
        assert!(has_excluded_ancestor("a/b/c", &dirs));
        assert!(has_excluded_ancestor("a/b/c/d.txt", &dirs));
        assert!(!has_excluded_ancestor("a/bc/d", &dirs));
        assert!(!has_excluded_ancestor("a/b", &dirs));
    }

    #[tokio::test]
    async fn test_capture_applies_filters() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "keep.txt", "1");
        write(dir.path(), "skip.tmp", "2");
        write(dir.path(), "cache/inner.txt", "3");
        write(dir.path(), ".hidden", "4");
        write(dir.path(), "big.bin", "0123456789");

        let config = ScanConfig {
            filters: ScanFilters {
                exclude_patterns: vec!["*.tmp".into(), "cache".into()],
                include_hidden: false,
                max_file_size: 5,
                ..Default::default()
            },
            verify_with_hash: false,
            case_sensitive: true,
        };
        let storage = LocalStorage::new(dir.path()).unwrap();
        let snapshot = FileScanner::with_config(2, config)
            .capture(&storage)
            .await
            .unwrap();

        let paths: Vec<_> = snapshot.keys().cloned().collect();
        assert_eq!(paths, vec!["keep.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_include_drops_directories_without_matches() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "docs/readme.md", "1");
        write(dir.path(), "docs/sub/notes.md", "2");
        write(dir.path(), "docs/sub/diagram.png", "3");
        write(dir.path(), "images/logo.png", "4");
        std::fs::create_dir_all(dir.path().join("empty/nested")).unwrap();

        let config = ScanConfig {
            filters: ScanFilters {
                include_patterns: vec!["*.md".into()],
                ..Default::default()
            },
            verify_with_hash: false,
            case_sensitive: true,
        };
        let storage = LocalStorage::new(dir.path()).unwrap();
        let snapshot = FileScanner::with_config(2, config)
            .capture(&storage)
            .await
            .unwrap();

        let paths: Vec<_> = snapshot.keys().cloned().collect();
        assert_eq!(
            paths,
            vec![
                "docs".to_string(),
                "docs/readme.md".to_string(),
                "docs/sub".to_string(),
                "docs/sub/notes.md".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_capture_with_hash() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "hello");
        write(dir.path(), "sub/b.txt", "world");

        let config = ScanConfig {
            verify_with_hash: true,
            case_sensitive: true,
            ..Default::default()
        };
        let storage = LocalStorage::new(dir.path()).unwrap();
        let snapshot = FileScanner::with_config(4, config)
            .capture(&storage)
            .await
            .unwrap();

        let a = snapshot.get("a.txt").unwrap();
        assert_eq!(
            a.checksum.as_deref(),
            Some(crate::storage::calculate_hash(b"hello").as_str())
        );
        assert!(snapshot.get("sub").unwrap().checksum.is_none());
        assert_eq!(
            snapshot.get("sub/b.txt").unwrap().absolute_path,
            dir.path().join("sub/b.txt")
        );
    }

    #[tokio::test]
    async fn test_capture_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let result = FileScanner::default()
            .with_cancel(token)
            .capture(&storage)
            .await;
        assert!(result.is_err());
    }
}
