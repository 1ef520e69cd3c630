//! 快照数据模型：某一时刻目录树的清单

use super::error::ScanError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// 同步的两侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Source => Side::Destination,
            Side::Destination => Side::Source,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Destination => "dest",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 快照中的单个条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// 相对路径，统一使用 `/` 分隔
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
    /// 修改时间（Unix 秒）
    pub modified_time: i64,
    pub is_dir: bool,
    pub checksum: Option<String>,
}

impl Entry {
    /// 路径深度（`a` 为 1，`a/b` 为 2）
    pub fn depth(&self) -> usize {
        path_depth(&self.relative_path)
    }
}

pub fn path_depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

/// 规范化相对路径：反斜杠转 `/`，去掉首尾分隔符
pub fn normalize_relative(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// 按大小写策略计算查找键
pub fn path_key(path: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        path.to_string()
    } else {
        path.to_lowercase()
    }
}

/// 各平台默认的路径大小写策略（Windows 不区分大小写）
pub fn default_case_sensitive() -> bool {
    !cfg!(any(target_os = "windows", target_os = "macos"))
}

/// 目录树快照，生成后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub root: PathBuf,
    /// 捕获时间（Unix 秒）
    pub captured_at: i64,
    pub case_sensitive: bool,
    entries: BTreeMap<String, Entry>,
    errors: Vec<ScanError>,
}

impl Snapshot {
    pub fn empty(root: impl Into<PathBuf>, case_sensitive: bool) -> Self {
        Self {
            root: root.into(),
            captured_at: chrono::Utc::now().timestamp(),
            case_sensitive,
            entries: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// 由条目列表构建快照；大小写不敏感时路径冲突的后者记为软错误并丢弃
    pub fn from_entries(
        root: impl Into<PathBuf>,
        case_sensitive: bool,
        entries: impl IntoIterator<Item = Entry>,
        mut errors: Vec<ScanError>,
    ) -> Self {
        let mut map: BTreeMap<String, Entry> = BTreeMap::new();
        for entry in entries {
            let key = path_key(&entry.relative_path, case_sensitive);
            if let Some(existing) = map.get(&key) {
                errors.push(ScanError::new(
                    entry.relative_path.clone(),
                    format!("路径与 {} 仅大小写不同，已忽略", existing.relative_path),
                ));
                continue;
            }
            map.insert(key, entry);
        }

        Self {
            root: root.into(),
            captured_at: chrono::Utc::now().timestamp(),
            case_sensitive,
            entries: map,
            errors,
        }
    }

    pub fn get(&self, relative_path: &str) -> Option<&Entry> {
        self.entries
            .get(&path_key(relative_path, self.case_sensitive))
    }

    pub fn get_by_key(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        self.get(relative_path).is_some()
    }

    /// 按键有序遍历
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn errors(&self) -> &[ScanError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_dir).count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// 指定路径的条目改取自 `previous`（`previous` 中没有则移除），其余不变
    pub fn with_paths_from(mut self, previous: &Snapshot, paths: &[String]) -> Snapshot {
        for path in paths {
            let key = path_key(path, self.case_sensitive);
            match previous.get(path) {
                Some(entry) => {
                    self.entries.insert(key, entry.clone());
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
        self
    }

    /// 以新的大小写策略重建键（比较不同策略的快照时使用）
    pub fn rekeyed(&self, case_sensitive: bool) -> Snapshot {
        if case_sensitive == self.case_sensitive {
            return self.clone();
        }
        let mut snapshot = Snapshot::from_entries(
            self.root.clone(),
            case_sensitive,
            self.entries.values().cloned(),
            self.errors.clone(),
        );
        snapshot.captured_at = self.captured_at;
        snapshot
    }
}
