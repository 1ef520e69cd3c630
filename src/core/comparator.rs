use crate::core::snapshot::{default_case_sensitive, Entry, Snapshot};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;

/// 路径分类（相对于参考侧）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    /// 仅参考侧存在
    Added,
    /// 仅对比侧存在
    Removed,
    Modified,
    Unchanged,
}

/// 文件比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRelation {
    /// 文件相同
    Equal,
    /// 参考侧更新
    ReferenceNewer,
    /// 对比侧更新
    OtherNewer,
    /// 时间相同但内容不同（大小或 hash 不同）
    Different,
    /// 一边是文件一边是目录
    TypeChanged,
}

/// 单个路径的差异
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    pub path: String,
    pub kind: DiffKind,
    /// 两边都存在时的比较细节
    pub relation: Option<FileRelation>,
    pub reference: Option<Entry>,
    pub other: Option<Entry>,
}

impl DiffEntry {
    pub fn is_change(&self) -> bool {
        self.kind != DiffKind::Unchanged
    }
}

/// 比较配置
#[derive(Debug, Clone)]
pub struct CompareConfig {
    /// 时间容差（秒）
    pub time_tolerance_seconds: i64,
    /// 两边都有 hash 时是否以 hash 为准
    pub use_checksum: bool,
    /// 是否忽略文件时间（仅比较大小和 checksum）
    pub ignore_mtime: bool,
    /// 路径比较是否区分大小写
    pub case_sensitive: bool,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            time_tolerance_seconds: 2,
            use_checksum: true,
            ignore_mtime: false,
            case_sensitive: default_case_sensitive(),
        }
    }
}

/// 文件比较器
#[derive(Debug, Clone, Default)]
pub struct FileComparator {
    config: CompareConfig,
}

impl FileComparator {
    pub fn with_config(config: CompareConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompareConfig {
        &self.config
    }

    fn time_relation(&self, reference: &Entry, other: &Entry) -> FileRelation {
        if self.config.ignore_mtime {
            return FileRelation::Different;
        }
        let diff = reference.modified_time - other.modified_time;
        if diff.abs() <= self.config.time_tolerance_seconds {
            FileRelation::Different
        } else if diff > 0 {
            FileRelation::ReferenceNewer
        } else {
            FileRelation::OtherNewer
        }
    }

    /// 比较两个条目
    pub fn compare_entries(&self, reference: &Entry, other: &Entry) -> FileRelation {
        if reference.is_dir != other.is_dir {
            return FileRelation::TypeChanged;
        }
        if reference.is_dir {
            return FileRelation::Equal;
        }

        // 两边都有 hash 时以 hash 为准，避免时钟偏差导致误判
        if self.config.use_checksum {
            if let (Some(a), Some(b)) = (&reference.checksum, &other.checksum) {
                return if a == b {
                    FileRelation::Equal
                } else {
                    self.time_relation(reference, other)
                };
            }
        }

        // 大小不同，肯定不同
        if reference.size != other.size {
            tracing::debug!(
                "文件大小不同: {} ({} / {})",
                reference.relative_path,
                reference.size,
                other.size
            );
            return self.time_relation(reference, other);
        }

        if self.config.ignore_mtime {
            return FileRelation::Equal;
        }

        match self.time_relation(reference, other) {
            FileRelation::Different => FileRelation::Equal,
            newer => newer,
        }
    }

    /// 两个条目内容是否一致
    pub fn same_content(&self, a: &Entry, b: &Entry) -> bool {
        self.compare_entries(a, b) == FileRelation::Equal
    }

    /// 比较两个快照：按路径取并集，逐一分类
    pub fn diff(&self, reference: &Snapshot, other: &Snapshot) -> Vec<DiffEntry> {
        let reference = self.rekey(reference);
        let other = self.rekey(other);

        let keys: BTreeSet<&String> = reference.keys().chain(other.keys()).collect();

        keys.into_iter()
            .map(|key| {
                let a = reference.get_by_key(key);
                let b = other.get_by_key(key);
                match (a, b) {
                    (Some(a), Some(b)) => {
                        let relation = self.compare_entries(a, b);
                        DiffEntry {
                            path: a.relative_path.clone(),
                            kind: if relation == FileRelation::Equal {
                                DiffKind::Unchanged
                            } else {
                                DiffKind::Modified
                            },
                            relation: Some(relation),
                            reference: Some(a.clone()),
                            other: Some(b.clone()),
                        }
                    }
                    (Some(a), None) => DiffEntry {
                        path: a.relative_path.clone(),
                        kind: DiffKind::Added,
                        relation: None,
                        reference: Some(a.clone()),
                        other: None,
                    },
                    (None, Some(b)) => DiffEntry {
                        path: b.relative_path.clone(),
                        kind: DiffKind::Removed,
                        relation: None,
                        reference: None,
                        other: Some(b.clone()),
                    },
                    (None, None) => unreachable!(),
                }
            })
            .collect()
    }

    fn rekey<'a>(&self, snapshot: &'a Snapshot) -> Cow<'a, Snapshot> {
        if snapshot.case_sensitive == self.config.case_sensitive {
            Cow::Borrowed(snapshot)
        } else {
            Cow::Owned(snapshot.rekeyed(self.config.case_sensitive))
        }
    }

    /// 统计差异
    pub fn summarize(diffs: &[DiffEntry]) -> DiffSummary {
        let mut summary = DiffSummary::default();
        for diff in diffs {
            match diff.kind {
                DiffKind::Added => summary.added += 1,
                DiffKind::Removed => summary.removed += 1,
                DiffKind::Modified => summary.modified += 1,
                DiffKind::Unchanged => summary.unchanged += 1,
            }
        }
        summary
    }
}

/// 差异统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
}

impl DiffSummary {
    pub fn changes(&self) -> usize {
        self.added + self.removed + self.modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file(path: &str, size: u64, mtime: i64, hash: Option<&str>) -> Entry {
        Entry {
            relative_path: path.to_string(),
            absolute_path: PathBuf::from(path),
            size,
            modified_time: mtime,
            is_dir: false,
            checksum: hash.map(str::to_string),
        }
    }

    fn dir(path: &str) -> Entry {
        Entry {
            is_dir: true,
            size: 0,
            ..file(path, 0, 0, None)
        }
    }

    fn snap(entries: Vec<Entry>, case_sensitive: bool) -> Snapshot {
        Snapshot::from_entries("/", case_sensitive, entries, Vec::new())
    }

    fn comparator() -> FileComparator {
        FileComparator::with_config(CompareConfig {
            case_sensitive: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_classification() {
        let a = snap(
            vec![
                file("only_a.txt", 1, 100, None),
                file("same.txt", 5, 100, None),
                file("changed.txt", 5, 100, None),
                dir("d"),
            ],
            true,
        );
        let b = snap(
            vec![
                file("only_b.txt", 1, 100, None),
                file("same.txt", 5, 101, None),
                file("changed.txt", 6, 100, None),
                dir("d"),
            ],
            true,
        );

        let diffs = comparator().diff(&a, &b);
        let kinds: Vec<_> = diffs.iter().map(|d| (d.path.as_str(), d.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("changed.txt", DiffKind::Modified),
                ("d", DiffKind::Unchanged),
                ("only_a.txt", DiffKind::Added),
                ("only_b.txt", DiffKind::Removed),
                ("same.txt", DiffKind::Unchanged),
            ]
        );
        // 时间相同、大小不同
        assert_eq!(diffs[0].relation, Some(FileRelation::Different));
    }

    #[test]
    fn test_hash_overrides_timestamp() {
        let c = comparator();
        // 时间差很大但内容相同
        let a = file("x", 3, 1000, Some("abc"));
        let b = file("x", 3, 5000, Some("abc"));
        assert_eq!(c.compare_entries(&a, &b), FileRelation::Equal);

        // 大小和时间都相同但 hash 不同
        let a = file("x", 3, 1000, Some("abc"));
        let b = file("x", 3, 1000, Some("def"));
        assert_eq!(c.compare_entries(&a, &b), FileRelation::Different);
    }

    #[test]
    fn test_newer_side() {
        let c = comparator();
        let a = file("x", 3, 2000, None);
        let b = file("x", 3, 1000, None);
        assert_eq!(c.compare_entries(&a, &b), FileRelation::ReferenceNewer);
        assert_eq!(c.compare_entries(&b, &a), FileRelation::OtherNewer);
        // 容差内视为相同
        let b = file("x", 3, 1999, None);
        assert_eq!(c.compare_entries(&a, &b), FileRelation::Equal);
    }

    #[test]
    fn test_type_change() {
        let c = comparator();
        assert_eq!(
            c.compare_entries(&dir("x"), &file("x", 1, 0, None)),
            FileRelation::TypeChanged
        );
    }

    #[test]
    fn test_case_insensitive_diff() {
        let c = FileComparator::with_config(CompareConfig {
            case_sensitive: false,
            ..Default::default()
        });
        let a = snap(vec![file("Photo.JPG", 1, 0, None)], true);
        let b = snap(vec![file("photo.jpg", 1, 0, None)], true);
        let diffs = c.diff(&a, &b);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].kind, DiffKind::Unchanged);

        let sensitive = comparator().diff(&a, &b);
        assert_eq!(FileComparator::summarize(&sensitive).changes(), 2);
    }
}
