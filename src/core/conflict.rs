use crate::core::baseline::Baseline;
use crate::core::comparator::FileComparator;
use crate::core::snapshot::{Entry, Side, Snapshot};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// 某一侧相对基线的变化
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideChange {
    NoChange,
    Added,
    Modified,
    Deleted,
}

impl SideChange {
    pub fn is_change(self) -> bool {
        self != SideChange::NoChange
    }
}

impl std::fmt::Display for SideChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SideChange::NoChange => write!(f, "no_change"),
            SideChange::Added => write!(f, "added"),
            SideChange::Modified => write!(f, "modified"),
            SideChange::Deleted => write!(f, "deleted"),
        }
    }
}

impl From<&str> for SideChange {
    fn from(s: &str) -> Self {
        match s {
            "added" => SideChange::Added,
            "modified" => SideChange::Modified,
            "deleted" => SideChange::Deleted,
            _ => SideChange::NoChange,
        }
    }
}

/// 冲突处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    NewerWins,
    LargerWins,
    SourceWins,
    DestinationWins,
    Skip,
    KeepBoth,
    /// 暂停该路径的规划，交给调用方决定
    Ask,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::KeepBoth
    }
}

/// 冲突的最终处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    SourceWins,
    DestinationWins,
    Skip,
    /// 保留两边：失败一侧的文件加冲突后缀改名
    KeepBoth,
}

impl std::fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictResolution::SourceWins => write!(f, "source_wins"),
            ConflictResolution::DestinationWins => write!(f, "destination_wins"),
            ConflictResolution::Skip => write!(f, "skip"),
            ConflictResolution::KeepBoth => write!(f, "keep_both"),
        }
    }
}

impl From<&str> for ConflictResolution {
    fn from(s: &str) -> Self {
        match s {
            "source_wins" => ConflictResolution::SourceWins,
            "destination_wins" => ConflictResolution::DestinationWins,
            "keep_both" => ConflictResolution::KeepBoth,
            _ => ConflictResolution::Skip,
        }
    }
}

/// 冲突记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub path: String,
    pub source_change: SideChange,
    pub dest_change: SideChange,
    pub source: Option<Entry>,
    pub dest: Option<Entry>,
    /// None 表示等待调用方决定（Ask）
    pub resolution: Option<ConflictResolution>,
    pub reason: String,
}

impl ConflictRecord {
    pub fn is_pending(&self) -> bool {
        self.resolution.is_none()
    }

    pub fn entry(&self, side: Side) -> Option<&Entry> {
        match side {
            Side::Source => self.source.as_ref(),
            Side::Destination => self.dest.as_ref(),
        }
    }
}

/// 无冲突的单侧变化，从 `from` 一侧传播到另一侧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoChange {
    pub path: String,
    pub from: Side,
    pub change: SideChange,
    pub source: Option<Entry>,
    pub dest: Option<Entry>,
}

impl AutoChange {
    pub fn entry(&self, side: Side) -> Option<&Entry> {
        match side {
            Side::Source => self.source.as_ref(),
            Side::Destination => self.dest.as_ref(),
        }
    }
}

/// 分类结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub auto_changes: Vec<AutoChange>,
    pub conflicts: Vec<ConflictRecord>,
    pub unchanged: usize,
}

impl Classification {
    pub fn pending_conflicts(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.conflicts.iter().filter(|c| c.is_pending())
    }

    /// 用调用方提供的决定补全冲突（含 Ask 暂停的路径）
    pub fn apply_resolutions(&mut self, resolutions: &HashMap<String, ConflictResolution>) {
        if resolutions.is_empty() {
            return;
        }
        for conflict in &mut self.conflicts {
            if let Some(resolution) = resolutions.get(&conflict.path) {
                conflict.resolution = Some(*resolution);
                conflict.reason = format!("{}-by-user", resolution_label(*resolution));
            }
        }
    }
}

fn resolution_label(resolution: ConflictResolution) -> &'static str {
    match resolution {
        ConflictResolution::SourceWins => "SourceWins",
        ConflictResolution::DestinationWins => "DestinationWins",
        ConflictResolution::Skip => "Skip",
        ConflictResolution::KeepBoth => "KeepBoth",
    }
}

/// 双向同步的冲突分类器
pub struct ConflictClassifier {
    comparator: FileComparator,
    policy: ConflictPolicy,
}

impl ConflictClassifier {
    pub fn new(comparator: FileComparator, policy: ConflictPolicy) -> Self {
        Self { comparator, policy }
    }

    /// 计算某一侧相对基线的变化
    pub fn side_change(&self, baseline: Option<&Entry>, current: Option<&Entry>) -> SideChange {
        match (baseline, current) {
            (None, None) => SideChange::NoChange,
            (None, Some(_)) => SideChange::Added,
            (Some(_), None) => SideChange::Deleted,
            (Some(before), Some(now)) => {
                if self.comparator.same_content(before, now) {
                    SideChange::NoChange
                } else {
                    SideChange::Modified
                }
            }
        }
    }

    /// 三方比较：基线、源、目标
    ///
    /// 只有两侧基线一致的路径才算同步过；不一致的按从未同步处理，
    /// 两侧都存在且内容不同时会成为冲突。
    pub fn classify(
        &self,
        baseline: &Baseline,
        source: &Snapshot,
        dest: &Snapshot,
    ) -> Classification {
        let case_sensitive = self.comparator.config().case_sensitive;
        let base_source = rekey(&baseline.source, case_sensitive);
        let base_dest = rekey(&baseline.dest, case_sensitive);
        let source = rekey(source, case_sensitive);
        let dest = rekey(dest, case_sensitive);

        let keys: BTreeSet<&String> = base_source
            .keys()
            .chain(base_dest.keys())
            .chain(source.keys())
            .chain(dest.keys())
            .collect();

        let mut result = Classification::default();

        for key in keys {
            let src = source.get_by_key(key);
            let dst = dest.get_by_key(key);
            let (synced_src, synced_dst) =
                self.synced_pair(base_source.get_by_key(key), base_dest.get_by_key(key));
            let src_change = self.side_change(synced_src, src);
            let dst_change = self.side_change(synced_dst, dst);

            let path = src
                .or(dst)
                .or_else(|| base_source.get_by_key(key))
                .or_else(|| base_dest.get_by_key(key))
                .map(|e| e.relative_path.clone())
                .unwrap_or_else(|| key.clone());

            match (src_change.is_change(), dst_change.is_change()) {
                (false, false) => result.unchanged += 1,
                (true, false) | (false, true) => {
                    let from = if src_change.is_change() {
                        Side::Source
                    } else {
                        Side::Destination
                    };
                    let change = if from == Side::Source { src_change } else { dst_change };
                    // 一侧删除而另一侧本来就没有，无需动作
                    if change == SideChange::Deleted && src.is_none() && dst.is_none() {
                        result.unchanged += 1;
                        continue;
                    }
                    result.auto_changes.push(AutoChange {
                        path,
                        from,
                        change,
                        source: src.cloned(),
                        dest: dst.cloned(),
                    });
                }
                (true, true) => {
                    if self.converged(src, dst) {
                        result.unchanged += 1;
                        continue;
                    }
                    let mut record = ConflictRecord {
                        path,
                        source_change: src_change,
                        dest_change: dst_change,
                        source: src.cloned(),
                        dest: dst.cloned(),
                        resolution: None,
                        reason: String::new(),
                    };
                    let (resolution, reason) = self.resolve(&record);
                    record.resolution = resolution;
                    record.reason = reason;
                    debug!(
                        "冲突: {} (源 {}, 目标 {}) -> {}",
                        record.path, src_change, dst_change, record.reason
                    );
                    result.conflicts.push(record);
                }
            }
        }

        result
    }

    /// 两侧基线一致时返回它们，否则视为没有基线
    fn synced_pair<'a>(
        &self,
        base_src: Option<&'a Entry>,
        base_dst: Option<&'a Entry>,
    ) -> (Option<&'a Entry>, Option<&'a Entry>) {
        match (base_src, base_dst) {
            (Some(a), Some(b)) if self.comparator.same_content(a, b) => (Some(a), Some(b)),
            _ => (None, None),
        }
    }

    /// 两侧都变化但结果一致（包括两侧都删除）
    fn converged(&self, src: Option<&Entry>, dst: Option<&Entry>) -> bool {
        match (src, dst) {
            (None, None) => true,
            (Some(a), Some(b)) => self.comparator.same_content(a, b),
            _ => false,
        }
    }

    /// 按策略决定冲突结果，返回 (结果, 原因)
    pub fn resolve(&self, record: &ConflictRecord) -> (Option<ConflictResolution>, String) {
        use ConflictResolution::{DestinationWins, KeepBoth, SourceWins};

        let by = |resolution: ConflictResolution, how: &str| {
            (Some(resolution), format!("{}-{}", resolution_label(resolution), how))
        };

        match self.policy {
            ConflictPolicy::SourceWins => by(SourceWins, "by-policy"),
            ConflictPolicy::DestinationWins => by(DestinationWins, "by-policy"),
            ConflictPolicy::Skip => by(ConflictResolution::Skip, "by-policy"),
            ConflictPolicy::KeepBoth => by(KeepBoth, "by-policy"),
            ConflictPolicy::Ask => (None, "awaiting-decision".to_string()),
            ConflictPolicy::NewerWins => {
                let src = record.source.as_ref().map(|e| e.modified_time);
                let dst = record.dest.as_ref().map(|e| e.modified_time);
                match (src, dst) {
                    (Some(a), Some(b)) if a > b => by(SourceWins, "by-time"),
                    (Some(a), Some(b)) if a < b => by(DestinationWins, "by-time"),
                    // 删除的一侧没有时间，保留仍存在的一侧
                    (Some(_), None) => by(SourceWins, "by-existence"),
                    (None, Some(_)) => by(DestinationWins, "by-existence"),
                    _ => by(KeepBoth, "tie"),
                }
            }
            ConflictPolicy::LargerWins => {
                let src = record.source.as_ref().map(|e| e.size);
                let dst = record.dest.as_ref().map(|e| e.size);
                match (src, dst) {
                    (Some(a), Some(b)) if a > b => by(SourceWins, "by-size"),
                    (Some(a), Some(b)) if a < b => by(DestinationWins, "by-size"),
                    (Some(_), None) => by(SourceWins, "by-existence"),
                    (None, Some(_)) => by(DestinationWins, "by-existence"),
                    _ => by(KeepBoth, "tie"),
                }
            }
        }
    }

    /// 生成冲突文件名
    pub fn generate_conflict_name(path: &str, side: Side, timestamp: i64) -> String {
        use chrono::DateTime;

        let dt = DateTime::from_timestamp(timestamp, 0)
            .map(|d| d.format("%Y%m%d_%H%M%S").to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let (dir, file) = match path.rfind('/') {
            Some(pos) => (&path[..=pos], &path[pos + 1..]),
            None => ("", path),
        };

        // 以点开头的文件（如 .bashrc）没有扩展名
        match file.rfind('.') {
            Some(ext_pos) if ext_pos > 0 => {
                let (name, ext) = file.split_at(ext_pos);
                format!("{}{}_conflict_{}_{}{}", dir, name, side, dt, ext)
            }
            _ => format!("{}{}_conflict_{}_{}", dir, file, side, dt),
        }
    }
}

fn rekey(snapshot: &Snapshot, case_sensitive: bool) -> Cow<'_, Snapshot> {
    if snapshot.case_sensitive == case_sensitive {
        Cow::Borrowed(snapshot)
    } else {
        Cow::Owned(snapshot.rekeyed(case_sensitive))
    }
}

/// 已保存的冲突
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredConflict {
    pub id: i64,
    pub job_id: String,
    pub file_path: String,
    pub source_change: SideChange,
    pub dest_change: SideChange,
    pub resolution: Option<ConflictResolution>,
    pub reason: String,
    pub source_size: Option<u64>,
    pub source_time: Option<i64>,
    pub dest_size: Option<u64>,
    pub dest_time: Option<i64>,
    pub created_at: i64,
}

/// 数据库行
#[derive(Debug, sqlx::FromRow)]
struct ConflictRow {
    id: i64,
    job_id: String,
    file_path: String,
    source_change: String,
    dest_change: String,
    resolution: Option<String>,
    reason: String,
    source_size: Option<i64>,
    source_time: Option<i64>,
    dest_size: Option<i64>,
    dest_time: Option<i64>,
    created_at: i64,
}

impl From<ConflictRow> for StoredConflict {
    fn from(r: ConflictRow) -> Self {
        StoredConflict {
            id: r.id,
            job_id: r.job_id,
            file_path: r.file_path,
            source_change: SideChange::from(r.source_change.as_str()),
            dest_change: SideChange::from(r.dest_change.as_str()),
            resolution: r.resolution.as_deref().map(ConflictResolution::from),
            reason: r.reason,
            source_size: r.source_size.map(|s| s.max(0) as u64),
            source_time: r.source_time,
            dest_size: r.dest_size.map(|s| s.max(0) as u64),
            dest_time: r.dest_time,
            created_at: r.created_at,
        }
    }
}

/// 冲突记录存储
#[derive(Debug, Clone)]
pub struct ConflictStore {
    db: Arc<SqlitePool>,
}

impl ConflictStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// 记录一批冲突；已有结果的冲突随本次运行处理，直接记为已应用
    pub async fn record_conflicts(&self, job_id: &str, conflicts: &[ConflictRecord]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        for c in conflicts {
            sqlx::query(
                r#"INSERT INTO conflicts
                   (job_id, file_path, source_change, dest_change, resolution, reason,
                    source_size, source_time, dest_size, dest_time, created_at, applied)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(job_id)
            .bind(&c.path)
            .bind(c.source_change.to_string())
            .bind(c.dest_change.to_string())
            .bind(c.resolution.map(|r| r.to_string()))
            .bind(&c.reason)
            .bind(c.source.as_ref().map(|e| e.size as i64))
            .bind(c.source.as_ref().map(|e| e.modified_time))
            .bind(c.dest.as_ref().map(|e| e.size as i64))
            .bind(c.dest.as_ref().map(|e| e.modified_time))
            .bind(now)
            .bind(c.resolution.is_some())
            .execute(&*self.db)
            .await?;
        }

        Ok(())
    }

    /// 获取任务的未解决冲突
    pub async fn get_pending_conflicts(&self, job_id: &str) -> Result<Vec<StoredConflict>> {
        let rows = sqlx::query_as::<_, ConflictRow>(
            "SELECT * FROM conflicts
             WHERE job_id = ? AND resolution IS NULL
             ORDER BY file_path",
        )
        .bind(job_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(StoredConflict::from).collect())
    }

    /// 获取任务的全部冲突（最新在前）
    pub async fn get_conflicts(&self, job_id: &str, limit: i64) -> Result<Vec<StoredConflict>> {
        let rows = sqlx::query_as::<_, ConflictRow>(
            "SELECT * FROM conflicts WHERE job_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(StoredConflict::from).collect())
    }

    /// 清除任务的未解决冲突（新一轮规划前调用）
    pub async fn clear_pending(&self, job_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conflicts WHERE job_id = ? AND resolution IS NULL")
            .bind(job_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// 解决冲突
    pub async fn resolve_conflict(&self, id: i64, resolution: ConflictResolution) -> Result<()> {
        sqlx::query("UPDATE conflicts SET resolution = ?, reason = ? WHERE id = ?")
            .bind(resolution.to_string())
            .bind(format!("{}-by-user", resolution_label(resolution)))
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// 调用方已决定、尚未在成功运行中应用的冲突结果（按路径，后决定的覆盖先决定的）
    pub async fn decisions(&self, job_id: &str) -> Result<HashMap<String, ConflictResolution>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT file_path, resolution FROM conflicts
             WHERE job_id = ? AND resolution IS NOT NULL AND applied = 0
             ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(path, resolution)| (path, ConflictResolution::from(resolution.as_str())))
            .collect())
    }

    /// 运行成功后把已决定的冲突标记为已应用
    pub async fn mark_applied(&self, job_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE conflicts SET applied = 1
             WHERE job_id = ? AND resolution IS NOT NULL AND applied = 0",
        )
        .bind(job_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }

    /// 删除任务的全部冲突记录
    pub async fn delete_job(&self, job_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conflicts WHERE job_id = ?")
            .bind(job_id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comparator::CompareConfig;
    use std::path::PathBuf;

    fn file(path: &str, size: u64, mtime: i64) -> Entry {
        Entry {
            relative_path: path.to_string(),
            absolute_path: PathBuf::from(path),
            size,
            modified_time: mtime,
            is_dir: false,
            checksum: None,
        }
    }

    fn snap(entries: Vec<Entry>) -> Snapshot {
        Snapshot::from_entries("/", true, entries, Vec::new())
    }

    fn classifier(policy: ConflictPolicy) -> ConflictClassifier {
        let comparator = FileComparator::with_config(CompareConfig {
            case_sensitive: true,
            ..Default::default()
        });
        ConflictClassifier::new(comparator, policy)
    }

    fn baseline(entries: Vec<Entry>) -> Baseline {
        Baseline::new("job", snap(entries.clone()), snap(entries))
    }

    #[test]
    fn test_one_sided_changes_propagate() {
        let base = baseline(vec![file("keep.txt", 1, 100), file("gone.txt", 1, 100)]);
        let source = snap(vec![
            file("keep.txt", 2, 200),
            file("gone.txt", 1, 100),
            file("new.txt", 1, 300),
        ]);
        let dest = snap(vec![file("keep.txt", 1, 100)]);

        let result = classifier(ConflictPolicy::Ask).classify(&base, &source, &dest);
        assert!(result.conflicts.is_empty());

        let changes: Vec<_> = result
            .auto_changes
            .iter()
            .map(|c| (c.path.as_str(), c.from, c.change))
            .collect();
        assert_eq!(
            changes,
            vec![
                ("gone.txt", Side::Destination, SideChange::Deleted),
                ("keep.txt", Side::Source, SideChange::Modified),
                ("new.txt", Side::Source, SideChange::Added),
            ]
        );
    }

    #[test]
    fn test_identical_changes_are_unchanged() {
        let base = baseline(vec![file("a.txt", 1, 100), file("b.txt", 1, 100)]);
        let source = snap(vec![file("a.txt", 5, 500)]);
        let dest = snap(vec![file("a.txt", 5, 501)]);

        let result = classifier(ConflictPolicy::Ask).classify(&base, &source, &dest);
        assert!(result.conflicts.is_empty());
        assert!(result.auto_changes.is_empty());
        assert_eq!(result.unchanged, 2);
    }

    #[test]
    fn test_diverged_baseline_counts_as_never_synced() {
        // 单向运行后两侧基线不一致
        let base = Baseline::new(
            "job",
            snap(vec![file("a.txt", 1, 100), file("old.txt", 3, 100)]),
            snap(vec![file("a.txt", 1, 100), file("extra.txt", 2, 100), file("old.txt", 4, 200)]),
        );
        let source = snap(vec![file("a.txt", 1, 100), file("old.txt", 3, 100)]);
        let dest = snap(vec![
            file("a.txt", 1, 100),
            file("extra.txt", 2, 100),
            file("old.txt", 4, 200),
        ]);

        let result = classifier(ConflictPolicy::NewerWins).classify(&base, &source, &dest);
        assert_eq!(result.unchanged, 1);
        assert_eq!(result.auto_changes.len(), 1);
        let extra = &result.auto_changes[0];
        assert_eq!(extra.path, "extra.txt");
        assert_eq!(extra.from, Side::Destination);
        assert_eq!(extra.change, SideChange::Added);

        assert_eq!(result.conflicts.len(), 1);
        let old = &result.conflicts[0];
        assert_eq!(old.path, "old.txt");
        assert_eq!(old.source_change, SideChange::Added);
        assert_eq!(old.dest_change, SideChange::Added);
        assert_eq!(old.resolution, Some(ConflictResolution::DestinationWins));
    }

    #[test]
    fn test_newer_wins_by_time() {
        let base = baseline(vec![file("shared.txt", 10, 100)]);
        let source = snap(vec![file("shared.txt", 11, 300)]);
        let dest = snap(vec![file("shared.txt", 12, 200)]);

        let result = classifier(ConflictPolicy::NewerWins).classify(&base, &source, &dest);
        assert_eq!(result.conflicts.len(), 1);
        let c = &result.conflicts[0];
        assert_eq!(c.resolution, Some(ConflictResolution::SourceWins));
        assert_eq!(c.reason, "SourceWins-by-time");
        assert_eq!(c.source_change, SideChange::Modified);
        assert_eq!(c.dest_change, SideChange::Modified);
    }

    #[test]
    fn test_delete_versus_modify_is_conflict() {
        let base = baseline(vec![file("doc.txt", 10, 100)]);
        let source = snap(vec![]);
        let dest = snap(vec![file("doc.txt", 20, 200)]);

        let newer = classifier(ConflictPolicy::NewerWins).classify(&base, &source, &dest);
        assert_eq!(newer.conflicts[0].resolution, Some(ConflictResolution::DestinationWins));
        assert_eq!(newer.conflicts[0].reason, "DestinationWins-by-existence");

        let larger = classifier(ConflictPolicy::LargerWins).classify(&base, &source, &dest);
        assert_eq!(larger.conflicts[0].resolution, Some(ConflictResolution::DestinationWins));
    }

    #[test]
    fn test_ask_waits_for_caller() {
        let base = baseline(vec![]);
        let source = snap(vec![file("x.txt", 1, 100)]);
        let dest = snap(vec![file("x.txt", 2, 100)]);

        let mut result = classifier(ConflictPolicy::Ask).classify(&base, &source, &dest);
        assert_eq!(result.pending_conflicts().count(), 1);

        let mut decisions = HashMap::new();
        decisions.insert("x.txt".to_string(), ConflictResolution::DestinationWins);
        result.apply_resolutions(&decisions);
        assert_eq!(result.pending_conflicts().count(), 0);
        assert_eq!(result.conflicts[0].reason, "DestinationWins-by-user");
    }

    #[test]
    fn test_larger_wins_and_tie() {
        let base = baseline(vec![]);
        let source = snap(vec![file("a", 10, 100), file("b", 5, 100)]);
        let dest = snap(vec![file("a", 3, 100), file("b", 7, 100)]);
        let result = classifier(ConflictPolicy::LargerWins).classify(&base, &source, &dest);
        assert_eq!(result.conflicts[0].resolution, Some(ConflictResolution::SourceWins));
        assert_eq!(result.conflicts[1].resolution, Some(ConflictResolution::DestinationWins));

        // 时间相同、大小不同：NewerWins 无法判断，保留两边
        let tie = classifier(ConflictPolicy::NewerWins).classify(&base, &source, &dest);
        assert_eq!(tie.conflicts[0].resolution, Some(ConflictResolution::KeepBoth));
        assert_eq!(tie.conflicts[0].reason, "KeepBoth-tie");
    }

    #[test]
    fn test_generate_conflict_name() {
        let ts = 1_700_000_000; // 2023-11-14 22:13:20 UTC
        assert_eq!(
            ConflictClassifier::generate_conflict_name("docs/report.txt", Side::Destination, ts),
            "docs/report_conflict_dest_20231114_221320.txt"
        );
        assert_eq!(
            ConflictClassifier::generate_conflict_name("Makefile", Side::Source, ts),
            "Makefile_conflict_source_20231114_221320"
        );
        assert_eq!(
            ConflictClassifier::generate_conflict_name("a.b/.env", Side::Source, ts),
            "a.b/.env_conflict_source_20231114_221320"
        );
    }

    #[tokio::test]
    async fn test_conflict_store() {
        let store = ConflictStore::new(Arc::new(crate::db::connect_in_memory().await.unwrap()));
        let record = ConflictRecord {
            path: "x.txt".into(),
            source_change: SideChange::Modified,
            dest_change: SideChange::Deleted,
            source: Some(file("x.txt", 4, 100)),
            dest: None,
            resolution: None,
            reason: "awaiting-decision".into(),
        };
        store.record_conflicts("job", &[record]).await.unwrap();

        let pending = store.get_pending_conflicts("job").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source_size, Some(4));
        assert_eq!(pending[0].dest_change, SideChange::Deleted);

        assert!(store.decisions("job").await.unwrap().is_empty());

        store
            .resolve_conflict(pending[0].id, ConflictResolution::SourceWins)
            .await
            .unwrap();
        assert!(store.get_pending_conflicts("job").await.unwrap().is_empty());
        assert_eq!(store.get_conflicts("job", 10).await.unwrap().len(), 1);

        let decisions = store.decisions("job").await.unwrap();
        assert_eq!(decisions.get("x.txt"), Some(&ConflictResolution::SourceWins));

        assert_eq!(store.mark_applied("job").await.unwrap(), 1);
        assert!(store.decisions("job").await.unwrap().is_empty());
        assert_eq!(store.delete_job("job").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_policy_resolved_conflicts_are_not_decisions() {
        let store = ConflictStore::new(Arc::new(crate::db::connect_in_memory().await.unwrap()));
        let record = ConflictRecord {
            path: "y.txt".into(),
            source_change: SideChange::Modified,
            dest_change: SideChange::Modified,
            source: Some(file("y.txt", 1, 100)),
            dest: Some(file("y.txt", 2, 200)),
            resolution: Some(ConflictResolution::DestinationWins),
            reason: "DestinationWins-by-time".into(),
        };
        store.record_conflicts("job", &[record]).await.unwrap();
        assert!(store.decisions("job").await.unwrap().is_empty());
    }
}
