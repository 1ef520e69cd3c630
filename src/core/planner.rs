//! 同步计划：把差异或冲突分类结果转换为有序的动作列表

use crate::core::comparator::{DiffEntry, FileComparator, FileRelation};
use crate::core::conflict::{
    AutoChange, Classification, ConflictClassifier, ConflictRecord, ConflictResolution, SideChange,
};
use crate::core::error::SyncError;
use crate::core::snapshot::{path_depth, path_key, Entry, Side, Snapshot};
use crate::db::{SyncDirection, SyncMode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// 目标侧不存在，复制
    Copy,
    /// 目标侧存在，覆盖
    Update,
    Delete,
    /// 冲突被决定为跳过
    Skip,
    CreateDir,
    /// 保留两边时给失败一侧的文件改名
    Rename,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::Copy => "copy",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::Skip => "skip",
            ActionKind::CreateDir => "create_dir",
            ActionKind::Rename => "rename",
        };
        f.write_str(s)
    }
}

/// 单个同步动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// 被写入（或删除）一侧的相对路径
    pub path: String,
    pub kind: ActionKind,
    /// 被写入（或删除）的一侧
    pub target: Side,
    /// 复制时在另一侧读取的相对路径；改名时为原路径
    pub from_path: Option<String>,
    /// 读取的绝对路径
    pub source_path: Option<PathBuf>,
    /// 写入（或删除）的绝对路径
    pub destination_path: PathBuf,
    pub size: u64,
    /// 复制后设置的修改时间
    pub modified_time: Option<i64>,
    pub is_dir: bool,
    pub reason: String,
}

impl Action {
    /// 复制类动作读取的相对路径
    pub fn read_path(&self) -> &str {
        self.from_path.as_deref().unwrap_or(&self.path)
    }

    pub fn transfers_bytes(&self) -> bool {
        matches!(self.kind, ActionKind::Copy | ActionKind::Update)
    }

    fn phase(&self) -> u8 {
        match self.kind {
            ActionKind::Rename => 0,
            ActionKind::Delete => 1,
            _ => 2,
        }
    }
}

/// 同步计划，生成后不可修改，由执行器消费一次
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    source_root: PathBuf,
    dest_root: PathBuf,
    mode: SyncMode,
    direction: SyncDirection,
    actions: Vec<Action>,
    total_files: usize,
    total_bytes: u64,
    conflicts: Vec<ConflictRecord>,
    warnings: Vec<String>,
}

impl Plan {
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn dest_root(&self) -> &Path {
        &self.dest_root
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn direction(&self) -> SyncDirection {
        self.direction
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// 需要执行的动作数（不含跳过）
    pub fn total_files(&self) -> usize {
        self.total_files
    }

    /// 需要传输的字节数
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// 本次分类出的全部冲突（含已决定的）
    pub fn conflicts(&self) -> &[ConflictRecord] {
        &self.conflicts
    }

    /// 等待调用方决定的冲突
    pub fn pending_conflicts(&self) -> Vec<&ConflictRecord> {
        self.conflicts.iter().filter(|c| c.is_pending()).collect()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// 附加扫描阶段的警告
    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        self.warnings.extend(warnings);
        self
    }
}

/// 单向同步的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Copy,
    Delete,
    DeleteIfSynced,
    Update,
    UpdateIfNewer,
    Ignore,
}

/// 路径相对于可读侧（origin）的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    OriginOnly,
    TargetOnly,
    Differs,
}

/// 模式决策表
fn decide(mode: SyncMode, presence: Presence) -> Decision {
    use Decision::*;
    match (mode, presence) {
        (_, Presence::OriginOnly) => Copy,
        (SyncMode::Mirror, Presence::TargetOnly) => Delete,
        (SyncMode::Echo, Presence::TargetOnly) => DeleteIfSynced,
        (SyncMode::Update | SyncMode::Contribute, Presence::TargetOnly) => Ignore,
        (SyncMode::Mirror | SyncMode::Echo, Presence::Differs) => Update,
        (SyncMode::Update, Presence::Differs) => UpdateIfNewer,
        (SyncMode::Contribute, Presence::Differs) => Ignore,
    }
}

/// 同步计划生成器
pub struct SyncPlanner {
    source_root: PathBuf,
    dest_root: PathBuf,
    comparator: FileComparator,
}

impl SyncPlanner {
    pub fn new(
        source_root: impl Into<PathBuf>,
        dest_root: impl Into<PathBuf>,
        comparator: FileComparator,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            dest_root: dest_root.into(),
            comparator,
        }
    }

    fn root(&self, side: Side) -> &Path {
        match side {
            Side::Source => &self.source_root,
            Side::Destination => &self.dest_root,
        }
    }

    fn absolute(&self, side: Side, path: &str) -> PathBuf {
        self.root(side).join(path)
    }

    fn case_sensitive(&self) -> bool {
        self.comparator.config().case_sensitive
    }

    /// 单向计划
    ///
    /// `diffs` 以源为参考侧（`FileComparator::diff(source, dest)`）。
    /// `previously_synced` 是可读侧的基线快照，Echo 模式据此判断是否删除。
    pub fn plan(
        &self,
        diffs: &[DiffEntry],
        mode: SyncMode,
        direction: SyncDirection,
        previously_synced: Option<&Snapshot>,
    ) -> Result<Plan, SyncError> {
        let origin_side = match direction {
            SyncDirection::SourceToDestination => Side::Source,
            SyncDirection::DestinationToSource => Side::Destination,
            SyncDirection::Bidirectional => {
                return Err(SyncError::Planning(
                    "双向同步必须先经过冲突分类".to_string(),
                ))
            }
        };
        let target_side = origin_side.other();

        let mut actions = Vec::new();
        let mut present = Vec::new();

        for diff in diffs {
            let (origin, target) = match origin_side {
                Side::Source => (diff.reference.as_ref(), diff.other.as_ref()),
                Side::Destination => (diff.other.as_ref(), diff.reference.as_ref()),
            };
            if let Some(t) = target {
                present.push((target_side, t.relative_path.clone()));
            }

            let presence = match (origin, target) {
                (Some(_), None) => Presence::OriginOnly,
                (None, Some(_)) => Presence::TargetOnly,
                (Some(o), Some(t)) => {
                    if self.comparator.same_content(o, t) {
                        continue;
                    }
                    Presence::Differs
                }
                (None, None) => continue,
            };

            let origin_label = side_label(origin_side);
            match decide(mode, presence) {
                Decision::Copy => {
                    let reason = format!("仅{}存在", origin_label);
                    self.propagate(origin_side, origin, target, &reason, &mut actions);
                }
                Decision::Delete => {
                    let reason = format!("{}中已不存在", origin_label);
                    self.propagate(origin_side, None, target, &reason, &mut actions);
                }
                Decision::DeleteIfSynced => {
                    let synced = previously_synced
                        .map(|s| s.contains(&diff.path))
                        .unwrap_or(false);
                    if synced {
                        let reason = format!("上次同步过，{}中已删除", origin_label);
                        self.propagate(origin_side, None, target, &reason, &mut actions);
                    }
                }
                Decision::Update => {
                    let reason = format!("{}内容不同", origin_label);
                    self.propagate(origin_side, origin, target, &reason, &mut actions);
                }
                Decision::UpdateIfNewer => {
                    if let (Some(o), Some(t)) = (origin, target) {
                        if self.origin_is_newer(o, t) {
                            let reason = format!("{}较新", origin_label);
                            self.propagate(origin_side, origin, target, &reason, &mut actions);
                        }
                    }
                }
                Decision::Ignore => {}
            }
        }

        Ok(self.finish(mode, direction, actions, present, Vec::new()))
    }

    fn origin_is_newer(&self, origin: &Entry, target: &Entry) -> bool {
        match self.comparator.compare_entries(origin, target) {
            FileRelation::ReferenceNewer => true,
            FileRelation::TypeChanged => origin.modified_time > target.modified_time,
            _ => false,
        }
    }

    /// 双向计划：自动变化按模式传播，冲突按已决定的结果处理
    pub fn plan_bidirectional(&self, classification: &Classification, mode: SyncMode) -> Plan {
        let mut actions = Vec::new();
        let mut present = Vec::new();

        for change in &classification.auto_changes {
            for side in [Side::Source, Side::Destination] {
                if let Some(e) = change.entry(side) {
                    present.push((side, e.relative_path.clone()));
                }
            }
            self.plan_auto_change(change, mode, &mut actions);
        }

        for conflict in &classification.conflicts {
            for side in [Side::Source, Side::Destination] {
                if let Some(e) = conflict.entry(side) {
                    present.push((side, e.relative_path.clone()));
                }
            }
            self.plan_conflict(conflict, &mut actions);
        }

        self.finish(
            mode,
            SyncDirection::Bidirectional,
            actions,
            present,
            classification.conflicts.clone(),
        )
    }

    fn plan_auto_change(&self, change: &AutoChange, mode: SyncMode, actions: &mut Vec<Action>) {
        let from = change.from;
        let origin = change.entry(from);
        let target = change.entry(from.other());
        let label = side_label(from);

        let presence = match change.change {
            SideChange::Deleted => Presence::TargetOnly,
            _ if target.is_none() => Presence::OriginOnly,
            _ => Presence::Differs,
        };

        match decide(mode, presence) {
            Decision::Copy => {
                let reason = format!("{}新增", label);
                self.propagate(from, origin, target, &reason, actions);
            }
            // 自动删除意味着该路径在基线中，即上次同步过
            Decision::Delete | Decision::DeleteIfSynced => {
                let reason = format!("{}已删除", label);
                self.propagate(from, None, target, &reason, actions);
            }
            Decision::Update => {
                let reason = format!("{}已修改", label);
                self.propagate(from, origin, target, &reason, actions);
            }
            Decision::UpdateIfNewer => {
                if let (Some(o), Some(t)) = (origin, target) {
                    if self.origin_is_newer(o, t) {
                        let reason = format!("{}已修改且较新", label);
                        self.propagate(from, origin, target, &reason, actions);
                    }
                }
            }
            Decision::Ignore => {}
        }
    }

    fn plan_conflict(&self, conflict: &ConflictRecord, actions: &mut Vec<Action>) {
        let Some(resolution) = conflict.resolution else {
            debug!("冲突等待决定: {}", conflict.path);
            return;
        };

        match resolution {
            ConflictResolution::SourceWins => self.propagate(
                Side::Source,
                conflict.source.as_ref(),
                conflict.dest.as_ref(),
                &conflict.reason,
                actions,
            ),
            ConflictResolution::DestinationWins => self.propagate(
                Side::Destination,
                conflict.dest.as_ref(),
                conflict.source.as_ref(),
                &conflict.reason,
                actions,
            ),
            ConflictResolution::Skip => actions.push(Action {
                path: conflict.path.clone(),
                kind: ActionKind::Skip,
                target: Side::Destination,
                from_path: None,
                source_path: conflict.source.as_ref().map(|e| e.absolute_path.clone()),
                destination_path: self.absolute(Side::Destination, &conflict.path),
                size: 0,
                modified_time: None,
                is_dir: false,
                reason: conflict.reason.clone(),
            }),
            ConflictResolution::KeepBoth => self.plan_keep_both(conflict, actions),
        }
    }

    /// 保留两边：失败一侧（较旧，时间相同时为目标侧）的文件改名后互相补齐
    fn plan_keep_both(&self, conflict: &ConflictRecord, actions: &mut Vec<Action>) {
        let (src, dst) = match (conflict.source.as_ref(), conflict.dest.as_ref()) {
            (Some(s), Some(d)) => (s, d),
            // 一侧已删除：没有需要改名的文件，直接恢复仍存在的一侧
            (Some(_), None) => {
                let kept = conflict.source.as_ref();
                return self.propagate(Side::Source, kept, None, &conflict.reason, actions);
            }
            (None, Some(_)) => {
                let kept = conflict.dest.as_ref();
                return self.propagate(Side::Destination, kept, None, &conflict.reason, actions);
            }
            (None, None) => return,
        };

        let loser_side = match (src.is_dir, dst.is_dir) {
            (true, false) => Side::Destination,
            (false, true) => Side::Source,
            _ if src.modified_time > dst.modified_time => Side::Destination,
            _ if src.modified_time < dst.modified_time => Side::Source,
            _ => Side::Destination,
        };
        let winner_side = loser_side.other();
        let (loser, winner) = match loser_side {
            Side::Source => (src, dst),
            Side::Destination => (dst, src),
        };

        let renamed = ConflictClassifier::generate_conflict_name(
            &loser.relative_path,
            loser_side,
            loser.modified_time,
        );

        actions.push(Action {
            path: renamed.clone(),
            kind: ActionKind::Rename,
            target: loser_side,
            from_path: Some(loser.relative_path.clone()),
            source_path: Some(loser.absolute_path.clone()),
            destination_path: self.absolute(loser_side, &renamed),
            size: loser.size,
            modified_time: Some(loser.modified_time),
            is_dir: false,
            reason: conflict.reason.clone(),
        });

        // 原路径改名后为空，写入胜出一侧的内容
        self.propagate(winner_side, Some(winner), None, &conflict.reason, actions);

        actions.push(Action {
            path: renamed.clone(),
            kind: ActionKind::Copy,
            target: winner_side,
            from_path: Some(renamed.clone()),
            source_path: Some(self.absolute(loser_side, &renamed)),
            destination_path: self.absolute(winner_side, &renamed),
            size: loser.size,
            modified_time: Some(loser.modified_time),
            is_dir: false,
            reason: conflict.reason.clone(),
        });
    }

    /// 让 `from` 对侧的状态与 `origin` 一致
    fn propagate(
        &self,
        from: Side,
        origin: Option<&Entry>,
        target: Option<&Entry>,
        reason: &str,
        actions: &mut Vec<Action>,
    ) {
        let to = from.other();

        if let Some(t) = target {
            let replace = match origin {
                None => true,
                Some(o) => o.is_dir != t.is_dir,
            };
            if replace {
                actions.push(Action {
                    path: t.relative_path.clone(),
                    kind: ActionKind::Delete,
                    target: to,
                    from_path: None,
                    source_path: None,
                    destination_path: t.absolute_path.clone(),
                    size: t.size,
                    modified_time: None,
                    is_dir: t.is_dir,
                    reason: reason.to_string(),
                });
            }
        }

        let Some(o) = origin else {
            return;
        };

        let target_matches_type = target.map(|t| t.is_dir == o.is_dir).unwrap_or(false);
        let path = target
            .filter(|_| target_matches_type)
            .map(|t| t.relative_path.clone())
            .unwrap_or_else(|| o.relative_path.clone());

        if o.is_dir {
            if !target_matches_type {
                actions.push(Action {
                    destination_path: self.absolute(to, &path),
                    path,
                    kind: ActionKind::CreateDir,
                    target: to,
                    from_path: None,
                    source_path: Some(o.absolute_path.clone()),
                    size: 0,
                    modified_time: None,
                    is_dir: true,
                    reason: reason.to_string(),
                });
            }
            return;
        }

        let kind = if target_matches_type {
            ActionKind::Update
        } else {
            ActionKind::Copy
        };
        actions.push(Action {
            destination_path: self.absolute(to, &path),
            from_path: (o.relative_path != path).then(|| o.relative_path.clone()),
            path,
            kind,
            target: to,
            source_path: Some(o.absolute_path.clone()),
            size: o.size,
            modified_time: Some(o.modified_time),
            is_dir: false,
            reason: reason.to_string(),
        });
    }

    fn finish(
        &self,
        mode: SyncMode,
        direction: SyncDirection,
        mut actions: Vec<Action>,
        present: Vec<(Side, String)>,
        conflicts: Vec<ConflictRecord>,
    ) -> Plan {
        sort_actions(&mut actions);
        let mut warnings = Vec::new();
        self.prune_blocked_deletes(&mut actions, &present, &mut warnings);

        let total_files = actions.iter().filter(|a| a.kind != ActionKind::Skip).count();
        let total_bytes = actions
            .iter()
            .filter(|a| a.transfers_bytes())
            .map(|a| a.size)
            .sum();

        debug!(
            "生成计划: {} 个动作, {} 字节, {} 个冲突",
            actions.len(),
            total_bytes,
            conflicts.len()
        );

        Plan {
            source_root: self.source_root.clone(),
            dest_root: self.dest_root.clone(),
            mode,
            direction,
            actions,
            total_files,
            total_bytes,
            conflicts,
            warnings,
        }
    }

    /// 目录下还有保留的条目时不能删除该目录（也不能用文件替换它）
    fn prune_blocked_deletes(
        &self,
        actions: &mut Vec<Action>,
        present: &[(Side, String)],
        warnings: &mut Vec<String>,
    ) {
        let cs = self.case_sensitive();
        let key = |side: Side, path: &str| (side, path_key(path, cs));

        let deleted: HashSet<(Side, String)> = actions
            .iter()
            .filter(|a| a.kind == ActionKind::Delete)
            .map(|a| key(a.target, &a.path))
            .collect();
        if !actions.iter().any(|a| a.kind == ActionKind::Delete && a.is_dir) {
            return;
        }

        let mut survivors: BTreeSet<(Side, String)> = present
            .iter()
            .map(|(side, path)| key(*side, path))
            .filter(|k| !deleted.contains(k))
            .collect();
        survivors.extend(
            actions
                .iter()
                .filter(|a| !matches!(a.kind, ActionKind::Delete | ActionKind::Skip))
                .map(|a| key(a.target, &a.path)),
        );

        // 删除已按深度从深到浅排列，被保留的子目录会继续阻止其父目录
        let mut blocked: HashSet<(Side, String)> = HashSet::new();
        for action in actions.iter().filter(|a| a.kind == ActionKind::Delete && a.is_dir) {
            let (side, dir) = key(action.target, &action.path);
            let prefix = format!("{}/", dir);
            let has_child = survivors
                .range((side, prefix.clone())..)
                .next()
                .map(|(s, p)| *s == side && p.starts_with(&prefix))
                .unwrap_or(false);
            if has_child {
                warn!("目录下仍有保留的条目，跳过删除: {}", action.path);
                warnings.push(format!("目录非空，未删除: {} ({})", action.path, side));
                blocked.insert((side, dir.clone()));
                survivors.insert((side, dir));
            }
        }

        if !blocked.is_empty() {
            actions.retain(|a| {
                let k = key(a.target, &a.path);
                !(blocked.contains(&k) && a.kind != ActionKind::Rename)
            });
        }
    }
}

fn side_label(side: Side) -> &'static str {
    match side {
        Side::Source => "源",
        Side::Destination => "目标",
    }
}

/// 改名最先；删除从深到浅；其余按路径升序（目录先于其中的文件）
fn sort_actions(actions: &mut [Action]) {
    actions.sort_by(|a, b| {
        a.phase().cmp(&b.phase()).then_with(|| {
            if a.kind == ActionKind::Delete {
                path_depth(&b.path)
                    .cmp(&path_depth(&a.path))
                    .then_with(|| b.path.cmp(&a.path))
            } else {
                a.path.cmp(&b.path)
            }
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::baseline::Baseline;
    use crate::core::comparator::CompareConfig;
    use crate::core::conflict::ConflictPolicy;

    fn file(path: &str, size: u64, mtime: i64) -> Entry {
        Entry {
            relative_path: path.to_string(),
            absolute_path: PathBuf::from("/x").join(path),
            size,
            modified_time: mtime,
            is_dir: false,
            checksum: None,
        }
    }

    fn dir(path: &str) -> Entry {
        Entry {
            is_dir: true,
            ..file(path, 0, 0)
        }
    }

    fn snap(entries: Vec<Entry>) -> Snapshot {
        Snapshot::from_entries("/x", true, entries, Vec::new())
    }

    fn comparator() -> FileComparator {
        FileComparator::with_config(CompareConfig {
            case_sensitive: true,
            ..Default::default()
        })
    }

    fn planner() -> SyncPlanner {
        SyncPlanner::new("/src", "/dst", comparator())
    }

    fn one_way(
        source: Vec<Entry>,
        dest: Vec<Entry>,
        mode: SyncMode,
        direction: SyncDirection,
        synced: Option<&Snapshot>,
    ) -> Plan {
        let diffs = comparator().diff(&snap(source), &snap(dest));
        planner().plan(&diffs, mode, direction, synced).unwrap()
    }

    fn summary(plan: &Plan) -> Vec<(ActionKind, Side, &str)> {
        plan.actions()
            .iter()
            .map(|a| (a.kind, a.target, a.path.as_str()))
            .collect()
    }

    #[test]
    fn test_mirror_copy_single_file() {
        let plan = one_way(
            vec![file("a.txt", 100, 10)],
            vec![],
            SyncMode::Mirror,
            SyncDirection::SourceToDestination,
            None,
        );
        assert_eq!(summary(&plan), vec![(ActionKind::Copy, Side::Destination, "a.txt")]);
        assert_eq!(plan.total_files(), 1);
        assert_eq!(plan.total_bytes(), 100);
        assert_eq!(plan.actions()[0].destination_path, PathBuf::from("/dst/a.txt"));
    }

    #[test]
    fn test_decision_table_for_dest_only_and_modified() {
        let source = vec![file("changed.txt", 5, 500)];
        let dest = vec![file("extra.txt", 1, 10), file("changed.txt", 4, 100)];

        let forward = SyncDirection::SourceToDestination;
        let mirror = one_way(source.clone(), dest.clone(), SyncMode::Mirror, forward, None);
        assert_eq!(
            summary(&mirror),
            vec![
                (ActionKind::Delete, Side::Destination, "extra.txt"),
                (ActionKind::Update, Side::Destination, "changed.txt"),
            ]
        );

        let update = one_way(source.clone(), dest.clone(), SyncMode::Update, forward, None);
        assert_eq!(summary(&update), vec![(ActionKind::Update, Side::Destination, "changed.txt")]);

        let contribute = one_way(source.clone(), dest.clone(), SyncMode::Contribute, forward, None);
        assert!(contribute.is_empty());

        // Echo 只删除上次同步过的文件
        let echo = one_way(source.clone(), dest.clone(), SyncMode::Echo, forward, None);
        assert_eq!(summary(&echo), vec![(ActionKind::Update, Side::Destination, "changed.txt")]);
        let synced = snap(vec![file("extra.txt", 1, 10)]);
        let echo = one_way(source, dest, SyncMode::Echo, forward, Some(&synced));
        assert_eq!(echo.actions()[0].kind, ActionKind::Delete);
    }

    #[test]
    fn test_update_mode_skips_older_source() {
        let plan = one_way(
            vec![file("a.txt", 5, 100)],
            vec![file("a.txt", 6, 500)],
            SyncMode::Update,
            SyncDirection::SourceToDestination,
            None,
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn test_destination_to_source_direction() {
        let plan = one_way(
            vec![file("old.txt", 1, 1)],
            vec![file("new.txt", 2, 2)],
            SyncMode::Mirror,
            SyncDirection::DestinationToSource,
            None,
        );
        assert_eq!(
            summary(&plan),
            vec![
                (ActionKind::Delete, Side::Source, "old.txt"),
                (ActionKind::Copy, Side::Source, "new.txt"),
            ]
        );
        assert_eq!(plan.actions()[1].destination_path, PathBuf::from("/src/new.txt"));
    }

    #[test]
    fn test_bidirectional_without_classification_is_planning_error() {
        let result = planner().plan(&[], SyncMode::Mirror, SyncDirection::Bidirectional, None);
        assert!(matches!(result, Err(SyncError::Planning(_))));
    }

    #[test]
    fn test_ordering_dirs_before_files_and_deepest_delete_first() {
        let plan = one_way(
            vec![
                dir("new"),
                file("new/inner.txt", 3, 1),
                dir("new/sub"),
                file("new/sub/deep.txt", 4, 1),
            ],
            vec![dir("old"), dir("old/sub"), file("old/sub/x.txt", 1, 1), file("old/y.txt", 1, 1)],
            SyncMode::Mirror,
            SyncDirection::SourceToDestination,
            None,
        );
        assert_eq!(
            summary(&plan),
            vec![
                (ActionKind::Delete, Side::Destination, "old/sub/x.txt"),
                (ActionKind::Delete, Side::Destination, "old/y.txt"),
                (ActionKind::Delete, Side::Destination, "old/sub"),
                (ActionKind::Delete, Side::Destination, "old"),
                (ActionKind::CreateDir, Side::Destination, "new"),
                (ActionKind::Copy, Side::Destination, "new/inner.txt"),
                (ActionKind::CreateDir, Side::Destination, "new/sub"),
                (ActionKind::Copy, Side::Destination, "new/sub/deep.txt"),
            ]
        );
        assert_eq!(plan.total_bytes(), 7);
    }

    #[test]
    fn test_type_change_deletes_then_creates() {
        let plan = one_way(
            vec![file("thing", 3, 100)],
            vec![dir("thing"), file("thing/child", 1, 1)],
            SyncMode::Mirror,
            SyncDirection::SourceToDestination,
            None,
        );
        assert_eq!(
            summary(&plan),
            vec![
                (ActionKind::Delete, Side::Destination, "thing/child"),
                (ActionKind::Delete, Side::Destination, "thing"),
                (ActionKind::Copy, Side::Destination, "thing"),
            ]
        );
    }

    #[test]
    fn test_echo_keeps_directory_with_unsynced_children() {
        let synced = snap(vec![dir("d"), file("d/synced.txt", 1, 1)]);
        let plan = one_way(
            vec![],
            vec![dir("d"), file("d/synced.txt", 1, 1), file("d/local.txt", 1, 1)],
            SyncMode::Echo,
            SyncDirection::SourceToDestination,
            Some(&synced),
        );
        assert_eq!(summary(&plan), vec![(ActionKind::Delete, Side::Destination, "d/synced.txt")]);
        assert_eq!(plan.warnings().len(), 1);
    }

    fn classify(
        policy: ConflictPolicy,
        base: Vec<Entry>,
        source: Vec<Entry>,
        dest: Vec<Entry>,
    ) -> Classification {
        let baseline = Baseline::new("job", snap(base.clone()), snap(base));
        let classifier = ConflictClassifier::new(comparator(), policy);
        classifier.classify(&baseline, &snap(source), &snap(dest))
    }

    #[test]
    fn test_bidirectional_newer_wins_updates_dest() {
        let classification = classify(
            ConflictPolicy::NewerWins,
            vec![file("shared.txt", 10, 100)],
            vec![file("shared.txt", 11, 300)],
            vec![file("shared.txt", 12, 200)],
        );
        let plan = planner().plan_bidirectional(&classification, SyncMode::Mirror);
        assert_eq!(summary(&plan), vec![(ActionKind::Update, Side::Destination, "shared.txt")]);
        assert_eq!(plan.conflicts().len(), 1);
        assert_eq!(plan.conflicts()[0].reason, "SourceWins-by-time");
        assert_eq!(plan.actions()[0].reason, "SourceWins-by-time");
    }

    #[test]
    fn test_bidirectional_auto_changes_both_ways() {
        let classification = classify(
            ConflictPolicy::Ask,
            vec![file("gone.txt", 1, 1), file("stay.txt", 1, 1)],
            vec![file("stay.txt", 1, 1), file("from_src.txt", 2, 5)],
            vec![file("gone.txt", 1, 1), file("stay.txt", 1, 1), file("from_dst.txt", 3, 5)],
        );
        let plan = planner().plan_bidirectional(&classification, SyncMode::Mirror);
        assert_eq!(
            summary(&plan),
            vec![
                (ActionKind::Delete, Side::Destination, "gone.txt"),
                (ActionKind::Copy, Side::Source, "from_dst.txt"),
                (ActionKind::Copy, Side::Destination, "from_src.txt"),
            ]
        );
    }

    #[test]
    fn test_keep_both_renames_older_side() {
        let classification = classify(
            ConflictPolicy::KeepBoth,
            vec![file("doc.txt", 1, 100)],
            vec![file("doc.txt", 2, 1_700_000_000)],
            vec![file("doc.txt", 3, 1_600_000_000)],
        );
        let plan = planner().plan_bidirectional(&classification, SyncMode::Mirror);
        let renamed = "doc_conflict_dest_20200913_122640.txt";
        assert_eq!(
            summary(&plan),
            vec![
                (ActionKind::Rename, Side::Destination, renamed),
                (ActionKind::Copy, Side::Destination, "doc.txt"),
                (ActionKind::Copy, Side::Source, renamed),
            ]
        );
        assert_eq!(plan.actions()[0].from_path.as_deref(), Some("doc.txt"));
        assert_eq!(plan.actions()[2].read_path(), renamed);
    }

    #[test]
    fn test_ask_and_skip() {
        let classification = classify(
            ConflictPolicy::Ask,
            vec![],
            vec![file("x.txt", 1, 100)],
            vec![file("x.txt", 2, 100)],
        );
        let plan = planner().plan_bidirectional(&classification, SyncMode::Mirror);
        assert!(plan.is_empty());
        assert_eq!(plan.pending_conflicts().len(), 1);

        let skipped = classify(
            ConflictPolicy::Skip,
            vec![],
            vec![file("x.txt", 1, 100)],
            vec![file("x.txt", 2, 100)],
        );
        let plan = planner().plan_bidirectional(&skipped, SyncMode::Mirror);
        assert_eq!(summary(&plan), vec![(ActionKind::Skip, Side::Destination, "x.txt")]);
        assert_eq!(plan.total_files(), 0);
    }

    #[test]
    fn test_deleted_directory_kept_for_conflicting_child() {
        // 源删除了整个目录，目标同时修改了其中的文件
        let classification = classify(
            ConflictPolicy::NewerWins,
            vec![dir("d"), file("d/a.txt", 1, 100), file("d/b.txt", 1, 100)],
            vec![],
            vec![dir("d"), file("d/a.txt", 1, 100), file("d/b.txt", 9, 900)],
        );
        let plan = planner().plan_bidirectional(&classification, SyncMode::Mirror);
        assert_eq!(
            summary(&plan),
            vec![
                (ActionKind::Delete, Side::Destination, "d/a.txt"),
                (ActionKind::Copy, Side::Source, "d/b.txt"),
            ]
        );
        assert_eq!(plan.warnings().len(), 1);
    }
}
