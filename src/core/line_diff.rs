//! 行级文本差异（LCS），用于在人工处理冲突前展示两侧文本

use serde::Serialize;
use similar::{Algorithm, ChangeTag, DiffOp, TextDiff};

/// 行类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Context,
    Added,
    Removed,
}

/// 差异中的一行（保留原始换行符）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub kind: LineKind,
    pub text: String,
}

/// 一段连续的差异及其上下文
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Hunk {
    /// A 中的起始行（从 1 开始）
    pub old_start: usize,
    pub old_lines: usize,
    /// B 中的起始行（从 1 开始）
    pub new_start: usize,
    pub new_lines: usize,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// 由 Context + Removed 行拼出的 A 片段
    pub fn old_text(&self) -> String {
        self.collect(LineKind::Removed)
    }

    /// 由 Context + Added 行拼出的 B 片段
    pub fn new_text(&self) -> String {
        self.collect(LineKind::Added)
    }

    fn collect(&self, side: LineKind) -> String {
        self.lines
            .iter()
            .filter(|l| l.kind == LineKind::Context || l.kind == side)
            .map(|l| l.text.as_str())
            .collect()
    }
}

/// 计算两段文本的行级差异
///
/// 返回的 hunk 按位置排列，每个 hunk 前后最多带 `context` 行上下文，
/// 相邻 hunk 的上下文重叠时合并为一个。文本相同时返回空列表。
pub fn diff_lines(a: &str, b: &str, context: usize) -> Vec<Hunk> {
    let diff = TextDiff::configure().algorithm(Algorithm::Lcs).diff_lines(a, b);

    diff.grouped_ops(context)
        .iter()
        .map(|group| build_hunk(&diff, group))
        .collect()
}

fn build_hunk(diff: &TextDiff<'_, '_, '_, str>, group: &[DiffOp]) -> Hunk {
    let (old_start, new_start) = group
        .first()
        .map(|op| (op.old_range().start, op.new_range().start))
        .unwrap_or_default();

    let lines: Vec<DiffLine> = group
        .iter()
        .flat_map(|op| diff.iter_changes(op))
        .map(|change| DiffLine {
            kind: match change.tag() {
                ChangeTag::Equal => LineKind::Context,
                ChangeTag::Delete => LineKind::Removed,
                ChangeTag::Insert => LineKind::Added,
            },
            text: change.value().to_string(),
        })
        .collect();

    Hunk {
        old_start: old_start + 1,
        old_lines: group.iter().map(|op| op.old_range().len()).sum(),
        new_start: new_start + 1,
        new_lines: group.iter().map(|op| op.new_range().len()).sum(),
        lines,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct(hunks: &[Hunk]) -> (String, String) {
        (
            hunks.iter().map(Hunk::old_text).collect(),
            hunks.iter().map(Hunk::new_text).collect(),
        )
    }

    #[test]
    fn test_identical_texts_have_no_hunks() {
        assert!(diff_lines("a\nb\n", "a\nb\n", 3).is_empty());
        assert!(diff_lines("", "", 3).is_empty());
    }

    #[test]
    fn test_full_context_reconstructs_both_texts() {
        let cases = [
            ("a\nb\nc\n", "a\nx\nc\n"),
            ("", "new\nfile\n"),
            ("old\nfile\n", ""),
            ("one\ntwo\nthree", "zero\none\nthree\nfour"),
            ("same\n", "same"),
            ("a\nb\nc\nd\ne\n", "e\nd\nc\nb\na\n"),
        ];
        for (a, b) in cases {
            let hunks = diff_lines(a, b, usize::MAX / 2);
            assert_eq!(hunks.len(), 1, "{:?} -> {:?}", a, b);
            assert_eq!(reconstruct(&hunks), (a.to_string(), b.to_string()));
        }
    }

    #[test]
    fn test_single_change_with_context() {
        let a = "1\n2\n3\n4\n5\n6\n7\n8\n9\n";
        let b = "1\n2\n3\n4\nfive\n6\n7\n8\n9\n";
        let hunks = diff_lines(a, b, 2);
        assert_eq!(hunks.len(), 1);

        let hunk = &hunks[0];
        assert_eq!(hunk.old_start, 3);
        assert_eq!(hunk.new_start, 3);
        assert_eq!(hunk.old_lines, 5);
        assert_eq!(hunk.new_lines, 5);
        let kinds: Vec<LineKind> = hunk.lines.iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LineKind::Context,
                LineKind::Context,
                LineKind::Removed,
                LineKind::Added,
                LineKind::Context,
                LineKind::Context,
            ]
        );
        assert_eq!(hunk.lines[2].text, "5\n");
        assert_eq!(hunk.lines[3].text, "five\n");
    }

    #[test]
    fn test_distant_changes_split_and_close_changes_merge() {
        let lines: Vec<String> = (1..=20).map(|i| format!("line {}\n", i)).collect();
        let edit = |changed: &[usize]| -> String {
            lines
                .iter()
                .enumerate()
                .map(|(i, l)| {
                    if changed.contains(&i) {
                        format!("edited {}\n", i)
                    } else {
                        l.clone()
                    }
                })
                .collect()
        };
        let a = edit(&[]);
        assert_eq!(diff_lines(&a, &edit(&[1, 18]), 1).len(), 2);
        assert_eq!(diff_lines(&a, &edit(&[2, 4]), 1).len(), 1);
    }

    #[test]
    fn test_lcs_keeps_longest_common_run() {
        let hunks = diff_lines("a\nb\nc\nd\n", "b\nc\nd\ne\n", 0);
        let removed: Vec<&str> = hunks
            .iter()
            .flat_map(|h| &h.lines)
            .filter(|l| l.kind == LineKind::Removed)
            .map(|l| l.text.as_str())
            .collect();
        let added: Vec<&str> = hunks
            .iter()
            .flat_map(|h| &h.lines)
            .filter(|l| l.kind == LineKind::Added)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(removed, vec!["a\n"]);
        assert_eq!(added, vec!["e\n"]);
        assert_eq!(hunks.len(), 2);
    }
}
