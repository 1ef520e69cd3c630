//! 快照比较和行级差异的基准测试

use criterion::{criterion_group, criterion_main, Criterion};
use foldersync_lib::core::comparator::{CompareConfig, FileComparator};
use foldersync_lib::core::line_diff::diff_lines;
use foldersync_lib::core::snapshot::{Entry, Snapshot};
use std::hint::black_box;

const BASE_TIME: i64 = 1_700_000_000;

/// 生成一棵 `dirs` × `files` 的快照，`touched` 中的文件修改时间后移
fn build_snapshot(root: &str, dirs: usize, files: usize, touched: &[usize]) -> Snapshot {
    let mut entries = Vec::with_capacity(dirs * (files + 1));
    for d in 0..dirs {
        let dir = format!("dir{:03}", d);
        entries.push(Entry {
            relative_path: dir.clone(),
            absolute_path: format!("{}/{}", root, dir).into(),
            size: 0,
            modified_time: BASE_TIME,
            is_dir: true,
            checksum: None,
        });
        for f in 0..files {
            let index = d * files + f;
            let path = format!("{}/file{:04}.dat", dir, f);
            let shift = if touched.contains(&index) { 3600 } else { 0 };
            entries.push(Entry {
                absolute_path: format!("{}/{}", root, path).into(),
                relative_path: path,
                size: 1024 + index as u64,
                modified_time: BASE_TIME + shift,
                is_dir: false,
                checksum: None,
            });
        }
    }
    Snapshot::from_entries(root, true, entries, Vec::new())
}

fn bench_tree_diff(c: &mut Criterion) {
    let comparator = FileComparator::with_config(CompareConfig {
        case_sensitive: true,
        ..Default::default()
    });
    let source = build_snapshot("/src", 100, 100, &[]);
    let dest = build_snapshot("/dst", 100, 100, &[7, 512, 4096, 9999]);

    c.bench_function("tree_diff_10k_entries", |b| {
        b.iter(|| black_box(comparator.diff(black_box(&source), black_box(&dest))));
    });
}

fn bench_line_diff(c: &mut Criterion) {
    let original: String = (0..2000).map(|i| format!("line {}\n", i)).collect();
    let edited: String = (0..2000)
        .map(|i| match i % 250 {
            0 => format!("changed {}\n", i),
            _ => format!("line {}\n", i),
        })
        .collect();

    c.bench_function("line_diff_2000_lines", |b| {
        b.iter(|| black_box(diff_lines(black_box(&original), black_box(&edited), 3)));
    });
}

criterion_group!(benches, bench_tree_diff, bench_line_diff);
criterion_main!(benches);
