pub mod baseline;
pub mod comparator;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod executor;
pub mod line_diff;
pub mod planner;
pub mod scanner;
pub mod schedule;
pub mod snapshot;

pub use baseline::{Baseline, BaselineStore, JobLease, JobLocks};
pub use comparator::{CompareConfig, DiffEntry, DiffKind, DiffSummary, FileComparator, FileRelation};
pub use conflict::{
    Classification, ConflictClassifier, ConflictPolicy, ConflictRecord, ConflictResolution,
    ConflictStore, SideChange, StoredConflict,
};
pub use engine::SyncEngine;
pub use error::{ActionError, ScanError, SyncError};
pub use executor::{PausedRun, SyncControl, SyncExecutor, SyncPhase, SyncProgress, SyncResult};
pub use line_diff::{diff_lines, Hunk, LineKind};
pub use planner::{Action, ActionKind, Plan, SyncPlanner};
pub use scanner::{FileScanner, ScanConfig, ScanFilters};
pub use schedule::{next_run_time, ScheduleState, ScheduleStatus, Trigger};
pub use snapshot::{Entry, Side, Snapshot};
