//! 任务调度状态机
//!
//! 只计算下一次运行时间，不持有定时器；外部调度器轮询 `is_due` 后触发运行。
//! 所有时间均为 UTC Unix 秒。

use crate::core::error::SyncError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// 触发方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    /// 文件变化后等待 settle 秒无新变化再运行
    OnChange { settle_seconds: i64 },
    Interval { seconds: i64 },
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
    /// 日期超过当月天数时取当月最后一天
    Monthly { day: u32, hour: u32, minute: u32 },
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger::Manual
    }
}

impl Trigger {
    /// 检查触发参数，越界的时间点永远不会触发
    pub fn validate(&self) -> Result<(), SyncError> {
        let invalid = |what: String| -> Result<(), SyncError> {
            Err(SyncError::Planning(format!("触发方式无效: {}", what)))
        };
        let time_ok = |hour: u32, minute: u32| hour < 24 && minute < 60;
        match *self {
            Trigger::Manual => Ok(()),
            Trigger::OnChange { settle_seconds } if settle_seconds < 0 => {
                invalid(format!("等待时间 {} 秒", settle_seconds))
            }
            Trigger::Interval { seconds } if seconds <= 0 => {
                invalid(format!("间隔 {} 秒", seconds))
            }
            Trigger::Daily { hour, minute } | Trigger::Weekly { hour, minute, .. }
                if !time_ok(hour, minute) =>
            {
                invalid(format!("时间 {:02}:{:02}", hour, minute))
            }
            Trigger::Monthly { day, hour, minute }
                if !(1..=31).contains(&day) || !time_ok(hour, minute) =>
            {
                invalid(format!("每月 {} 日 {:02}:{:02}", day, hour, minute))
            }
            _ => Ok(()),
        }
    }
}

/// 调度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Idle,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Disabled,
}

impl ScheduleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleStatus::Idle => "idle",
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::Running => "running",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Failed => "failed",
            ScheduleStatus::Cancelled => "cancelled",
            ScheduleStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "idle" => ScheduleStatus::Idle,
            "scheduled" => ScheduleStatus::Scheduled,
            "running" => ScheduleStatus::Running,
            "completed" => ScheduleStatus::Completed,
            "failed" => ScheduleStatus::Failed,
            "cancelled" => ScheduleStatus::Cancelled,
            "disabled" => ScheduleStatus::Disabled,
            _ => return None,
        })
    }

    fn is_finished(self) -> bool {
        matches!(
            self,
            ScheduleStatus::Completed | ScheduleStatus::Failed | ScheduleStatus::Cancelled
        )
    }

    /// 允许的状态转换
    pub fn can_transition(self, to: ScheduleStatus) -> bool {
        use ScheduleStatus::*;
        match (self, to) {
            (Idle, Scheduled | Running | Disabled) => true,
            (Scheduled, Idle | Scheduled | Running | Disabled) => true,
            (Running, Completed | Failed | Cancelled) => true,
            (from, Idle | Scheduled | Running | Disabled) if from.is_finished() => true,
            (Disabled, Idle | Scheduled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个任务的调度状态（不可变值，每次转换返回新值）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    pub trigger: Trigger,
    pub status: ScheduleStatus,
    pub last_completion: Option<i64>,
    pub last_change: Option<i64>,
    pub next_run: Option<i64>,
    /// 本次运行开始时间（只在运行期间有值，不持久化）
    #[serde(default, skip_serializing)]
    pub started_at: Option<i64>,
}

impl ScheduleState {
    pub fn new(trigger: Trigger, now: i64) -> Self {
        let state = Self {
            trigger,
            status: ScheduleStatus::Idle,
            last_completion: None,
            last_change: None,
            next_run: None,
            started_at: None,
        };
        state.rescheduled(now)
    }

    /// 校验并执行状态转换
    pub fn transition(self, to: ScheduleStatus) -> Result<Self, SyncError> {
        if !self.status.can_transition(to) {
            return Err(SyncError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(Self { status: to, ..self })
    }

    /// 开始运行
    pub fn start(self, now: i64) -> Result<Self, SyncError> {
        Ok(Self {
            started_at: Some(now),
            ..self.transition(ScheduleStatus::Running)?
        })
    }

    /// 运行结束：记录完成时间并计算下一次运行
    pub fn finish(self, outcome: ScheduleStatus, now: i64) -> Result<Self, SyncError> {
        if !outcome.is_finished() {
            return Err(SyncError::InvalidTransition {
                from: self.status.to_string(),
                to: outcome.to_string(),
            });
        }
        let finished = self.transition(outcome)?;
        // 运行开始后出现的变化没有被本次扫描看到，仍需要一次新的运行
        let started_at = finished.started_at;
        let last_change = finished
            .last_change
            .filter(|&at| started_at.map(|s| at >= s).unwrap_or(false));
        Ok(Self {
            last_completion: Some(now),
            last_change,
            started_at: None,
            ..finished
        }
        .rescheduled(now))
    }

    /// 重新计算下一次运行；有下一次时为 Scheduled，否则 Idle
    pub fn rescheduled(self, now: i64) -> Self {
        if matches!(self.status, ScheduleStatus::Disabled | ScheduleStatus::Running) {
            return self;
        }
        let next_run = match self.trigger {
            Trigger::OnChange { settle_seconds } => {
                self.last_change.map(|at| at + settle_seconds.max(0))
            }
            ref trigger => next_run_time(trigger, self.last_completion, now),
        };
        let status = if next_run.is_some() {
            ScheduleStatus::Scheduled
        } else {
            ScheduleStatus::Idle
        };
        Self {
            status,
            next_run,
            ..self
        }
    }

    pub fn disable(self) -> Result<Self, SyncError> {
        Ok(Self {
            next_run: None,
            ..self.transition(ScheduleStatus::Disabled)?
        })
    }

    pub fn enable(self, now: i64) -> Result<Self, SyncError> {
        Ok(self.transition(ScheduleStatus::Idle)?.rescheduled(now))
    }

    /// 更换触发方式
    pub fn with_trigger(self, trigger: Trigger, now: i64) -> Self {
        Self { trigger, ..self }.rescheduled(now)
    }

    /// 记录一次文件变化（OnChange 去抖：每次变化都把运行时间往后推）
    pub fn note_change(self, at: i64) -> Self {
        let state = Self {
            last_change: Some(at),
            ..self
        };
        match state.trigger {
            Trigger::OnChange { .. } => state.rescheduled(at),
            _ => state,
        }
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.status == ScheduleStatus::Scheduled && self.next_run.map(|t| t <= now).unwrap_or(false)
    }
}

/// 根据触发方式和上次完成时间计算下一次运行时间
///
/// `Manual` 和 `OnChange` 不按时间触发，返回 None。没有完成记录时以 `now` 为起点。
pub fn next_run_time(trigger: &Trigger, last_completion: Option<i64>, now: i64) -> Option<i64> {
    let base = last_completion.unwrap_or(now);
    match *trigger {
        Trigger::Manual | Trigger::OnChange { .. } => None,
        Trigger::Interval { seconds } => (seconds > 0).then(|| base + seconds),
        Trigger::Daily { hour, minute } => {
            let date = DateTime::from_timestamp(base, 0)?.date_naive();
            let today = at_time(date, hour, minute)?;
            if today > base {
                Some(today)
            } else {
                at_time(date + Duration::days(1), hour, minute)
            }
        }
        Trigger::Weekly {
            weekday,
            hour,
            minute,
        } => {
            let date = DateTime::from_timestamp(base, 0)?.date_naive();
            let ahead = (7 + weekday.num_days_from_monday() as i64
                - date.weekday().num_days_from_monday() as i64)
                % 7;
            let candidate = at_time(date + Duration::days(ahead), hour, minute)?;
            if candidate > base {
                Some(candidate)
            } else {
                at_time(date + Duration::days(ahead + 7), hour, minute)
            }
        }
        Trigger::Monthly { day, hour, minute } => {
            if day == 0 {
                return None;
            }
            let date = DateTime::from_timestamp(base, 0)?.date_naive();
            let (mut year, mut month) = (date.year(), date.month());
            // 当月的时间点已过时取下个月
            for _ in 0..2 {
                let clamped = day.min(days_in_month(year, month)?);
                let date = NaiveDate::from_ymd_opt(year, month, clamped)?;
                let candidate = at_time(date, hour, minute)?;
                if candidate > base {
                    return Some(candidate);
                }
                (year, month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
            }
            None
        }
    }
}

fn at_time(date: NaiveDate, hour: u32, minute: u32) -> Option<i64> {
    date.and_hms_opt(hour, minute, 0).map(|dt| dt.and_utc().timestamp())
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|d| d.day())
}
