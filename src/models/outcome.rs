//! 任务结果模型

use std::fmt;
use std::time::Duration;

/// 因选择器或选项缺失而被跳过的一次选择
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSelection {
    pub variant: String,
    pub step_index: usize,
    pub category: String,
}

/// 一次成功运行的任务报告
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    /// 写入工作表的行数（含表头）
    pub rows_written: usize,
    /// 被跳过的选择，非空即为降级采集
    pub skipped_selections: Vec<SkippedSelection>,
}

impl JobReport {
    pub fn is_degraded(&self) -> bool {
        !self.skipped_selections.is_empty()
    }
}

/// 失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Extraction,
    Merge,
    Store,
    Timeout,
    Panic,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Extraction => "采集失败",
            FailureKind::Merge => "合并失败",
            FailureKind::Store => "保存失败",
            FailureKind::Timeout => "超时",
            FailureKind::Panic => "异常终止",
        };
        f.write_str(label)
    }
}

/// 单个任务的最终结果（只记录日志，不持久化）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// 工作表已存在，未运行
    Skipped,
    /// 完整成功
    Succeeded { rows: usize },
    /// 成功但部分选择被跳过
    Degraded {
        rows: usize,
        skipped: Vec<SkippedSelection>,
    },
    /// 重试耗尽或被终止后仍失败
    Failed {
        kind: FailureKind,
        attempts: u32,
        message: String,
    },
    /// 未被调度或在终止信号后被放弃
    Abandoned,
}

impl JobOutcome {
    pub fn from_report(report: JobReport) -> Self {
        if report.is_degraded() {
            JobOutcome::Degraded {
                rows: report.rows_written,
                skipped: report.skipped_selections,
            }
        } else {
            JobOutcome::Succeeded {
                rows: report.rows_written,
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            JobOutcome::Succeeded { .. } | JobOutcome::Degraded { .. }
        )
    }
}

/// 带名称和耗时的任务结果
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub name: String,
    pub outcome: JobOutcome,
    pub elapsed: Duration,
}
