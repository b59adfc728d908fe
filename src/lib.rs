//! # Sheet Harvester
//!
//! 并发地从网页导出 CSV 表格，合并后写入多工作表的 xlsx 工作簿
//!
//! ## 架构设计
//!
//! 本系统采用四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 只暴露能力，不关心业务
//! - `ExtractionDriver` - 会话 / 选择 / 导出的驱动接口
//! - `with_policy` - 时限、panic 捕获和线性退避重试
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `merge` - 合并多份 CSV，只保留第一份的表头
//! - `OutputStore` - 共享工作簿，原子落盘
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个任务"的完整处理流程
//! - `JobRunner` - 打开会话 → 逐个计数选项导出 → 合并 → 写入
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/scheduler` - 并发调度、跳过、终止处理
//! - `orchestrator/app` - 组装依赖、监听信号
//!
//! 浏览器实现位于 `browser/`，是 `ExtractionDriver` 的 Chromium 版本。

pub mod browser;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use browser::ChromeDriver;
pub use config::Config;
pub use error::{AppError, AppResult};
pub use infrastructure::{ExtractionDriver, RetryPolicy, SelectionOutcome};
pub use models::{Job, JobOutcome, RawPayload, RowSet};
pub use orchestrator::{App, Orchestrator, RunSettings, RunSummary};
pub use services::{merge, OutputStore};
pub use workflow::JobRunner;
