//! 编排层（Orchestration Layer）
//!
//! ## 模块划分
//!
//! ### `app` - 应用入口
//! - 组装配置、工作簿和驱动
//! - 监听 Ctrl+C / SIGTERM
//! - 输出全局统计信息
//!
//! ### `scheduler` - 任务调度器
//! - 跳过已存在的工作表
//! - 控制并发数量（Semaphore）
//! - 套用时限与重试策略
//! - 终止信号后的收尾和最终落盘
//!
//! ## 层次关系
//!
//! ```text
//! app (组装 + 信号)
//!     ↓
//! scheduler (处理 Vec<Job>)
//!     ↓
//! workflow::JobRunner (处理单个 Job)
//!     ↓
//! services (合并 / 工作簿)
//!     ↓
//! infrastructure (驱动接口 / 重试策略)
//! ```

pub mod app;
pub mod scheduler;

// 重新导出主要类型
pub use app::App;
pub use scheduler::{Orchestrator, RunPhase, RunSettings, RunSummary};
