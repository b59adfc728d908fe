/// 日志工具模块
///
/// 提供日志初始化和输出格式化的辅助函数
use std::path::Path;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::models::JobOutcome;
use crate::orchestrator::RunSummary;

/// 初始化日志
///
/// 默认级别为 `info`，可以通过 `RUST_LOG` 覆盖。重复调用不会报错。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 并发采集模式");
    info!("🌐 目标页面: {}", config.target_url);
    info!("📊 最大并发数: {}", config.concurrency);
    info!(
        "⏱️ 单次时限: {} 秒，最多尝试 {} 次",
        config.job_timeout_secs, config.max_attempts
    );
    info!("{}", "=".repeat(60));
}

/// 记录任务加载信息
///
/// # 参数
/// - `total`: 任务总数
/// - `pending`: 需要运行的任务数
pub fn log_jobs_loaded(total: usize, pending: usize) {
    info!("✓ 共 {} 个任务，{} 个待处理", total, pending);
    if total > pending {
        info!("💡 {} 个任务的工作表已存在，将跳过", total - pending);
    }
}

/// 记录单个任务的最终结果
pub fn log_job_outcome(name: &str, outcome: &JobOutcome, elapsed: Duration) {
    let elapsed = format_elapsed(elapsed);
    match outcome {
        JobOutcome::Succeeded { rows } => {
            info!("[任务 {}] ✅ 完成，{} 行，耗时 {}", name, rows, elapsed);
        }
        JobOutcome::Degraded { rows, skipped } => {
            warn!(
                "[任务 {}] ⚠️ 完成但有 {} 次选择被跳过，{} 行，耗时 {}",
                name,
                skipped.len(),
                rows,
                elapsed
            );
        }
        JobOutcome::Failed {
            kind,
            attempts,
            message,
        } => {
            error!(
                "[任务 {}] ❌ {}（尝试 {} 次），耗时 {}: {}",
                name, kind, attempts, elapsed, message
            );
        }
        JobOutcome::Skipped => info!("[任务 {}] ⏭️ 已存在，跳过", name),
        JobOutcome::Abandoned => warn!("[任务 {}] 🛑 已放弃", name),
    }
}

/// 打印最终统计信息
pub fn print_final_stats(summary: &RunSummary, output_path: &Path, elapsed: Duration) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}，总耗时 {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        format_elapsed(elapsed)
    );
    info!("{}", "=".repeat(60));
    info!("✅ 完成: {}/{}", summary.completed(), summary.total());
    info!("   其中完整成功: {}", summary.succeeded());
    info!("⚠️ 降级: {}", summary.degraded());
    info!("⏭️ 跳过: {}", summary.skipped());
    info!("❌ 失败: {}", summary.failed());
    if summary.abandoned() > 0 {
        info!("🛑 放弃: {}", summary.abandoned());
    }
    if summary.interrupted {
        info!("收到终止信号，提前结束");
    }
    info!("{}", "=".repeat(60));
    match &summary.flush_error {
        Some(e) => error!("\n工作簿保存失败: {}", e),
        None => info!("\n结果已保存至: {}", output_path.display()),
    }
}

/// 按秒取整显示耗时
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
