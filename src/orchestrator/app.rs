//! 应用入口 - 编排层
//!
//! 负责把配置、工作簿、驱动和调度器组装起来，并监听终止信号。

use std::sync::Arc;

use chrono::Local;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::browser::ChromeDriver;
use crate::config::Config;
use crate::error::{AppResult, StoreError};
use crate::infrastructure::ExtractionDriver;
use crate::orchestrator::scheduler::{Orchestrator, RunSettings, RunSummary};
use crate::services::OutputStore;
use crate::utils::logging::{log_startup, print_final_stats};

/// 应用主结构
pub struct App<D: ExtractionDriver = ChromeDriver> {
    config: Config,
    store: Arc<OutputStore>,
    driver: Arc<D>,
}

impl App<ChromeDriver> {
    /// 使用浏览器驱动初始化应用
    pub async fn initialize(config: Config) -> AppResult<Self> {
        let driver = ChromeDriver::from_config(&config);
        Self::with_driver(config, driver).await
    }
}

impl<D: ExtractionDriver> App<D> {
    /// 使用指定驱动初始化应用
    ///
    /// 已有工作簿无法读取时直接返回错误，避免覆盖它。
    pub async fn with_driver(config: Config, driver: D) -> AppResult<Self> {
        log_startup(&config);

        let path = config.output_path(Local::now().date_naive());
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StoreError::WriteFailed {
                    path: dir.display().to_string(),
                    reason: e.to_string(),
                })?;
        }

        let store = OutputStore::load_existing(&path)?;

        Ok(Self {
            config,
            store: Arc::new(store),
            driver: Arc::new(driver),
        })
    }

    pub fn store(&self) -> &Arc<OutputStore> {
        &self.store
    }

    /// 运行全部任务，Ctrl+C 或 SIGTERM 会触发优雅停止
    pub async fn run(&self) -> AppResult<RunSummary> {
        let shutdown = CancellationToken::new();
        let listener = tokio::spawn(listen_for_shutdown(shutdown.clone()));

        let summary = self.run_until(shutdown).await;
        listener.abort();

        Ok(summary)
    }

    /// 运行全部任务，直到完成或 `shutdown` 被取消
    pub async fn run_until(&self, shutdown: CancellationToken) -> RunSummary {
        let started = Instant::now();
        let orchestrator = Orchestrator::new(
            Arc::clone(&self.driver),
            Arc::clone(&self.store),
            RunSettings::from_config(&self.config),
        );

        let summary = orchestrator.run(self.config.jobs(), shutdown).await;
        print_final_stats(&summary, self.store.path(), started.elapsed());
        summary
    }
}

/// 等待 Ctrl+C 或 SIGTERM，然后取消 `token`
async fn listen_for_shutdown(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("无法监听 Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("无法监听 SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("收到 Ctrl+C，开始停止"),
        _ = terminate => warn!("收到 SIGTERM，开始停止"),
    }
    token.cancel();
}
