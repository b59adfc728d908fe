//! 浏览器采集驱动
//!
//! 每个会话启动一个独立的浏览器实例（独立用户目录、独立下载目录），
//! 通过页面脚本操作下拉框，点击导出按钮后从下载目录读取 CSV。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{Browser, Page};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser::launch::{launch_browser, LaunchOptions};
use crate::config::{Config, Selectors};
use crate::error::DriverError;
use crate::infrastructure::{ExtractionDriver, SelectionOutcome};
use crate::models::RawPayload;

const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// 基于 Chromium 的采集驱动
#[derive(Clone, Debug)]
pub struct ChromeDriver {
    launch: LaunchOptions,
    selectors: Selectors,
    settle_delay: Duration,
    download_timeout: Duration,
}

/// 浏览器会话，持有浏览器进程、页面和临时目录
pub struct ChromeSession {
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
    page: Option<Page>,
    download_dir: TempDir,
    _profile_dir: TempDir,
}

impl ChromeSession {
    fn page(&self) -> Result<&Page, DriverError> {
        self.page.as_ref().ok_or(DriverError::SessionClosed)
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum SelectStatus {
    Applied,
    MissingSelect,
    MissingOption,
}

impl ChromeDriver {
    pub fn new(
        launch: LaunchOptions,
        selectors: Selectors,
        settle_delay: Duration,
        download_timeout: Duration,
    ) -> Self {
        Self {
            launch,
            selectors,
            settle_delay,
            download_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            LaunchOptions {
                headless: config.headless,
                chrome_executable: config.chrome_executable.clone(),
                extensions: config.extensions.clone(),
            },
            config.selectors.clone(),
            config.settle_delay(),
            config.download_timeout(),
        )
    }

    /// 在下拉框中选择值或显示文本等于 `label` 的选项
    async fn select(
        &self,
        page: &Page,
        selector: &str,
        label: &str,
    ) -> Result<SelectStatus, DriverError> {
        let status: SelectStatus = eval_as(page, select_script(selector, label)?).await?;
        if status == SelectStatus::Applied {
            // 等待页面根据选择刷新
            sleep(self.settle_delay).await;
        }
        Ok(status)
    }
}

#[async_trait]
impl ExtractionDriver for ChromeDriver {
    type Session = ChromeSession;

    async fn open_session(&self, target: &str) -> Result<ChromeSession, DriverError> {
        let profile_dir = tempfile::Builder::new()
            .prefix("harvest-profile-")
            .tempdir()?;
        let download_dir = tempfile::Builder::new()
            .prefix("harvest-download-")
            .tempdir()?;

        let (browser, handler) =
            launch_browser(&self.launch, profile_dir.path(), download_dir.path()).await?;

        let mut session = ChromeSession {
            browser: Some(browser),
            handler: Some(handler),
            page: None,
            download_dir,
            _profile_dir: profile_dir,
        };

        match open_page(&session, target).await {
            Ok(page) => {
                info!("已导航到: {}", target);
                session.page = Some(page);
                Ok(session)
            }
            Err(e) => {
                self.close_session(&mut session).await;
                Err(e)
            }
        }
    }

    async fn apply_selection(
        &self,
        session: &mut ChromeSession,
        step_index: usize,
        category: &str,
    ) -> Result<SelectionOutcome, DriverError> {
        let Some(selector) = self.selectors.steps.get(step_index) else {
            return Ok(SelectionOutcome::NotFound);
        };

        match self.select(session.page()?, selector, category).await? {
            SelectStatus::Applied => Ok(SelectionOutcome::Applied),
            status => {
                debug!("选择器 {} 选择 {} 失败: {:?}", selector, category, status);
                Ok(SelectionOutcome::NotFound)
            }
        }
    }

    async fn apply_variant(&self, session: &mut ChromeSession, value: &str) -> Result<(), DriverError> {
        match self.select(session.page()?, &self.selectors.variant, value).await? {
            SelectStatus::Applied => Ok(()),
            status => Err(DriverError::VariantUnavailable {
                value: value.to_string(),
                reason: format!("{status:?}"),
            }),
        }
    }

    async fn trigger_extraction(
        &self,
        session: &mut ChromeSession,
    ) -> Result<RawPayload, DriverError> {
        let page = session.page()?;
        let button = page
            .find_element(self.selectors.export_button.as_str())
            .await
            .map_err(|e| DriverError::TriggerFailed(e.to_string()))?;
        button
            .click()
            .await
            .map_err(|e| DriverError::TriggerFailed(e.to_string()))?;

        let path = wait_for_download(session.download_dir.path(), self.download_timeout).await?;
        let bytes = tokio::fs::read(&path).await?;
        tokio::fs::remove_file(&path).await?;
        debug!("下载完成: {} ({} 字节)", path.display(), bytes.len());

        Ok(RawPayload::new(bytes))
    }

    async fn close_session(&self, session: &mut ChromeSession) {
        if let Some(page) = session.page.take() {
            if let Err(e) = page.close().await {
                debug!("关闭页面失败: {}", e);
            }
        }
        if let Some(mut browser) = session.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("关闭浏览器失败: {}", e);
            }
            if let Err(e) = browser.wait().await {
                debug!("等待浏览器退出失败: {}", e);
            }
        }
        if let Some(handler) = session.handler.take() {
            handler.abort();
        }
    }
}

async fn open_page(session: &ChromeSession, target: &str) -> Result<Page, DriverError> {
    let browser = session.browser.as_ref().ok_or(DriverError::SessionClosed)?;
    let navigation_err = |e: chromiumoxide::error::CdpError| DriverError::NavigationFailed {
        target: target.to_string(),
        reason: e.to_string(),
    };

    let page = browser.new_page(target).await.map_err(navigation_err)?;
    page.wait_for_navigation().await.map_err(navigation_err)?;
    Ok(page)
}

/// 执行 JS 代码并反序列化为指定类型
async fn eval_as<T: DeserializeOwned>(page: &Page, script: String) -> Result<T, DriverError> {
    let result = page.evaluate(script).await.map_err(DriverError::protocol)?;
    result.into_value().map_err(DriverError::protocol)
}

fn select_script(selector: &str, label: &str) -> Result<String, DriverError> {
    let selector = serde_json::to_string(selector).map_err(DriverError::protocol)?;
    let label = serde_json::to_string(label).map_err(DriverError::protocol)?;

    Ok(format!(
        r#"
        (() => {{
            const el = document.querySelector({selector});
            if (!el || !el.options) return "missing_select";
            const wanted = {label};
            const option = Array.from(el.options).find(
                (o) => o.value === wanted || o.text.trim() === wanted
            );
            if (!option) return "missing_option";
            el.value = option.value;
            el.dispatchEvent(new Event("input", {{ bubbles: true }}));
            el.dispatchEvent(new Event("change", {{ bubbles: true }}));
            return "applied";
        }})()
        "#
    ))
}

/// 轮询下载目录，直到出现下载完成的文件
async fn wait_for_download(dir: &Path, timeout: Duration) -> Result<PathBuf, DriverError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(path) = finished_download(dir).await? {
            return Ok(path);
        }
        if Instant::now() >= deadline {
            return Err(DriverError::DownloadTimeout(timeout));
        }
        sleep(DOWNLOAD_POLL_INTERVAL).await;
    }
}

async fn finished_download(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let partial = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("crdownload") || ext.eq_ignore_ascii_case("tmp"));
        if !partial && entry.file_type().await?.is_file() {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
