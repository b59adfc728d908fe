use std::path::Path;

use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::error::DriverError;

/// 浏览器启动参数
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    pub headless: bool,
    pub chrome_executable: Option<String>,
    pub extensions: Vec<String>,
}

/// 启动独立的浏览器实例
///
/// 每个实例使用自己的用户目录，下载文件写入 `download_dir`。
/// 返回浏览器和后台事件循环的句柄。
pub async fn launch_browser(
    options: &LaunchOptions,
    profile_dir: &Path,
    download_dir: &Path,
) -> Result<(Browser, JoinHandle<()>), DriverError> {
    let mut builder = BrowserConfig::builder()
        .user_data_dir(profile_dir)
        .args(vec![
            "--disable-gpu",           // 无头模式下禁用 GPU
            "--no-sandbox",            // 容器内没有沙盒权限
            "--disable-dev-shm-usage", // 防止共享内存不足
        ]);

    builder = if options.headless {
        builder.new_headless_mode()
    } else {
        builder.with_head()
    };
    if let Some(executable) = &options.chrome_executable {
        builder = builder.chrome_executable(executable);
    }
    for extension in &options.extensions {
        builder = builder.extension(extension.clone());
    }

    let config = builder.build().map_err(|e| {
        error!("配置浏览器失败: {}", e);
        DriverError::LaunchFailed(e)
    })?;

    let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
        error!("启动浏览器失败: {}", e);
        DriverError::LaunchFailed(e.to_string())
    })?;
    debug!("浏览器启动成功");

    // 在后台处理浏览器事件
    let handle = tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    // 添加短暂延迟以等待浏览器状态同步
    sleep(tokio::time::Duration::from_millis(300)).await;

    if let Err(e) = allow_downloads(&browser, download_dir).await {
        handle.abort();
        return Err(e);
    }

    Ok((browser, handle))
}

/// 允许下载并把文件写入指定目录
async fn allow_downloads(browser: &Browser, download_dir: &Path) -> Result<(), DriverError> {
    let params = SetDownloadBehaviorParams::builder()
        .behavior(SetDownloadBehaviorBehavior::Allow)
        .download_path(download_dir.to_string_lossy().to_string())
        .build()
        .map_err(DriverError::LaunchFailed)?;
    browser
        .execute(params)
        .await
        .map_err(|e| DriverError::LaunchFailed(format!("设置下载目录失败: {e}")))?;
    Ok(())
}
