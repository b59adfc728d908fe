use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 浏览器 / 采集驱动错误
    #[error("驱动错误: {0}")]
    Driver(#[from] DriverError),
    /// 输出工作簿错误
    #[error("输出错误: {0}")]
    Store(#[from] StoreError),
    /// CSV 解析错误
    #[error("解析错误: {0}")]
    Parse(#[from] ParseError),
    /// 任务执行错误
    #[error("任务错误: {0}")]
    Job(#[from] JobError),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// JSON 解析失败
    #[error("JSON解析失败 ({path}): {source}")]
    JsonParseFailed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置值不合法
    #[error("配置项 {field} 不合法: {reason}")]
    Invalid { field: String, reason: String },
}

/// 采集驱动错误
#[derive(Debug, Error)]
pub enum DriverError {
    /// 浏览器配置或启动失败
    #[error("启动浏览器失败: {0}")]
    LaunchFailed(String),
    /// 打开目标页面失败
    #[error("打开页面 {target} 失败: {reason}")]
    NavigationFailed { target: String, reason: String },
    /// 页面协议调用失败（执行脚本、点击等）
    #[error("页面操作失败: {0}")]
    Protocol(String),
    /// 计数选项不可用
    #[error("无法选择计数选项 {value}: {reason}")]
    VariantUnavailable { value: String, reason: String },
    /// 导出按钮不存在或无法点击
    #[error("无法触发导出: {0}")]
    TriggerFailed(String),
    /// 等待下载超时
    #[error("等待下载超时 ({0:?})")]
    DownloadTimeout(std::time::Duration),
    /// 读取下载文件失败
    #[error("读取下载文件失败: {0}")]
    Io(#[from] std::io::Error),
    /// 会话已关闭
    #[error("会话已关闭")]
    SessionClosed,
}

/// 输出工作簿错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 读取已有工作簿失败
    #[error("读取工作簿失败 ({path}): {reason}")]
    ReadFailed { path: String, reason: String },
    /// 写入工作簿失败
    #[error("写入工作簿失败 ({path}): {reason}")]
    WriteFailed { path: String, reason: String },
    /// 后台写入任务异常退出
    #[error("写入任务异常退出: {0}")]
    TaskFailed(String),
}

/// CSV 解析错误
#[derive(Debug, Error)]
pub enum ParseError {
    /// 引号未闭合
    #[error("第 {payload} 份数据第 {line} 行的引号未闭合")]
    UnterminatedQuote { payload: usize, line: u64 },
    /// 编码错误或结构错误
    #[error("第 {payload} 份数据解析失败: {source}")]
    Malformed {
        payload: usize,
        #[source]
        source: csv::Error,
    },
}

/// 单次任务尝试的错误
#[derive(Debug, Error)]
pub enum JobError {
    #[error("采集失败: {0}")]
    Extraction(#[from] DriverError),
    #[error("合并失败: {0}")]
    Merge(#[from] ParseError),
    #[error("保存失败: {0}")]
    Store(#[from] StoreError),
}

impl ConfigError {
    /// 创建配置值不合法错误
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl DriverError {
    /// 把任意协议层错误包装为 `Protocol`
    pub fn protocol(err: impl std::fmt::Display) -> Self {
        DriverError::Protocol(err.to_string())
    }
}

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
