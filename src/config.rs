use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::infrastructure::RetryPolicy;
use crate::models::{Job, SelectionStep};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// 工作表名称最大长度
const MAX_SHEET_NAME_CHARS: usize = 31;
const INVALID_SHEET_CHARS: &[char] = &['[', ']', ':', '*', '?', '/', '\\'];

/// 一个选择步骤：单个类别，或按顺序应用的多个类别
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StepSpec {
    Single(String),
    Many(Vec<String>),
}

impl StepSpec {
    fn to_step(&self) -> SelectionStep {
        match self {
            StepSpec::Single(category) => SelectionStep::single(category.clone()),
            StepSpec::Many(categories) => SelectionStep::new(categories.clone()),
        }
    }
}

/// 页面元素选择器
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Selectors {
    /// 第 i 个选择步骤使用的下拉框
    pub steps: Vec<String>,
    /// 计数下拉框
    pub variant: String,
    /// 导出按钮
    pub export_button: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            steps: vec!["#selSHEET".to_string(), "#selSHEET2".to_string()],
            variant: "#selRANK".to_string(),
            export_button: r#"input[value="匯出CSV"]"#.to_string(),
        }
    }
}

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 目标URL
    #[serde(alias = "url")]
    pub target_url: String,
    /// 任务名（工作表名）→ 各选择步骤的类别
    #[serde(alias = "categoryMap")]
    pub jobs: BTreeMap<String, Vec<StepSpec>>,
    /// 计数选项，每个选项导出一次
    #[serde(alias = "countOptionList")]
    pub count_options: Vec<String>,
    /// 输出目录
    #[serde(alias = "outputPath")]
    pub output_dir: String,
    /// 指定输出文件（默认按日期生成）
    pub output_file: Option<String>,
    /// 同时运行的任务数量
    #[serde(alias = "concurrentCount")]
    pub concurrency: usize,
    /// 单次尝试时限（秒）
    pub job_timeout_secs: u64,
    /// 每个任务最多尝试次数
    pub max_attempts: u32,
    /// 重试退避单位（秒）
    pub backoff_unit_secs: u64,
    /// 收到终止信号后等待进行中任务的时间（秒）
    pub shutdown_grace_secs: u64,
    // --- 浏览器配置 ---
    pub headless: bool,
    pub chrome_executable: Option<String>,
    /// 需要加载的扩展目录
    pub extensions: Vec<String>,
    /// 每次选择后等待页面稳定的时间（毫秒）
    pub settle_millis: u64,
    /// 等待下载完成的时间（秒）
    pub download_timeout_secs: u64,
    pub selectors: Selectors,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_url: String::new(),
            jobs: BTreeMap::new(),
            count_options: Vec::new(),
            output_dir: "output".to_string(),
            output_file: None,
            concurrency: 3,
            job_timeout_secs: 300,
            max_attempts: 3,
            backoff_unit_secs: 1,
            shutdown_grace_secs: 0,
            headless: true,
            chrome_executable: None,
            extensions: Vec::new(),
            settle_millis: 800,
            download_timeout_secs: 60,
            selectors: Selectors::default(),
        }
    }
}

impl Config {
    /// 从 `HARVEST_CONFIG` 指定的文件加载配置，并应用环境变量覆盖
    pub fn from_env() -> Result<Self, ConfigError> {
        let path =
            std::env::var("HARVEST_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 读取配置文件，`.json` 按 JSON 解析，其余按 TOML 解析
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&content).map_err(|source| ConfigError::JsonParseFailed {
                path: path.display().to_string(),
                source,
            })
        } else {
            Self::from_toml_str(&content).map_err(|source| ConfigError::TomlParseFailed {
                path: path.display().to_string(),
                source,
            })
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// 应用环境变量覆盖，`lookup` 按变量名返回值
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("HARVEST_TARGET_URL") {
            self.target_url = v;
        }
        if let Some(v) = lookup("HARVEST_OUTPUT_DIR") {
            self.output_dir = v;
        }
        if let Some(v) = lookup("HARVEST_CONCURRENCY") {
            self.concurrency = parse_var("HARVEST_CONCURRENCY", &v, "usize")?;
        }
        if let Some(v) = lookup("HARVEST_HEADLESS") {
            self.headless = parse_var("HARVEST_HEADLESS", &v, "bool")?;
        }
        if let Some(v) = lookup("HARVEST_JOB_TIMEOUT_SECS") {
            self.job_timeout_secs = parse_var("HARVEST_JOB_TIMEOUT_SECS", &v, "u64")?;
        }
        if let Some(v) = lookup("HARVEST_MAX_ATTEMPTS") {
            self.max_attempts = parse_var("HARVEST_MAX_ATTEMPTS", &v, "u32")?;
        }
        Ok(())
    }

    /// 校验配置，任何错误都会在任务开始前终止程序
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_url.trim().is_empty() {
            return Err(ConfigError::invalid("target_url", "不能为空"));
        }
        if self.jobs.is_empty() {
            return Err(ConfigError::invalid("jobs", "至少需要一个任务"));
        }
        if self.count_options.is_empty() {
            return Err(ConfigError::invalid("count_options", "至少需要一个计数选项"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "必须大于 0"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "必须大于 0"));
        }
        if self.job_timeout_secs == 0 {
            return Err(ConfigError::invalid("job_timeout_secs", "必须大于 0"));
        }

        let mut seen = HashSet::new();
        for name in self.jobs.keys() {
            validate_sheet_name(name)?;
            if !seen.insert(name.to_lowercase()) {
                return Err(ConfigError::invalid(
                    format!("jobs.{name}"),
                    "工作表名称重复（不区分大小写）",
                ));
            }
        }

        let mut step_counts = self.jobs.values().map(Vec::len);
        let expected = step_counts.next().unwrap_or(0);
        if step_counts.any(|count| count != expected) {
            return Err(ConfigError::invalid("jobs", "所有任务的选择步骤数必须相同"));
        }
        if expected > self.selectors.steps.len() {
            return Err(ConfigError::invalid(
                "selectors.steps",
                format!(
                    "任务需要 {} 个选择器，只配置了 {} 个",
                    expected,
                    self.selectors.steps.len()
                ),
            ));
        }

        Ok(())
    }

    /// 根据配置构建任务列表
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .map(|(name, steps)| {
                Job::new(
                    name.clone(),
                    self.target_url.clone(),
                    steps.iter().map(StepSpec::to_step).collect(),
                    self.count_options.clone(),
                )
            })
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.job_timeout_secs),
            self.max_attempts,
            Duration::from_secs(self.backoff_unit_secs),
        )
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// 输出文件路径：`output_file`，或 `<output_dir>/output_<YYYY_MM_DD>.xlsx`
    pub fn output_path(&self, date: NaiveDate) -> PathBuf {
        match &self.output_file {
            Some(file) => PathBuf::from(file),
            None => Path::new(&self.output_dir)
                .join(format!("output_{}.xlsx", date.format("%Y_%m_%d"))),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    var_name: &str,
    value: &str,
    expected_type: &str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::EnvVarParseFailed {
            var_name: var_name.to_string(),
            value: value.to_string(),
            expected_type: expected_type.to_string(),
        })
}

fn validate_sheet_name(name: &str) -> Result<(), ConfigError> {
    let field = || format!("jobs.{name}");

    if name.trim().is_empty() {
        return Err(ConfigError::invalid(field(), "工作表名称不能为空"));
    }
    if name.chars().count() > MAX_SHEET_NAME_CHARS {
        return Err(ConfigError::invalid(
            field(),
            format!("工作表名称不能超过 {MAX_SHEET_NAME_CHARS} 个字符"),
        ));
    }
    if name.contains(INVALID_SHEET_CHARS) {
        return Err(ConfigError::invalid(
            field(),
            "工作表名称不能包含 [ ] : * ? / \\",
        ));
    }
    if name.starts_with('\'') || name.ends_with('\'') {
        return Err(ConfigError::invalid(field(), "工作表名称不能以单引号开头或结尾"));
    }
    if name.eq_ignore_ascii_case("history") {
        return Err(ConfigError::invalid(field(), "History 是保留的工作表名称"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    const SAMPLE_TOML: &str = r##"
target_url = "https://example.com/rank"
count_options = ["50", "100"]
concurrency = 2
output_dir = "out"

[jobs]
"水果-苹果" = ["水果", "苹果"]
"蔬菜" = ["蔬菜", ["叶菜", "菠菜"]]

[selectors]
steps = ["#a", "#b"]
"##;

    #[test]
    fn parses_toml_with_defaults() {
        let config = assert_ok!(Config::from_toml_str(SAMPLE_TOML));
        assert_ok!(config.validate());

        assert_eq!(config.concurrency, 2);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.job_timeout_secs, 300);
        assert_eq!(config.selectors.variant, "#selRANK");

        let jobs = config.jobs();
        assert_eq!(jobs.len(), 2);
        let veg = jobs.iter().find(|j| j.name == "蔬菜").unwrap();
        assert_eq!(veg.selection_steps[0], SelectionStep::single("蔬菜"));
        assert_eq!(
            veg.selection_steps[1],
            SelectionStep::new(vec!["叶菜".to_string(), "菠菜".to_string()])
        );
        assert_eq!(veg.variants, vec!["50", "100"]);
        assert_eq!(veg.target, "https://example.com/rank");
    }

    #[test]
    fn accepts_legacy_json_keys() {
        let json = r#"{
            "url": "https://example.com",
            "categoryMap": {"Sheet A": ["x", "y"]},
            "headless": false,
            "outputPath": "./result",
            "countOptionList": ["10"],
            "concurrentCount": 4
        }"#;

        let config = assert_ok!(Config::from_json_str(json));
        assert_ok!(config.validate());
        assert_eq!(config.target_url, "https://example.com");
        assert_eq!(config.concurrency, 4);
        assert!(!config.headless);
        assert_eq!(config.output_dir, "./result");
        assert_eq!(config.jobs().len(), 1);
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = assert_ok!(Config::from_toml_str(SAMPLE_TOML));
        let env = HashMap::from([
            ("HARVEST_CONCURRENCY", "7"),
            ("HARVEST_HEADLESS", "false"),
            ("HARVEST_OUTPUT_DIR", "elsewhere"),
        ]);

        assert_ok!(config.apply_overrides(|name| env.get(name).map(|v| v.to_string())));
        assert_eq!(config.concurrency, 7);
        assert!(!config.headless);
        assert_eq!(config.output_dir, "elsewhere");
    }

    #[test]
    fn unparsable_override_is_reported() {
        let mut config = Config::default();
        let err = assert_err!(config.apply_overrides(|name| {
            (name == "HARVEST_MAX_ATTEMPTS").then(|| "many".to_string())
        }));
        assert!(matches!(err, ConfigError::EnvVarParseFailed { .. }));
    }

    #[test]
    fn rejects_invalid_settings() {
        let base = assert_ok!(Config::from_toml_str(SAMPLE_TOML));

        let mut zero = base.clone();
        zero.concurrency = 0;
        assert_err!(zero.validate());

        let mut bad_name = base.clone();
        bad_name
            .jobs
            .insert("a/b".to_string(), vec![StepSpec::Single("x".into()); 2]);
        assert_err!(bad_name.validate());

        let mut long_name = base.clone();
        long_name
            .jobs
            .insert("x".repeat(32), vec![StepSpec::Single("x".into()); 2]);
        assert_err!(long_name.validate());

        let mut duplicate = base.clone();
        duplicate
            .jobs
            .insert("Fruit".to_string(), vec![StepSpec::Single("x".into()); 2]);
        duplicate
            .jobs
            .insert("fruit".to_string(), vec![StepSpec::Single("x".into()); 2]);
        assert_err!(duplicate.validate());

        let mut uneven = base.clone();
        uneven
            .jobs
            .insert("other".to_string(), vec![StepSpec::Single("x".into())]);
        assert_err!(uneven.validate());

        let mut too_many = base.clone();
        too_many.selectors.steps.truncate(1);
        assert_err!(too_many.validate());

        let mut no_variants = base;
        no_variants.count_options.clear();
        assert_err!(no_variants.validate());
    }

    #[test]
    fn output_path_is_derived_from_date() {
        let config = assert_ok!(Config::from_toml_str(SAMPLE_TOML));
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            config.output_path(date),
            Path::new("out").join("output_2024_03_09.xlsx")
        );

        let explicit = Config {
            output_file: Some("fixed.xlsx".to_string()),
            ..config
        };
        assert_eq!(explicit.output_path(date), PathBuf::from("fixed.xlsx"));
    }

    #[test]
    fn reads_config_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("config.toml");
        std::fs::write(&toml_path, SAMPLE_TOML).unwrap();
        assert_ok!(Config::from_file(&toml_path));

        let missing = dir.path().join("missing.json");
        let err = assert_err!(Config::from_file(&missing));
        assert!(matches!(err, ConfigError::ReadFailed { .. }));
    }
}
