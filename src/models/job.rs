//! 采集任务定义

use std::fmt::Display;

/// 一个选择步骤
///
/// 同一步骤中的类别按顺序依次应用到同一个选择器槽位上
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionStep {
    pub categories: Vec<String>,
}

impl SelectionStep {
    pub fn new(categories: Vec<String>) -> Self {
        Self { categories }
    }

    /// 只包含一个类别的步骤
    pub fn single(category: impl Into<String>) -> Self {
        Self {
            categories: vec![category.into()],
        }
    }
}

/// 采集任务
///
/// `name` 同时也是输出工作表的名称，在一次运行中唯一
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// 任务名称（工作表名）
    pub name: String,
    /// 目标页面地址
    pub target: String,
    /// 选择步骤，第 i 个步骤使用第 i 个选择器槽位
    pub selection_steps: Vec<SelectionStep>,
    /// 计数选项，每个选项采集一次
    pub variants: Vec<String>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        selection_steps: Vec<SelectionStep>,
        variants: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            selection_steps,
            variants,
        }
    }
}

impl Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[任务 {}]", self.name)
    }
}
