//! 采集驱动接口 - 基础设施层
//!
//! 把"打开页面、选择类别、选择计数、点击导出、等待下载"抽象为一组能力，
//! 任务流程只依赖这个 trait，不关心背后是浏览器还是测试替身。

use async_trait::async_trait;

use crate::error::DriverError;
use crate::models::RawPayload;

/// 选择结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionOutcome {
    /// 已选中
    Applied,
    /// 选择器或选项不存在
    NotFound,
}

/// 采集驱动
///
/// 每个会话只属于一个任务，不会在任务之间共享或复用。
#[async_trait]
pub trait ExtractionDriver: Send + Sync + 'static {
    type Session: Send + 'static;

    /// 打开指向 `target` 的会话
    async fn open_session(&self, target: &str) -> Result<Self::Session, DriverError>;

    /// 在第 `step_index` 个选择器槽位上选择 `category`
    async fn apply_selection(
        &self,
        session: &mut Self::Session,
        step_index: usize,
        category: &str,
    ) -> Result<SelectionOutcome, DriverError>;

    /// 选择计数选项
    async fn apply_variant(&self, session: &mut Self::Session, value: &str)
        -> Result<(), DriverError>;

    /// 触发导出并等待数据返回
    async fn trigger_extraction(&self, session: &mut Self::Session)
        -> Result<RawPayload, DriverError>;

    /// 关闭会话；可重复调用，失败后调用也是安全的
    async fn close_session(&self, session: &mut Self::Session);
}
