//! 单个任务流程 - 流程层
//!
//! 流程顺序：
//! 1. 打开会话（任何退出路径都会释放）
//! 2. 逐个计数选项：应用全部选择步骤 → 选择计数 → 导出并等待数据
//! 3. 关闭会话
//! 4. 合并数据 → 写入工作簿 → 落盘

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{DriverError, JobError};
use crate::infrastructure::{ExtractionDriver, SelectionOutcome};
use crate::models::{Job, JobReport, RawPayload, SkippedSelection};
use crate::services::{merge, OutputStore};

/// 任务执行器
///
/// - 不持有任何会话，每次运行独占一个新会话
/// - 只依赖驱动能力和共享工作簿
pub struct JobRunner<D: ExtractionDriver> {
    driver: Arc<D>,
    store: Arc<OutputStore>,
}

impl<D: ExtractionDriver> Clone for JobRunner<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            store: Arc::clone(&self.store),
        }
    }
}

impl<D: ExtractionDriver> JobRunner<D> {
    pub fn new(driver: Arc<D>, store: Arc<OutputStore>) -> Self {
        Self { driver, store }
    }

    /// 执行一次任务尝试
    pub async fn run(&self, job: &Job) -> Result<JobReport, JobError> {
        info!("{} 🌐 打开页面: {}", job, job.target);
        let session = self.driver.open_session(&job.target).await?;
        let mut guard = SessionGuard::new(Arc::clone(&self.driver), session);

        let extracted = match guard.session_mut() {
            Some(session) => self.extract_all(job, session).await,
            None => Err(DriverError::SessionClosed),
        };
        guard.close().await;
        let (payloads, skipped_selections) = extracted?;

        let rows = merge(&payloads)?;
        let rows_written = rows.len();
        self.store.put(&job.name, rows).await;
        self.store.flush().await?;

        info!("{} ✓ 已写入 {} 行", job, rows_written);
        Ok(JobReport {
            rows_written,
            skipped_selections,
        })
    }

    async fn extract_all(
        &self,
        job: &Job,
        session: &mut D::Session,
    ) -> Result<(Vec<RawPayload>, Vec<SkippedSelection>), DriverError> {
        let mut payloads = Vec::with_capacity(job.variants.len());
        let mut skipped = Vec::new();

        for (variant_index, variant) in job.variants.iter().enumerate() {
            debug!(
                "{} 计数选项 {}/{}: {}",
                job,
                variant_index + 1,
                job.variants.len(),
                variant
            );

            for (step_index, step) in job.selection_steps.iter().enumerate() {
                for category in &step.categories {
                    let outcome = self
                        .driver
                        .apply_selection(session, step_index, category)
                        .await?;
                    if outcome == SelectionOutcome::NotFound {
                        warn!(
                            "{} ⚠️ 第 {} 个选择器找不到类别 {}，跳过",
                            job,
                            step_index + 1,
                            category
                        );
                        skipped.push(SkippedSelection {
                            variant: variant.clone(),
                            step_index,
                            category: category.clone(),
                        });
                    }
                }
            }

            self.driver.apply_variant(session, variant).await?;
            let payload = self.driver.trigger_extraction(session).await?;
            debug!("{} 📥 收到 {} 字节", job, payload.len());
            payloads.push(payload);
        }

        Ok((payloads, skipped))
    }
}

/// 会话守卫
///
/// 正常路径显式 `close()`；超时取消或 panic 时由 `Drop` 在后台关闭。
struct SessionGuard<D: ExtractionDriver> {
    driver: Arc<D>,
    session: Option<D::Session>,
}

impl<D: ExtractionDriver> SessionGuard<D> {
    fn new(driver: Arc<D>, session: D::Session) -> Self {
        Self {
            driver,
            session: Some(session),
        }
    }

    fn session_mut(&mut self) -> Option<&mut D::Session> {
        self.session.as_mut()
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.driver.close_session(&mut session).await;
        }
    }
}

impl<D: ExtractionDriver> Drop for SessionGuard<D> {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let driver = Arc::clone(&self.driver);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    driver.close_session(&mut session).await;
                });
            }
            Err(_) => warn!("没有可用的运行时，会话未能正常关闭"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RowSet, SelectionStep};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeDriver {
        payloads: HashMap<String, Vec<&'static str>>,
        missing: Vec<String>,
        fail_trigger: bool,
        hang_trigger: bool,
        calls: Mutex<Vec<String>>,
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    struct FakeSession {
        target: String,
        served: usize,
        open: bool,
    }

    impl FakeDriver {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExtractionDriver for FakeDriver {
        type Session = FakeSession;

        async fn open_session(&self, target: &str) -> Result<FakeSession, DriverError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeSession {
                target: target.to_string(),
                served: 0,
                open: true,
            })
        }

        async fn apply_selection(
            &self,
            _session: &mut FakeSession,
            step_index: usize,
            category: &str,
        ) -> Result<SelectionOutcome, DriverError> {
            self.record(format!("select {step_index} {category}"));
            if self.missing.iter().any(|m| m == category) {
                Ok(SelectionOutcome::NotFound)
            } else {
                Ok(SelectionOutcome::Applied)
            }
        }

        async fn apply_variant(
            &self,
            _session: &mut FakeSession,
            value: &str,
        ) -> Result<(), DriverError> {
            self.record(format!("variant {value}"));
            Ok(())
        }

        async fn trigger_extraction(
            &self,
            session: &mut FakeSession,
        ) -> Result<RawPayload, DriverError> {
            self.record("export".to_string());
            if self.hang_trigger {
                futures::future::pending::<()>().await;
            }
            if self.fail_trigger {
                return Err(DriverError::TriggerFailed("button missing".into()));
            }
            let payload = self.payloads[&session.target][session.served];
            session.served += 1;
            Ok(RawPayload::from(payload))
        }

        async fn close_session(&self, session: &mut FakeSession) {
            if session.open {
                session.open = false;
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn job() -> Job {
        Job::new(
            "A",
            "page-a",
            vec![SelectionStep::single("fruit"), SelectionStep::single("apple")],
            vec!["50".to_string(), "100".to_string()],
        )
    }

    fn driver() -> FakeDriver {
        FakeDriver {
            payloads: HashMap::from([(
                "page-a".to_string(),
                vec!["h,v\n1,x\n", "h,v\n2,y\n"],
            )]),
            ..Default::default()
        }
    }

    fn runner(
        driver: FakeDriver,
        dir: &tempfile::TempDir,
    ) -> (JobRunner<FakeDriver>, Arc<FakeDriver>, Arc<OutputStore>) {
        let driver = Arc::new(driver);
        let store = Arc::new(OutputStore::new(dir.path().join("out.xlsx")));
        (
            JobRunner::new(Arc::clone(&driver), Arc::clone(&store)),
            driver,
            store,
        )
    }

    #[tokio::test]
    async fn selections_precede_each_variant_and_result_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, driver, store) = runner(driver(), &dir);

        let report = runner.run(&job()).await.unwrap();

        assert_eq!(report.rows_written, 3);
        assert!(!report.is_degraded());
        assert_eq!(
            driver.calls(),
            vec![
                "select 0 fruit",
                "select 1 apple",
                "variant 50",
                "export",
                "select 0 fruit",
                "select 1 apple",
                "variant 100",
                "export",
            ]
        );
        assert_eq!(
            store.get("A").await.unwrap(),
            RowSet::from(vec![vec!["h", "v"], vec!["1", "x"], vec!["2", "y"]])
        );
        assert!(store.path().exists());
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_selector_degrades_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = driver();
        fake.missing = vec!["apple".to_string()];
        let (runner, _driver, store) = runner(fake, &dir);

        let report = runner.run(&job()).await.unwrap();

        assert!(report.is_degraded());
        assert_eq!(report.skipped_selections.len(), 2);
        assert_eq!(report.skipped_selections[0].step_index, 1);
        assert_eq!(report.skipped_selections[1].variant, "100");
        assert!(store.exists("A").await);
    }

    #[tokio::test]
    async fn driver_failure_still_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = driver();
        fake.fail_trigger = true;
        let (runner, driver, store) = runner(fake, &dir);

        let err = runner.run(&job()).await.unwrap_err();

        assert!(matches!(err, JobError::Extraction(DriverError::TriggerFailed(_))));
        assert_eq!(driver.opened.load(Ordering::SeqCst), 1);
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
        assert!(!store.exists("A").await);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_merge_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeDriver {
            payloads: HashMap::from([(
                "page-a".to_string(),
                vec!["h,v\n1,x\n", "h,v\n\"broken\n"],
            )]),
            ..Default::default()
        };
        let (runner, _driver, store) = runner(fake, &dir);

        let err = runner.run(&job()).await.unwrap_err();

        assert!(matches!(err, JobError::Merge(_)));
        assert!(!store.exists("A").await);
    }

    #[tokio::test]
    async fn cancelled_attempt_releases_session_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = driver();
        fake.hang_trigger = true;
        let (runner, driver, _store) = runner(fake, &dir);

        let attempt = tokio::time::timeout(Duration::from_millis(20), runner.run(&job())).await;
        assert!(attempt.is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
    }
}
