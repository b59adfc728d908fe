//! 任务调度器 - 编排层
//!
//! ## 职责
//!
//! 1. **过滤**：工作表已存在的任务直接标记为跳过
//! 2. **并发控制**：使用 Semaphore 限制同时运行的任务数
//! 3. **策略执行**：每个任务都在时限 + 重试策略下运行
//! 4. **终止处理**：收到信号后不再调度新任务，宽限期后放弃剩余任务
//! 5. **最终落盘**：无论如何退出，都会保存一次工作簿
//!
//! 生命周期：`Initializing → Running → Draining → Terminated`

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::JobError;
use crate::infrastructure::{with_policy, AttemptError, ExtractionDriver, PolicyError, RetryPolicy};
use crate::models::{FailureKind, Job, JobOutcome, JobRecord};
use crate::services::OutputStore;
use crate::utils::logging::{log_job_outcome, log_jobs_loaded};
use crate::workflow::JobRunner;

/// 调度器所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Initializing,
    Running,
    Draining,
    Terminated,
}

/// 调度参数
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    /// 最大并发任务数
    pub concurrency: usize,
    /// 单个任务的时限与重试策略
    pub policy: RetryPolicy,
    /// 收到终止信号后等待运行中任务的时间
    pub shutdown_grace: Duration,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency,
            policy: config.retry_policy(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// 一次运行的汇总
#[derive(Debug, Default)]
pub struct RunSummary {
    pub records: Vec<JobRecord>,
    /// 是否因终止信号提前结束
    pub interrupted: bool,
    /// 最终落盘失败的原因
    pub flush_error: Option<String>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Succeeded { .. }))
    }

    /// 成功或降级完成的任务数
    pub fn completed(&self) -> usize {
        self.count(JobOutcome::is_success)
    }

    pub fn degraded(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Degraded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Skipped))
    }

    pub fn abandoned(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Abandoned))
    }

    /// 按任务名查找结果
    pub fn outcome(&self, name: &str) -> Option<&JobOutcome> {
        self.records
            .iter()
            .find(|r| r.name == name)
            .map(|r| &r.outcome)
    }

    fn count(&self, predicate: impl Fn(&JobOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| predicate(&r.outcome)).count()
    }

    fn abandon(&mut self, name: String) {
        log_job_outcome(&name, &JobOutcome::Abandoned, Duration::ZERO);
        self.push(name, JobOutcome::Abandoned, Duration::ZERO);
    }

    fn push(&mut self, name: String, outcome: JobOutcome, elapsed: Duration) {
        self.records.push(JobRecord {
            name,
            outcome,
            elapsed,
        });
    }
}

/// 任务调度器
pub struct Orchestrator<D: ExtractionDriver> {
    runner: JobRunner<D>,
    store: Arc<OutputStore>,
    settings: RunSettings,
    phase: watch::Sender<RunPhase>,
}

impl<D: ExtractionDriver> Orchestrator<D> {
    pub fn new(driver: Arc<D>, store: Arc<OutputStore>, settings: RunSettings) -> Self {
        let (phase, _) = watch::channel(RunPhase::Initializing);
        Self {
            runner: JobRunner::new(driver, Arc::clone(&store)),
            store,
            settings,
            phase,
        }
    }

    /// 订阅阶段变化
    pub fn phases(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    /// 运行全部任务，直到完成或收到终止信号
    pub async fn run(&self, jobs: Vec<Job>, shutdown: CancellationToken) -> RunSummary {
        self.enter(RunPhase::Initializing);
        let mut summary = RunSummary::default();

        let total = jobs.len();
        let mut pending = Vec::with_capacity(total);
        for job in jobs {
            if self.store.exists(&job.name).await {
                log_job_outcome(&job.name, &JobOutcome::Skipped, Duration::ZERO);
                summary.push(job.name, JobOutcome::Skipped, Duration::ZERO);
            } else {
                pending.push(job);
            }
        }
        log_jobs_loaded(total, pending.len());

        self.enter(RunPhase::Running);
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let running: Arc<Mutex<HashSet<String>>> = Arc::default();
        let mut tasks = JoinSet::new();

        let mut queue = pending.into_iter();
        for job in queue.by_ref() {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                summary.abandon(job.name);
                break;
            };

            lock(&running).insert(job.name.clone());
            let runner = self.runner.clone();
            let policy = self.settings.policy;
            let token = shutdown.clone();
            let running = Arc::clone(&running);

            tasks.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                info!("{} ▶️ 开始处理", job);

                let result = with_policy(&policy, &token, |attempt| {
                    if attempt > 1 {
                        info!("{} 🔄 第 {} 次尝试", job, attempt);
                    }
                    runner.run(&job)
                })
                .await;

                let outcome = match result {
                    Ok(report) => JobOutcome::from_report(report),
                    Err(e) => failure_outcome(&e),
                };
                let elapsed = started.elapsed();
                log_job_outcome(&job.name, &outcome, elapsed);

                lock(&running).remove(&job.name);
                JobRecord {
                    name: job.name,
                    outcome,
                    elapsed,
                }
            });
        }
        for job in queue {
            summary.abandon(job.name);
        }

        self.enter(RunPhase::Draining);
        let cancelled = loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => collect(joined, &mut summary),
                    None => break false,
                },
                _ = shutdown.cancelled() => break true,
            }
        };

        if cancelled {
            warn!("🛑 收到终止信号，停止调度新任务");
            self.drain_with_grace(&mut tasks, &mut summary).await;
        }

        // 被中止的任务没有机会返回记录
        let mut abandoned: Vec<String> = lock(&running).drain().collect();
        abandoned.sort();
        for name in abandoned {
            summary.abandon(name);
        }
        summary.interrupted = shutdown.is_cancelled();

        match self.store.flush().await {
            Ok(()) => info!("💾 工作簿已保存: {}", self.store.path().display()),
            Err(e) => {
                error!("❌ 最终保存失败: {}", e);
                summary.flush_error = Some(e.to_string());
            }
        }

        self.enter(RunPhase::Terminated);
        summary
    }

    /// 在宽限期内等待运行中的任务，超时后全部中止
    async fn drain_with_grace(&self, tasks: &mut JoinSet<JobRecord>, summary: &mut RunSummary) {
        if tasks.is_empty() {
            return;
        }

        let grace = tokio::time::sleep(self.settings.shutdown_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => collect(joined, summary),
                    None => return,
                },
                _ = &mut grace => break,
            }
        }

        warn!("⏹️ 宽限期结束，中止 {} 个运行中的任务", tasks.len());
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            collect(joined, summary);
        }
    }

    fn enter(&self, phase: RunPhase) {
        info!("调度阶段: {:?}", phase);
        self.phase.send_replace(phase);
    }
}

fn collect(joined: Result<JobRecord, JoinError>, summary: &mut RunSummary) {
    match joined {
        Ok(record) => summary.records.push(record),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("任务异常退出: {}", e),
    }
}

/// 把策略错误归类为失败结果
fn failure_outcome(err: &PolicyError<JobError>) -> JobOutcome {
    let kind = match err.last_error() {
        AttemptError::TimedOut(_) => FailureKind::Timeout,
        AttemptError::Panicked(_) => FailureKind::Panic,
        AttemptError::Failed(JobError::Extraction(_)) => FailureKind::Extraction,
        AttemptError::Failed(JobError::Merge(_)) => FailureKind::Merge,
        AttemptError::Failed(JobError::Store(_)) => FailureKind::Store,
    };
    JobOutcome::Failed {
        kind,
        attempts: err.attempts(),
        message: err.last_error().to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DriverError, ParseError};

    #[test]
    fn policy_errors_are_classified() {
        let timed_out: PolicyError<JobError> = PolicyError::Exhausted {
            attempts: 3,
            last: AttemptError::TimedOut(Duration::from_secs(300)),
        };
        assert!(matches!(
            failure_outcome(&timed_out),
            JobOutcome::Failed {
                kind: FailureKind::Timeout,
                attempts: 3,
                ..
            }
        ));

        let merge: PolicyError<JobError> = PolicyError::Interrupted {
            attempts: 1,
            last: AttemptError::Failed(JobError::Merge(ParseError::UnterminatedQuote {
                payload: 1,
                line: 2,
            })),
        };
        assert!(matches!(
            failure_outcome(&merge),
            JobOutcome::Failed {
                kind: FailureKind::Merge,
                attempts: 1,
                ..
            }
        ));

        let driver: PolicyError<JobError> = PolicyError::Exhausted {
            attempts: 2,
            last: AttemptError::Failed(JobError::Extraction(DriverError::SessionClosed)),
        };
        match failure_outcome(&driver) {
            JobOutcome::Failed { kind, message, .. } => {
                assert_eq!(kind, FailureKind::Extraction);
                assert!(message.contains("会话已关闭"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn summary_counts_by_outcome() {
        let mut summary = RunSummary::default();
        summary.push("A".into(), JobOutcome::Succeeded { rows: 3 }, Duration::ZERO);
        summary.push("B".into(), JobOutcome::Skipped, Duration::ZERO);
        summary.push("C".into(), JobOutcome::Abandoned, Duration::ZERO);
        summary.push(
            "D".into(),
            JobOutcome::Degraded {
                rows: 1,
                skipped: Vec::new(),
            },
            Duration::ZERO,
        );

        assert_eq!(summary.total(), 4);
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.degraded(), 1);
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.abandoned(), 1);
        assert_eq!(summary.failed(), 0);
        assert_eq!(summary.completed(), 2);
        assert_eq!(summary.outcome("B"), Some(&JobOutcome::Skipped));
        assert_eq!(summary.outcome("Z"), None);
    }
}
