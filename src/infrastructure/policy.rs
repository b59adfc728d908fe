//! 超时与重试策略 - 基础设施层
//!
//! 对任意可失败的异步操作套上时限和线性退避重试：
//!
//! - 每次尝试都受 `deadline` 约束，超时即视为本次失败
//! - 操作内部 panic 会在调用边界被捕获，转换为可重试的错误
//! - 第 n 次失败后等待 `n × backoff_unit` 再重试，最多 `max_attempts` 次
//! - 收到终止信号后不再发起新的尝试

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 单次尝试的时限
    pub deadline: Duration,
    /// 最多尝试次数（至少 1 次）
    pub max_attempts: u32,
    /// 退避时间单位
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn new(deadline: Duration, max_attempts: u32, backoff_unit: Duration) -> Self {
        Self {
            deadline,
            max_attempts: max_attempts.max(1),
            backoff_unit,
        }
    }

    /// 第 `attempt` 次失败后的等待时间
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }
}

/// 单次尝试的失败原因
#[derive(Debug, Error)]
pub enum AttemptError<E: std::error::Error + 'static> {
    /// 操作返回了错误
    #[error(transparent)]
    Failed(E),
    /// 超过时限
    #[error("超过时限 {0:?}")]
    TimedOut(Duration),
    /// 操作 panic
    #[error("执行过程中发生 panic: {0}")]
    Panicked(String),
}

/// 策略执行的最终失败
#[derive(Debug, Error)]
pub enum PolicyError<E: std::error::Error + 'static> {
    /// 重试次数耗尽
    #[error("已尝试 {attempts} 次仍失败: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: AttemptError<E>,
    },
    /// 收到终止信号，不再重试
    #[error("收到终止信号，尝试 {attempts} 次后停止重试: {last}")]
    Interrupted {
        attempts: u32,
        #[source]
        last: AttemptError<E>,
    },
}

impl<E: std::error::Error + 'static> PolicyError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            PolicyError::Exhausted { attempts, .. } | PolicyError::Interrupted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn last_error(&self) -> &AttemptError<E> {
        match self {
            PolicyError::Exhausted { last, .. } | PolicyError::Interrupted { last, .. } => last,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.last_error(), AttemptError::TimedOut(_))
    }
}

/// 按策略执行操作
///
/// `operation` 接收当前尝试序号（从 1 开始），每次尝试都重新构造 future。
pub async fn with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    mut operation: F,
) -> Result<T, PolicyError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        // 构造 future 的同步部分也可能 panic
        let guarded = AssertUnwindSafe(async { operation(attempt).await }).catch_unwind();
        let last = match tokio::time::timeout(policy.deadline, guarded).await {
            Ok(Ok(Ok(value))) => return Ok(value),
            Ok(Ok(Err(e))) => AttemptError::Failed(e),
            Ok(Err(payload)) => AttemptError::Panicked(panic_message(payload.as_ref())),
            Err(_) => AttemptError::TimedOut(policy.deadline),
        };

        if attempt >= max_attempts {
            return Err(PolicyError::Exhausted {
                attempts: attempt,
                last,
            });
        }
        if shutdown.is_cancelled() {
            return Err(PolicyError::Interrupted {
                attempts: attempt,
                last,
            });
        }

        let delay = policy.backoff(attempt);
        warn!(
            "第 {}/{} 次尝试失败: {}，{:?} 后重试",
            attempt, max_attempts, last, delay
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(PolicyError::Interrupted {
                    attempts: attempt,
                    last,
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "未知 panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, Error)]
    #[error("boom #{0}")]
    struct Boom(u32);

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(10), max_attempts, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn always_timing_out_uses_every_attempt_with_linear_backoff() {
        let token = CancellationToken::new();
        let mut starts = Vec::new();

        let result: Result<(), PolicyError<Boom>> = with_policy(&policy(4), &token, |_| {
            starts.push(Instant::now());
            futures::future::pending()
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 4);
        assert!(err.is_timeout());
        assert!(matches!(err, PolicyError::Exhausted { .. }));

        assert_eq!(starts.len(), 4);
        for (i, pair) in starts.windows(2).enumerate() {
            let expected = Duration::from_secs(10) + Duration::from_secs(i as u64 + 1);
            assert_eq!(pair[1] - pair[0], expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fails_twice_then_succeeds_on_third_attempt() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let value = with_policy(&policy(5), &token, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(Boom(attempt))
                } else {
                    Ok(attempt * 10)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 30);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_inside_attempt_is_retried() {
        let token = CancellationToken::new();

        let value = with_policy(&policy(2), &token, |attempt| async move {
            if attempt == 1 {
                panic!("driver crashed");
            }
            Ok::<_, Boom>("recovered")
        })
        .await
        .unwrap();

        assert_eq!(value, "recovered");
    }

    #[tokio::test(start_paused = true)]
    async fn panic_before_future_is_built_is_retried() {
        let token = CancellationToken::new();

        let handle = tokio::spawn(async move {
            with_policy(&policy(2), &token, |attempt| {
                if attempt == 1 {
                    panic!("session setup crashed");
                }
                async { Ok::<_, Boom>(7) }
            })
            .await
        });

        let value = handle.await.unwrap().unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn synchronous_panic_on_last_attempt_is_reported() {
        let token = CancellationToken::new();

        let err = with_policy(&policy(1), &token, |_| -> futures::future::Ready<Result<(), Boom>> {
            panic!("no session");
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts(), 1);
        match err.last_error() {
            AttemptError::Panicked(msg) => assert_eq!(msg, "no session"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_error_keeps_last_failure() {
        let token = CancellationToken::new();

        let err = with_policy(&policy(2), &token, |attempt| async move {
            Err::<(), _>(Boom(attempt))
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts(), 2);
        assert!(!err.is_timeout());
        match err.last_error() {
            AttemptError::Failed(Boom(n)) => assert_eq!(*n, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_stops_retrying() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);

        let err = with_policy(&policy(5), &token, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(Boom(attempt)) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, PolicyError::Interrupted { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_linearly() {
        let p = RetryPolicy::new(Duration::from_secs(1), 0, Duration::from_millis(500));
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(3), Duration::from_millis(1500));
    }
}
