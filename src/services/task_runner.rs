use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::{EngineError, Result};

/// Cooperative cancellation flag threaded through prepare/execute. Tasks
/// call `check` at safe points; cancellation is an explicit result variant
/// rather than an unwinding exception, so cancellation races stay auditable.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Bounded-concurrency executor for a batch of independent tasks. Failures
/// never fail-fast: every task gets to finish, and all failures come back
/// in one aggregate error. Cancellation aborts outstanding futures and
/// awaits them before surfacing.
pub struct ParallelTaskRunner {
    limit: usize,
    token: CancellationToken,
}

impl ParallelTaskRunner {
    pub fn new(limit: usize, token: CancellationToken) -> Self {
        Self {
            limit: limit.max(1),
            token,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn run<F>(&self, tasks: Vec<F>) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.token.check()?;

        let total = tasks.len();
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut set: JoinSet<Result<()>> = JoinSet::new();
        for task in tasks {
            let semaphore = Arc::clone(&semaphore);
            let token = self.token.clone();
            set.spawn(async move {
                token.check()?;
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| EngineError::Cancelled)?;
                token.check()?;
                task.await
            });
        }

        let mut failures = Vec::new();
        let mut cancelled = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_cancelled() => cancelled = true,
                Ok(Err(err)) => failures.push(err),
                Err(join_err) if join_err.is_cancelled() => cancelled = true,
                Err(join_err) => failures.push(EngineError::IllegalState(format!(
                    "task aborted unexpectedly: {join_err}"
                ))),
            }

            if self.token.is_cancelled() && !cancelled {
                set.abort_all();
                cancelled = true;
            }
        }

        if cancelled || self.token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if !failures.is_empty() {
            tracing::warn!("{} of {} parallel tasks failed", failures.len(), total);
            return Err(EngineError::Batch { failures, total });
        }
        Ok(())
    }
}
