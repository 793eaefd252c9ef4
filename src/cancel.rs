use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Cooperative cancellation flag shared between a caller and running
/// pipelines. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Per-run execution guard: the caller's token plus an optional deadline.
///
/// Clones share the token and the deadline, so nested evaluations (views
/// read during a run) stay within the outer run's time limit.
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint {
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl Checkpoint {
    pub(crate) fn new(token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            // A limit too large to represent as an instant never expires.
            deadline: timeout
                .and_then(|limit| Some((Instant::now().checked_add(limit)?, limit))),
        }
    }

    /// Fail if the run was cancelled or ran past its deadline.
    pub(crate) fn check(&self, stage: usize) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled { stage });
        }
        if let Some((deadline, limit)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::TimedOut { stage, limit });
            }
        }
        Ok(())
    }
}
