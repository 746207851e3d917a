//! Cancellation and deadline propagation for backend operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Per-call context: a cancellation token plus an optional deadline.
///
/// Cloning shares the token; [`OpContext::child`] derives a context that is
/// cancelled along with its parent but can also be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once the context was cancelled or its deadline passed.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled("context cancelled".into()));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::Cancelled("deadline exceeded".into()));
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the context is cancelled, or the
    /// deadline passes, whichever comes first. `fut` is dropped on
    /// cancellation.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled("context cancelled".into())),
            _ = deadline => Err(Error::Cancelled("deadline exceeded".into())),
            result = fut => result,
        }
    }

    /// Cancellable sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}
