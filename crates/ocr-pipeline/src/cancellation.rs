//! Cancellation helpers shared by every suspension point

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Fail fast when the token is already cancelled
pub fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Race a future against the token; cancellation wins ties
pub async fn run_cancellable<F, T>(cancel: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        value = future => Ok(value),
    }
}

/// Sleep for `duration` unless the token fires first
pub async fn sleep(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    run_cancellable(cancel, tokio::time::sleep(duration)).await
}
