//! Cancellation helpers shared by every suspension point.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ObjfsError, Result};

/// Run `fut` until it completes or `cancel` fires, whichever comes first.
/// A token that is already cancelled wins without polling `fut`.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ObjfsError::Cancelled),
        res = fut => res,
    }
}

/// Same as [`cancellable`], with an overall deadline.
pub async fn with_deadline<T, F>(cancel: &CancellationToken, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, cancellable(cancel, fut)).await {
        Ok(res) => res,
        Err(_) => {
            // Wake anything still parked on this token.
            cancel.cancel();
            Err(ObjfsError::DeadlineExceeded(deadline))
        }
    }
}
