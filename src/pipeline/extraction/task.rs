//! Blocking work under the run deadline.
//!
//! Engines are synchronous. Every call is moved to the blocking pool and
//! awaited against the run's deadline so a hung renderer, OCR process or
//! remote provider cannot stall the run past it.

use std::future::Future;

use tokio::time::Instant;

use super::ExtractionError;

/// Await `fut`, giving up at `deadline`.
pub async fn within<F, T>(deadline: Instant, stage: &'static str, fut: F) -> Result<T, ExtractionError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| ExtractionError::DeadlineExceeded { stage })
}

/// Run a fallible blocking closure on the blocking pool, bounded by `deadline`.
///
/// On timeout the closure keeps running to completion in the background;
/// its result is discarded.
pub async fn run_blocking<F, T>(
    deadline: Instant,
    stage: &'static str,
    f: F,
) -> Result<T, ExtractionError>
where
    F: FnOnce() -> Result<T, ExtractionError> + Send + 'static,
    T: Send + 'static,
{
    within(deadline, stage, tokio::task::spawn_blocking(f))
        .await?
        .map_err(|e| ExtractionError::TaskJoin(e.to_string()))?
}
