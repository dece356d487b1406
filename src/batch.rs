//! Sequential batching over index ranges.

use std::future::Future;

use anyhow::{bail, Result};

/// Call `f(start, end)` for consecutive windows of `batch` over `[0, total)`.
///
/// Windows run one after another; the first error stops the walk. The last
/// window is cut short at `total`.
pub async fn do_in_batches<F, Fut>(batch: usize, total: usize, mut f: F) -> Result<()>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if batch == 0 {
        bail!("batch size must be > 0");
    }

    for start in (0..total).step_by(batch) {
        let end = (start + batch).min(total);
        tracing::info!(start, end, total, "Batch started");
        f(start, end).await?;
        tracing::info!(start, end, total, "Batch done");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn windows_cover_range() {
        let seen = Mutex::new(Vec::new());
        do_in_batches(4, 10, |s, e| {
            seen.lock().unwrap().push((s, e));
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(seen.into_inner().unwrap(), vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[tokio::test]
    async fn empty_total_calls_nothing() {
        let mut calls = 0;
        do_in_batches(3, 0, |_, _| {
            calls += 1;
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn stops_at_first_error() {
        let mut calls = 0;
        let result = do_in_batches(2, 10, |s, _| {
            calls += 1;
            async move {
                if s == 2 {
                    bail!("window {} failed", s)
                }
                Ok(())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn zero_batch_is_rejected() {
        assert!(do_in_batches(0, 5, |_, _| async { Ok(()) }).await.is_err());
    }
}
