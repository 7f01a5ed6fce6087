use std::future::Future;
use std::time::Duration;

/// Runs `fut` to completion, or gives up after `limit` when one is set. `None` means the limit
/// elapsed first.
pub(crate) async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
