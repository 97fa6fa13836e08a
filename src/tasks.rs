use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::error;

/// Run one task per `(key, item)` pair, at most `concurrency` at a time, and
/// wait for all of them. Each output comes back next to its key, in
/// completion order. A panicking task yields `Err` for its key and never
/// takes its siblings down.
pub async fn run_bounded<K, V, I, F, Fut, T>(
    items: I,
    concurrency: usize,
    task: F,
) -> Vec<(K, Result<T, JoinError>)>
where
    I: IntoIterator<Item = (K, V)>,
    F: Fn(V) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    let mut keys = HashMap::new();

    for (key, item) in items {
        let permits = permits.clone();
        let fut = task(item);
        let handle = set.spawn(async move {
            // The semaphore is never closed, so acquire cannot fail.
            let _permit = permits.acquire_owned().await.ok();
            fut.await
        });
        keys.insert(handle.id(), key);
    }

    let mut outputs = Vec::with_capacity(keys.len());
    while let Some(joined) = set.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, output)) => (id, Ok(output)),
            Err(e) => {
                error!("❌ Per-order task aborted: {:?}", e);
                (e.id(), Err(e))
            }
        };

        if let Some(key) = keys.remove(&id) {
            outputs.push((key, result));
        }
    }

    outputs
}
