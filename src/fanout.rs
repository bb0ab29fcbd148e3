//! Concurrent per-item work with full error aggregation.
//!
//! Every item runs to completion regardless of its siblings. Each item
//! reports at most one error into a channel sized to the item count; once
//! all items finish the channel is drained into an [`ErrorList`].

use std::future::Future;

use futures::future::join_all;
use tokio::sync::mpsc;

use crate::error::{Error, ErrorList, Result};

/// Runs `f` for every item and waits for all of them, returning every
/// failure. The futures are polled together by `join_all` on the calling
/// task rather than spawned; callers push blocking work through
/// `spawn_blocking` so no item stalls its siblings.
pub async fn for_each<T, I, F, Fut>(items: I, f: F) -> Result<()>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let items: Vec<T> = items.into_iter().collect();
    if items.is_empty() {
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel::<Error>(items.len());

    let tasks = items.into_iter().map(|item| {
        let tx = tx.clone();
        let work = f(item);
        async move {
            if let Err(err) = work.await {
                // Capacity equals the item count, so this never waits.
                let _ = tx.send(err).await;
            }
        }
    });

    join_all(tasks).await;
    drop(tx);

    let mut errs = ErrorList::new();
    while let Some(err) = rx.recv().await {
        errs.push(err);
    }
    errs.into_result()
}
