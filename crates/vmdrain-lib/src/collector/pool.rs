//! Bounded-parallelism executor shared by every fetch stage
//!
//! Workers pull items off a shared queue and push typed results into a
//! channel; the channel closes once the last worker finishes, so the
//! draining side observes a complete stage before the next one starts.

use super::ProgressFn;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Default cap on in-flight requests per stage
pub const DEFAULT_WORKERS: usize = 32;

/// Run `job` over `items` with at most `workers` concurrent executions.
///
/// Results are returned in completion order; the progress callback fires
/// once per completed item with the stage name and running counts.
pub(crate) async fn run<I, O, F, Fut>(
    stage: &str,
    items: Vec<I>,
    workers: usize,
    progress: &ProgressFn,
    job: F,
) -> Vec<O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }
    progress(stage, 0, total);

    let workers = workers.min(total).max(1);
    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let (tx, mut rx) = mpsc::channel::<O>(workers);
    let job = Arc::new(job);

    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        let job = Arc::clone(&job);
        tokio::spawn(async move {
            loop {
                let item = queue.lock().expect("work queue poisoned").pop_front();
                let Some(item) = item else { break };
                if tx.send(job(item).await).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut results = Vec::with_capacity(total);
    let mut completed = 0;
    while let Some(result) = rx.recv().await {
        completed += 1;
        progress(stage, completed, total);
        results.push(result);
    }
    results
}
