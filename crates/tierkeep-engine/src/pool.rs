//! Fixed-size worker pool over a finite batch of jobs.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinError;
use tracing::error;

/// Run `job` over `items` with at most `workers` concurrent tasks.
///
/// Results come back in completion order per worker, not input order. Each job runs in
/// its own task; a job that panics yields `on_panic(item, err)` and its worker moves on.
pub(crate) async fn run_bounded<T, R, F, Fut, P>(
    items: Vec<T>,
    workers: usize,
    job: F,
    on_panic: P,
) -> Vec<R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    P: Fn(T, JoinError) -> R + Send + Sync + 'static,
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = workers.clamp(1, items.len());
    let queue = Arc::new(Mutex::new(items.into_iter()));
    let job = Arc::new(job);
    let on_panic = Arc::new(on_panic);

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let job = Arc::clone(&job);
            let on_panic = Arc::clone(&on_panic);
            tokio::spawn(async move {
                let mut results = Vec::new();
                loop {
                    let next = queue.lock().await.next();
                    let Some(item) = next else {
                        break;
                    };
                    match tokio::spawn(job(item.clone())).await {
                        Ok(result) => results.push(result),
                        Err(err) => {
                            error!(error = %err, "pool job terminated abnormally");
                            results.push(on_panic(item, err));
                        }
                    }
                }
                results
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(mut batch) => results.append(&mut batch),
            Err(err) => error!(error = %err, "pool worker terminated abnormally"),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrency_never_exceeds_worker_count() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (running_ref, peak_ref) = (Arc::clone(&running), Arc::clone(&peak));

        let job = move |value: u32| {
            let running = Arc::clone(&running_ref);
            let peak = Arc::clone(&peak_ref);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                value * 2
            }
        };
        let results = run_bounded((0..20).collect(), 3, job, |_, _| 0).await;

        assert_eq!(results.len(), 20);
        assert_eq!(
            results.iter().sum::<u32>(),
            (0..20_u32).map(|v| v * 2).sum::<u32>()
        );
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn empty_batch_spawns_nothing() {
        let results: Vec<u8> =
            run_bounded(Vec::<u8>::new(), 4, |value| async move { value }, |_, _| 0).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn panicking_job_keeps_the_rest_of_the_batch() {
        let results = run_bounded(
            (0..6).collect(),
            1,
            |value: u32| async move {
                assert_ne!(value, 2, "job {value} failed");
                Some(value)
            },
            |value, err| {
                assert!(err.is_panic());
                assert_eq!(value, 2);
                None
            },
        )
        .await;

        assert_eq!(results, vec![Some(0), Some(1), None, Some(3), Some(4), Some(5)]);
    }
}
