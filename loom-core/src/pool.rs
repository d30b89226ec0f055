//! Bounded per-repository fan-out
//!
//! Every fleet-wide operation spawns one task per repository into a
//! [`JoinSet`], with at most `max_workers` running at once. A panicking task
//! becomes an [`Error::Unexpected`] for its repository only.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::fleet::RepositoryHandle;
use crate::{Error, Result};

/// Default fan-out width
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Run `task` once per handle, at most `max_workers` at a time
///
/// Results come back in completion order. Sort by name if order matters.
pub async fn fan_out<R, F, Fut>(
    handles: &[RepositoryHandle],
    max_workers: usize,
    task: F,
) -> Vec<(RepositoryHandle, Result<R>)>
where
    F: Fn(RepositoryHandle) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut set = JoinSet::new();

    for handle in handles {
        let semaphore = Arc::clone(&semaphore);
        let work = task(handle.clone());
        let handle = handle.clone();

        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let outcome = tokio::spawn(work).await.map_err(Error::from);
            (handle, outcome)
        });
    }

    let mut results = Vec::with_capacity(handles.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((handle, outcome)) => {
                if let Err(e) = &outcome {
                    warn!("Task for repository '{}' failed: {}", handle.name(), e);
                }
                results.push((handle, outcome));
            }
            Err(e) => warn!("Fan-out task failed: {}", e),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn handles(n: usize) -> Vec<RepositoryHandle> {
        (0..n)
            .map(|i| RepositoryHandle::new(format!("repo{}", i), format!("/tmp/repo{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_every_handle_gets_a_result() {
        let results = fan_out(&handles(5), 2, |h| async move { h.name().len() }).await;
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|(_, r)| *r.as_ref().unwrap() == 5));
    }

    #[tokio::test]
    async fn test_width_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = fan_out(&handles(8), 3, |_| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(results.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let results = fan_out(&handles(3), 4, |h| async move {
            if h.name() == "repo1" {
                panic!("boom");
            }
            h.name().to_string()
        })
        .await;

        assert_eq!(results.len(), 3);
        let (_, failed) = results.iter().find(|(h, _)| h.name() == "repo1").unwrap();
        assert!(matches!(failed, Err(Error::Unexpected { kind, .. }) if kind == "panic"));
        assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 2);
    }
}
