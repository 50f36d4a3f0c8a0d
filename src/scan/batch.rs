//! Bounded-concurrency probe pool. Targets are spawned into a `JoinSet`
//! that is refilled each time a probe settles, so the cap is also the
//! steady-state in-flight count. Cancellation stops refills; probes already
//! launched run to completion and their results are kept.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub async fn batch_scan<T, O, F, Fut>(
    targets: Vec<T>,
    limit: usize,
    cancel: CancellationToken,
    probe: F,
) -> Vec<O>
where
    T: Send + 'static,
    O: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: std::future::Future<Output = Option<O>> + Send + 'static,
{
    let limit = limit.max(1);
    let mut pending = targets.into_iter();
    let mut pool: JoinSet<Option<O>> = JoinSet::new();
    let mut found = Vec::new();

    loop {
        while pool.len() < limit && !cancel.is_cancelled() {
            let Some(target) = pending.next() else {
                break;
            };
            pool.spawn(probe(target));
        }

        match pool.join_next().await {
            Some(Ok(Some(output))) => found.push(output),
            Some(Ok(None)) => {}
            Some(Err(e)) => tracing::debug!("probe task failed: {}", e),
            None => break,
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn collects_all_positive_results() {
        let cancel = CancellationToken::new();
        let items: Vec<u32> = (0..100).collect();
        let mut results = batch_scan(items, 8, cancel, |n| async move {
            if n % 2 == 0 { Some(n) } else { None }
        })
        .await;
        results.sort_unstable();
        assert_eq!(results, (0..100).filter(|n| n % 2 == 0).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_limit() {
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<u32> = (0..50).collect();
        let (fl, pk) = (in_flight.clone(), peak.clone());
        batch_scan(items, 5, cancel, move |_| {
            let fl = fl.clone();
            let pk = pk.clone();
            async move {
                let now = fl.fetch_add(1, Ordering::SeqCst) + 1;
                pk.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                fl.fetch_sub(1, Ordering::SeqCst);
                Some(())
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn cancellation_stops_refills() {
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));

        let items: Vec<u32> = (0..1000).collect();
        let st = started.clone();
        let cc = cancel.clone();
        let results = batch_scan(items, 4, cancel, move |n| {
            let st = st.clone();
            let cc = cc.clone();
            async move {
                st.fetch_add(1, Ordering::SeqCst);
                if n == 10 {
                    cc.cancel();
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                Some(n)
            }
        })
        .await;

        assert!(results.len() < 1000);
        assert!(started.load(Ordering::SeqCst) < 1000);
    }

    #[tokio::test]
    async fn panicking_probe_does_not_sink_the_pool() {
        let cancel = CancellationToken::new();
        let items: Vec<u32> = (0..20).collect();
        let mut results = batch_scan(items, 3, cancel, |n| async move {
            assert!(n != 7, "probe blew up");
            Some(n)
        })
        .await;
        results.sort_unstable();
        assert_eq!(results.len(), 19);
        assert!(!results.contains(&7));
    }
}
