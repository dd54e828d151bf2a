//! Fixed-interval task runner that stops on shutdown.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Run `task` every `period`, first after one full period, until `shutdown`
/// becomes `true` or its sender is dropped.
pub async fn every<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => task().await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(period_ms = period.as_millis() as u64, "Recurring task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_runs_each_period_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let runner = tokio::spawn(every(Duration::from_secs(2), rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(4200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        runner.await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_when_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(
            Duration::from_secs(1),
            every(Duration::from_secs(60), rx, || async {}),
        )
        .await
        .expect("runner should stop once the sender is gone");
    }

    #[tokio::test]
    async fn test_already_shut_down_never_runs() {
        let (_tx, rx) = watch::channel(true);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        every(Duration::from_millis(1), rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
