use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Run `action` every `interval` while `owner` is alive and `cancel` has not
/// fired. The first tick happens one full interval after the spawn.
pub(crate) fn spawn_weak_loop<T: Send + Sync + 'static>(
    owner: Weak<T>,
    interval: Duration,
    cancel: CancellationToken,
    mut action: impl FnMut(&Arc<T>) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            match owner.upgrade() {
                Some(strong) => action(&strong),
                None => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_owner_dropped() {
        let owner = Arc::new(AtomicUsize::new(0));
        let task = spawn_weak_loop(
            Arc::downgrade(&owner),
            Duration::from_millis(10),
            CancellationToken::new(),
            |count| {
                count.fetch_add(1, Ordering::Relaxed);
            },
        );

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(owner.load(Ordering::Relaxed), 3);

        drop(owner);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_cancel() {
        let owner = Arc::new(());
        let cancel = CancellationToken::new();
        let task = spawn_weak_loop(
            Arc::downgrade(&owner),
            Duration::from_secs(1),
            cancel.clone(),
            |_| {},
        );

        cancel.cancel();
        task.await.unwrap();
    }
}
