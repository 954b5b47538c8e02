//! Repeating discovery → diff → publish → notify cycle
//!
//! Cycles never overlap. The loop awaits each cycle before looking at the
//! timer again and missed ticks are skipped rather than queued, so a slow
//! discovery simply stretches the effective interval. A cycle-level lock
//! also covers cycles triggered directly through [`PollingScheduler::run_cycle`].

use crate::discovery::Discover;
use crate::mapping::{diff, Change, MappingStore, Snapshot};
use crate::notify::{added_message, removed_message, NotificationSink, NOTIFICATION_TITLE};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Shortest interval the polling loop will tick at
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of a single discovery cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A new snapshot was published
    Updated,
    /// Discovery matched the current snapshot
    Unchanged,
    /// Discovery skipped this cycle; the previous snapshot stands
    Skipped,
    /// Another cycle was still running
    Busy,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct PollingScheduler {
    discovery: Arc<dyn Discover>,
    store: Arc<MappingStore>,
    notifier: Arc<dyn NotificationSink>,
    cycle_lock: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
}

impl PollingScheduler {
    pub fn new(
        discovery: Arc<dyn Discover>,
        store: Arc<MappingStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            store,
            notifier,
            cycle_lock: tokio::sync::Mutex::new(()),
            running: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Run one cycle now, then one every `interval`.
    ///
    /// Calling `start` while already running leaves the existing loop alone.
    /// Intervals below [`MIN_INTERVAL`] are raised to it.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("Polling already started");
            return;
        }

        if interval < MIN_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                "Polling interval too short, using {:?}",
                MIN_INTERVAL
            );
        }
        let interval = interval.max(MIN_INTERVAL);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        scheduler.run_cycle().await;
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Polling loop exited");
        });

        info!(interval_ms = interval.as_millis() as u64, "Started polling for session mappings");
        *running = Some(Running { shutdown_tx, handle });
    }

    /// Stop scheduling cycles.
    ///
    /// A cycle already in flight runs to completion; await the returned
    /// handle to wait for it.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let running = self.running.lock().take()?;
        let _ = running.shutdown_tx.send(true);
        info!("Stopped polling for session mappings");
        Some(running.handle)
    }

    /// Discover, and publish and announce the result if anything changed
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            debug!("Discovery cycle still in flight, skipping tick");
            return CycleOutcome::Busy;
        };

        let Some(discovered) = self.discovery.discover().await else {
            return CycleOutcome::Skipped;
        };

        let previous = self.store.snapshot();
        let change = diff(&previous, &discovered);
        if change.is_empty() {
            return CycleOutcome::Unchanged;
        }

        self.store.publish(discovered);
        let current = self.store.snapshot();
        self.announce(&change, &previous, &current).await;
        CycleOutcome::Updated
    }

    async fn announce(&self, change: &Change, previous: &Snapshot, current: &Snapshot) {
        for entry in change.added.values() {
            self.deliver(&added_message(entry)).await;
            info!(
                subdomain = entry.subdomain(),
                port = entry.port(),
                source = %entry.source(),
                "Server added"
            );
        }

        for subdomain in &change.removed {
            let previous_port = previous.get(subdomain).map(|entry| entry.port());
            self.deliver(&removed_message(subdomain, previous_port)).await;
            info!(subdomain = %subdomain, previous_port, "Server removed");
        }

        info!(count = current.len(), mappings = %current, "Subdomain mappings updated");
    }

    async fn deliver(&self, message: &str) {
        if let Err(e) = self.notifier.notify(NOTIFICATION_TITLE, message).await {
            warn!(error = %e, message, "Failed to send notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{MappingEntry, Source};
    use crate::notify::SilentNotifier;
    use futures::future::BoxFuture;
    use std::collections::VecDeque;

    /// Returns queued results in order, then repeats the last one
    struct QueuedDiscovery {
        results: Mutex<VecDeque<Option<Snapshot>>>,
    }

    impl QueuedDiscovery {
        fn new(results: Vec<Option<Snapshot>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
            })
        }
    }

    impl Discover for QueuedDiscovery {
        fn discover(&self) -> BoxFuture<'_, Option<Snapshot>> {
            let mut results = self.results.lock();
            let next = if results.len() > 1 {
                results.pop_front().flatten()
            } else {
                results.front().cloned().flatten()
            };
            Box::pin(async move { next })
        }
    }

    fn snapshot(entries: &[(&str, u16)]) -> Snapshot {
        entries
            .iter()
            .filter_map(|(sub, port)| MappingEntry::new(*sub, *port, Source::General))
            .collect()
    }

    fn scheduler(discovery: Arc<QueuedDiscovery>) -> Arc<PollingScheduler> {
        PollingScheduler::new(discovery, Arc::new(MappingStore::new()), Arc::new(SilentNotifier))
    }

    #[tokio::test]
    async fn test_cycle_publishes_changes() {
        let scheduler = scheduler(QueuedDiscovery::new(vec![Some(snapshot(&[("alpha", 4000)]))]));

        assert_eq!(scheduler.run_cycle().await, CycleOutcome::Updated);
        assert_eq!(scheduler.store().snapshot().get("alpha").unwrap().port(), 4000);

        assert_eq!(scheduler.run_cycle().await, CycleOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_skipped_cycle_keeps_previous_snapshot() {
        let scheduler = scheduler(QueuedDiscovery::new(vec![
            Some(snapshot(&[("alpha", 4000)])),
            None,
        ]));

        assert_eq!(scheduler.run_cycle().await, CycleOutcome::Updated);
        assert_eq!(scheduler.run_cycle().await, CycleOutcome::Skipped);
        assert_eq!(scheduler.store().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_start_runs_first_cycle_immediately() {
        let scheduler = scheduler(QueuedDiscovery::new(vec![Some(snapshot(&[("alpha", 4000)]))]));

        scheduler.start(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.is_running());
        assert!(scheduler.store().snapshot().contains("alpha"));

        let handle = scheduler.stop().unwrap();
        handle.await.unwrap();
        assert!(!scheduler.is_running());
        assert!(scheduler.stop().is_none());
    }

    #[tokio::test]
    async fn test_start_with_zero_interval_keeps_polling() {
        let discovery = QueuedDiscovery::new(vec![Some(snapshot(&[("alpha", 4000)]))]);
        let scheduler = scheduler(discovery);

        scheduler.start(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.is_running());
        assert!(scheduler.store().snapshot().contains("alpha"));

        let handle = scheduler.stop().unwrap();
        handle.await.unwrap();
        assert!(!scheduler.is_running());
    }
}
