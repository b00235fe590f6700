//! Staleness poller.
//!
//! Periodically asks a [`HeadSource`] for the version marker of every
//! registered collection. When a collection's marker moves strictly past the
//! last one seen, its cache is wiped and then, if the store has loaded
//! before, the store reloads.
//!
//! Scheduling is owned by a [`PollerHandle`]: `start` spawns a tokio task,
//! `stop` signals it through a watch channel. A run already in progress when
//! `stop` is called finishes; only future ticks are cancelled. The first
//! tick after a restart is anchored to the previous run, so stopping and
//! starting again does not reset the cadence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use recsync_core::{CollectionId, ConfigError, StorageError, SyncConfig, SyncError, SyncResult};
use recsync_storage::{HeadSource, ReadCache, Watermark};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::store::Reloadable;

/// Configuration for the poller task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
}

impl From<&SyncConfig> for PollerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            interval: config.poll_interval,
        }
    }
}

/// Counters for poller activity.
#[derive(Debug, Default)]
pub struct PollerMetrics {
    /// Runs that reached the head source
    pub runs: AtomicU64,

    /// Collections whose marker advanced
    pub advances: AtomicU64,

    /// Store reloads triggered
    pub reloads: AtomicU64,

    /// Failed queries, invalidations and reloads
    pub errors: AtomicU64,
}

impl PollerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> PollerSnapshot {
        PollerSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            advances: self.advances.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of poller metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollerSnapshot {
    pub runs: u64,
    pub advances: u64,
    pub reloads: u64,
    pub errors: u64,
}

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Collections whose marker advanced; their caches were cleared.
    pub advanced: Vec<CollectionId>,
    /// Collections whose store reloaded.
    pub reloaded: Vec<CollectionId>,
    /// Invalidations or reloads that failed.
    pub failures: usize,
}

struct Registration {
    store: Arc<dyn Reloadable>,
    cache: Arc<dyn ReadCache>,
    last_seen: Option<Watermark>,
}

struct Inner<H> {
    heads: H,
    registrations: Mutex<BTreeMap<CollectionId, Registration>>,
    last_run: Mutex<Option<Instant>>,
    metrics: PollerMetrics,
}

/// Owned cancellation handle of a running poller task.
pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal the task to exit after any in-flight run.
    fn cancel(self) {
        // The task may already have exited; nothing to signal then.
        let _ = self.shutdown.send(true);
        drop(self.task);
    }
}

/// Periodic staleness detection over registered (store, cache) pairs.
pub struct StalenessPoller<H: HeadSource + 'static> {
    inner: Arc<Inner<H>>,
    handle: Mutex<Option<PollerHandle>>,
}

impl<H: HeadSource + 'static> StalenessPoller<H> {
    pub fn new(heads: H) -> Self {
        Self {
            inner: Arc::new(Inner {
                heads,
                registrations: Mutex::new(BTreeMap::new()),
                last_run: Mutex::new(None),
                metrics: PollerMetrics::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Track `collection`. Any marker the source reports first counts as an
    /// advance. Registering an id again replaces the previous entry.
    pub fn register(
        &self,
        collection: impl Into<CollectionId>,
        store: Arc<dyn Reloadable>,
        cache: Arc<dyn ReadCache>,
    ) -> SyncResult<()> {
        self.insert(collection.into(), store, cache, None)
    }

    /// Track `collection` with a known last-seen marker.
    pub fn register_with_marker(
        &self,
        collection: impl Into<CollectionId>,
        store: Arc<dyn Reloadable>,
        cache: Arc<dyn ReadCache>,
        marker: i64,
    ) -> SyncResult<()> {
        self.insert(collection.into(), store, cache, Some(Watermark::new(marker)))
    }

    fn insert(
        &self,
        collection: CollectionId,
        store: Arc<dyn Reloadable>,
        cache: Arc<dyn ReadCache>,
        last_seen: Option<Watermark>,
    ) -> SyncResult<()> {
        self.inner
            .registrations
            .lock()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?
            .insert(
                collection,
                Registration {
                    store,
                    cache,
                    last_seen,
                },
            );
        Ok(())
    }

    /// Last marker seen for `collection`.
    pub fn last_seen(&self, collection: &str) -> SyncResult<Option<i64>> {
        let registrations = self
            .inner
            .registrations
            .lock()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?;
        Ok(registrations
            .get(collection)
            .and_then(|r| r.last_seen)
            .map(|w| w.sequence))
    }

    pub fn registered(&self) -> SyncResult<Vec<CollectionId>> {
        let registrations = self
            .inner
            .registrations
            .lock()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?;
        Ok(registrations.keys().cloned().collect())
    }

    pub fn metrics(&self) -> PollerSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Poll once. A failed head query is returned to the caller; failed
    /// invalidations and reloads are logged and counted in the report.
    pub async fn run(&self) -> SyncResult<PollReport> {
        self.inner.run().await
    }

    /// Whether a scheduled task is active.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().is_some_and(|h| !h.task.is_finished()))
            .unwrap_or(false)
    }

    /// Run every `interval` on the current tokio runtime. A zero interval is
    /// rejected.
    ///
    /// The first run fires one interval after the previous run, or
    /// immediately if there was none or it is already overdue. Starting a
    /// running poller restarts it with the new interval.
    pub fn start(&self, interval: Duration) -> SyncResult<()> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "interval".to_string(),
                value: format!("{:?}", interval),
                reason: "poll interval must be greater than zero".to_string(),
            }
            .into());
        }

        let mut slot = self
            .handle
            .lock()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?;
        if let Some(previous) = slot.take() {
            previous.cancel();
        }

        let delay = self.inner.first_delay(interval)?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);

        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            first_delay_ms = delay.as_millis() as u64,
            "Staleness poller started"
        );

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + delay, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("Staleness poller stopped");
                            break;
                        }
                    }

                    _ = ticker.tick() => {
                        if let Err(e) = inner.run().await {
                            tracing::warn!(error = %e, "Staleness poll failed, retrying next tick");
                        }
                    }
                }
            }
        });

        *slot = Some(PollerHandle { shutdown, task });
        Ok(())
    }

    /// Start with the interval from `config`.
    pub fn start_with(&self, config: &PollerConfig) -> SyncResult<()> {
        self.start(config.interval)
    }

    /// Cancel future runs. Safe to call when not running.
    pub fn stop(&self) {
        let handle = match self.handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Stop and drop every registration.
    pub fn destroy(&self) {
        self.stop();
        match self.inner.registrations.lock() {
            Ok(mut registrations) => registrations.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl<H: HeadSource + 'static> Drop for StalenessPoller<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<H: HeadSource> Inner<H> {
    fn first_delay(&self, interval: Duration) -> SyncResult<Duration> {
        let last_run = *self
            .last_run
            .lock()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?;
        Ok(match last_run {
            Some(at) => interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        })
    }

    async fn run(&self) -> SyncResult<PollReport> {
        *self
            .last_run
            .lock()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))? = Some(Instant::now());

        let ids: Vec<CollectionId> = self
            .registrations
            .lock()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?
            .keys()
            .cloned()
            .collect();
        if ids.is_empty() {
            return Ok(PollReport::default());
        }

        self.metrics.runs.fetch_add(1, Ordering::Relaxed);
        let heads = match self.heads.heads(&ids).await {
            Ok(heads) => heads,
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let stale = self.advance(&heads)?;
        let mut report = PollReport::default();

        for (id, store, cache) in stale {
            self.metrics.advances.fetch_add(1, Ordering::Relaxed);
            report.advanced.push(id.clone());

            if let Err(e) = cache.clear_read_cache().await {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                report.failures += 1;
                tracing::warn!(collection = %id, error = %e, "Cache invalidation failed, skipping reload");
                continue;
            }

            if !store.can_reload() {
                continue;
            }
            match store.reload().await {
                Ok(()) => {
                    self.metrics.reloads.fetch_add(1, Ordering::Relaxed);
                    report.reloaded.push(id);
                }
                Err(e) => {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    report.failures += 1;
                    tracing::warn!(collection = %id, error = %e, "Reload after staleness failed");
                }
            }
        }

        tracing::debug!(
            advanced = report.advanced.len(),
            reloaded = report.reloaded.len(),
            "Staleness poll completed"
        );
        Ok(report)
    }

    /// Record advanced markers and return the affected registrations.
    #[allow(clippy::type_complexity)]
    fn advance(
        &self,
        heads: &BTreeMap<CollectionId, i64>,
    ) -> SyncResult<Vec<(CollectionId, Arc<dyn Reloadable>, Arc<dyn ReadCache>)>> {
        let mut registrations = self
            .registrations
            .lock()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?;

        let mut stale = Vec::new();
        for (id, marker) in heads {
            let Some(entry) = registrations.get_mut(id) else {
                continue;
            };
            if Watermark::advances(entry.last_seen.as_ref(), *marker) {
                entry.last_seen = Some(Watermark::new(*marker));
                stale.push((id.clone(), Arc::clone(&entry.store), Arc::clone(&entry.cache)));
            }
        }
        Ok(stale)
    }
}
