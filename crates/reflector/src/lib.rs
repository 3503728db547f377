//! kreflect reflector: keeps a [`Store`] in sync with a remote collection.
//!
//! The reflector lists the collection, replaces the store with the result, then
//! watches from the listed version and applies each change as it arrives. Any
//! watch termination (closed stream, transport error, expired version, resync
//! timer) goes back to a full list. Failures, and watches that end before
//! applying any event, are retried with backoff until the cancellation token
//! fires.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use kreflect_core::{ChangeEvent, CollectionVersion, FetchError, ListerWatcher, Selector, WatchStatus};
use kreflect_store::Store;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub use backoff::Backoff;
pub use config::ReflectorConfig;

/// Where the reflector is in its list/watch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorState {
    Idle,
    Listing,
    Watching,
    Stopped,
}

impl fmt::Display for ReflectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReflectorState::Idle => "idle",
            ReflectorState::Listing => "listing",
            ReflectorState::Watching => "watching",
            ReflectorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReflectorError {
    #[error("list failed {attempts} consecutive times; last error: {last}")]
    RetriesExhausted { attempts: u32, last: FetchError },
}

/// Why a watch stopped delivering events.
#[derive(Debug)]
enum WatchEnd {
    Cancelled,
    Resync,
    /// Stream ended cleanly after `applied` events.
    Closed { applied: u64 },
    Expired { reason: String, applied: u64 },
    Failed(FetchError),
}

pub struct Reflector<L: ?Sized> {
    name: String,
    lw: Arc<L>,
    selector: Selector,
    store: Arc<Store>,
    config: ReflectorConfig,
    state_tx: watch::Sender<ReflectorState>,
    version: ArcSwapOption<CollectionVersion>,
}

impl<L> Reflector<L>
where
    L: ListerWatcher + ?Sized + 'static,
{
    pub fn new(name: impl Into<String>, lw: Arc<L>, selector: Selector, store: Arc<Store>, config: ReflectorConfig) -> Self {
        let (state_tx, _) = watch::channel(ReflectorState::Idle);
        Self { name: name.into(), lw, selector, store, config, state_tx, version: ArcSwapOption::empty() }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn state(&self) -> ReflectorState { *self.state_tx.borrow() }

    pub fn subscribe_state(&self) -> watch::Receiver<ReflectorState> { self.state_tx.subscribe() }

    /// Highest collection version applied so far (list result, change or bookmark).
    pub fn last_synced_version(&self) -> Option<CollectionVersion> {
        self.version.load_full().map(|v| (*v).clone())
    }

    /// Run in the background until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<Result<(), ReflectorError>> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Drive the list/watch cycle until `cancel` fires. Only returns an error when a
    /// list retry ceiling is configured and exhausted.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ReflectorError> {
        info!(reflector = %self.name, selector = ?self.selector, "reflector starting");
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        let res = self.run_cycles(&cancel, &mut backoff).await;
        self.set_state(ReflectorState::Stopped);
        match &res {
            Ok(()) => info!(reflector = %self.name, "reflector stopped"),
            Err(e) => error!(reflector = %self.name, error = %e, "reflector gave up"),
        }
        res
    }

    async fn run_cycles(&self, cancel: &CancellationToken, backoff: &mut Backoff) -> Result<(), ReflectorError> {
        loop {
            let Some(version) = self.list_and_replace(cancel, backoff).await? else {
                return Ok(());
            };
            match self.watch_from(cancel, version, backoff).await {
                WatchEnd::Cancelled => return Ok(()),
                WatchEnd::Resync => {
                    info!(reflector = %self.name, "resync period elapsed; re-listing");
                    counter!("reflector_relists_total", 1u64, "reason" => "resync");
                }
                WatchEnd::Closed { applied } => {
                    debug!(reflector = %self.name, applied, "watch closed by server; re-listing");
                    counter!("reflector_relists_total", 1u64, "reason" => "closed");
                    if applied == 0 && !self.pace_relist(cancel, backoff, "watch closed without events").await {
                        return Ok(());
                    }
                }
                WatchEnd::Expired { reason, applied } => {
                    warn!(reflector = %self.name, reason = %reason, applied, "continuation point expired; re-listing");
                    counter!("reflector_relists_total", 1u64, "reason" => "expired");
                    if applied == 0 && !self.pace_relist(cancel, backoff, "continuation point expired before any event").await {
                        return Ok(());
                    }
                }
                WatchEnd::Failed(err) => {
                    counter!("reflector_relists_total", 1u64, "reason" => "error");
                    let delay = backoff.next_delay();
                    warn!(
                        reflector = %self.name,
                        error = %err,
                        failures = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "watch failed; re-listing after backoff"
                    );
                    if !sleep_or_cancel(cancel, delay).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One backoff step before re-listing after a watch that applied nothing.
    /// False if cancelled while waiting.
    async fn pace_relist(&self, cancel: &CancellationToken, backoff: &mut Backoff, why: &str) -> bool {
        let delay = backoff.next_delay();
        debug!(
            reflector = %self.name,
            why,
            failures = backoff.failures(),
            retry_in_ms = delay.as_millis() as u64,
            "pacing re-list"
        );
        sleep_or_cancel(cancel, delay).await
    }

    /// List until it succeeds, then replace the store. `None` means cancelled.
    async fn list_and_replace(
        &self,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<Option<CollectionVersion>, ReflectorError> {
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            self.set_state(ReflectorState::Listing);
            let started = std::time::Instant::now();
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                res = self.lw.list(&self.selector) => res,
            };
            match res {
                Ok(list) => {
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }
                    counter!("reflector_lists_total", 1u64);
                    histogram!("reflector_list_ms", started.elapsed().as_secs_f64() * 1000.0);
                    let count = list.items.len();
                    self.store.replace(list.items);
                    self.set_version(list.version.clone());
                    info!(reflector = %self.name, items = count, version = %list.version, "list complete");
                    return Ok(Some(list.version));
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    counter!("reflector_list_errors_total", 1u64);
                    if let Some(max) = self.config.max_list_attempts {
                        if failures >= max {
                            return Err(ReflectorError::RetriesExhausted { attempts: failures, last: err });
                        }
                    }
                    let delay = backoff.next_delay();
                    warn!(reflector = %self.name, error = %err, attempt = failures, retry_in_ms = delay.as_millis() as u64, "list failed; retrying");
                    if !sleep_or_cancel(cancel, delay).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn watch_from(&self, cancel: &CancellationToken, since: CollectionVersion, backoff: &mut Backoff) -> WatchEnd {
        self.set_state(ReflectorState::Watching);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WatchEnd::Cancelled,
            res = self.lw.watch(&self.selector, &since) => res,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(FetchError::Stale(reason)) => return WatchEnd::Expired { reason, applied: 0 },
            Err(err) => return WatchEnd::Failed(err),
        };
        debug!(reflector = %self.name, since = %since, "watch opened");

        let resync_at = (!self.config.resync_period.is_zero()).then(|| Instant::now() + self.config.resync_period);
        let resync = async move {
            match resync_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(resync);

        let mut applied = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return WatchEnd::Cancelled,
                _ = &mut resync => return WatchEnd::Resync,
                next = stream.next() => next,
            };
            let event = match next {
                None => return WatchEnd::Closed { applied },
                Some(Err(FetchError::Stale(reason))) => return WatchEnd::Expired { reason, applied },
                Some(Err(err)) => return WatchEnd::Failed(err),
                Some(Ok(event)) => event,
            };
            if cancel.is_cancelled() {
                return WatchEnd::Cancelled;
            }
            if let Err(status) = self.apply(event) {
                return if status.is_expired() {
                    WatchEnd::Expired { reason: status.to_string(), applied }
                } else {
                    WatchEnd::Failed(FetchError::Transient(status.to_string()))
                };
            }
            applied += 1;
            if applied == 1 {
                backoff.reset();
            }
        }
    }

    /// Apply one change to the store. An in-stream error status is handed back to abort the watch.
    fn apply(&self, event: ChangeEvent) -> Result<(), WatchStatus> {
        counter!("reflector_watch_events_total", 1u64, "kind" => event.kind());
        match event {
            ChangeEvent::Added { object, version } | ChangeEvent::Modified { object, version } => {
                trace!(reflector = %self.name, key = %object.key(), version = %version, "upsert");
                self.store.upsert(object);
                self.set_version(version);
            }
            ChangeEvent::Deleted { object, version } => {
                let key = object.key();
                trace!(reflector = %self.name, key = %key, version = %version, "delete");
                self.store.delete(&key);
                self.set_version(version);
            }
            ChangeEvent::Bookmark { version } => {
                trace!(reflector = %self.name, version = %version, "bookmark");
                self.set_version(version);
            }
            ChangeEvent::Error(status) => return Err(status),
        }
        Ok(())
    }

    fn set_version(&self, version: CollectionVersion) { self.version.store(Some(Arc::new(version))); }

    fn set_state(&self, next: ReflectorState) {
        let changed = self.state_tx.send_if_modified(|cur| {
            if *cur == next {
                return false;
            }
            *cur = next;
            true
        });
        if changed {
            debug!(reflector = %self.name, state = %next, "state change");
        }
    }
}

/// Sleep for `delay`; false if cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
