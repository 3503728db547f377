use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use kreflect_store::Store;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::report::render_keys;

/// Periodic reader of the store; never mutates it.
pub struct ConsumerLoop {
    store: Arc<Store>,
    interval: Duration,
    cycles: Option<u32>,
}

impl ConsumerLoop {
    pub fn new(store: Arc<Store>, interval: Duration, cycles: Option<u32>) -> Self {
        Self { store, interval, cycles }
    }

    /// Report every `interval` until cancelled or `cycles` reports were made, then
    /// print one final report. Returns the number of periodic reports.
    pub async fn run<W: Write>(&self, cancel: &CancellationToken, out: &mut W) -> std::io::Result<u32> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut done = 0u32;
        while self.cycles.map_or(true, |max| done < max) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.report(out)?;
            done += 1;
        }
        self.report(out)?;
        Ok(done)
    }

    fn report<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let snap = self.store.snapshot();
        if !snap.synced {
            debug!("store not synced yet; reporting current contents");
        }
        out.write_all(render_keys(snap.keys()).as_bytes())?;
        out.flush()
    }
}
