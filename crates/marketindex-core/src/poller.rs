//! The poll scheduler — drives each chain source on a fixed cadence.
//!
//! One poller per configured source. A tick is fetch → apply → advance
//! cursor; the cursor only moves after the batch went through the applier,
//! and a failed fetch leaves it untouched so the same window is retried on
//! the next tick (the interval is the backoff). Ticks run at the fixed
//! cadence regardless of how long a cycle takes; an in-flight guard skips
//! overlapping runs for the same source to avoid duplicate RPC work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::apply::EventApplier;
use crate::cursor::{Cursor, CursorStore};
use crate::error::MarketError;
use crate::source::EventSource;

/// Outcome of a single poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A previous tick for this source is still running.
    Skipped,
    /// Fetched and applied a window.
    Polled { events: usize, next_position: u64 },
}

/// Polls one chain source and feeds its events through the applier.
pub struct ChainPoller {
    source: Arc<dyn EventSource>,
    applier: EventApplier,
    cursors: Arc<dyn CursorStore>,
    interval: Duration,
    fetching: AtomicBool,
}

impl ChainPoller {
    pub fn new(
        source: Arc<dyn EventSource>,
        applier: EventApplier,
        cursors: Arc<dyn CursorStore>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            applier,
            cursors,
            interval,
            fetching: AtomicBool::new(false),
        }
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    /// Returns `true` while a tick is running.
    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::SeqCst)
    }

    /// Run one fetch → apply → advance cycle.
    pub async fn tick(&self) -> Result<PollOutcome, MarketError> {
        if self.fetching.swap(true, Ordering::SeqCst) {
            debug!(source = self.source_id(), "previous tick still running, skipping");
            return Ok(PollOutcome::Skipped);
        }
        let result = self.tick_inner().await;
        self.fetching.store(false, Ordering::SeqCst);
        result
    }

    async fn tick_inner(&self) -> Result<PollOutcome, MarketError> {
        let source_id = self.source.source_id();
        let from = match self.cursors.load(source_id).await? {
            Some(cursor) => cursor.position,
            None => self.source.start_position(),
        };

        let batch = self.source.fetch(from).await?;
        let applied = self.applier.apply_batch(&batch.events).await;

        if batch.next_position > from {
            self.cursors
                .save(Cursor::new(source_id, batch.next_position))
                .await?;
        }

        if !batch.events.is_empty() {
            info!(
                source = source_id,
                events = batch.events.len(),
                applied,
                position = batch.next_position,
                "poll tick complete"
            );
        }
        Ok(PollOutcome::Polled {
            events: batch.events.len(),
            next_position: batch.next_position,
        })
    }

    /// Loop forever at the fixed cadence. Fetch failures are logged; the
    /// next tick retries the same window.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                warn!(source = self.source_id(), error = %err, "poll tick failed");
            }
        }
    }
}

/// Immutable indexer configuration, passed in at construction — there is no
/// shared mutable chain list anywhere.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Poll cadence per source.
    pub poll_interval: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
        }
    }
}

/// Owns one poller per configured source.
pub struct Indexer {
    pollers: Vec<Arc<ChainPoller>>,
}

impl Indexer {
    /// Build pollers for every source worth polling. Sources without any
    /// configured addresses are skipped entirely.
    pub fn new(
        config: IndexerConfig,
        sources: Vec<Arc<dyn EventSource>>,
        applier_store: Arc<dyn crate::store::MarketStore>,
        cursors: Arc<dyn CursorStore>,
    ) -> Self {
        let mut pollers = Vec::with_capacity(sources.len());
        for source in sources {
            if !source.is_configured() {
                warn!(
                    source = source.source_id(),
                    "skipping source - no addresses of interest configured"
                );
                continue;
            }
            pollers.push(Arc::new(ChainPoller::new(
                source,
                EventApplier::new(Arc::clone(&applier_store)),
                Arc::clone(&cursors),
                config.poll_interval,
            )));
        }
        info!(sources = pollers.len(), "indexer configured");
        Self { pollers }
    }

    pub fn pollers(&self) -> &[Arc<ChainPoller>] {
        &self.pollers
    }

    /// Spawn one polling task per source.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        self.pollers
            .iter()
            .map(|poller| tokio::spawn(Arc::clone(poller).run()))
            .collect()
    }
}
