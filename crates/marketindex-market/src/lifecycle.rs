//! Listing lifecycle scheduler.
//!
//! Three delayed, single-flight-per-listing jobs drive time-based listing
//! transitions: Activate at `start_ts`, Settle at `end_ts`, and a recurring
//! DutchSync that re-derives the interpolated Dutch price. Jobs are
//! advisory re-derivations of state, not commands: a job firing against a
//! missing listing, a terminal listing, or a rescheduled time is a silent
//! no-op (or reschedules itself), so stale and duplicate firings are
//! harmless.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use marketindex_core::error::MarketError;
use marketindex_core::store::{ListingPatch, MarketStore, WriteOp};
use marketindex_core::types::{BidStatus, Listing, ListingStatus, ListingType};

use crate::queue::JobQueue;

/// The lifecycle job kinds. Adding a kind extends this enum and the
/// dispatch match below — a compile-time-checked extension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleJob {
    Activate,
    Settle,
    DutchSync,
}

impl LifecycleJob {
    /// Queue id for this job on one listing; the single-flight key.
    pub fn job_id(&self, listing_id: &str) -> String {
        match self {
            Self::Activate => format!("activate:{listing_id}"),
            Self::Settle => format!("settle:{listing_id}"),
            Self::DutchSync => format!("sync:{listing_id}"),
        }
    }
}

/// Linear Dutch price at `now`, clamped at `end_price` as floor. `None`
/// when the listing has no positive duration.
pub fn dutch_price_at(listing: &Listing, now: DateTime<Utc>) -> Option<Decimal> {
    let duration = (listing.end_ts - listing.start_ts).num_seconds();
    if duration <= 0 {
        return None;
    }
    let elapsed = (now - listing.start_ts).num_seconds().clamp(0, duration);
    let span = listing.start_price - listing.end_price;
    let price = listing.start_price - span * Decimal::from(elapsed) / Decimal::from(duration);
    Some(price.max(listing.end_price))
}

/// Schedules and runs the lifecycle jobs.
pub struct LifecycleScheduler {
    store: Arc<dyn MarketStore>,
    queue: Arc<JobQueue>,
    sync_interval: Duration,
}

impl LifecycleScheduler {
    pub fn new(store: Arc<dyn MarketStore>) -> Arc<Self> {
        Self::with_sync_interval(store, Duration::seconds(60))
    }

    /// Override the Dutch resync cadence (tests use short intervals).
    pub fn with_sync_interval(store: Arc<dyn MarketStore>, sync_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue: Arc::new(JobQueue::new()),
            sync_interval,
        })
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    /// Whether a job is currently scheduled for a listing.
    pub fn job_pending(&self, job: LifecycleJob, listing_id: &str) -> bool {
        self.queue.pending(&job.job_id(listing_id))
    }

    // ── Scheduling entry points ──────────────────────────────────────────────

    /// Schedule activation at `run_at`. Listings that should already be
    /// active are created Active directly, so a past time schedules nothing.
    pub fn schedule_activation(self: &Arc<Self>, listing_id: &str, run_at: DateTime<Utc>) {
        if run_at <= Utc::now() {
            return;
        }
        self.schedule(LifecycleJob::Activate, listing_id, run_at);
    }

    pub fn schedule_settlement(self: &Arc<Self>, listing_id: &str, run_at: DateTime<Utc>) {
        self.schedule(LifecycleJob::Settle, listing_id, run_at);
    }

    /// Replace the pending settlement with one at the new end time (late-bid
    /// extension path).
    pub fn reschedule_settlement(self: &Arc<Self>, listing_id: &str, run_at: DateTime<Utc>) {
        self.schedule_settlement(listing_id, run_at);
    }

    pub fn schedule_dutch_sync(self: &Arc<Self>, listing_id: &str, run_at: DateTime<Utc>) {
        self.schedule(LifecycleJob::DutchSync, listing_id, run_at);
    }

    /// Best-effort removal of every scheduled job for a listing (on sale or
    /// cancellation). A job that already fired still no-ops safely.
    pub fn clear(&self, listing_id: &str) {
        for job in [
            LifecycleJob::Activate,
            LifecycleJob::Settle,
            LifecycleJob::DutchSync,
        ] {
            self.queue.remove(&job.job_id(listing_id));
        }
    }

    fn schedule(self: &Arc<Self>, job: LifecycleJob, listing_id: &str, run_at: DateTime<Utc>) {
        let delay = (run_at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
        let scheduler = Arc::clone(self);
        let listing_id_owned = listing_id.to_string();
        self.queue.enqueue(&job.job_id(listing_id), delay, async move {
            scheduler.dispatch(job, &listing_id_owned).await;
        });
    }

    async fn dispatch(self: Arc<Self>, job: LifecycleJob, listing_id: &str) {
        let result = match job {
            LifecycleJob::Activate => self.run_activation(listing_id).await,
            LifecycleJob::Settle => self.run_settlement(listing_id).await,
            LifecycleJob::DutchSync => self.run_dutch_sync(listing_id).await,
        };
        // Job errors are logged and the job dropped; a later poll or read
        // re-derives correct state from chain events where applicable.
        if let Err(err) = result {
            warn!(job = ?job, listing = listing_id, error = %err, "lifecycle job failed");
        }
    }

    // ── Job handlers ─────────────────────────────────────────────────────────

    /// Pending → Active at `start_ts`. Fired early (clock skew or a moved
    /// start), it reschedules itself instead of acting.
    pub async fn run_activation(self: &Arc<Self>, listing_id: &str) -> Result<(), MarketError> {
        let Some(listing) = self.store.listing(listing_id).await? else {
            warn!(listing = listing_id, "activate: listing not found");
            return Ok(());
        };
        if listing.status != ListingStatus::Pending {
            return Ok(());
        }
        if listing.start_ts > Utc::now() {
            self.schedule(LifecycleJob::Activate, listing_id, listing.start_ts);
            return Ok(());
        }

        let activated = self
            .store
            .update_listing(
                listing_id,
                &[ListingStatus::Pending],
                ListingPatch::status(ListingStatus::Active),
            )
            .await?;
        if activated {
            debug!(listing = listing_id, "listing activated");
            if listing.listing_type == ListingType::DutchAuction {
                self.schedule_dutch_sync(listing_id, Utc::now() + self.sync_interval);
            }
        }
        Ok(())
    }

    /// Active → Expired at `end_ts`, cancelling all remaining pending bids.
    /// Fired early (end pushed forward by an extension), it reschedules to
    /// the new end time.
    pub async fn run_settlement(self: &Arc<Self>, listing_id: &str) -> Result<(), MarketError> {
        let Some(listing) = self.store.listing(listing_id).await? else {
            warn!(listing = listing_id, "settle: listing not found");
            return Ok(());
        };
        if listing.status != ListingStatus::Active {
            return Ok(());
        }
        if listing.end_ts > Utc::now() {
            self.schedule(LifecycleJob::Settle, listing_id, listing.end_ts);
            return Ok(());
        }

        let result = self
            .store
            .commit(vec![
                WriteOp::UpdateListing {
                    id: listing_id.to_string(),
                    expect_status: vec![ListingStatus::Active],
                    expect_version: Some(listing.version),
                    patch: ListingPatch::status(ListingStatus::Expired),
                },
                WriteOp::TransitionBids {
                    listing_id: listing_id.to_string(),
                    bidder: None,
                    from: BidStatus::Pending,
                    to: BidStatus::Cancelled,
                },
            ])
            .await;
        match result {
            Ok(()) => {
                debug!(listing = listing_id, "listing expired");
                Ok(())
            }
            // A concurrent sale or bid won the race; the job is advisory.
            Err(MarketError::Conflict(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Re-derive the interpolated Dutch price and reschedule. At or past
    /// `end_ts`, defers to Settle instead of computing a price.
    pub async fn run_dutch_sync(self: &Arc<Self>, listing_id: &str) -> Result<(), MarketError> {
        let Some(listing) = self.store.listing(listing_id).await? else {
            warn!(listing = listing_id, "dutch sync: listing not found");
            return Ok(());
        };
        if listing.listing_type != ListingType::DutchAuction
            || listing.status != ListingStatus::Active
        {
            return Ok(());
        }

        let now = Utc::now();
        if now >= listing.end_ts {
            self.schedule_settlement(listing_id, listing.end_ts);
            return Ok(());
        }
        let Some(price) = dutch_price_at(&listing, now) else {
            return Ok(());
        };

        self.store
            .update_listing(listing_id, &[ListingStatus::Active], ListingPatch::price(price))
            .await?;
        self.schedule_dutch_sync(listing_id, now + self.sync_interval);
        Ok(())
    }
}
