//! marketindex-market — the listing lifecycle scheduler and the
//! bid/settlement engine.
//!
//! ```text
//! Marketplace ──┬── place_bid / withdraw_overbid / buy_now
//!               └── create_* (fixed, english, dutch, bundle)
//!        │ WriteBatch commits (version CAS + bounded retry)
//!        ▼
//!  MarketStore        LifecycleScheduler ── JobQueue (single-flight ids)
//!                          ├── Activate   (start_ts)
//!                          ├── Settle     (end_ts, cancels pending bids)
//!                          └── DutchSync  (recurring price re-derivation)
//! ```

pub mod engine;
pub mod lifecycle;
pub mod queue;

pub use engine::{
    BundleItemRequest, BuyNowRequest, CreateBundleListing, CreateDutchAuction,
    CreateEnglishAuction, CreateFixedListing, Marketplace, PlaceBidRequest,
};
pub use lifecycle::{dutch_price_at, LifecycleJob, LifecycleScheduler};
pub use queue::JobQueue;
