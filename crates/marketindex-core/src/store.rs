//! The persistent store contract.
//!
//! Backends implement keyed idempotent upserts, create-if-absent inserts
//! keyed by natural identity, targeted conditional updates, and
//! [`MarketStore::commit`] — an all-or-nothing application of a
//! [`WriteBatch`] with preconditions. A failed precondition rejects the
//! whole batch with [`MarketError::Conflict`]; callers that hold business
//! invariants (the bid/settlement engine) re-read and retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::MarketError;
use crate::types::{
    Bid, BidStatus, BridgeEvent, BundleItem, Collection, Listing, ListingStatus, Sale, Token, User,
};

/// Field updates applied to a listing. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ListingPatch {
    pub price: Option<Decimal>,
    pub status: Option<ListingStatus>,
    pub end_ts: Option<DateTime<Utc>>,
}

impl ListingPatch {
    pub fn status(status: ListingStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn price(price: Decimal) -> Self {
        Self {
            price: Some(price),
            ..Default::default()
        }
    }
}

/// One mutation inside an atomic write batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Patch a listing. `expect_status` (when non-empty) and `expect_version`
    /// are preconditions; the listing's version is bumped on success.
    UpdateListing {
        id: String,
        expect_status: Vec<ListingStatus>,
        expect_version: Option<u64>,
        patch: ListingPatch,
    },
    /// Insert a bid; the id must not exist yet.
    InsertBid(Bid),
    /// Transition one bid, requiring its current status.
    SetBidStatus {
        bid_id: String,
        expect: BidStatus,
        to: BidStatus,
    },
    /// Bulk-transition every matching bid of a listing (optionally one
    /// bidder's). Matching zero bids is not a conflict.
    TransitionBids {
        listing_id: String,
        bidder: Option<String>,
        from: BidStatus,
        to: BidStatus,
    },
    /// Reassign token custody; the token must exist.
    SetTokenOwner { token_pk: String, owner: String },
    /// Append a sale fact; the id must not exist yet.
    InsertSale(Sale),
}

/// An ordered list of mutations applied all-or-nothing.
pub type WriteBatch = Vec<WriteOp>;

/// The marketplace domain store.
///
/// Chain-event appliers use the idempotent upserts and targeted updates
/// (partial application across calls is tolerated because every mapping is
/// safe to reapply); the bid/settlement engine uses [`Self::commit`] so that
/// multi-entity mutations are atomic.
#[async_trait]
pub trait MarketStore: Send + Sync {
    // ── Reads ────────────────────────────────────────────────────────────────

    async fn collection_by_contract(
        &self,
        chain_id: &str,
        address: &str,
    ) -> Result<Option<Collection>, MarketError>;

    async fn token(
        &self,
        collection_id: &str,
        token_id: &str,
    ) -> Result<Option<Token>, MarketError>;

    async fn token_by_pk(&self, token_pk: &str) -> Result<Option<Token>, MarketError>;

    async fn listing(&self, id: &str) -> Result<Option<Listing>, MarketError>;

    async fn bundle_items(&self, listing_id: &str) -> Result<Vec<BundleItem>, MarketError>;

    /// The current highest bid with status Pending, if any.
    async fn highest_pending_bid(&self, listing_id: &str) -> Result<Option<Bid>, MarketError>;

    /// All of one bidder's bids on a listing in a given status.
    async fn bids_by_status(
        &self,
        listing_id: &str,
        bidder: &str,
        status: BidStatus,
    ) -> Result<Vec<Bid>, MarketError>;

    async fn bid_exists(&self, bid_id: &str) -> Result<bool, MarketError>;

    async fn sale_exists(&self, sale_id: &str) -> Result<bool, MarketError>;

    /// The most recent in-flight bridge event for a logical token, matched
    /// by `(contract address, token_id)` across chains — the initiating leg
    /// is recorded against the source-chain token while the completion is
    /// observed on the destination chain.
    async fn latest_inflight_bridge(
        &self,
        token_contract: &str,
        token_id: &str,
    ) -> Result<Option<BridgeEvent>, MarketError>;

    /// Whether a bridge leg with this dedup key was already observed, either
    /// as an initiating `message_id` or as a `completed_message_id`.
    async fn bridge_message_seen(&self, key: &str) -> Result<bool, MarketError>;

    // ── Idempotent upserts ───────────────────────────────────────────────────

    /// Create the user on first sight; an existing wallet is left untouched.
    async fn upsert_user(&self, user: User) -> Result<(), MarketError>;

    /// Return the collection for `(chain_id, address)`, creating `template`
    /// if none exists. An existing collection is returned unchanged.
    async fn get_or_create_collection(
        &self,
        template: Collection,
    ) -> Result<Collection, MarketError>;

    /// Upsert a token by `(collection_id, token_id)`. On an existing token,
    /// `owner` and `chain_id` are updated and `metadata_uri` only when the
    /// incoming value is non-empty; other curated fields are kept.
    async fn upsert_token(&self, token: Token) -> Result<Token, MarketError>;

    // ── Inserts keyed by natural identity ────────────────────────────────────

    /// Insert a listing (with bundle members, when any). Fails on duplicate id.
    async fn insert_listing(
        &self,
        listing: Listing,
        items: Vec<BundleItem>,
    ) -> Result<(), MarketError>;

    /// Insert a listing unless its id already exists. Returns whether it was
    /// inserted — replays return `false` and leave the listing untouched.
    async fn insert_listing_if_absent(&self, listing: Listing) -> Result<bool, MarketError>;

    /// Insert a bid unless its id already exists. Returns whether inserted.
    async fn insert_bid_if_absent(&self, bid: Bid) -> Result<bool, MarketError>;

    /// Insert a sale fact unless its id already exists. Returns whether inserted.
    async fn insert_sale_if_absent(&self, sale: Sale) -> Result<bool, MarketError>;

    async fn insert_bridge_event(&self, event: BridgeEvent) -> Result<(), MarketError>;

    // ── Targeted conditional updates (applier path) ──────────────────────────

    /// Patch a listing only when its status is one of `expect_status`
    /// (empty = unconditional). Returns whether the update applied; a
    /// precondition miss is a no-op, not an error.
    async fn update_listing(
        &self,
        id: &str,
        expect_status: &[ListingStatus],
        patch: ListingPatch,
    ) -> Result<bool, MarketError>;

    /// Transition one bid if it currently has `expect` status.
    async fn set_bid_status(
        &self,
        bid_id: &str,
        expect: BidStatus,
        to: BidStatus,
    ) -> Result<bool, MarketError>;

    /// Reassign token custody. Returns `false` when the token is unknown.
    async fn set_token_owner(&self, token_pk: &str, owner: &str) -> Result<bool, MarketError>;

    /// Mark a bridge event Completed, stamping the completing leg's key.
    async fn complete_bridge_event(
        &self,
        id: &str,
        completed_message_id: &str,
    ) -> Result<(), MarketError>;

    // ── Atomic multi-entity commit (engine path) ─────────────────────────────

    /// Apply every op in `batch` atomically. Any failed precondition aborts
    /// the whole batch with [`MarketError::Conflict`] and leaves state
    /// untouched.
    async fn commit(&self, batch: WriteBatch) -> Result<(), MarketError>;
}
