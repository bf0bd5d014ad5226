//! The bid/settlement engine and listing creation.
//!
//! Every multi-entity mutation (place_bid, buy_now, settle) is one
//! [`WriteOp`] batch committed atomically against the listing's version.
//! Losing the version race yields [`MarketError::Conflict`], which the
//! engine retries with bounded backoff — each attempt re-reads and
//! re-validates, so exactly one commit happens per logical operation and an
//! auction extension is never applied twice for one bid.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use marketindex_core::error::MarketError;
use marketindex_core::retry::{retry_transient, RetryPolicy};
use marketindex_core::store::{ListingPatch, MarketStore, WriteBatch, WriteOp};
use marketindex_core::types::{
    Bid, BidStatus, BundleItem, Listing, ListingStatus, ListingType, Sale, Token, User, UserRole,
};

use crate::lifecycle::LifecycleScheduler;

/// A late bid within this window of the end time extends the auction.
const AUCTION_EXTENSION_WINDOW_SECS: i64 = 5 * 60;
/// How far one late bid pushes the end time.
const AUCTION_EXTENSION_SECS: i64 = 2 * 60;

#[derive(Debug, Clone)]
pub struct PlaceBidRequest {
    pub listing_id: String,
    pub bidder: String,
    pub amount: Decimal,
    pub chain_id: String,
}

#[derive(Debug, Clone)]
pub struct BuyNowRequest {
    pub listing_id: String,
    pub buyer: String,
    pub amount: Decimal,
    pub chain_id: String,
}

#[derive(Debug, Clone)]
pub struct CreateFixedListing {
    pub token_pk: String,
    pub price: Decimal,
    pub reserve_price: Option<Decimal>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateEnglishAuction {
    pub token_pk: String,
    pub start_price: Decimal,
    pub reserve_price: Option<Decimal>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateDutchAuction {
    pub token_pk: String,
    pub start_price: Decimal,
    pub end_price: Decimal,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BundleItemRequest {
    pub token_pk: String,
    pub quantity: u32,
}

#[derive(Debug, Clone)]
pub struct CreateBundleListing {
    pub bundle_token_pk: String,
    pub price: Decimal,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub items: Vec<BundleItemRequest>,
}

/// Marketplace operations exposed to the API layer.
pub struct Marketplace {
    store: Arc<dyn MarketStore>,
    scheduler: Arc<LifecycleScheduler>,
    retry: RetryPolicy,
}

impl Marketplace {
    pub fn new(store: Arc<dyn MarketStore>, scheduler: Arc<LifecycleScheduler>) -> Self {
        Self::with_retry(store, scheduler, RetryPolicy::default())
    }

    pub fn with_retry(
        store: Arc<dyn MarketStore>,
        scheduler: Arc<LifecycleScheduler>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            scheduler,
            retry,
        }
    }

    // ── Bidding ──────────────────────────────────────────────────────────────

    /// Place a bid on an active English auction. Supersedes the previous
    /// pending bid, raises the listing price, and extends the end time when
    /// the bid lands inside the extension window.
    pub async fn place_bid(&self, request: PlaceBidRequest) -> Result<Bid, MarketError> {
        let bidder = request.bidder.to_lowercase();
        let (bid, extended_end) =
            retry_transient(&self.retry, || self.try_place_bid(&request, &bidder)).await?;

        if let Some(new_end) = extended_end {
            self.scheduler
                .reschedule_settlement(&request.listing_id, new_end);
            debug!(listing = %request.listing_id, %new_end, "auction extended by late bid");
        }
        Ok(bid)
    }

    async fn try_place_bid(
        &self,
        request: &PlaceBidRequest,
        bidder: &str,
    ) -> Result<(Bid, Option<DateTime<Utc>>), MarketError> {
        let listing = self
            .store
            .listing(&request.listing_id)
            .await?
            .ok_or_else(|| MarketError::not_found("listing", request.listing_id.clone()))?;

        if listing.status != ListingStatus::Active {
            return Err(MarketError::InvalidState(format!(
                "listing {} is not active",
                listing.id
            )));
        }
        if listing.listing_type != ListingType::EnglishAuction {
            return Err(MarketError::InvalidState(
                "listing does not accept bids".into(),
            ));
        }
        if request.amount <= listing.price {
            return Err(MarketError::BidTooLow {
                amount: request.amount,
                current: listing.price,
            });
        }

        let previous = self.store.highest_pending_bid(&listing.id).await?;

        let now = Utc::now();
        let remaining = listing.end_ts - now;
        let extended_end = (remaining > Duration::zero()
            && remaining <= Duration::seconds(AUCTION_EXTENSION_WINDOW_SECS))
            .then(|| listing.end_ts + Duration::seconds(AUCTION_EXTENSION_SECS));

        let bid = Bid {
            id: Uuid::new_v4().to_string(),
            listing_id: listing.id.clone(),
            bidder: bidder.to_string(),
            amount: request.amount,
            chain_id: request.chain_id.clone(),
            status: BidStatus::Pending,
            tx_hash: None,
            created_at: now,
        };

        let mut batch: WriteBatch = vec![WriteOp::UpdateListing {
            id: listing.id.clone(),
            expect_status: vec![ListingStatus::Active],
            expect_version: Some(listing.version),
            patch: ListingPatch {
                price: Some(request.amount),
                status: None,
                end_ts: extended_end,
            },
        }];
        if let Some(previous) = previous {
            batch.push(WriteOp::SetBidStatus {
                bid_id: previous.id,
                expect: BidStatus::Pending,
                to: BidStatus::Refunded,
            });
        }
        batch.push(WriteOp::InsertBid(bid.clone()));

        self.store.commit(batch).await?;
        Ok((bid, extended_end))
    }

    /// Mark all of one bidder's superseded (Refunded) bids on a listing as
    /// withdrawn and return the refundable total.
    pub async fn withdraw_overbid(
        &self,
        listing_id: &str,
        bidder: &str,
    ) -> Result<Decimal, MarketError> {
        let bidder = bidder.to_lowercase();
        let refunded = self
            .store
            .bids_by_status(listing_id, &bidder, BidStatus::Refunded)
            .await?;
        if refunded.is_empty() {
            return Err(MarketError::not_found(
                "refundable bids",
                listing_id.to_string(),
            ));
        }
        let total: Decimal = refunded.iter().map(|bid| bid.amount).sum();

        self.store
            .commit(vec![WriteOp::TransitionBids {
                listing_id: listing_id.to_string(),
                bidder: Some(bidder),
                from: BidStatus::Refunded,
                to: BidStatus::Cancelled,
            }])
            .await?;
        Ok(total)
    }

    // ── Instant purchase ─────────────────────────────────────────────────────

    /// Buy a fixed-price, Dutch, or bundle listing outright: listing Sold,
    /// token custody (all bundle members too) to the buyer, Sale fact
    /// recorded — one atomic unit — then scheduled jobs cleared.
    pub async fn buy_now(&self, request: BuyNowRequest) -> Result<Sale, MarketError> {
        let buyer = request.buyer.to_lowercase();
        let sale = retry_transient(&self.retry, || self.try_buy_now(&request, &buyer)).await?;

        self.scheduler.clear(&request.listing_id);
        Ok(sale)
    }

    async fn try_buy_now(
        &self,
        request: &BuyNowRequest,
        buyer: &str,
    ) -> Result<Sale, MarketError> {
        let listing = self
            .store
            .listing(&request.listing_id)
            .await?
            .ok_or_else(|| MarketError::not_found("listing", request.listing_id.clone()))?;

        if !listing.listing_type.buy_now_eligible() {
            return Err(MarketError::InvalidState(
                "listing is not available for instant purchase".into(),
            ));
        }
        if listing.status != ListingStatus::Active {
            return Err(MarketError::InvalidState(format!(
                "listing {} is not active",
                listing.id
            )));
        }

        let items = if listing.listing_type == ListingType::Bundle {
            self.store.bundle_items(&listing.id).await?
        } else {
            Vec::new()
        };

        self.store
            .upsert_user(User::new(buyer, UserRole::Buyer))
            .await?;

        let sale = Sale {
            id: Uuid::new_v4().to_string(),
            token_pk: listing.token_pk.clone(),
            price: request.amount,
            seller: listing.seller.clone(),
            buyer: buyer.to_string(),
            chain_id: request.chain_id.clone(),
            tx_hash: String::new(),
            ts: Utc::now(),
            listing_id: listing.id.clone(),
        };

        let mut batch: WriteBatch = vec![
            WriteOp::UpdateListing {
                id: listing.id.clone(),
                expect_status: vec![ListingStatus::Active],
                expect_version: Some(listing.version),
                patch: ListingPatch {
                    price: Some(request.amount),
                    status: Some(ListingStatus::Sold),
                    end_ts: None,
                },
            },
            WriteOp::SetTokenOwner {
                token_pk: listing.token_pk.clone(),
                owner: buyer.to_string(),
            },
        ];
        for item in items {
            if item.token_pk != listing.token_pk {
                batch.push(WriteOp::SetTokenOwner {
                    token_pk: item.token_pk,
                    owner: buyer.to_string(),
                });
            }
        }
        batch.push(WriteOp::InsertSale(sale.clone()));

        self.store.commit(batch).await?;
        Ok(sale)
    }

    // ── Listing creation ─────────────────────────────────────────────────────

    pub async fn create_fixed(&self, input: CreateFixedListing) -> Result<Listing, MarketError> {
        ensure_chronology(input.start_ts, input.end_ts)?;
        let (token, seller) = self.seller_for(&input.token_pk).await?;

        let listing = Listing {
            id: Uuid::new_v4().to_string(),
            token_pk: token.id,
            listing_type: ListingType::Fixed,
            price: input.price,
            start_price: input.price,
            end_price: input.price,
            reserve_price: input.reserve_price,
            start_ts: input.start_ts,
            end_ts: input.end_ts,
            status: initial_status(input.start_ts),
            seller,
            version: 0,
        };
        self.store.insert_listing(listing.clone(), Vec::new()).await?;
        self.schedule_lifecycle(&listing);
        Ok(listing)
    }

    pub async fn create_english_auction(
        &self,
        input: CreateEnglishAuction,
    ) -> Result<Listing, MarketError> {
        ensure_chronology(input.start_ts, input.end_ts)?;
        if let Some(reserve) = input.reserve_price {
            if reserve > input.start_price {
                return Err(MarketError::InvalidState(
                    "reserve price cannot exceed start price".into(),
                ));
            }
        }
        let (token, seller) = self.seller_for(&input.token_pk).await?;

        let listing = Listing {
            id: Uuid::new_v4().to_string(),
            token_pk: token.id,
            listing_type: ListingType::EnglishAuction,
            price: input.start_price,
            start_price: input.start_price,
            end_price: input.start_price,
            reserve_price: input.reserve_price,
            start_ts: input.start_ts,
            end_ts: input.end_ts,
            status: initial_status(input.start_ts),
            seller,
            version: 0,
        };
        self.store.insert_listing(listing.clone(), Vec::new()).await?;
        self.schedule_lifecycle(&listing);
        Ok(listing)
    }

    pub async fn create_dutch_auction(
        &self,
        input: CreateDutchAuction,
    ) -> Result<Listing, MarketError> {
        ensure_chronology(input.start_ts, input.end_ts)?;
        if input.start_price <= input.end_price {
            return Err(MarketError::InvalidState(
                "end price must be lower than start price".into(),
            ));
        }
        let (token, seller) = self.seller_for(&input.token_pk).await?;

        let listing = Listing {
            id: Uuid::new_v4().to_string(),
            token_pk: token.id,
            listing_type: ListingType::DutchAuction,
            price: input.start_price,
            start_price: input.start_price,
            end_price: input.end_price,
            reserve_price: None,
            start_ts: input.start_ts,
            end_ts: input.end_ts,
            status: initial_status(input.start_ts),
            seller,
            version: 0,
        };
        self.store.insert_listing(listing.clone(), Vec::new()).await?;
        self.schedule_lifecycle(&listing);
        Ok(listing)
    }

    pub async fn create_bundle(
        &self,
        input: CreateBundleListing,
    ) -> Result<Listing, MarketError> {
        ensure_chronology(input.start_ts, input.end_ts)?;
        let (bundle_token, seller) = self.seller_for(&input.bundle_token_pk).await?;

        let listing_id = Uuid::new_v4().to_string();
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(input.items.len());
        for item in &input.items {
            if !seen.insert(item.token_pk.clone()) {
                return Err(MarketError::InvalidState(
                    "duplicate token in bundle items".into(),
                ));
            }
            let token = self
                .store
                .token_by_pk(&item.token_pk)
                .await?
                .ok_or_else(|| MarketError::not_found("bundle item token", item.token_pk.clone()))?;
            if token.owner.to_lowercase() != seller {
                return Err(MarketError::InvalidState(
                    "all bundle items must be owned by the seller".into(),
                ));
            }
            items.push(BundleItem {
                listing_id: listing_id.clone(),
                token_pk: item.token_pk.clone(),
                quantity: item.quantity.max(1),
            });
        }

        let listing = Listing {
            id: listing_id,
            token_pk: bundle_token.id,
            listing_type: ListingType::Bundle,
            price: input.price,
            start_price: input.price,
            end_price: input.price,
            reserve_price: None,
            start_ts: input.start_ts,
            end_ts: input.end_ts,
            status: initial_status(input.start_ts),
            seller,
            version: 0,
        };
        self.store.insert_listing(listing.clone(), items).await?;
        self.schedule_lifecycle(&listing);
        Ok(listing)
    }

    async fn seller_for(&self, token_pk: &str) -> Result<(Token, String), MarketError> {
        let token = self
            .store
            .token_by_pk(token_pk)
            .await?
            .ok_or_else(|| MarketError::not_found("token", token_pk.to_string()))?;
        let seller = token.owner.to_lowercase();
        self.store
            .upsert_user(User::new(&seller, UserRole::Creator))
            .await?;
        Ok((token, seller))
    }

    fn schedule_lifecycle(&self, listing: &Listing) {
        if listing.start_ts > Utc::now() {
            self.scheduler.schedule_activation(&listing.id, listing.start_ts);
        }
        if listing.listing_type.timed() {
            self.scheduler.schedule_settlement(&listing.id, listing.end_ts);
        }
        if listing.listing_type == ListingType::DutchAuction
            && listing.status == ListingStatus::Active
        {
            let first_run =
                listing.start_ts.max(Utc::now()) + self.scheduler.sync_interval();
            self.scheduler.schedule_dutch_sync(&listing.id, first_run);
        }
    }
}

fn initial_status(start_ts: DateTime<Utc>) -> ListingStatus {
    if start_ts > Utc::now() {
        ListingStatus::Pending
    } else {
        ListingStatus::Active
    }
}

fn ensure_chronology(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), MarketError> {
    if end <= start {
        return Err(MarketError::InvalidState(
            "end time must be later than start time".into(),
        ));
    }
    Ok(())
}
