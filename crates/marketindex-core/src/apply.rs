//! Event normalization sink: maps chain events into idempotent domain
//! mutations.
//!
//! Every handler is an idempotent upsert keyed by natural identity (listing
//! id, `"{tx_hash}:{log_index}"`, token key), never by event sequence, so
//! re-delivery — re-orgs, at-least-once polling, retries — has no effect
//! beyond the first successful apply. Chain-observed state is authoritative:
//! a sale event overrides an internally derived Expired status.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::MarketError;
use crate::event::{MarketEvent, Provenance};
use crate::store::{ListingPatch, MarketStore};
use crate::types::{
    Bid, BidStatus, BridgeEvent, BridgeProtocol, BridgeStatus, Collection, Listing, ListingStatus,
    ListingType, Sale, Token, User, UserRole, BURN_ADDRESS,
};

/// Duration assumed for chain-originated listings whose event carries no end
/// time.
pub const DEFAULT_LISTING_DURATION_DAYS: i64 = 7;

/// Applies normalized chain events to the domain store.
pub struct EventApplier {
    store: Arc<dyn MarketStore>,
}

impl EventApplier {
    pub fn new(store: Arc<dyn MarketStore>) -> Self {
        Self { store }
    }

    /// Apply one event. Idempotent for every kind.
    pub async fn apply(&self, event: &MarketEvent) -> Result<(), MarketError> {
        match event {
            MarketEvent::ListingCreated {
                meta,
                listing_id,
                seller,
                token_contract,
                token_id,
                price,
                listing_type,
            } => {
                self.on_listing_created(
                    meta,
                    listing_id,
                    seller,
                    token_contract,
                    token_id,
                    *price,
                    *listing_type,
                )
                .await
            }
            MarketEvent::BidPlaced {
                meta,
                listing_id,
                bidder,
                amount,
            } => self.on_bid_placed(meta, listing_id, bidder, *amount).await,
            MarketEvent::SaleSettled {
                meta,
                listing_id,
                buyer,
                amount,
            } => self.on_sale_settled(meta, listing_id, buyer, *amount).await,
            MarketEvent::ListingCancelled { meta, listing_id } => {
                self.on_listing_cancelled(meta, listing_id).await
            }
            MarketEvent::AuctionExtended {
                meta,
                listing_id,
                new_end_ts,
            } => self.on_auction_extended(meta, listing_id, *new_end_ts).await,
            MarketEvent::Transfer {
                meta,
                token_contract,
                to,
                token_id,
                ..
            } => self.on_transfer(meta, token_contract, to, token_id).await,
            MarketEvent::BridgeInitiated {
                meta,
                protocol,
                token_contract,
                token_id,
                sender,
                dst_chain,
                burn_mint,
                metadata_uri,
            } => {
                self.on_bridge_initiated(
                    meta,
                    *protocol,
                    token_contract,
                    token_id,
                    sender,
                    dst_chain,
                    *burn_mint,
                    metadata_uri,
                )
                .await
            }
            MarketEvent::BridgeCompleted {
                meta,
                protocol,
                token_contract,
                token_id,
                receiver,
                src_chain,
                metadata_uri,
            } => {
                self.on_bridge_completed(
                    meta,
                    *protocol,
                    token_contract,
                    token_id,
                    receiver,
                    src_chain,
                    metadata_uri,
                )
                .await
            }
        }
    }

    /// Apply a batch in source order. An error in one event is logged and
    /// does not abort the remaining events — every mapping is idempotent and
    /// safe to reapply, so partial application followed by cursor
    /// advancement is acceptable. Returns how many events applied cleanly.
    pub async fn apply_batch(&self, events: &[MarketEvent]) -> usize {
        let mut applied = 0;
        for event in events {
            match self.apply(event).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    warn!(
                        kind = event.kind(),
                        tx = %event.meta().tx_hash,
                        error = %err,
                        "failed to apply event"
                    );
                }
            }
        }
        applied
    }

    // ── Shadow-entity helpers ────────────────────────────────────────────────

    /// Resolve the collection for `(chain_id, address)`, creating a shadow
    /// collection when the contract has never been seen. All handlers go
    /// through here so shadow semantics stay identical across event kinds.
    async fn resolve_or_create_collection(
        &self,
        chain_id: &str,
        address: &str,
        creator: &str,
        slug_prefix: &str,
        name_prefix: &str,
    ) -> Result<Collection, MarketError> {
        let bare = address.strip_prefix("0x").unwrap_or(address);
        let template = Collection {
            id: Collection::key(chain_id, address),
            chain_id: chain_id.to_string(),
            address: address.to_string(),
            slug: format!("{slug_prefix}-{}", &bare[..bare.len().min(8)]),
            name: format!("{name_prefix} {}", &address[..address.len().min(6)]),
            royalty_bps: 0,
            creator_wallet: creator.to_string(),
            verified: false,
        };
        self.store.get_or_create_collection(template).await
    }

    /// Resolve the token for `(collection, token_id)`, creating it when
    /// unseen. On an existing token, custody and chain move to the given
    /// values; curated metadata survives.
    async fn resolve_or_create_token(
        &self,
        collection: &Collection,
        token_id: &str,
        chain_id: &str,
        owner: &str,
        metadata_uri: &str,
    ) -> Result<Token, MarketError> {
        let token = Token {
            id: Token::key(&collection.id, token_id),
            collection_id: collection.id.clone(),
            token_id: token_id.to_string(),
            chain_id: chain_id.to_string(),
            owner: owner.to_string(),
            metadata_uri: metadata_uri.to_string(),
            image_url: metadata_uri.to_string(),
            attributes: None,
            minted_at: Utc::now(),
        };
        self.store.upsert_token(token).await
    }

    // ── Handlers ─────────────────────────────────────────────────────────────

    async fn on_listing_created(
        &self,
        meta: &Provenance,
        listing_id: &str,
        seller: &str,
        token_contract: &str,
        token_id: &str,
        price: Decimal,
        listing_type: ListingType,
    ) -> Result<(), MarketError> {
        let seller = seller.to_lowercase();
        let token_contract = token_contract.to_lowercase();
        self.store
            .upsert_user(User::new(&seller, UserRole::Creator))
            .await?;

        let collection = self
            .resolve_or_create_collection(&meta.chain_id, &token_contract, &seller, "auto", "Collection")
            .await?;
        let token = self
            .resolve_or_create_token(&collection, token_id, &meta.chain_id, &seller, "")
            .await?;

        let now = Utc::now();
        let listing = Listing {
            id: listing_id.to_string(),
            token_pk: token.id,
            listing_type,
            price,
            start_price: price,
            end_price: price,
            reserve_price: None,
            start_ts: now,
            end_ts: now + Duration::days(DEFAULT_LISTING_DURATION_DAYS),
            status: ListingStatus::Active,
            seller,
            version: 0,
        };
        // Replays must never reset prices, times, or a terminal status the
        // listing reached after the first observation.
        if self.store.insert_listing_if_absent(listing).await? {
            debug!(listing = listing_id, chain = %meta.chain_id, "listing created");
        } else {
            debug!(listing = listing_id, "listing already known, replay ignored");
        }
        Ok(())
    }

    async fn on_bid_placed(
        &self,
        meta: &Provenance,
        listing_id: &str,
        bidder: &str,
        amount: Decimal,
    ) -> Result<(), MarketError> {
        let Some(listing) = self.store.listing(listing_id).await? else {
            warn!(listing = listing_id, "bid for unknown listing");
            return Ok(());
        };

        let bidder = bidder.to_lowercase();
        self.store
            .upsert_user(User::new(&bidder, UserRole::Buyer))
            .await?;

        let bid = Bid {
            id: meta.dedup_key(),
            listing_id: listing_id.to_string(),
            bidder,
            amount,
            chain_id: meta.chain_id.clone(),
            status: BidStatus::Pending,
            tx_hash: Some(meta.tx_hash.clone()),
            created_at: Utc::now(),
        };

        let previous = self.store.highest_pending_bid(listing_id).await?;
        if !self.store.insert_bid_if_absent(bid).await? {
            debug!(listing = listing_id, "bid already known, replay ignored");
            return Ok(());
        }

        // The chain already enforced bid ordering; the price write trusts it.
        // A non-increasing amount still gets recorded but is worth noticing —
        // it indicates a reorged or inconsistent source.
        if amount <= listing.price {
            warn!(
                listing = listing_id,
                %amount,
                current = %listing.price,
                "observed bid does not exceed stored price"
            );
        }
        if let Some(previous) = previous {
            self.store
                .set_bid_status(&previous.id, BidStatus::Pending, BidStatus::Refunded)
                .await?;
        }
        self.store
            .update_listing(
                listing_id,
                &[ListingStatus::Pending, ListingStatus::Active],
                ListingPatch::price(amount),
            )
            .await?;

        debug!(listing = listing_id, %amount, chain = %meta.chain_id, "bid stored");
        Ok(())
    }

    async fn on_sale_settled(
        &self,
        meta: &Provenance,
        listing_id: &str,
        buyer: &str,
        amount: Decimal,
    ) -> Result<(), MarketError> {
        let Some(listing) = self.store.listing(listing_id).await? else {
            warn!(listing = listing_id, "sale for unknown listing");
            return Ok(());
        };

        let buyer = buyer.to_lowercase();
        let sale = Sale {
            id: meta.tx_hash.clone(),
            token_pk: listing.token_pk.clone(),
            price: amount,
            seller: listing.seller.clone(),
            buyer: buyer.clone(),
            chain_id: meta.chain_id.clone(),
            tx_hash: meta.tx_hash.clone(),
            ts: Utc::now(),
            listing_id: listing_id.to_string(),
        };
        if !self.store.insert_sale_if_absent(sale).await? {
            debug!(listing = listing_id, "sale already known, replay ignored");
            return Ok(());
        }

        self.store
            .upsert_user(User::new(&buyer, UserRole::Buyer))
            .await?;
        // Expired is overridden here: the settlement timer only derives
        // state, the chain observed the sale actually happening.
        self.store
            .update_listing(
                listing_id,
                &[
                    ListingStatus::Pending,
                    ListingStatus::Active,
                    ListingStatus::Expired,
                ],
                ListingPatch {
                    price: Some(amount),
                    status: Some(ListingStatus::Sold),
                    end_ts: Some(Utc::now()),
                },
            )
            .await?;

        debug!(listing = listing_id, %buyer, %amount, "sale recorded");
        Ok(())
    }

    async fn on_listing_cancelled(
        &self,
        _meta: &Provenance,
        listing_id: &str,
    ) -> Result<(), MarketError> {
        let updated = self
            .store
            .update_listing(
                listing_id,
                &[ListingStatus::Pending, ListingStatus::Active],
                ListingPatch::status(ListingStatus::Cancelled),
            )
            .await?;
        if updated {
            debug!(listing = listing_id, "listing cancelled");
        }
        Ok(())
    }

    async fn on_auction_extended(
        &self,
        _meta: &Provenance,
        listing_id: &str,
        new_end_ts: chrono::DateTime<Utc>,
    ) -> Result<(), MarketError> {
        self.store
            .update_listing(
                listing_id,
                &[ListingStatus::Pending, ListingStatus::Active],
                ListingPatch {
                    end_ts: Some(new_end_ts),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn on_transfer(
        &self,
        meta: &Provenance,
        token_contract: &str,
        to: &str,
        token_id: &str,
    ) -> Result<(), MarketError> {
        // A transfer for a contract we never saw a listing from is ignored;
        // the token will materialize once a marketplace event references it.
        let token_contract = token_contract.to_lowercase();
        let Some(collection) = self
            .store
            .collection_by_contract(&meta.chain_id, &token_contract)
            .await?
        else {
            return Ok(());
        };

        let token_pk = Token::key(&collection.id, token_id);
        let to = to.to_lowercase();
        if self.store.set_token_owner(&token_pk, &to).await? {
            debug!(token = %token_pk, owner = %to, "transfer applied");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_bridge_initiated(
        &self,
        meta: &Provenance,
        protocol: BridgeProtocol,
        token_contract: &str,
        token_id: &str,
        sender: &str,
        dst_chain: &str,
        burn_mint: bool,
        metadata_uri: &str,
    ) -> Result<(), MarketError> {
        let sender = sender.to_lowercase();
        let token_contract = token_contract.to_lowercase();
        let collection = self
            .resolve_or_create_collection(&meta.chain_id, &token_contract, &sender, "onft", "ONFT")
            .await?;

        // Burn-and-mint parks the token at the burn address; lock-and-mint
        // keeps it with the sender until the remote leg completes.
        let locked_owner = if burn_mint { BURN_ADDRESS } else { sender.as_str() };
        let token = self
            .resolve_or_create_token(&collection, token_id, &meta.chain_id, locked_owner, metadata_uri)
            .await?;

        let key = meta.dedup_key();
        if self.store.bridge_message_seen(&key).await? {
            debug!(message = %key, "bridge initiation already known, replay ignored");
            return Ok(());
        }
        self.store
            .insert_bridge_event(BridgeEvent {
                id: key.clone(),
                token_pk: token.id,
                src_chain: meta.chain_id.clone(),
                dst_chain: dst_chain.to_string(),
                protocol,
                message_id: key,
                status: BridgeStatus::InFlight,
                fee: Decimal::ZERO,
                completed_message_id: None,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_bridge_completed(
        &self,
        meta: &Provenance,
        protocol: BridgeProtocol,
        token_contract: &str,
        token_id: &str,
        receiver: &str,
        src_chain: &str,
        metadata_uri: &str,
    ) -> Result<(), MarketError> {
        let receiver = receiver.to_lowercase();
        let token_contract = token_contract.to_lowercase();
        let collection = self
            .resolve_or_create_collection(&meta.chain_id, &token_contract, &receiver, "onft", "ONFT")
            .await?;
        let token = self
            .resolve_or_create_token(&collection, token_id, &meta.chain_id, &receiver, metadata_uri)
            .await?;

        let key = meta.dedup_key();
        if self.store.bridge_message_seen(&key).await? {
            debug!(message = %key, "bridge completion already known, replay ignored");
            return Ok(());
        }

        // Adapters don't reliably echo the initiating message id, so the
        // completion matches by logical token (contract + token id, any
        // chain), most recent in-flight leg first.
        match self
            .store
            .latest_inflight_bridge(&token_contract, token_id)
            .await?
        {
            Some(inflight) => {
                self.store.complete_bridge_event(&inflight.id, &key).await?;
                debug!(token = %token.id, message = %inflight.message_id, "bridge completed");
            }
            None => {
                // Out-of-order delivery, or the initiating leg was lost.
                // Never block on the missing leg; record the completion and
                // make the orphan visible for monitoring.
                warn!(token = %token.id, message = %key, "orphaned bridge completion");
                self.store
                    .insert_bridge_event(BridgeEvent {
                        id: key.clone(),
                        token_pk: token.id,
                        src_chain: src_chain.to_string(),
                        dst_chain: meta.chain_id.clone(),
                        protocol,
                        message_id: key.clone(),
                        status: BridgeStatus::Completed,
                        fee: Decimal::ZERO,
                        completed_message_id: Some(key),
                        created_at: Utc::now(),
                    })
                    .await?;
            }
        }
        Ok(())
    }
}
