//! In-memory storage backend.
//!
//! All entity maps live behind one mutex, which makes `commit` naturally
//! atomic. Data is lost when the process exits; useful for tests and
//! ephemeral indexers.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use marketindex_core::cursor::{Cursor, CursorStore};
use marketindex_core::error::MarketError;
use marketindex_core::store::{ListingPatch, MarketStore, WriteBatch, WriteOp};
use marketindex_core::types::{
    Bid, BidStatus, BridgeEvent, BridgeStatus, BundleItem, Collection, Listing, ListingStatus,
    Sale, Token, User,
};

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    collections: HashMap<String, Collection>,
    tokens: HashMap<String, Token>,
    listings: HashMap<String, Listing>,
    bundle_items: Vec<BundleItem>,
    bids: HashMap<String, Bid>,
    sales: HashMap<String, Sale>,
    bridges: Vec<BridgeEvent>,
    cursors: HashMap<String, Cursor>,
}

/// In-memory marketplace store. Implements both [`MarketStore`] and
/// [`CursorStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Test / inspection helpers ────────────────────────────────────────────

    pub fn listing_count(&self) -> usize {
        self.inner.lock().unwrap().listings.len()
    }

    pub fn bid_count(&self, listing_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .bids
            .values()
            .filter(|b| b.listing_id == listing_id)
            .count()
    }

    pub fn sale_count(&self) -> usize {
        self.inner.lock().unwrap().sales.len()
    }

    pub fn collection_count(&self) -> usize {
        self.inner.lock().unwrap().collections.len()
    }

    pub fn bridge_events_for(&self, token_pk: &str) -> Vec<BridgeEvent> {
        self.inner
            .lock()
            .unwrap()
            .bridges
            .iter()
            .filter(|b| b.token_pk == token_pk)
            .cloned()
            .collect()
    }

    fn patch_listing(listing: &mut Listing, patch: &ListingPatch) {
        if let Some(price) = patch.price {
            listing.price = price;
        }
        if let Some(status) = patch.status {
            listing.status = status;
        }
        if let Some(end_ts) = patch.end_ts {
            listing.end_ts = end_ts;
        }
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn collection_by_contract(
        &self,
        chain_id: &str,
        address: &str,
    ) -> Result<Option<Collection>, MarketError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .collections
            .get(&Collection::key(chain_id, address))
            .cloned())
    }

    async fn token(
        &self,
        collection_id: &str,
        token_id: &str,
    ) -> Result<Option<Token>, MarketError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tokens.get(&Token::key(collection_id, token_id)).cloned())
    }

    async fn token_by_pk(&self, token_pk: &str) -> Result<Option<Token>, MarketError> {
        Ok(self.inner.lock().unwrap().tokens.get(token_pk).cloned())
    }

    async fn listing(&self, id: &str) -> Result<Option<Listing>, MarketError> {
        Ok(self.inner.lock().unwrap().listings.get(id).cloned())
    }

    async fn bundle_items(&self, listing_id: &str) -> Result<Vec<BundleItem>, MarketError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .bundle_items
            .iter()
            .filter(|item| item.listing_id == listing_id)
            .cloned()
            .collect())
    }

    async fn highest_pending_bid(&self, listing_id: &str) -> Result<Option<Bid>, MarketError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .bids
            .values()
            .filter(|b| b.listing_id == listing_id && b.status == BidStatus::Pending)
            .max_by(|a, b| {
                a.amount
                    .cmp(&b.amount)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .cloned())
    }

    async fn bids_by_status(
        &self,
        listing_id: &str,
        bidder: &str,
        status: BidStatus,
    ) -> Result<Vec<Bid>, MarketError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .bids
            .values()
            .filter(|b| b.listing_id == listing_id && b.bidder == bidder && b.status == status)
            .cloned()
            .collect())
    }

    async fn bid_exists(&self, bid_id: &str) -> Result<bool, MarketError> {
        Ok(self.inner.lock().unwrap().bids.contains_key(bid_id))
    }

    async fn sale_exists(&self, sale_id: &str) -> Result<bool, MarketError> {
        Ok(self.inner.lock().unwrap().sales.contains_key(sale_id))
    }

    async fn latest_inflight_bridge(
        &self,
        token_contract: &str,
        token_id: &str,
    ) -> Result<Option<BridgeEvent>, MarketError> {
        let inner = self.inner.lock().unwrap();
        let found = inner.bridges.iter().rev().find(|b| {
            if b.status != BridgeStatus::InFlight {
                return false;
            }
            let Some(token) = inner.tokens.get(&b.token_pk) else {
                return false;
            };
            let Some(collection) = inner.collections.get(&token.collection_id) else {
                return false;
            };
            collection.address == token_contract && token.token_id == token_id
        });
        Ok(found.cloned())
    }

    async fn bridge_message_seen(&self, key: &str) -> Result<bool, MarketError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.bridges.iter().any(|b| {
            b.message_id == key || b.completed_message_id.as_deref() == Some(key)
        }))
    }

    async fn upsert_user(&self, user: User) -> Result<(), MarketError> {
        let mut inner = self.inner.lock().unwrap();
        inner.users.entry(user.wallet.clone()).or_insert(user);
        Ok(())
    }

    async fn get_or_create_collection(
        &self,
        template: Collection,
    ) -> Result<Collection, MarketError> {
        let mut inner = self.inner.lock().unwrap();
        let key = Collection::key(&template.chain_id, &template.address);
        Ok(inner.collections.entry(key).or_insert(template).clone())
    }

    async fn upsert_token(&self, token: Token) -> Result<Token, MarketError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.tokens.get_mut(&token.id) {
            existing.owner = token.owner;
            existing.chain_id = token.chain_id;
            if !token.metadata_uri.is_empty() {
                existing.metadata_uri = token.metadata_uri;
            }
            Ok(existing.clone())
        } else {
            inner.tokens.insert(token.id.clone(), token.clone());
            Ok(token)
        }
    }

    async fn insert_listing(
        &self,
        listing: Listing,
        items: Vec<BundleItem>,
    ) -> Result<(), MarketError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.listings.contains_key(&listing.id) {
            return Err(MarketError::Storage(format!(
                "duplicate listing id {}",
                listing.id
            )));
        }
        inner.listings.insert(listing.id.clone(), listing);
        inner.bundle_items.extend(items);
        Ok(())
    }

    async fn insert_listing_if_absent(&self, listing: Listing) -> Result<bool, MarketError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.listings.contains_key(&listing.id) {
            return Ok(false);
        }
        inner.listings.insert(listing.id.clone(), listing);
        Ok(true)
    }

    async fn insert_bid_if_absent(&self, bid: Bid) -> Result<bool, MarketError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.bids.contains_key(&bid.id) {
            return Ok(false);
        }
        inner.bids.insert(bid.id.clone(), bid);
        Ok(true)
    }

    async fn insert_sale_if_absent(&self, sale: Sale) -> Result<bool, MarketError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.sales.contains_key(&sale.id) {
            return Ok(false);
        }
        inner.sales.insert(sale.id.clone(), sale);
        Ok(true)
    }

    async fn insert_bridge_event(&self, event: BridgeEvent) -> Result<(), MarketError> {
        self.inner.lock().unwrap().bridges.push(event);
        Ok(())
    }

    async fn update_listing(
        &self,
        id: &str,
        expect_status: &[ListingStatus],
        patch: ListingPatch,
    ) -> Result<bool, MarketError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(listing) = inner.listings.get_mut(id) else {
            return Ok(false);
        };
        if !expect_status.is_empty() && !expect_status.contains(&listing.status) {
            return Ok(false);
        }
        Self::patch_listing(listing, &patch);
        listing.version += 1;
        Ok(true)
    }

    async fn set_bid_status(
        &self,
        bid_id: &str,
        expect: BidStatus,
        to: BidStatus,
    ) -> Result<bool, MarketError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(bid) = inner.bids.get_mut(bid_id) else {
            return Ok(false);
        };
        if bid.status != expect {
            return Ok(false);
        }
        bid.status = to;
        Ok(true)
    }

    async fn set_token_owner(&self, token_pk: &str, owner: &str) -> Result<bool, MarketError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tokens.get_mut(token_pk) {
            Some(token) => {
                token.owner = owner.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete_bridge_event(
        &self,
        id: &str,
        completed_message_id: &str,
    ) -> Result<(), MarketError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(event) = inner.bridges.iter_mut().find(|b| b.id == id) else {
            return Err(MarketError::not_found("bridge event", id));
        };
        event.status = BridgeStatus::Completed;
        event.completed_message_id = Some(completed_message_id.to_string());
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), MarketError> {
        let mut inner = self.inner.lock().unwrap();

        // Validate every precondition before touching anything, so a failed
        // batch leaves state exactly as it was.
        for op in &batch {
            match op {
                WriteOp::UpdateListing {
                    id,
                    expect_status,
                    expect_version,
                    ..
                } => {
                    let Some(listing) = inner.listings.get(id) else {
                        return Err(MarketError::Conflict(format!("listing {id} missing")));
                    };
                    if !expect_status.is_empty() && !expect_status.contains(&listing.status) {
                        return Err(MarketError::Conflict(format!(
                            "listing {id} status {} not in expected set",
                            listing.status
                        )));
                    }
                    if let Some(version) = expect_version {
                        if listing.version != *version {
                            return Err(MarketError::Conflict(format!(
                                "listing {id} version {} != expected {version}",
                                listing.version
                            )));
                        }
                    }
                }
                WriteOp::InsertBid(bid) => {
                    if inner.bids.contains_key(&bid.id) {
                        return Err(MarketError::Conflict(format!("bid {} exists", bid.id)));
                    }
                }
                WriteOp::SetBidStatus { bid_id, expect, .. } => {
                    match inner.bids.get(bid_id) {
                        Some(bid) if bid.status == *expect => {}
                        Some(bid) => {
                            return Err(MarketError::Conflict(format!(
                                "bid {bid_id} status {} != expected {expect}",
                                bid.status
                            )));
                        }
                        None => {
                            return Err(MarketError::Conflict(format!("bid {bid_id} missing")));
                        }
                    }
                }
                WriteOp::TransitionBids { .. } => {}
                WriteOp::SetTokenOwner { token_pk, .. } => {
                    if !inner.tokens.contains_key(token_pk) {
                        return Err(MarketError::Conflict(format!("token {token_pk} missing")));
                    }
                }
                WriteOp::InsertSale(sale) => {
                    if inner.sales.contains_key(&sale.id) {
                        return Err(MarketError::Conflict(format!("sale {} exists", sale.id)));
                    }
                }
            }
        }

        for op in batch {
            match op {
                WriteOp::UpdateListing { id, patch, .. } => {
                    let listing = inner.listings.get_mut(&id).unwrap();
                    Self::patch_listing(listing, &patch);
                    listing.version += 1;
                }
                WriteOp::InsertBid(bid) => {
                    inner.bids.insert(bid.id.clone(), bid);
                }
                WriteOp::SetBidStatus { bid_id, to, .. } => {
                    inner.bids.get_mut(&bid_id).unwrap().status = to;
                }
                WriteOp::TransitionBids {
                    listing_id,
                    bidder,
                    from,
                    to,
                } => {
                    for bid in inner.bids.values_mut() {
                        if bid.listing_id == listing_id
                            && bid.status == from
                            && bidder.as_deref().map_or(true, |w| bid.bidder == w)
                        {
                            bid.status = to;
                        }
                    }
                }
                WriteOp::SetTokenOwner { token_pk, owner } => {
                    inner.tokens.get_mut(&token_pk).unwrap().owner = owner;
                }
                WriteOp::InsertSale(sale) => {
                    inner.sales.insert(sale.id.clone(), sale);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load(&self, source_id: &str) -> Result<Option<Cursor>, MarketError> {
        Ok(self.inner.lock().unwrap().cursors.get(source_id).cloned())
    }

    async fn save(&self, cursor: Cursor) -> Result<(), MarketError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.cursors.get(&cursor.source_id) {
            if existing.position > cursor.position {
                return Ok(());
            }
        }
        inner.cursors.insert(cursor.source_id.clone(), cursor);
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<(), MarketError> {
        self.inner.lock().unwrap().cursors.remove(source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn listing(id: &str, status: ListingStatus) -> Listing {
        Listing {
            id: id.into(),
            token_pk: "1:0xc/1".into(),
            listing_type: marketindex_core::types::ListingType::EnglishAuction,
            price: Decimal::ONE,
            start_price: Decimal::ONE,
            end_price: Decimal::ONE,
            reserve_price: None,
            start_ts: Utc::now(),
            end_ts: Utc::now() + chrono::Duration::hours(1),
            status,
            seller: "0xseller".into(),
            version: 0,
        }
    }

    fn bid(id: &str, listing_id: &str, amount: &str, status: BidStatus) -> Bid {
        Bid {
            id: id.into(),
            listing_id: listing_id.into(),
            bidder: "0xbidder".into(),
            amount: amount.parse().unwrap(),
            chain_id: "1".into(),
            status,
            tx_hash: None,
            created_at: Utc::now(),
        }
    }

    fn token(pk: &str) -> Token {
        Token {
            id: pk.into(),
            collection_id: "1:0xc".into(),
            token_id: "1".into(),
            chain_id: "1".into(),
            owner: "0xseller".into(),
            metadata_uri: String::new(),
            image_url: String::new(),
            attributes: None,
            minted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn get_or_create_collection_keeps_existing() {
        let store = MemoryStore::new();
        let mut template = Collection {
            id: Collection::key("1", "0xabc"),
            chain_id: "1".into(),
            address: "0xabc".into(),
            slug: "auto-abc".into(),
            name: "Collection 0xabc".into(),
            royalty_bps: 0,
            creator_wallet: "0x1".into(),
            verified: false,
        };
        let created = store.get_or_create_collection(template.clone()).await.unwrap();
        assert_eq!(created.slug, "auto-abc");

        template.slug = "different".into();
        let again = store.get_or_create_collection(template).await.unwrap();
        assert_eq!(again.slug, "auto-abc"); // existing wins
        assert_eq!(store.collection_count(), 1);
    }

    #[tokio::test]
    async fn upsert_token_preserves_curated_metadata() {
        let store = MemoryStore::new();
        let mut t = token("1:0xc/1");
        t.metadata_uri = "ipfs://meta".into();
        store.upsert_token(t.clone()).await.unwrap();

        t.owner = "0xnew".into();
        t.metadata_uri = String::new(); // empty must not clobber
        let stored = store.upsert_token(t).await.unwrap();
        assert_eq!(stored.owner, "0xnew");
        assert_eq!(stored.metadata_uri, "ipfs://meta");
    }

    #[tokio::test]
    async fn update_listing_respects_status_precondition() {
        let store = MemoryStore::new();
        store
            .insert_listing(listing("L1", ListingStatus::Sold), vec![])
            .await
            .unwrap();

        let updated = store
            .update_listing(
                "L1",
                &[ListingStatus::Active],
                ListingPatch::status(ListingStatus::Cancelled),
            )
            .await
            .unwrap();
        assert!(!updated);
        assert_eq!(
            store.listing("L1").await.unwrap().unwrap().status,
            ListingStatus::Sold
        );
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        store
            .insert_listing(listing("L1", ListingStatus::Active), vec![])
            .await
            .unwrap();

        // Second op fails its precondition (bid does not exist) — the
        // listing update must not stick.
        let result = store
            .commit(vec![
                WriteOp::UpdateListing {
                    id: "L1".into(),
                    expect_status: vec![ListingStatus::Active],
                    expect_version: Some(0),
                    patch: ListingPatch::price("5".parse().unwrap()),
                },
                WriteOp::SetBidStatus {
                    bid_id: "nope".into(),
                    expect: BidStatus::Pending,
                    to: BidStatus::Refunded,
                },
            ])
            .await;
        assert!(matches!(result, Err(MarketError::Conflict(_))));

        let l = store.listing("L1").await.unwrap().unwrap();
        assert_eq!(l.price, Decimal::ONE);
        assert_eq!(l.version, 0);
    }

    #[tokio::test]
    async fn commit_version_conflict() {
        let store = MemoryStore::new();
        store
            .insert_listing(listing("L1", ListingStatus::Active), vec![])
            .await
            .unwrap();

        // Simulate a concurrent writer bumping the version.
        store
            .update_listing("L1", &[], ListingPatch::price("2".parse().unwrap()))
            .await
            .unwrap();

        let result = store
            .commit(vec![WriteOp::UpdateListing {
                id: "L1".into(),
                expect_status: vec![ListingStatus::Active],
                expect_version: Some(0),
                patch: ListingPatch::price("3".parse().unwrap()),
            }])
            .await;
        assert!(matches!(result, Err(MarketError::Conflict(_))));
    }

    #[tokio::test]
    async fn commit_applies_every_op() {
        let store = MemoryStore::new();
        store
            .insert_listing(listing("L1", ListingStatus::Active), vec![])
            .await
            .unwrap();
        store.upsert_token(token("1:0xc/1")).await.unwrap();
        store
            .insert_bid_if_absent(bid("B1", "L1", "2", BidStatus::Pending))
            .await
            .unwrap();

        store
            .commit(vec![
                WriteOp::UpdateListing {
                    id: "L1".into(),
                    expect_status: vec![ListingStatus::Active],
                    expect_version: Some(0),
                    patch: ListingPatch {
                        price: Some("3".parse().unwrap()),
                        status: Some(ListingStatus::Sold),
                        end_ts: None,
                    },
                },
                WriteOp::SetBidStatus {
                    bid_id: "B1".into(),
                    expect: BidStatus::Pending,
                    to: BidStatus::Refunded,
                },
                WriteOp::SetTokenOwner {
                    token_pk: "1:0xc/1".into(),
                    owner: "0xbuyer".into(),
                },
            ])
            .await
            .unwrap();

        let l = store.listing("L1").await.unwrap().unwrap();
        assert_eq!(l.status, ListingStatus::Sold);
        assert_eq!(l.version, 1);
        assert_eq!(
            store.token_by_pk("1:0xc/1").await.unwrap().unwrap().owner,
            "0xbuyer"
        );
        assert_eq!(
            store
                .bids_by_status("L1", "0xbidder", BidStatus::Refunded)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn transition_bids_scoped_to_bidder() {
        let store = MemoryStore::new();
        store
            .insert_bid_if_absent(bid("B1", "L1", "2", BidStatus::Refunded))
            .await
            .unwrap();
        let mut other = bid("B2", "L1", "3", BidStatus::Refunded);
        other.bidder = "0xother".into();
        store.insert_bid_if_absent(other).await.unwrap();

        store
            .commit(vec![WriteOp::TransitionBids {
                listing_id: "L1".into(),
                bidder: Some("0xbidder".into()),
                from: BidStatus::Refunded,
                to: BidStatus::Cancelled,
            }])
            .await
            .unwrap();

        assert_eq!(
            store
                .bids_by_status("L1", "0xbidder", BidStatus::Cancelled)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .bids_by_status("L1", "0xother", BidStatus::Refunded)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn highest_pending_bid_orders_by_amount() {
        let store = MemoryStore::new();
        store
            .insert_bid_if_absent(bid("B1", "L1", "2", BidStatus::Pending))
            .await
            .unwrap();
        store
            .insert_bid_if_absent(bid("B2", "L1", "5", BidStatus::Pending))
            .await
            .unwrap();
        store
            .insert_bid_if_absent(bid("B3", "L1", "9", BidStatus::Refunded))
            .await
            .unwrap();

        let highest = store.highest_pending_bid("L1").await.unwrap().unwrap();
        assert_eq!(highest.id, "B2"); // refunded bids don't count
    }

    #[tokio::test]
    async fn bridge_message_seen_covers_both_legs() {
        let store = MemoryStore::new();
        store
            .get_or_create_collection(Collection {
                id: Collection::key("1", "0xc"),
                chain_id: "1".into(),
                address: "0xc".into(),
                slug: "onft-c".into(),
                name: "ONFT 0xc".into(),
                royalty_bps: 0,
                creator_wallet: "0xseller".into(),
                verified: false,
            })
            .await
            .unwrap();
        let mut bridged = token("1:0xc/7");
        bridged.token_id = "7".into();
        store.upsert_token(bridged).await.unwrap();
        store
            .insert_bridge_event(BridgeEvent {
                id: "0xa:0".into(),
                token_pk: "1:0xc/7".into(),
                src_chain: "1".into(),
                dst_chain: "137".into(),
                protocol: marketindex_core::types::BridgeProtocol::LayerZero,
                message_id: "0xa:0".into(),
                status: BridgeStatus::InFlight,
                fee: Decimal::ZERO,
                completed_message_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.bridge_message_seen("0xa:0").await.unwrap());
        assert!(!store.bridge_message_seen("0xb:0").await.unwrap());

        assert!(
            store.latest_inflight_bridge("0xc", "7").await.unwrap().is_some(),
            "in-flight leg matched by (contract, token id)"
        );

        store.complete_bridge_event("0xa:0", "0xb:0").await.unwrap();
        assert!(store.bridge_message_seen("0xb:0").await.unwrap());
        assert!(
            store.latest_inflight_bridge("0xc", "7").await.unwrap().is_none(),
            "completed event no longer in flight"
        );
    }
}
