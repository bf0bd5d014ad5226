//! SQLite storage backend for MarketIndex.
//!
//! Persists the full marketplace state — users, collections, tokens,
//! listings, bids, sales, bridge events — plus source cursors in a single
//! SQLite file. Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use marketindex_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./market.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use marketindex_core::cursor::{Cursor, CursorStore};
use marketindex_core::error::MarketError;
use marketindex_core::store::{ListingPatch, MarketStore, WriteBatch, WriteOp};
use marketindex_core::types::{
    Bid, BidStatus, BridgeEvent, BridgeProtocol, BridgeStatus, BundleItem, Collection, Listing,
    ListingStatus, ListingType, Sale, Token, User,
};

/// SQLite-backed marketplace + cursor store.
pub struct SqliteStore {
    pool: SqlitePool,
}

fn storage_err(err: impl std::fmt::Display) -> MarketError {
    MarketError::Storage(err.to_string())
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_decimal(s: &str) -> Result<Decimal, MarketError> {
    s.parse::<Decimal>()
        .map_err(|e| MarketError::Storage(format!("bad decimal {s:?}: {e}")))
}

fn listing_type_from(s: &str) -> Result<ListingType, MarketError> {
    match s {
        "fixed" => Ok(ListingType::Fixed),
        "english-auction" => Ok(ListingType::EnglishAuction),
        "dutch-auction" => Ok(ListingType::DutchAuction),
        "bundle" => Ok(ListingType::Bundle),
        other => Err(MarketError::Storage(format!("bad listing type {other:?}"))),
    }
}

fn listing_status_from(s: &str) -> Result<ListingStatus, MarketError> {
    match s {
        "pending" => Ok(ListingStatus::Pending),
        "active" => Ok(ListingStatus::Active),
        "sold" => Ok(ListingStatus::Sold),
        "expired" => Ok(ListingStatus::Expired),
        "cancelled" => Ok(ListingStatus::Cancelled),
        other => Err(MarketError::Storage(format!("bad listing status {other:?}"))),
    }
}

fn bid_status_from(s: &str) -> Result<BidStatus, MarketError> {
    match s {
        "pending" => Ok(BidStatus::Pending),
        "refunded" => Ok(BidStatus::Refunded),
        "cancelled" => Ok(BidStatus::Cancelled),
        other => Err(MarketError::Storage(format!("bad bid status {other:?}"))),
    }
}

fn bridge_status_from(s: &str) -> Result<BridgeStatus, MarketError> {
    match s {
        "created" => Ok(BridgeStatus::Created),
        "in-flight" => Ok(BridgeStatus::InFlight),
        "completed" => Ok(BridgeStatus::Completed),
        other => Err(MarketError::Storage(format!("bad bridge status {other:?}"))),
    }
}

fn bridge_protocol_from(s: &str) -> Result<BridgeProtocol, MarketError> {
    match s {
        "layerzero" => Ok(BridgeProtocol::LayerZero),
        "wormhole" => Ok(BridgeProtocol::Wormhole),
        other => Err(MarketError::Storage(format!("bad bridge protocol {other:?}"))),
    }
}

fn row_to_collection(row: &sqlx::sqlite::SqliteRow) -> Collection {
    Collection {
        id: row.get("id"),
        chain_id: row.get("chain_id"),
        address: row.get("address"),
        slug: row.get("slug"),
        name: row.get("name"),
        royalty_bps: row.get::<i64, _>("royalty_bps") as u32,
        creator_wallet: row.get("creator_wallet"),
        verified: row.get::<i64, _>("verified") != 0,
    }
}

fn row_to_token(row: &sqlx::sqlite::SqliteRow) -> Token {
    let attributes = row
        .get::<Option<String>, _>("attributes_json")
        .and_then(|s| serde_json::from_str(&s).ok());
    Token {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        token_id: row.get("token_id"),
        chain_id: row.get("chain_id"),
        owner: row.get("owner"),
        metadata_uri: row.get("metadata_uri"),
        image_url: row.get("image_url"),
        attributes,
        minted_at: millis_to_utc(row.get("minted_at")),
    }
}

fn row_to_listing(row: &sqlx::sqlite::SqliteRow) -> Result<Listing, MarketError> {
    Ok(Listing {
        id: row.get("id"),
        token_pk: row.get("token_pk"),
        listing_type: listing_type_from(&row.get::<String, _>("listing_type"))?,
        price: parse_decimal(&row.get::<String, _>("price"))?,
        start_price: parse_decimal(&row.get::<String, _>("start_price"))?,
        end_price: parse_decimal(&row.get::<String, _>("end_price"))?,
        reserve_price: row
            .get::<Option<String>, _>("reserve_price")
            .map(|s| parse_decimal(&s))
            .transpose()?,
        start_ts: millis_to_utc(row.get("start_ts")),
        end_ts: millis_to_utc(row.get("end_ts")),
        status: listing_status_from(&row.get::<String, _>("status"))?,
        seller: row.get("seller"),
        version: row.get::<i64, _>("version") as u64,
    })
}

fn row_to_bid(row: &sqlx::sqlite::SqliteRow) -> Result<Bid, MarketError> {
    Ok(Bid {
        id: row.get("id"),
        listing_id: row.get("listing_id"),
        bidder: row.get("bidder"),
        amount: parse_decimal(&row.get::<String, _>("amount"))?,
        chain_id: row.get("chain_id"),
        status: bid_status_from(&row.get::<String, _>("status"))?,
        tx_hash: row.get("tx_hash"),
        created_at: millis_to_utc(row.get("created_at")),
    })
}

fn row_to_bridge(row: &sqlx::sqlite::SqliteRow) -> Result<BridgeEvent, MarketError> {
    Ok(BridgeEvent {
        id: row.get("id"),
        token_pk: row.get("token_pk"),
        src_chain: row.get("src_chain"),
        dst_chain: row.get("dst_chain"),
        protocol: bridge_protocol_from(&row.get::<String, _>("protocol"))?,
        message_id: row.get("message_id"),
        status: bridge_status_from(&row.get::<String, _>("status"))?,
        fee: parse_decimal(&row.get::<String, _>("fee"))?,
        completed_message_id: row.get("completed_message_id"),
        created_at: millis_to_utc(row.get("created_at")),
    })
}

/// Build the conditional listing UPDATE. Bind order: patch fields (price,
/// status, end_ts), then id, then expected statuses, then expected version.
fn listing_update_sql(
    patch: &ListingPatch,
    expect_status: &[ListingStatus],
    expect_version: bool,
) -> String {
    let mut sets = vec!["version = version + 1".to_string()];
    if patch.price.is_some() {
        sets.push("price = ?".into());
    }
    if patch.status.is_some() {
        sets.push("status = ?".into());
    }
    if patch.end_ts.is_some() {
        sets.push("end_ts = ?".into());
    }
    let mut sql = format!("UPDATE listings SET {} WHERE id = ?", sets.join(", "));
    if !expect_status.is_empty() {
        let marks = vec!["?"; expect_status.len()].join(", ");
        sql.push_str(&format!(" AND status IN ({marks})"));
    }
    if expect_version {
        sql.push_str(" AND version = ?");
    }
    sql
}

fn bind_listing_update<'q>(
    sql: &'q str,
    id: &'q str,
    patch: &ListingPatch,
    expect_status: &[ListingStatus],
    expect_version: Option<u64>,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    let mut query = sqlx::query(sql);
    if let Some(price) = patch.price {
        query = query.bind(price.to_string());
    }
    if let Some(status) = patch.status {
        query = query.bind(status.to_string());
    }
    if let Some(end_ts) = patch.end_ts {
        query = query.bind(end_ts.timestamp_millis());
    }
    query = query.bind(id);
    for status in expect_status {
        query = query.bind(status.to_string());
    }
    if let Some(version) = expect_version {
        query = query.bind(version as i64);
    }
    query
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    pub async fn open(path: &str) -> Result<Self, MarketError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database. Ideal for tests.
    pub async fn in_memory() -> Result<Self, MarketError> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), MarketError> {
        // WAL mode — better concurrent read throughput
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let statements = [
            "CREATE TABLE IF NOT EXISTS users (
                wallet TEXT PRIMARY KEY,
                role   TEXT NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS collections (
                id             TEXT PRIMARY KEY,
                chain_id       TEXT NOT NULL,
                address        TEXT NOT NULL,
                slug           TEXT NOT NULL,
                name           TEXT NOT NULL,
                royalty_bps    INTEGER NOT NULL,
                creator_wallet TEXT NOT NULL,
                verified       INTEGER NOT NULL,
                UNIQUE (chain_id, address)
            );",
            "CREATE TABLE IF NOT EXISTS tokens (
                id              TEXT PRIMARY KEY,
                collection_id   TEXT NOT NULL,
                token_id        TEXT NOT NULL,
                chain_id        TEXT NOT NULL,
                owner           TEXT NOT NULL,
                metadata_uri    TEXT NOT NULL,
                image_url       TEXT NOT NULL,
                attributes_json TEXT,
                minted_at       INTEGER NOT NULL,
                UNIQUE (collection_id, token_id)
            );",
            "CREATE TABLE IF NOT EXISTS listings (
                id            TEXT PRIMARY KEY,
                token_pk      TEXT NOT NULL,
                listing_type  TEXT NOT NULL,
                price         TEXT NOT NULL,
                start_price   TEXT NOT NULL,
                end_price     TEXT NOT NULL,
                reserve_price TEXT,
                start_ts      INTEGER NOT NULL,
                end_ts        INTEGER NOT NULL,
                status        TEXT NOT NULL,
                seller        TEXT NOT NULL,
                version       INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS bundle_items (
                listing_id TEXT NOT NULL,
                token_pk   TEXT NOT NULL,
                quantity   INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS bids (
                id         TEXT PRIMARY KEY,
                listing_id TEXT NOT NULL,
                bidder     TEXT NOT NULL,
                amount     TEXT NOT NULL,
                chain_id   TEXT NOT NULL,
                status     TEXT NOT NULL,
                tx_hash    TEXT,
                created_at INTEGER NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_bids_listing ON bids (listing_id, status);",
            "CREATE TABLE IF NOT EXISTS sales (
                id         TEXT PRIMARY KEY,
                token_pk   TEXT NOT NULL,
                price      TEXT NOT NULL,
                seller     TEXT NOT NULL,
                buyer      TEXT NOT NULL,
                chain_id   TEXT NOT NULL,
                tx_hash    TEXT NOT NULL,
                ts         INTEGER NOT NULL,
                listing_id TEXT NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS bridge_events (
                id                   TEXT PRIMARY KEY,
                token_pk             TEXT NOT NULL,
                src_chain            TEXT NOT NULL,
                dst_chain            TEXT NOT NULL,
                protocol             TEXT NOT NULL,
                message_id           TEXT NOT NULL,
                status               TEXT NOT NULL,
                fee                  TEXT NOT NULL,
                completed_message_id TEXT,
                created_at           INTEGER NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_bridge_token ON bridge_events (token_pk, status);",
            "CREATE TABLE IF NOT EXISTS cursors (
                source_id  TEXT PRIMARY KEY,
                position   INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MarketStore for SqliteStore {
    async fn collection_by_contract(
        &self,
        chain_id: &str,
        address: &str,
    ) -> Result<Option<Collection>, MarketError> {
        let row = sqlx::query("SELECT * FROM collections WHERE chain_id = ? AND address = ?")
            .bind(chain_id)
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.as_ref().map(row_to_collection))
    }

    async fn token(
        &self,
        collection_id: &str,
        token_id: &str,
    ) -> Result<Option<Token>, MarketError> {
        let row = sqlx::query("SELECT * FROM tokens WHERE collection_id = ? AND token_id = ?")
            .bind(collection_id)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.as_ref().map(row_to_token))
    }

    async fn token_by_pk(&self, token_pk: &str) -> Result<Option<Token>, MarketError> {
        let row = sqlx::query("SELECT * FROM tokens WHERE id = ?")
            .bind(token_pk)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.as_ref().map(row_to_token))
    }

    async fn listing(&self, id: &str) -> Result<Option<Listing>, MarketError> {
        let row = sqlx::query("SELECT * FROM listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_listing).transpose()
    }

    async fn bundle_items(&self, listing_id: &str) -> Result<Vec<BundleItem>, MarketError> {
        let rows = sqlx::query("SELECT * FROM bundle_items WHERE listing_id = ?")
            .bind(listing_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(rows
            .iter()
            .map(|row| BundleItem {
                listing_id: row.get("listing_id"),
                token_pk: row.get("token_pk"),
                quantity: row.get::<i64, _>("quantity") as u32,
            })
            .collect())
    }

    async fn highest_pending_bid(&self, listing_id: &str) -> Result<Option<Bid>, MarketError> {
        let row = sqlx::query(
            "SELECT * FROM bids WHERE listing_id = ? AND status = 'pending'
             ORDER BY CAST(amount AS REAL) DESC, created_at DESC LIMIT 1",
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(row_to_bid).transpose()
    }

    async fn bids_by_status(
        &self,
        listing_id: &str,
        bidder: &str,
        status: BidStatus,
    ) -> Result<Vec<Bid>, MarketError> {
        let rows = sqlx::query(
            "SELECT * FROM bids WHERE listing_id = ? AND bidder = ? AND status = ?
             ORDER BY created_at",
        )
        .bind(listing_id)
        .bind(bidder)
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(row_to_bid).collect()
    }

    async fn bid_exists(&self, bid_id: &str) -> Result<bool, MarketError> {
        let row = sqlx::query("SELECT 1 FROM bids WHERE id = ?")
            .bind(bid_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.is_some())
    }

    async fn sale_exists(&self, sale_id: &str) -> Result<bool, MarketError> {
        let row = sqlx::query("SELECT 1 FROM sales WHERE id = ?")
            .bind(sale_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.is_some())
    }

    async fn latest_inflight_bridge(
        &self,
        token_contract: &str,
        token_id: &str,
    ) -> Result<Option<BridgeEvent>, MarketError> {
        let row = sqlx::query(
            "SELECT b.* FROM bridge_events b
             JOIN tokens t ON t.id = b.token_pk
             JOIN collections c ON c.id = t.collection_id
             WHERE b.status = 'in-flight' AND c.address = ? AND t.token_id = ?
             ORDER BY b.created_at DESC, b.rowid DESC LIMIT 1",
        )
        .bind(token_contract)
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(row_to_bridge).transpose()
    }

    async fn bridge_message_seen(&self, key: &str) -> Result<bool, MarketError> {
        let row = sqlx::query(
            "SELECT 1 FROM bridge_events WHERE message_id = ? OR completed_message_id = ? LIMIT 1",
        )
        .bind(key)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.is_some())
    }

    async fn upsert_user(&self, user: User) -> Result<(), MarketError> {
        sqlx::query("INSERT OR IGNORE INTO users (wallet, role) VALUES (?, ?)")
            .bind(&user.wallet)
            .bind(match user.role {
                marketindex_core::types::UserRole::Creator => "creator",
                marketindex_core::types::UserRole::Buyer => "buyer",
            })
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_or_create_collection(
        &self,
        template: Collection,
    ) -> Result<Collection, MarketError> {
        sqlx::query(
            "INSERT OR IGNORE INTO collections
             (id, chain_id, address, slug, name, royalty_bps, creator_wallet, verified)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&template.id)
        .bind(&template.chain_id)
        .bind(&template.address)
        .bind(&template.slug)
        .bind(&template.name)
        .bind(template.royalty_bps as i64)
        .bind(template.creator_wallet.as_str())
        .bind(template.verified as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        self.collection_by_contract(&template.chain_id, &template.address)
            .await?
            .ok_or_else(|| MarketError::Storage("collection upsert lost".into()))
    }

    async fn upsert_token(&self, token: Token) -> Result<Token, MarketError> {
        let attributes = token
            .attributes
            .as_ref()
            .map(|a| serde_json::to_string(a).unwrap_or_default());
        sqlx::query(
            "INSERT INTO tokens
             (id, collection_id, token_id, chain_id, owner, metadata_uri, image_url, attributes_json, minted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                 owner = excluded.owner,
                 chain_id = excluded.chain_id,
                 metadata_uri = CASE WHEN excluded.metadata_uri != ''
                                     THEN excluded.metadata_uri
                                     ELSE tokens.metadata_uri END",
        )
        .bind(&token.id)
        .bind(&token.collection_id)
        .bind(&token.token_id)
        .bind(&token.chain_id)
        .bind(&token.owner)
        .bind(&token.metadata_uri)
        .bind(&token.image_url)
        .bind(attributes)
        .bind(token.minted_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        self.token_by_pk(&token.id)
            .await?
            .ok_or_else(|| MarketError::Storage("token upsert lost".into()))
    }

    async fn insert_listing(
        &self,
        listing: Listing,
        items: Vec<BundleItem>,
    ) -> Result<(), MarketError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO listings
             (id, token_pk, listing_type, price, start_price, end_price, reserve_price,
              start_ts, end_ts, status, seller, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&listing.id)
        .bind(&listing.token_pk)
        .bind(listing.listing_type.to_string())
        .bind(listing.price.to_string())
        .bind(listing.start_price.to_string())
        .bind(listing.end_price.to_string())
        .bind(listing.reserve_price.map(|p| p.to_string()))
        .bind(listing.start_ts.timestamp_millis())
        .bind(listing.end_ts.timestamp_millis())
        .bind(listing.status.to_string())
        .bind(&listing.seller)
        .bind(listing.version as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?
        .rows_affected();
        if inserted == 0 {
            return Err(MarketError::Storage(format!(
                "duplicate listing id {}",
                listing.id
            )));
        }
        for item in items {
            sqlx::query("INSERT INTO bundle_items (listing_id, token_pk, quantity) VALUES (?, ?, ?)")
                .bind(&item.listing_id)
                .bind(&item.token_pk)
                .bind(item.quantity as i64)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn insert_listing_if_absent(&self, listing: Listing) -> Result<bool, MarketError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO listings
             (id, token_pk, listing_type, price, start_price, end_price, reserve_price,
              start_ts, end_ts, status, seller, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&listing.id)
        .bind(&listing.token_pk)
        .bind(listing.listing_type.to_string())
        .bind(listing.price.to_string())
        .bind(listing.start_price.to_string())
        .bind(listing.end_price.to_string())
        .bind(listing.reserve_price.map(|p| p.to_string()))
        .bind(listing.start_ts.timestamp_millis())
        .bind(listing.end_ts.timestamp_millis())
        .bind(listing.status.to_string())
        .bind(&listing.seller)
        .bind(listing.version as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_bid_if_absent(&self, bid: Bid) -> Result<bool, MarketError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO bids
             (id, listing_id, bidder, amount, chain_id, status, tx_hash, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&bid.id)
        .bind(&bid.listing_id)
        .bind(&bid.bidder)
        .bind(bid.amount.to_string())
        .bind(&bid.chain_id)
        .bind(bid.status.to_string())
        .bind(bid.tx_hash.as_deref())
        .bind(bid.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_sale_if_absent(&self, sale: Sale) -> Result<bool, MarketError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO sales
             (id, token_pk, price, seller, buyer, chain_id, tx_hash, ts, listing_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&sale.id)
        .bind(&sale.token_pk)
        .bind(sale.price.to_string())
        .bind(&sale.seller)
        .bind(&sale.buyer)
        .bind(&sale.chain_id)
        .bind(&sale.tx_hash)
        .bind(sale.ts.timestamp_millis())
        .bind(&sale.listing_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_bridge_event(&self, event: BridgeEvent) -> Result<(), MarketError> {
        sqlx::query(
            "INSERT INTO bridge_events
             (id, token_pk, src_chain, dst_chain, protocol, message_id, status, fee,
              completed_message_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.token_pk)
        .bind(&event.src_chain)
        .bind(&event.dst_chain)
        .bind(event.protocol.to_string())
        .bind(&event.message_id)
        .bind(event.status.to_string())
        .bind(event.fee.to_string())
        .bind(event.completed_message_id.as_deref())
        .bind(event.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn update_listing(
        &self,
        id: &str,
        expect_status: &[ListingStatus],
        patch: ListingPatch,
    ) -> Result<bool, MarketError> {
        let sql = listing_update_sql(&patch, expect_status, false);
        let result = bind_listing_update(&sql, id, &patch, expect_status, None)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_bid_status(
        &self,
        bid_id: &str,
        expect: BidStatus,
        to: BidStatus,
    ) -> Result<bool, MarketError> {
        let result = sqlx::query("UPDATE bids SET status = ? WHERE id = ? AND status = ?")
            .bind(to.to_string())
            .bind(bid_id)
            .bind(expect.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_token_owner(&self, token_pk: &str, owner: &str) -> Result<bool, MarketError> {
        let result = sqlx::query("UPDATE tokens SET owner = ? WHERE id = ?")
            .bind(owner)
            .bind(token_pk)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_bridge_event(
        &self,
        id: &str,
        completed_message_id: &str,
    ) -> Result<(), MarketError> {
        let result = sqlx::query(
            "UPDATE bridge_events SET status = 'completed', completed_message_id = ?
             WHERE id = ?",
        )
        .bind(completed_message_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(MarketError::not_found("bridge event", id));
        }
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), MarketError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for op in &batch {
            match op {
                WriteOp::UpdateListing {
                    id,
                    expect_status,
                    expect_version,
                    patch,
                } => {
                    let sql = listing_update_sql(patch, expect_status, expect_version.is_some());
                    let affected = bind_listing_update(&sql, id, patch, expect_status, *expect_version)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?
                        .rows_affected();
                    if affected == 0 {
                        return Err(MarketError::Conflict(format!(
                            "listing {id} precondition failed"
                        )));
                    }
                }
                WriteOp::InsertBid(bid) => {
                    let affected = sqlx::query(
                        "INSERT OR IGNORE INTO bids
                         (id, listing_id, bidder, amount, chain_id, status, tx_hash, created_at)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&bid.id)
                    .bind(&bid.listing_id)
                    .bind(&bid.bidder)
                    .bind(bid.amount.to_string())
                    .bind(&bid.chain_id)
                    .bind(bid.status.to_string())
                    .bind(bid.tx_hash.as_deref())
                    .bind(bid.created_at.timestamp_millis())
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?
                    .rows_affected();
                    if affected == 0 {
                        return Err(MarketError::Conflict(format!("bid {} exists", bid.id)));
                    }
                }
                WriteOp::SetBidStatus { bid_id, expect, to } => {
                    let affected =
                        sqlx::query("UPDATE bids SET status = ? WHERE id = ? AND status = ?")
                            .bind(to.to_string())
                            .bind(bid_id)
                            .bind(expect.to_string())
                            .execute(&mut *tx)
                            .await
                            .map_err(storage_err)?
                            .rows_affected();
                    if affected == 0 {
                        return Err(MarketError::Conflict(format!(
                            "bid {bid_id} precondition failed"
                        )));
                    }
                }
                WriteOp::TransitionBids {
                    listing_id,
                    bidder,
                    from,
                    to,
                } => {
                    let mut sql =
                        String::from("UPDATE bids SET status = ? WHERE listing_id = ? AND status = ?");
                    if bidder.is_some() {
                        sql.push_str(" AND bidder = ?");
                    }
                    let mut query = sqlx::query(&sql)
                        .bind(to.to_string())
                        .bind(listing_id)
                        .bind(from.to_string());
                    if let Some(bidder) = bidder {
                        query = query.bind(bidder);
                    }
                    query.execute(&mut *tx).await.map_err(storage_err)?;
                }
                WriteOp::SetTokenOwner { token_pk, owner } => {
                    let affected = sqlx::query("UPDATE tokens SET owner = ? WHERE id = ?")
                        .bind(owner)
                        .bind(token_pk)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?
                        .rows_affected();
                    if affected == 0 {
                        return Err(MarketError::Conflict(format!("token {token_pk} missing")));
                    }
                }
                WriteOp::InsertSale(sale) => {
                    let affected = sqlx::query(
                        "INSERT OR IGNORE INTO sales
                         (id, token_pk, price, seller, buyer, chain_id, tx_hash, ts, listing_id)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&sale.id)
                    .bind(&sale.token_pk)
                    .bind(sale.price.to_string())
                    .bind(&sale.seller)
                    .bind(&sale.buyer)
                    .bind(&sale.chain_id)
                    .bind(&sale.tx_hash)
                    .bind(sale.ts.timestamp_millis())
                    .bind(&sale.listing_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?
                    .rows_affected();
                    if affected == 0 {
                        return Err(MarketError::Conflict(format!("sale {} exists", sale.id)));
                    }
                }
            }
        }
        tx.commit().await.map_err(storage_err)?;
        debug!(ops = batch.len(), "write batch committed");
        Ok(())
    }
}

// ─── CursorStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for SqliteStore {
    async fn load(&self, source_id: &str) -> Result<Option<Cursor>, MarketError> {
        let row = sqlx::query("SELECT * FROM cursors WHERE source_id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| Cursor {
            source_id: r.get("source_id"),
            position: r.get::<i64, _>("position") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, cursor: Cursor) -> Result<(), MarketError> {
        // The WHERE clause on the upsert keeps positions monotonic.
        sqlx::query(
            "INSERT INTO cursors (source_id, position, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (source_id) DO UPDATE SET
                 position = excluded.position,
                 updated_at = excluded.updated_at
             WHERE excluded.position >= cursors.position",
        )
        .bind(&cursor.source_id)
        .bind(cursor.position as i64)
        .bind(cursor.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<(), MarketError> {
        sqlx::query("DELETE FROM cursors WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
