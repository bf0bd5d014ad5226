//! Domain entities shared across the indexing and marketplace pipeline.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Free-form attribute blob attached to tokens.
pub type Json = serde_json::Value;

/// The burn address tokens are parked at during burn-and-mint bridging.
pub const BURN_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

// ─── User ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    Creator,
    Buyer,
}

/// A wallet seen selling, bidding, or buying. Auto-created on first sight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub wallet: String,
    pub role: UserRole,
}

impl User {
    pub fn new(wallet: impl Into<String>, role: UserRole) -> Self {
        Self {
            wallet: wallet.into(),
            role,
        }
    }
}

// ─── Collection ───────────────────────────────────────────────────────────────

/// An NFT collection. Identity key = `(chain_id, address)`.
///
/// Auto-created as a "shadow collection" on the first observed event that
/// references an unknown contract; curators can enrich it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub chain_id: String,
    pub address: String,
    pub slug: String,
    pub name: String,
    pub royalty_bps: u32,
    pub creator_wallet: String,
    pub verified: bool,
}

impl Collection {
    /// Natural key for a collection: `"{chain_id}:{address}"`.
    pub fn key(chain_id: &str, address: &str) -> String {
        format!("{chain_id}:{address}")
    }
}

// ─── Token ────────────────────────────────────────────────────────────────────

/// A single token. Identity key = `(collection_id, token_id)`.
///
/// `owner` is the single source of truth for current custody; it is mutated
/// by Transfer events and by settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub collection_id: String,
    pub token_id: String,
    pub chain_id: String,
    pub owner: String,
    pub metadata_uri: String,
    pub image_url: String,
    pub attributes: Option<Json>,
    pub minted_at: DateTime<Utc>,
}

impl Token {
    /// Natural key for a token: `"{collection_id}/{token_id}"`.
    pub fn key(collection_id: &str, token_id: &str) -> String {
        format!("{collection_id}/{token_id}")
    }
}

// ─── Listing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingType {
    Fixed,
    EnglishAuction,
    DutchAuction,
    Bundle,
}

impl ListingType {
    /// Map the on-chain `uint8` listing type code. Unknown codes fall back to
    /// `Fixed`, matching the marketplace contract's default.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::EnglishAuction,
            2 => Self::DutchAuction,
            3 => Self::Bundle,
            _ => Self::Fixed,
        }
    }

    /// Listing types that settle instantly through `buy_now`.
    pub fn buy_now_eligible(&self) -> bool {
        matches!(self, Self::Fixed | Self::DutchAuction | Self::Bundle)
    }

    /// Listing types whose end time is enforced by a settlement timer.
    pub fn timed(&self) -> bool {
        matches!(self, Self::EnglishAuction | Self::DutchAuction | Self::Bundle)
    }
}

impl std::fmt::Display for ListingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::EnglishAuction => write!(f, "english-auction"),
            Self::DutchAuction => write!(f, "dutch-auction"),
            Self::Bundle => write!(f, "bundle"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    Pending,
    Active,
    Sold,
    Expired,
    Cancelled,
}

impl ListingStatus {
    /// Sold, Expired, and Cancelled are absorbing: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sold | Self::Expired | Self::Cancelled)
    }
}

impl std::fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Sold => write!(f, "sold"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A marketplace listing.
///
/// `id` is the chain-assigned listing identifier for on-chain-originated
/// listings (globally unique across chains by construction) and a generated
/// identifier for API-originated ones. `version` is the optimistic-concurrency
/// token bumped on every committed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub token_pk: String,
    pub listing_type: ListingType,
    pub price: Decimal,
    pub start_price: Decimal,
    pub end_price: Decimal,
    pub reserve_price: Option<Decimal>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub status: ListingStatus,
    pub seller: String,
    pub version: u64,
}

impl Listing {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A member token of a bundle listing. All members must share ownership with
/// the bundle's seller at listing-creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleItem {
    pub listing_id: String,
    pub token_pk: String,
    pub quantity: u32,
}

// ─── Bid ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BidStatus {
    /// The current highest bid. At most one per listing at any time.
    Pending,
    /// Superseded by a higher bid; awaiting withdrawal by the bidder.
    Refunded,
    /// Withdrawal acknowledged, or auction expired with the bid unclaimed.
    Cancelled,
}

impl std::fmt::Display for BidStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Refunded => write!(f, "refunded"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: String,
    pub listing_id: String,
    pub bidder: String,
    pub amount: Decimal,
    pub chain_id: String,
    pub status: BidStatus,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─── Sale ─────────────────────────────────────────────────────────────────────

/// An append-only sale fact. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sale {
    pub id: String,
    pub token_pk: String,
    pub price: Decimal,
    pub seller: String,
    pub buyer: String,
    pub chain_id: String,
    pub tx_hash: String,
    pub ts: DateTime<Utc>,
    pub listing_id: String,
}

// ─── BridgeEvent ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeProtocol {
    LayerZero,
    Wormhole,
}

impl std::fmt::Display for BridgeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LayerZero => write!(f, "layerzero"),
            Self::Wormhole => write!(f, "wormhole"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeStatus {
    /// Requested through the API but not yet observed on-chain.
    Created,
    /// The initiating leg was observed; waiting for the completion leg.
    InFlight,
    Completed,
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::InFlight => write!(f, "in-flight"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// One leg-pair of a cross-chain transfer.
///
/// `message_id` is the dedup key of the initiating leg
/// (`"{tx_hash}:{log_index}"`); `completed_message_id` records the key of the
/// completing leg so replayed completion signals are no-ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub id: String,
    pub token_pk: String,
    pub src_chain: String,
    pub dst_chain: String,
    pub protocol: BridgeProtocol,
    pub message_id: String,
    pub status: BridgeStatus,
    pub fee: Decimal,
    pub completed_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
