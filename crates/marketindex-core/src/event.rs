//! The normalized chain event model.
//!
//! Every chain-specific source decodes raw logs/transactions into
//! [`MarketEvent`] values. Adding a new event kind extends the enum and the
//! compiler forces every dispatch site (applier, sources) to handle it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{BridgeProtocol, ListingType};

/// Where an event came from. Sufficient to build a natural idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Chain slug (e.g. `"1"`, `"137"`, `"solana"`).
    pub chain_id: String,
    /// Transaction hash or signature.
    pub tx_hash: String,
    /// Log index within the transaction block (sequence index on
    /// account-model chains).
    pub log_index: u32,
}

impl Provenance {
    pub fn new(chain_id: impl Into<String>, tx_hash: impl Into<String>, log_index: u32) -> Self {
        Self {
            chain_id: chain_id.into(),
            tx_hash: tx_hash.into(),
            log_index,
        }
    }

    /// The natural idempotency key for anything derived from this event.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.tx_hash, self.log_index)
    }
}

/// A normalized marketplace/bridge event observed on some chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    ListingCreated {
        meta: Provenance,
        listing_id: String,
        seller: String,
        token_contract: String,
        token_id: String,
        price: Decimal,
        listing_type: ListingType,
    },
    BidPlaced {
        meta: Provenance,
        listing_id: String,
        bidder: String,
        amount: Decimal,
    },
    SaleSettled {
        meta: Provenance,
        listing_id: String,
        buyer: String,
        amount: Decimal,
    },
    ListingCancelled {
        meta: Provenance,
        listing_id: String,
    },
    AuctionExtended {
        meta: Provenance,
        listing_id: String,
        new_end_ts: DateTime<Utc>,
    },
    Transfer {
        meta: Provenance,
        token_contract: String,
        from: String,
        to: String,
        token_id: String,
    },
    BridgeInitiated {
        meta: Provenance,
        protocol: BridgeProtocol,
        token_contract: String,
        token_id: String,
        sender: String,
        dst_chain: String,
        burn_mint: bool,
        metadata_uri: String,
    },
    BridgeCompleted {
        meta: Provenance,
        protocol: BridgeProtocol,
        token_contract: String,
        token_id: String,
        receiver: String,
        src_chain: String,
        metadata_uri: String,
    },
}

impl MarketEvent {
    pub fn meta(&self) -> &Provenance {
        match self {
            Self::ListingCreated { meta, .. }
            | Self::BidPlaced { meta, .. }
            | Self::SaleSettled { meta, .. }
            | Self::ListingCancelled { meta, .. }
            | Self::AuctionExtended { meta, .. }
            | Self::Transfer { meta, .. }
            | Self::BridgeInitiated { meta, .. }
            | Self::BridgeCompleted { meta, .. } => meta,
        }
    }

    /// Stable kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ListingCreated { .. } => "listing-created",
            Self::BidPlaced { .. } => "bid-placed",
            Self::SaleSettled { .. } => "sale-settled",
            Self::ListingCancelled { .. } => "listing-cancelled",
            Self::AuctionExtended { .. } => "auction-extended",
            Self::Transfer { .. } => "transfer",
            Self::BridgeInitiated { .. } => "bridge-initiated",
            Self::BridgeCompleted { .. } => "bridge-completed",
        }
    }
}
