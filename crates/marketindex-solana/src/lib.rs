//! marketindex-solana — event source for account-model chains.
//!
//! Unlike EVM chains there is no block-range log query: the source lists
//! recent transaction signatures for the marketplace program, filters out
//! slots at or below the cursor, and parses marketplace events out of each
//! transaction's program logs. The cursor position is a slot watermark.
//!
//! Events are emitted by the on-chain program as JSON log lines:
//!
//! ```text
//! Program log: MARKET_EVENT:{"kind":"bid_placed","listing_id":"…","bidder":"…","amount":"2.5"}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use marketindex_core::error::MarketError;
use marketindex_core::event::{MarketEvent, Provenance};
use marketindex_core::source::{EventSource, SourceBatch};
use marketindex_core::types::ListingType;

/// Prefix the marketplace program uses for its event log lines.
pub const EVENT_LOG_PREFIX: &str = "Program log: MARKET_EVENT:";

/// A confirmed signature entry, newest first as returned by RPC.
#[derive(Debug, Clone)]
pub struct SignatureInfo {
    pub slot: u64,
    pub signature: String,
}

/// Trait for the two RPC reads the source needs.
#[async_trait]
pub trait SolanaRpcClient: Send + Sync {
    /// Most recent signatures involving `program`, newest first.
    async fn signatures_for(
        &self,
        program: &str,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>, MarketError>;

    /// The program log lines of one confirmed transaction.
    async fn transaction_logs(&self, signature: &str) -> Result<Vec<String>, MarketError>;
}

/// The wire shape of one program-emitted event.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireEvent {
    ListingCreated {
        listing_id: String,
        seller: String,
        token_contract: String,
        token_id: String,
        price: String,
        listing_type: u8,
    },
    BidPlaced {
        listing_id: String,
        bidder: String,
        amount: String,
    },
    SaleSettled {
        listing_id: String,
        buyer: String,
        amount: String,
    },
    ListingCancelled {
        listing_id: String,
    },
    AuctionExtended {
        listing_id: String,
        new_end_ts: i64,
    },
    Transfer {
        token_contract: String,
        from: String,
        to: String,
        token_id: String,
    },
}

fn parse_amount(s: &str) -> Result<Decimal, MarketError> {
    s.parse::<Decimal>()
        .map_err(|e| MarketError::Malformed(format!("bad amount {s:?}: {e}")))
}

fn normalize(wire: WireEvent, meta: Provenance) -> Result<MarketEvent, MarketError> {
    Ok(match wire {
        WireEvent::ListingCreated {
            listing_id,
            seller,
            token_contract,
            token_id,
            price,
            listing_type,
        } => MarketEvent::ListingCreated {
            meta,
            listing_id,
            seller,
            token_contract,
            token_id,
            price: parse_amount(&price)?,
            listing_type: ListingType::from_code(listing_type),
        },
        WireEvent::BidPlaced {
            listing_id,
            bidder,
            amount,
        } => MarketEvent::BidPlaced {
            meta,
            listing_id,
            bidder,
            amount: parse_amount(&amount)?,
        },
        WireEvent::SaleSettled {
            listing_id,
            buyer,
            amount,
        } => MarketEvent::SaleSettled {
            meta,
            listing_id,
            buyer,
            amount: parse_amount(&amount)?,
        },
        WireEvent::ListingCancelled { listing_id } => {
            MarketEvent::ListingCancelled { meta, listing_id }
        }
        WireEvent::AuctionExtended {
            listing_id,
            new_end_ts,
        } => MarketEvent::AuctionExtended {
            meta,
            listing_id,
            new_end_ts: DateTime::from_timestamp(new_end_ts, 0)
                .ok_or_else(|| MarketError::Malformed("end timestamp out of range".into()))?,
        },
        WireEvent::Transfer {
            token_contract,
            from,
            to,
            token_id,
        } => MarketEvent::Transfer {
            meta,
            token_contract,
            from,
            to,
            token_id,
        },
    })
}

/// Configuration for one account-model chain source.
#[derive(Debug, Clone)]
pub struct SolanaSourceConfig {
    pub chain_id: String,
    pub program_address: Option<String>,
    /// Signature page size per fetch.
    pub signature_limit: usize,
    pub rpc_timeout: Duration,
}

impl SolanaSourceConfig {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            program_address: None,
            signature_limit: 100,
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for SolanaSourceConfig {
    fn default() -> Self {
        Self::new("solana")
    }
}

/// [`EventSource`] over an account-model chain.
pub struct SolanaEventSource<C> {
    config: SolanaSourceConfig,
    client: C,
    source_id: String,
}

impl<C: SolanaRpcClient> SolanaEventSource<C> {
    pub fn new(config: SolanaSourceConfig, client: C) -> Self {
        let source_id = format!("indexer-{}", config.chain_id);
        Self {
            config,
            client,
            source_id,
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, MarketError>>,
    ) -> Result<T, MarketError> {
        match tokio::time::timeout(self.config.rpc_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MarketError::SourceUnavailable {
                reason: format!("rpc call exceeded {:?}", self.config.rpc_timeout),
            }),
        }
    }

    fn parse_logs(&self, signature: &str, logs: &[String]) -> Vec<MarketEvent> {
        let mut events = Vec::new();
        for (index, line) in logs.iter().enumerate() {
            let Some(payload) = line.strip_prefix(EVENT_LOG_PREFIX) else {
                continue;
            };
            let meta = Provenance::new(&self.config.chain_id, signature, index as u32);
            let parsed = serde_json::from_str::<WireEvent>(payload)
                .map_err(|e| MarketError::Malformed(format!("bad event json: {e}")))
                .and_then(|wire| normalize(wire, meta));
            match parsed {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(signature, error = %err, "skipping malformed program event");
                }
            }
        }
        events
    }
}

#[async_trait]
impl<C: SolanaRpcClient> EventSource for SolanaEventSource<C> {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn start_position(&self) -> u64 {
        0
    }

    fn is_configured(&self) -> bool {
        self.config.program_address.is_some()
    }

    async fn fetch(&self, from: u64) -> Result<SourceBatch, MarketError> {
        let Some(program) = self.config.program_address.as_deref() else {
            return Ok(SourceBatch::up_to_date(from));
        };

        let mut signatures = self
            .bounded(self.client.signatures_for(program, self.config.signature_limit))
            .await?;
        // Slots at or above the watermark are new; RPC returns newest first.
        signatures.retain(|s| s.slot >= from);
        signatures.sort_by_key(|s| s.slot);

        let mut events = Vec::new();
        let mut max_slot = None;
        for info in &signatures {
            // A failed transaction read fails the whole window; the cursor
            // stays put and the next tick retries from the same slot.
            let logs = self.bounded(self.client.transaction_logs(&info.signature)).await?;
            events.extend(self.parse_logs(&info.signature, &logs));
            max_slot = Some(info.slot);
        }

        Ok(SourceBatch {
            events,
            next_position: max_slot.map_or(from, |slot| slot + 1),
        })
    }
}
