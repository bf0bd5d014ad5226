//! marketindex-core — foundation of the multi-chain marketplace indexer.
//!
//! # Architecture
//!
//! ```text
//! Indexer → ChainPoller (one per source)
//!               ├── EventSource    (EVM / account-model chains)
//!               ├── EventApplier   (idempotent domain mutations)
//!               ├── CursorStore    (resume positions, advance-after-apply)
//!               └── MarketStore    (domain entities + atomic write batches)
//! ```
//!
//! The lifecycle scheduler and bid/settlement engine live in
//! `marketindex-market`; storage backends in `marketindex-storage`.

pub mod apply;
pub mod cursor;
pub mod error;
pub mod event;
pub mod poller;
pub mod retry;
pub mod source;
pub mod store;
pub mod types;

pub use apply::EventApplier;
pub use cursor::{Cursor, CursorStore, MemoryCursorStore};
pub use error::MarketError;
pub use event::{MarketEvent, Provenance};
pub use poller::{ChainPoller, Indexer, IndexerConfig, PollOutcome};
pub use retry::{retry_transient, RetryConfig, RetryPolicy};
pub use source::{EventSource, SourceBatch};
pub use store::{ListingPatch, MarketStore, WriteBatch, WriteOp};
pub use types::{
    Bid, BidStatus, BridgeEvent, BridgeProtocol, BridgeStatus, BundleItem, Collection, Listing,
    ListingStatus, ListingType, Sale, Token, User, UserRole,
};
