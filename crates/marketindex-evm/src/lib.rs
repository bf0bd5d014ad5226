//! marketindex-evm — EVM log decoding and the EVM event source.
//!
//! The source polls the marketplace contract plus the two bridge contracts
//! (LayerZero ONFT, Wormhole) over a bounded block window and decodes their
//! logs into normalized [`marketindex_core::MarketEvent`]s by topic0.

pub mod decode;
pub mod source;

pub use decode::{decode_log, event_topic, EvmEventKind, RawLog, TopicTable};
pub use source::{EvmEventSource, EvmRpcClient, EvmSourceConfig};
