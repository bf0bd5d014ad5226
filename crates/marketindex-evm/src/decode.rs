//! EVM log decoding.
//!
//! Logs are matched by topic0 — the keccak-256 hash of the event signature,
//! computed once at startup — and decoded with plain 32-byte word slicing:
//! indexed parameters come from topics, the rest from the ABI-encoded data
//! section. Logs that are too short for their kind decode to
//! [`MarketError::Malformed`]; callers log and skip them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use marketindex_core::error::MarketError;
use marketindex_core::event::{MarketEvent, Provenance};
use marketindex_core::types::{BridgeProtocol, ListingType};

/// A raw EVM log, already stripped of RPC encoding quirks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u32,
}

/// The event kinds the marketplace and bridge contracts emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvmEventKind {
    ListingCreated,
    BidPlaced,
    SaleSettled,
    ListingCancelled,
    Transfer,
    AuctionExtended,
    BridgeInitiated,
    BridgeReceived,
    WormholeInitiated,
    WormholeCompleted,
}

/// Canonical event signatures, as emitted by the deployed contracts.
pub const EVENT_SIGNATURES: &[(EvmEventKind, &str)] = &[
    (
        EvmEventKind::ListingCreated,
        "ListingCreated(bytes32,address,address,uint256,uint256,uint8)",
    ),
    (EvmEventKind::BidPlaced, "BidPlaced(bytes32,address,uint256)"),
    (EvmEventKind::SaleSettled, "SaleSettled(bytes32,address,uint256)"),
    (EvmEventKind::ListingCancelled, "ListingCancelled(bytes32)"),
    (EvmEventKind::Transfer, "Transfer(address,address,uint256)"),
    (EvmEventKind::AuctionExtended, "AuctionExtended(bytes32,uint64)"),
    (
        EvmEventKind::BridgeInitiated,
        "BridgeInitiated(address,uint16,address,uint256,bool,string,bytes)",
    ),
    (
        EvmEventKind::BridgeReceived,
        "BridgeReceived(uint16,address,uint256,bool,string)",
    ),
    (
        EvmEventKind::WormholeInitiated,
        "WormholeTransferInitiated(address,uint16,address,uint256,string)",
    ),
    (
        EvmEventKind::WormholeCompleted,
        "WormholeTransferCompleted(uint16,address,address,uint256,string)",
    ),
];

fn keccak256(bytes: &[u8]) -> [u8; 32] {
    use tiny_keccak::{Hasher, Keccak};
    let mut k = Keccak::v256();
    k.update(bytes);
    let mut out = [0u8; 32];
    k.finalize(&mut out);
    out
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// topic0 for an event signature: `0x` + keccak-256 of the signature text.
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex_encode(&keccak256(signature.as_bytes())))
}

/// topic0 → event kind lookup, built once per source.
pub struct TopicTable {
    map: HashMap<String, EvmEventKind>,
}

impl TopicTable {
    pub fn new() -> Self {
        let map = EVENT_SIGNATURES
            .iter()
            .map(|(kind, signature)| (event_topic(signature), *kind))
            .collect();
        Self { map }
    }

    pub fn kind_of(&self, topic0: &str) -> Option<EvmEventKind> {
        self.map.get(&topic0.to_lowercase()).copied()
    }
}

impl Default for TopicTable {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Word-level helpers ───────────────────────────────────────────────────────

fn malformed(what: impl Into<String>) -> MarketError {
    MarketError::Malformed(what.into())
}

fn strip0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

fn topic_at<'a>(log: &'a RawLog, index: usize) -> Result<&'a str, MarketError> {
    log.topics
        .get(index)
        .map(|t| strip0x(t))
        .ok_or_else(|| malformed(format!("missing topic {index}")))
}

fn data_word(data: &str, index: usize) -> Result<&str, MarketError> {
    let data = strip0x(data);
    let start = index * 64;
    data.get(start..start + 64)
        .ok_or_else(|| malformed(format!("data too short for word {index}")))
}

fn word_u128(word: &str) -> Result<u128, MarketError> {
    if word.len() != 64 {
        return Err(malformed(format!("bad word length {}", word.len())));
    }
    if word[..32].bytes().any(|b| b != b'0') {
        return Err(malformed("value exceeds 128 bits"));
    }
    u128::from_str_radix(&word[32..], 16).map_err(|e| malformed(format!("bad uint word: {e}")))
}

fn word_u64(word: &str) -> Result<u64, MarketError> {
    let value = word_u128(word)?;
    u64::try_from(value).map_err(|_| malformed("value exceeds 64 bits"))
}

fn word_bool(word: &str) -> Result<bool, MarketError> {
    Ok(word_u128(word)? != 0)
}

fn word_address(word: &str) -> Result<String, MarketError> {
    if word.len() != 64 {
        return Err(malformed(format!("bad word length {}", word.len())));
    }
    Ok(format!("0x{}", word[24..].to_lowercase()))
}

/// A full 32-byte word rendered back as `0x…` — used for `bytes32` ids.
fn word_b32(word: &str) -> Result<String, MarketError> {
    if word.len() != 64 {
        return Err(malformed(format!("bad word length {}", word.len())));
    }
    Ok(format!("0x{}", word.to_lowercase()))
}

/// Wei (scale 18) to a whole-unit decimal amount.
fn word_amount(word: &str) -> Result<Decimal, MarketError> {
    let wei = word_u128(word)?;
    let wei = i128::try_from(wei).map_err(|_| malformed("amount exceeds decimal range"))?;
    Ok(Decimal::from_i128_with_scale(wei, 18).normalize())
}

fn hex_bytes(s: &str) -> Result<Vec<u8>, MarketError> {
    if s.len() % 2 != 0 {
        return Err(malformed("odd hex length"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| malformed(format!("bad hex: {e}"))))
        .collect()
}

/// Decode a dynamic `string` parameter. `offset_word` is the index of the
/// head word holding the byte offset of the string's length word.
fn dyn_string(data: &str, offset_word: usize) -> Result<String, MarketError> {
    let data = strip0x(data);
    let offset = word_u128(data_word(data, offset_word)?)? as usize;
    let length_start = offset * 2;
    let length_word = data
        .get(length_start..length_start + 64)
        .ok_or_else(|| malformed("string offset out of range"))?;
    let length = word_u128(length_word)? as usize;
    let body_start = length_start + 64;
    let body = data
        .get(body_start..body_start + length * 2)
        .ok_or_else(|| malformed("string body out of range"))?;
    Ok(String::from_utf8_lossy(&hex_bytes(body)?).into_owned())
}

fn timestamp_secs(word: &str) -> Result<DateTime<Utc>, MarketError> {
    let secs = word_u64(word)? as i64;
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| malformed("timestamp out of range"))
}

// ─── Log → event ─────────────────────────────────────────────────────────────

/// Decode one log into a normalized event. Unknown topic0 values return
/// `Ok(None)`; structurally broken logs of a known kind are `Malformed`.
pub fn decode_log(
    chain_id: &str,
    log: &RawLog,
    topics: &TopicTable,
) -> Result<Option<MarketEvent>, MarketError> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    let Some(kind) = topics.kind_of(topic0) else {
        return Ok(None);
    };

    let meta = Provenance::new(chain_id, log.tx_hash.to_lowercase(), log.log_index);
    let contract = log.address.to_lowercase();

    let event = match kind {
        EvmEventKind::ListingCreated => MarketEvent::ListingCreated {
            meta,
            listing_id: word_b32(topic_at(log, 1)?)?,
            seller: word_address(topic_at(log, 2)?)?,
            token_contract: word_address(topic_at(log, 3)?)?,
            token_id: word_u128(data_word(&log.data, 0)?)?.to_string(),
            price: word_amount(data_word(&log.data, 1)?)?,
            listing_type: ListingType::from_code(word_u64(data_word(&log.data, 2)?)? as u8),
        },
        EvmEventKind::BidPlaced => MarketEvent::BidPlaced {
            meta,
            listing_id: word_b32(topic_at(log, 1)?)?,
            bidder: word_address(topic_at(log, 2)?)?,
            amount: word_amount(data_word(&log.data, 0)?)?,
        },
        EvmEventKind::SaleSettled => MarketEvent::SaleSettled {
            meta,
            listing_id: word_b32(topic_at(log, 1)?)?,
            buyer: word_address(topic_at(log, 2)?)?,
            amount: word_amount(data_word(&log.data, 0)?)?,
        },
        EvmEventKind::ListingCancelled => MarketEvent::ListingCancelled {
            meta,
            listing_id: word_b32(topic_at(log, 1)?)?,
        },
        EvmEventKind::Transfer => MarketEvent::Transfer {
            meta,
            token_contract: contract,
            from: word_address(topic_at(log, 1)?)?,
            to: word_address(topic_at(log, 2)?)?,
            token_id: word_u128(topic_at(log, 3)?)?.to_string(),
        },
        EvmEventKind::AuctionExtended => MarketEvent::AuctionExtended {
            meta,
            listing_id: word_b32(topic_at(log, 1)?)?,
            new_end_ts: timestamp_secs(data_word(&log.data, 0)?)?,
        },
        EvmEventKind::BridgeInitiated => MarketEvent::BridgeInitiated {
            meta,
            protocol: BridgeProtocol::LayerZero,
            token_contract: contract,
            token_id: word_u128(data_word(&log.data, 0)?)?.to_string(),
            sender: word_address(topic_at(log, 1)?)?,
            dst_chain: word_u64(topic_at(log, 2)?)?.to_string(),
            burn_mint: word_bool(data_word(&log.data, 1)?)?,
            metadata_uri: dyn_string(&log.data, 2)?,
        },
        EvmEventKind::BridgeReceived => MarketEvent::BridgeCompleted {
            meta,
            protocol: BridgeProtocol::LayerZero,
            token_contract: contract,
            token_id: word_u128(data_word(&log.data, 0)?)?.to_string(),
            receiver: word_address(topic_at(log, 2)?)?,
            src_chain: word_u64(topic_at(log, 1)?)?.to_string(),
            metadata_uri: dyn_string(&log.data, 2)?,
        },
        EvmEventKind::WormholeInitiated => MarketEvent::BridgeInitiated {
            meta,
            protocol: BridgeProtocol::Wormhole,
            token_contract: word_address(topic_at(log, 3)?)?,
            token_id: word_u128(data_word(&log.data, 0)?)?.to_string(),
            sender: word_address(topic_at(log, 1)?)?,
            dst_chain: word_u64(topic_at(log, 2)?)?.to_string(),
            burn_mint: false,
            metadata_uri: dyn_string(&log.data, 1)?,
        },
        EvmEventKind::WormholeCompleted => MarketEvent::BridgeCompleted {
            meta,
            protocol: BridgeProtocol::Wormhole,
            token_contract: word_address(topic_at(log, 3)?)?,
            token_id: word_u128(data_word(&log.data, 0)?)?.to_string(),
            receiver: word_address(topic_at(log, 2)?)?,
            src_chain: word_u64(topic_at(log, 1)?)?.to_string(),
            metadata_uri: dyn_string(&log.data, 1)?,
        },
    };
    Ok(Some(event))
}

// ─── Test encoding helpers ───────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testenc {
    /// A 32-byte word from a u128 value.
    pub fn word(value: u128) -> String {
        format!("{value:064x}")
    }

    /// A 32-byte word from an address.
    pub fn addr_word(address: &str) -> String {
        let bare = address.strip_prefix("0x").unwrap_or(address);
        format!("{:0>64}", bare.to_lowercase())
    }

    /// ABI-encode a dynamic string tail: length word + padded body.
    pub fn string_tail(s: &str) -> String {
        let hex: String = s.bytes().map(|b| format!("{b:02x}")).collect();
        let padded_len = (hex.len() + 63) / 64 * 64;
        format!("{}{:0<width$}", word(s.len() as u128), hex, width = padded_len)
    }
}

#[cfg(test)]
mod tests {
    use super::testenc::*;
    use super::*;

    fn log(topics: Vec<String>, data: String) -> RawLog {
        RawLog {
            address: "0xMarket".into(),
            topics,
            data: format!("0x{data}"),
            block_number: 100,
            tx_hash: "0xTx".into(),
            log_index: 3,
        }
    }

    fn sig(kind: EvmEventKind) -> &'static str {
        EVENT_SIGNATURES
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, s)| *s)
            .unwrap()
    }

    #[test]
    fn topic_table_is_complete_and_distinct() {
        let table = TopicTable::new();
        for (kind, signature) in EVENT_SIGNATURES {
            let topic = event_topic(signature);
            assert_eq!(topic.len(), 66);
            assert!(topic.starts_with("0x"));
            assert_eq!(table.kind_of(&topic), Some(*kind));
            assert_eq!(table.kind_of(&topic.to_uppercase().replace("0X", "0x")), Some(*kind));
        }
        assert_eq!(table.map.len(), EVENT_SIGNATURES.len());
    }

    #[test]
    fn decode_listing_created() {
        let listing_id = format!("0x{}", "ab".repeat(32));
        let topics = vec![
            event_topic(sig(EvmEventKind::ListingCreated)),
            listing_id.clone(),
            addr_word("0xSELLER00000000000000000000000000000000aa"),
            addr_word("0xC0FFEE0000000000000000000000000000000bb"),
        ];
        let data = format!(
            "{}{}{}",
            word(42),                            // tokenId
            word(1_500_000_000_000_000_000),     // 1.5 ether in wei
            word(1),                             // english auction
        );
        let table = TopicTable::new();
        let event = decode_log("1", &log(topics, data), &table).unwrap().unwrap();

        match event {
            MarketEvent::ListingCreated {
                meta,
                listing_id: id,
                seller,
                token_id,
                price,
                listing_type,
                ..
            } => {
                assert_eq!(meta.chain_id, "1");
                assert_eq!(meta.tx_hash, "0xtx");
                assert_eq!(meta.log_index, 3);
                assert_eq!(id, listing_id);
                assert!(seller.starts_with("0x"));
                assert_eq!(seller.len(), 42);
                assert_eq!(token_id, "42");
                assert_eq!(price, "1.5".parse().unwrap());
                assert_eq!(listing_type, ListingType::EnglishAuction);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn decode_transfer_from_topics_only() {
        let topics = vec![
            event_topic(sig(EvmEventKind::Transfer)),
            addr_word("0x1111111111111111111111111111111111111111"),
            addr_word("0x2222222222222222222222222222222222222222"),
            word(7),
        ];
        let table = TopicTable::new();
        let event = decode_log("137", &log(topics, String::new()), &table)
            .unwrap()
            .unwrap();
        match event {
            MarketEvent::Transfer {
                token_contract,
                from,
                to,
                token_id,
                ..
            } => {
                assert_eq!(token_contract, "0xmarket"); // emitting contract
                assert_eq!(from, "0x1111111111111111111111111111111111111111");
                assert_eq!(to, "0x2222222222222222222222222222222222222222");
                assert_eq!(token_id, "7");
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn decode_auction_extended_timestamp() {
        let topics = vec![
            event_topic(sig(EvmEventKind::AuctionExtended)),
            format!("0x{}", "cd".repeat(32)),
        ];
        let data = word(1_700_000_000);
        let table = TopicTable::new();
        let event = decode_log("1", &log(topics, data), &table).unwrap().unwrap();
        match event {
            MarketEvent::AuctionExtended { new_end_ts, .. } => {
                assert_eq!(new_end_ts.timestamp(), 1_700_000_000);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn decode_bridge_initiated_with_dynamic_uri() {
        let topics = vec![
            event_topic(sig(EvmEventKind::BridgeInitiated)),
            addr_word("0xSENDER0000000000000000000000000000000001"),
            word(137), // dstChainId
            addr_word("0xRECIPIENT000000000000000000000000000002"),
        ];
        // head: tokenId, burnMint, offset(uri), offset(adapterParams)
        // tail: uri string, empty bytes
        let uri = "ipfs://meta/7";
        let uri_tail = string_tail(uri);
        let params_offset = 4 * 32 + uri_tail.len() / 2;
        let data = format!(
            "{}{}{}{}{}{}",
            word(7),
            word(1), // burnMint = true
            word(4 * 32),
            word(params_offset as u128),
            uri_tail,
            word(0), // empty adapterParams
        );
        let table = TopicTable::new();
        let event = decode_log("1", &log(topics, data), &table).unwrap().unwrap();
        match event {
            MarketEvent::BridgeInitiated {
                protocol,
                token_id,
                dst_chain,
                burn_mint,
                metadata_uri,
                ..
            } => {
                assert_eq!(protocol, BridgeProtocol::LayerZero);
                assert_eq!(token_id, "7");
                assert_eq!(dst_chain, "137");
                assert!(burn_mint);
                assert_eq!(metadata_uri, uri);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn decode_wormhole_completed() {
        let topics = vec![
            event_topic(sig(EvmEventKind::WormholeCompleted)),
            word(1), // srcChainId
            addr_word("0xRECEIVER00000000000000000000000000000003"),
            addr_word("0xTOKEN000000000000000000000000000000000004"),
        ];
        let uri_tail = string_tail("ipfs://x");
        let data = format!("{}{}{}", word(9), word(2 * 32), uri_tail);
        let table = TopicTable::new();
        let event = decode_log("137", &log(topics, data), &table).unwrap().unwrap();
        match event {
            MarketEvent::BridgeCompleted {
                protocol,
                src_chain,
                token_id,
                metadata_uri,
                ..
            } => {
                assert_eq!(protocol, BridgeProtocol::Wormhole);
                assert_eq!(src_chain, "1");
                assert_eq!(token_id, "9");
                assert_eq!(metadata_uri, "ipfs://x");
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn unknown_topic_is_skipped_not_malformed() {
        let table = TopicTable::new();
        let result = decode_log(
            "1",
            &log(vec![format!("0x{}", "ee".repeat(32))], String::new()),
            &table,
        );
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn short_data_is_malformed() {
        let topics = vec![
            event_topic(sig(EvmEventKind::BidPlaced)),
            format!("0x{}", "ab".repeat(32)),
            addr_word("0xBIDDER0000000000000000000000000000000005"),
        ];
        let result = decode_log("1", &log(topics, "beef".into()), &TopicTable::new());
        assert!(matches!(result, Err(MarketError::Malformed(_))));
    }

    #[test]
    fn missing_topics_are_malformed() {
        let topics = vec![event_topic(sig(EvmEventKind::BidPlaced))];
        let result = decode_log("1", &log(topics, word(1)), &TopicTable::new());
        assert!(matches!(result, Err(MarketError::Malformed(_))));
    }
}
