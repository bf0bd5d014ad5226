//! The EVM event source.
//!
//! Polls the marketplace contract and the two bridge contracts (each
//! optional) over a capped block window, decodes their logs, and returns
//! them in source order. The RPC client is a trait so transports stay
//! pluggable and tests run against scripted clients.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use marketindex_core::error::MarketError;
use marketindex_core::event::MarketEvent;
use marketindex_core::source::{clamp_window, EventSource, SourceBatch};

use crate::decode::{decode_log, RawLog, TopicTable};

/// Trait for reading blocks and logs from an EVM JSON-RPC provider.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, MarketError>;

    async fn logs(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, MarketError>;
}

/// Configuration for one EVM chain source.
#[derive(Debug, Clone)]
pub struct EvmSourceConfig {
    /// Chain slug (e.g. `"1"`, `"137"`, `"42161"`).
    pub chain_id: String,
    pub marketplace_address: Option<String>,
    /// LayerZero ONFT bridge contract.
    pub onft_address: Option<String>,
    /// Wormhole bridge contract.
    pub wormhole_address: Option<String>,
    /// First block to index when no cursor exists.
    pub start_block: u64,
    /// Window cap per fetch, in blocks.
    pub max_blocks_per_fetch: u64,
    /// Bound on each RPC call before it counts as unavailable.
    pub rpc_timeout: Duration,
}

impl EvmSourceConfig {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            marketplace_address: None,
            onft_address: None,
            wormhole_address: None,
            start_block: 0,
            max_blocks_per_fetch: 1000,
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

/// [`EventSource`] over an EVM chain.
pub struct EvmEventSource<C> {
    config: EvmSourceConfig,
    client: C,
    topics: TopicTable,
    source_id: String,
}

impl<C: EvmRpcClient> EvmEventSource<C> {
    pub fn new(config: EvmSourceConfig, client: C) -> Self {
        let source_id = format!("indexer-{}", config.chain_id);
        Self {
            config,
            client,
            topics: TopicTable::new(),
            source_id,
        }
    }

    fn addresses(&self) -> impl Iterator<Item = &String> {
        self.config
            .marketplace_address
            .iter()
            .chain(self.config.onft_address.iter())
            .chain(self.config.wormhole_address.iter())
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
}

#[async_trait]
impl<C: EvmRpcClient> EventSource for EvmEventSource<C> {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn start_position(&self) -> u64 {
        self.config.start_block
    }

    fn is_configured(&self) -> bool {
        self.addresses().next().is_some()
    }

    async fn fetch(&self, from: u64) -> Result<SourceBatch, MarketError> {
        let head = self.bounded(self.client.block_number()).await?;
        let Some((from, to)) = clamp_window(from, head, self.config.max_blocks_per_fetch) else {
            return Ok(SourceBatch::up_to_date(from));
        };

        let mut decoded: Vec<(u64, u32, MarketEvent)> = Vec::new();
        for address in self.addresses() {
            let logs = self.bounded(self.client.logs(address, from, to)).await?;
            for log in logs {
                match decode_log(&self.config.chain_id, &log, &self.topics) {
                    Ok(Some(event)) => decoded.push((log.block_number, log.log_index, event)),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            chain = %self.config.chain_id,
                            tx = %log.tx_hash,
                            error = %err,
                            "skipping malformed log"
                        );
                    }
                }
            }
        }
        // Batches apply in source order even when logs span several
        // contracts.
        decoded.sort_by_key(|(block, index, _)| (*block, *index));

        Ok(SourceBatch {
            events: decoded.into_iter().map(|(_, _, event)| event).collect(),
            next_position: to + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testenc::{addr_word, word};
    use crate::decode::{event_topic, EvmEventKind, EVENT_SIGNATURES};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn sig(kind: EvmEventKind) -> &'static str {
        EVENT_SIGNATURES
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, s)| *s)
            .unwrap()
    }

    struct MockClient {
        head: u64,
        logs: HashMap<String, Vec<RawLog>>,
        ranges: Mutex<Vec<(u64, u64)>>,
        fail: bool,
    }

    impl MockClient {
        fn new(head: u64) -> Self {
            Self {
                head,
                logs: HashMap::new(),
                ranges: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl EvmRpcClient for MockClient {
        async fn block_number(&self) -> Result<u64, MarketError> {
            if self.fail {
                return Err(MarketError::SourceUnavailable {
                    reason: "rpc down".into(),
                });
            }
            Ok(self.head)
        }

        async fn logs(
            &self,
            address: &str,
            from_block: u64,
            to_block: u64,
        ) -> Result<Vec<RawLog>, MarketError> {
            self.ranges.lock().unwrap().push((from_block, to_block));
            Ok(self
                .logs
                .get(address)
                .map(|logs| {
                    logs.iter()
                        .filter(|l| l.block_number >= from_block && l.block_number <= to_block)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn cancel_log(block: u64, index: u32) -> RawLog {
        RawLog {
            address: "0xmarket".into(),
            topics: vec![
                event_topic(sig(EvmEventKind::ListingCancelled)),
                format!("0x{}", "ab".repeat(32)),
            ],
            data: "0x".into(),
            block_number: block,
            tx_hash: format!("0xtx{block}"),
            log_index: index,
        }
    }

    fn transfer_log(block: u64, index: u32) -> RawLog {
        RawLog {
            address: "0xonft".into(),
            topics: vec![
                event_topic(sig(EvmEventKind::Transfer)),
                addr_word("0x1111111111111111111111111111111111111111"),
                addr_word("0x2222222222222222222222222222222222222222"),
                word(5),
            ],
            data: "0x".into(),
            block_number: block,
            tx_hash: format!("0xtr{block}"),
            log_index: index,
        }
    }

    fn source_with(client: MockClient) -> EvmEventSource<MockClient> {
        let mut config = EvmSourceConfig::new("1");
        config.marketplace_address = Some("0xmarket".into());
        config.onft_address = Some("0xonft".into());
        EvmEventSource::new(config, client)
    }

    #[tokio::test]
    async fn fetch_caps_window_and_advances() {
        let client = MockClient::new(5000);
        let source = source_with(client);

        let batch = source.fetch(100).await.unwrap();
        assert_eq!(batch.next_position, 1100); // 1000-block cap

        let ranges = source.client.ranges.lock().unwrap().clone();
        assert!(ranges.iter().all(|(from, to)| (*from, *to) == (100, 1099)));
    }

    #[tokio::test]
    async fn fetch_orders_events_across_contracts() {
        let mut client = MockClient::new(200);
        client
            .logs
            .insert("0xmarket".into(), vec![cancel_log(105, 0)]);
        client
            .logs
            .insert("0xonft".into(), vec![transfer_log(101, 2)]);
        let source = source_with(client);

        let batch = source.fetch(100).await.unwrap();
        assert_eq!(batch.events.len(), 2);
        assert!(matches!(batch.events[0], MarketEvent::Transfer { .. }));
        assert!(matches!(batch.events[1], MarketEvent::ListingCancelled { .. }));
        assert_eq!(batch.next_position, 201);
    }

    #[tokio::test]
    async fn fetch_up_to_date_when_past_head() {
        let source = source_with(MockClient::new(99));
        let batch = source.fetch(100).await.unwrap();
        assert!(batch.events.is_empty());
        assert_eq!(batch.next_position, 100);
    }

    #[tokio::test]
    async fn fetch_propagates_source_unavailable() {
        let mut client = MockClient::new(200);
        client.fail = true;
        let source = source_with(client);
        assert!(matches!(
            source.fetch(100).await,
            Err(MarketError::SourceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn malformed_logs_are_skipped() {
        let mut client = MockClient::new(200);
        let mut broken = cancel_log(101, 0);
        broken.topics.truncate(1); // listing id topic missing
        client
            .logs
            .insert("0xmarket".into(), vec![broken, cancel_log(102, 0)]);
        let source = source_with(client);

        let batch = source.fetch(100).await.unwrap();
        assert_eq!(batch.events.len(), 1);
    }

    #[test]
    fn unconfigured_without_addresses() {
        let source = EvmEventSource::new(EvmSourceConfig::new("1"), MockClient::new(0));
        assert!(!source.is_configured());
    }
}
