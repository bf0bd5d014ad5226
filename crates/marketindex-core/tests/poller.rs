//! Integration tests for the poll scheduler.
//!
//! These live under `tests/` rather than as an in-crate `#[cfg(test)] mod`
//! because they build the poller against `marketindex-storage::MemoryStore`,
//! a dev-dependency that depends back on `marketindex-core`. As an integration
//! test the crate resolves to a single compiled copy, so the trait and type
//! identities line up.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use marketindex_core::cursor::{CursorStore, MemoryCursorStore};
use marketindex_core::error::MarketError;
use marketindex_core::event::{MarketEvent, Provenance};
use marketindex_core::source::{EventSource, SourceBatch};
use marketindex_core::types::ListingType;
use marketindex_core::{ChainPoller, EventApplier, Indexer, IndexerConfig, PollOutcome};
use marketindex_storage::MemoryStore;

    /// Replays a scripted sequence of fetch results and records the `from`
    /// positions it was asked for.
    struct ScriptedSource {
        id: String,
        start: u64,
        configured: bool,
        script: Mutex<VecDeque<Result<SourceBatch, MarketError>>>,
        calls: Mutex<Vec<u64>>,
    }

    impl ScriptedSource {
        fn new(start: u64, script: Vec<Result<SourceBatch, MarketError>>) -> Self {
            Self {
                id: "indexer-test".into(),
                start,
                configured: true,
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        fn source_id(&self) -> &str {
            &self.id
        }

        fn start_position(&self) -> u64 {
            self.start
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn fetch(&self, from: u64) -> Result<SourceBatch, MarketError> {
            self.calls.lock().unwrap().push(from);
            match self.script.lock().unwrap().pop_front() {
                Some(result) => result,
                None => Ok(SourceBatch::up_to_date(from)),
            }
        }
    }

    fn listing_event(tx: &str) -> MarketEvent {
        MarketEvent::ListingCreated {
            meta: Provenance::new("1", tx, 0),
            listing_id: format!("listing-{tx}"),
            seller: "0xseller".into(),
            token_contract: "0xcafe".into(),
            token_id: "1".into(),
            price: "1".parse().unwrap(),
            listing_type: ListingType::Fixed,
        }
    }

    fn poller(source: ScriptedSource) -> (ChainPoller, Arc<MemoryStore>, Arc<MemoryCursorStore>) {
        let store = Arc::new(MemoryStore::new());
        let cursors = Arc::new(MemoryCursorStore::new());
        let poller = ChainPoller::new(
            Arc::new(source),
            EventApplier::new(Arc::clone(&store) as _),
            Arc::clone(&cursors) as _,
            Duration::from_secs(15),
        );
        (poller, store, cursors)
    }

    #[tokio::test]
    async fn tick_applies_batch_then_advances_cursor() {
        let source = ScriptedSource::new(
            100,
            vec![Ok(SourceBatch {
                events: vec![listing_event("0xt1")],
                next_position: 1100,
            })],
        );
        let (poller, store, cursors) = poller(source);

        let outcome = poller.tick().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Polled {
                events: 1,
                next_position: 1100
            }
        );
        assert_eq!(store.listing_count(), 1);
        assert_eq!(
            cursors.load("indexer-test").await.unwrap().unwrap().position,
            1100
        );
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cursor_for_next_tick() {
        let source = ScriptedSource::new(
            100,
            vec![
                Err(MarketError::SourceUnavailable {
                    reason: "rpc timeout".into(),
                }),
                Ok(SourceBatch {
                    events: vec![listing_event("0xt1")],
                    next_position: 200,
                }),
            ],
        );
        let (poller, _store, cursors) = poller(source);

        assert!(poller.tick().await.is_err());
        assert!(cursors.load("indexer-test").await.unwrap().is_none());

        // The next tick retries the same window.
        poller.tick().await.unwrap();
        assert_eq!(
            cursors.load("indexer-test").await.unwrap().unwrap().position,
            200
        );
    }

    #[tokio::test]
    async fn resumes_from_cursor_else_start_position() {
        let source = Arc::new(ScriptedSource::new(
            500,
            vec![
                Ok(SourceBatch {
                    events: vec![],
                    next_position: 800,
                }),
                Ok(SourceBatch::up_to_date(800)),
            ],
        ));
        let store = Arc::new(MemoryStore::new());
        let cursors = Arc::new(MemoryCursorStore::new());
        let poller = ChainPoller::new(
            Arc::clone(&source) as _,
            EventApplier::new(store as _),
            cursors as _,
            Duration::from_secs(15),
        );

        poller.tick().await.unwrap(); // no cursor yet → starts at 500
        poller.tick().await.unwrap(); // resumes from saved 800

        assert_eq!(*source.calls.lock().unwrap(), vec![500, 800]);
    }

    #[tokio::test]
    async fn up_to_date_tick_saves_nothing() {
        let source = ScriptedSource::new(100, vec![Ok(SourceBatch::up_to_date(100))]);
        let (poller, _store, cursors) = poller(source);

        poller.tick().await.unwrap();
        assert!(cursors.load("indexer-test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unconfigured_sources_are_skipped() {
        let mut source = ScriptedSource::new(0, vec![]);
        source.configured = false;

        let store = Arc::new(MemoryStore::new());
        let cursors = Arc::new(MemoryCursorStore::new());
        let indexer = Indexer::new(
            IndexerConfig::default(),
            vec![Arc::new(source) as Arc<dyn EventSource>],
            store as _,
            cursors as _,
        );
        assert!(indexer.pollers().is_empty());
    }
