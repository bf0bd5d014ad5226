//! The chain event source contract.

use async_trait::async_trait;

use crate::error::MarketError;
use crate::event::MarketEvent;

/// One fetched window of events.
#[derive(Debug, Default)]
pub struct SourceBatch {
    /// Events in source order (ascending position, then log index).
    pub events: Vec<MarketEvent>,
    /// The position the next fetch should start from. Always `>= from`;
    /// equal to `from` when the source had nothing new.
    pub next_position: u64,
}

impl SourceBatch {
    /// An empty batch that leaves the cursor where it was.
    pub fn up_to_date(from: u64) -> Self {
        Self {
            events: Vec::new(),
            next_position: from,
        }
    }
}

/// Abstraction over "read events from position P onwards" for one chain.
///
/// Implementations must be deterministic for a given window (replayable),
/// cap the window size per call to bound latency and RPC load, and map
/// transient read failures to [`MarketError::SourceUnavailable`] so the poll
/// scheduler retries the same window on its next tick — a failed fetch never
/// skips part of a window.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Stable identifier for this source, used as the cursor key.
    fn source_id(&self) -> &str;

    /// First position of interest when no cursor exists yet.
    fn start_position(&self) -> u64;

    /// Returns `false` when the source has no contract addresses of
    /// interest; such sources are skipped entirely by the indexer.
    fn is_configured(&self) -> bool;

    /// Fetch a bounded window of events starting at `from`.
    async fn fetch(&self, from: u64) -> Result<SourceBatch, MarketError>;
}

/// Clamp a fetch window to `max_span` positions. Returns `None` when `from`
/// is already past `head`.
pub fn clamp_window(from: u64, head: u64, max_span: u64) -> Option<(u64, u64)> {
    if from > head {
        return None;
    }
    let to = head.min(from + max_span.max(1) - 1);
    Some((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_clamped_to_span() {
        assert_eq!(clamp_window(100, 5000, 1000), Some((100, 1099)));
    }

    #[test]
    fn window_clamped_to_head() {
        assert_eq!(clamp_window(100, 150, 1000), Some((100, 150)));
    }

    #[test]
    fn window_none_when_caught_up() {
        assert_eq!(clamp_window(151, 150, 1000), None);
    }

    #[test]
    fn window_single_block() {
        assert_eq!(clamp_window(150, 150, 1), Some((150, 150)));
    }
}
