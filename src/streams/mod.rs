//! Durable event streams with consumer groups
//!
//! Entries are appended in order per stream. A consumer group tracks the last
//! entry delivered; delivered entries stay pending for their consumer until
//! acknowledged, giving at-least-once delivery.

mod memory;
mod postgres;

pub use memory::MemoryEventStreams;
pub use postgres::PgEventStreams;

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::Event;
use crate::error::Result;

/// Per-stream limits for one batch read: an even share of `count` for every
/// stream first, then whatever is left goes to the streams in order.
pub(crate) fn batch_passes(count: usize, streams: usize) -> [Option<usize>; 2] {
    let share = if streams == 0 { 0 } else { count.div_ceil(streams) };
    [Some(share), None]
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub stream: String,
    /// Position within the stream, increasing with append order
    pub id: u64,
    pub event: Event,
}

#[async_trait]
pub trait EventStreams: Send + Sync {
    /// Append and return the entry id
    async fn append(&self, stream: &str, event: &Event) -> Result<u64>;

    /// Create the group at the start of the stream if it does not exist
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Deliver up to `count` new entries across `streams` to `consumer`,
    /// waiting at most `block` when none are available. Each stream gets a
    /// fair share of the batch so a busy stream cannot starve the others.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Entries delivered to `consumer` and not yet acknowledged
    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    async fn ack(&self, stream: &str, group: &str, id: u64) -> Result<()>;

    async fn len(&self, stream: &str) -> Result<usize>;
}
