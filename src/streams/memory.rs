use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{batch_passes, EventStreams, StreamEntry};
use crate::domain::Event;
use crate::error::{OrraError, Result};

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    /// entry id -> consumer
    pending: BTreeMap<u64, String>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<(u64, Event)>>,
    groups: HashMap<(String, String), GroupState>,
}

/// In-process streams for tests and `--in-memory` runs
#[derive(Default)]
pub struct MemoryEventStreams {
    inner: Mutex<Inner>,
    appended: Notify,
}

impl MemoryEventStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event in a stream, in order
    pub async fn events(&self, stream: &str) -> Vec<Event> {
        let inner = self.inner.lock().await;
        inner
            .streams
            .get(stream)
            .map(|entries| entries.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of entries pending across all consumers of a group
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    async fn deliver_new(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut inner = self.inner.lock().await;
        let Inner { streams: data, groups } = &mut *inner;
        let mut out = Vec::new();

        for quota in batch_passes(count, streams.len()) {
            for stream in streams {
                let remaining = count.saturating_sub(out.len());
                if remaining == 0 {
                    break;
                }
                let limit = quota.map_or(remaining, |q| q.min(remaining));
                let state = groups
                    .get_mut(&(stream.clone(), group.to_string()))
                    .ok_or_else(|| {
                        OrraError::Validation(format!("no group {} on stream {}", group, stream))
                    })?;
                let Some(entries) = data.get(stream) else {
                    continue;
                };
                let start = state.last_delivered;
                for (id, event) in entries.iter().filter(|(id, _)| *id > start).take(limit) {
                    state.last_delivered = *id;
                    state.pending.insert(*id, consumer.to_string());
                    out.push(StreamEntry {
                        stream: stream.clone(),
                        id: *id,
                        event: event.clone(),
                    });
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl EventStreams for MemoryEventStreams {
    async fn append(&self, stream: &str, event: &Event) -> Result<u64> {
        let id = {
            let mut inner = self.inner.lock().await;
            let entries = inner.streams.entry(stream.to_string()).or_default();
            let id = entries.last().map(|(id, _)| id + 1).unwrap_or(1);
            entries.push((id, event.clone()));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.streams.entry(stream.to_string()).or_default();
        inner
            .groups
            .entry((stream.to_string(), group.to_string()))
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so an append between the
            // check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.deliver_new(group, consumer, streams, count).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        for stream in streams {
            let Some(state) = inner.groups.get(&(stream.clone(), group.to_string())) else {
                continue;
            };
            let Some(entries) = inner.streams.get(stream) else {
                continue;
            };
            for (id, owner) in &state.pending {
                if out.len() >= count {
                    return Ok(out);
                }
                if owner != consumer {
                    continue;
                }
                if let Some((_, event)) = entries.iter().find(|(eid, _)| eid == id) {
                    out.push(StreamEntry {
                        stream: stream.clone(),
                        id: *id,
                        event: event.clone(),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner
            .groups
            .get_mut(&(stream.to_string(), group.to_string()))
        {
            state.pending.remove(&id);
        }
        Ok(())
    }

    async fn len(&self, stream: &str) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.streams.get(stream).map(Vec::len).unwrap_or(0))
    }
}
