//! Live distribution hub.
//!
//! One `Stream` per device, each with a bounded inbound channel and a
//! broadcast thread that copies every packet into each attached consumer's
//! bounded outbound queue. All hand-offs are `try_send`: a full queue drops
//! the packet for that queue only. Producers never block on the hub and a
//! slow consumer never delays its siblings. Recording durability comes from
//! the segment store, so dropped live packets are not errors.
//!
//! Locking: the stream registry and each stream's consumer set sit behind
//! reader/writer locks that are only held for map access, never across I/O.

mod consumer;
mod stream;

pub use consumer::{ConsumerKind, ConsumerStatus};
pub use stream::{Attachment, Stream};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Queue capacities, in packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HubSettings {
    pub stream_capacity: usize,
    pub consumer_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            stream_capacity: 100,
            consumer_capacity: 100,
        }
    }
}

/// One `/status` entry. `dropped` counts packets lost on the inbound queue;
/// per-consumer losses are listed under `consumers`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub consumer_count: usize,
    pub active: bool,
    pub published: u64,
    pub dropped: u64,
    pub consumers: Vec<ConsumerStatus>,
}

/// Registry of live streams, shared by ingestion sessions and attach points.
#[derive(Default)]
pub struct DistributionHub {
    settings: HubSettings,
    streams: RwLock<HashMap<String, Arc<Stream>>>,
    closed: AtomicBool,
}

impl DistributionHub {
    pub fn new(settings: HubSettings) -> Self {
        Self {
            settings,
            streams: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn get_or_create_stream(&self, id: &str) -> Result<Arc<Stream>> {
        if let Some(stream) = self.streams.read().get(id) {
            return Ok(stream.clone());
        }
        let mut streams = self.streams.write();
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("hub is shut down"));
        }
        if let Some(stream) = streams.get(id) {
            return Ok(stream.clone());
        }
        let stream = Stream::spawn(id, &self.settings)?;
        streams.insert(id.to_string(), stream.clone());
        log::info!("hub: stream {} created", id);
        Ok(stream)
    }

    pub fn get_stream(&self, id: &str) -> Option<Arc<Stream>> {
        self.streams.read().get(id).cloned()
    }

    /// Remove a stream, stopping its broadcaster and cancelling its
    /// consumers. Returns false when no such stream exists.
    pub fn remove_stream(&self, id: &str) -> bool {
        let removed = self.streams.write().remove(id);
        match removed {
            Some(stream) => {
                stream.shutdown();
                true
            }
            None => false,
        }
    }

    /// Publish to `id`, creating the stream on first use.
    pub fn publish(&self, id: &str, packet: Bytes) -> Result<bool> {
        Ok(self.get_or_create_stream(id)?.publish(packet))
    }

    /// Snapshot of every stream: `{id: {consumerCount, active, ...}}`.
    pub fn status(&self) -> BTreeMap<String, StreamStatus> {
        self.streams
            .read()
            .iter()
            .map(|(id, stream)| {
                (
                    id.clone(),
                    StreamStatus {
                        consumer_count: stream.consumer_count(),
                        active: stream.is_active(),
                        published: stream.published(),
                        dropped: stream.dropped(),
                        consumers: stream.consumers(),
                    },
                )
            })
            .collect()
    }

    /// Remove every stream. Later `get_or_create_stream` calls fail.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Arc<Stream>> = self.streams.write().drain().map(|(_, s)| s).collect();
        for stream in drained {
            stream.shutdown();
        }
    }
}
