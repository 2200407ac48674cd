use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use super::consumer::{Consumer, ConsumerKind, ConsumerMap, ConsumerStatus};
use super::HubSettings;
use crate::shutdown::StopSignal;

/// Live fan-out channel for one device.
pub struct Stream {
    id: String,
    inbound: Sender<Bytes>,
    consumers: Arc<ConsumerMap>,
    consumer_capacity: usize,
    cancel: StopSignal,
    broadcaster: Mutex<Option<JoinHandle<()>>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Stream {
    pub(crate) fn spawn(id: &str, settings: &HubSettings) -> Result<Arc<Self>> {
        let (inbound, rx) = bounded(settings.stream_capacity);
        let consumers: Arc<ConsumerMap> = Arc::default();
        let cancel = StopSignal::new();

        let stream = Arc::new(Self {
            id: id.to_string(),
            inbound,
            consumers: consumers.clone(),
            consumer_capacity: settings.consumer_capacity,
            cancel: cancel.clone(),
            broadcaster: Mutex::new(None),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let stream_id = id.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("broadcast-{id}"))
            .spawn(move || broadcast_loop(&stream_id, rx, &consumers, &cancel))
            .with_context(|| format!("failed to spawn broadcaster for stream {id}"))?;
        *stream.broadcaster.lock() = Some(handle);
        Ok(stream)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a packet for broadcast. Never blocks: when the inbound channel
    /// is full (or the stream was removed) the packet is dropped and `false`
    /// is returned.
    pub fn publish(&self, packet: Bytes) -> bool {
        if self.cancel.is_stopped() {
            return false;
        }
        match self.inbound.try_send(packet) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Attach a consumer writing to `sink`. An existing consumer with the
    /// same id is replaced.
    pub fn attach(
        self: &Arc<Self>,
        consumer_id: impl Into<String>,
        kind: ConsumerKind,
        sink: Box<dyn Write + Send>,
    ) -> Result<Attachment> {
        if self.cancel.is_stopped() {
            return Err(anyhow!("stream {} has been removed", self.id));
        }
        let consumer_id = consumer_id.into();
        let consumer = Consumer::spawn(
            &self.id,
            consumer_id.clone(),
            kind.clone(),
            self.consumer_capacity,
            sink,
            Arc::downgrade(&self.consumers),
        )?;
        let replaced = self.consumers.write().insert(consumer_id.clone(), consumer);
        if let Some(old) = replaced {
            old.cancel();
        }
        log::info!("hub: {} consumer {} attached to {}", kind, consumer_id, self.id);
        Ok(Attachment {
            stream: Arc::downgrade(self),
            consumer_id,
        })
    }

    /// Detach and cancel a consumer. Returns false when it was not attached.
    pub fn detach(&self, consumer_id: &str) -> bool {
        let removed = self.consumers.write().remove(consumer_id);
        match removed {
            Some(consumer) => {
                consumer.cancel();
                log::info!("hub: consumer {} detached from {}", consumer_id, self.id);
                true
            }
            None => false,
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    pub fn consumer_status(&self, consumer_id: &str) -> Option<ConsumerStatus> {
        self.consumers.read().get(consumer_id).map(Consumer::status)
    }

    pub fn consumers(&self) -> Vec<ConsumerStatus> {
        let mut list: Vec<ConsumerStatus> =
            self.consumers.read().values().map(Consumer::status).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_stopped()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop broadcasting and cancel every attached consumer.
    pub(crate) fn shutdown(&self) {
        self.cancel.stop();
        let drained: Vec<Consumer> = self.consumers.write().drain().map(|(_, c)| c).collect();
        for consumer in &drained {
            consumer.cancel();
        }
        if let Some(handle) = self.broadcaster.lock().take() {
            if handle.join().is_err() {
                log::error!("hub: broadcaster for {} panicked", self.id);
            }
        }
        log::info!(
            "hub: stream {} removed ({} consumer(s) cancelled)",
            self.id,
            drained.len()
        );
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.cancel.stop();
    }
}

fn broadcast_loop(id: &str, rx: Receiver<Bytes>, consumers: &ConsumerMap, cancel: &StopSignal) {
    let cancelled = cancel.receiver().clone();
    loop {
        select! {
            recv(rx) -> packet => {
                let Ok(packet) = packet else { break };
                for consumer in consumers.read().values() {
                    consumer.offer(packet.clone());
                }
            }
            recv(cancelled) -> _ => break,
        }
    }
    log::debug!("hub: broadcaster for {} exited", id);
}

/// Handle returned by `Stream::attach`.
#[derive(Debug, Clone)]
pub struct Attachment {
    stream: Weak<Stream>,
    consumer_id: String,
}

impl Attachment {
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// True while the consumer is still registered on a live stream.
    pub fn is_attached(&self) -> bool {
        self.stream.upgrade().is_some_and(|stream| {
            stream.is_active() && stream.consumers.read().contains_key(&self.consumer_id)
        })
    }

    pub fn detach(&self) -> bool {
        self.stream
            .upgrade()
            .is_some_and(|stream| stream.detach(&self.consumer_id))
    }
}
