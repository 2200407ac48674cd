use anyhow::{Context, Result};
use bytes::Bytes;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::shutdown::StopSignal;

pub(crate) type ConsumerMap = RwLock<HashMap<String, Consumer>>;

/// Declared kind of a live consumer. A tag only: the hub forwards the same
/// bytes to every kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConsumerKind {
    Raw,
    HttpFlv,
    Rtsp,
    Rtmp,
    Other(String),
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::HttpFlv => write!(f, "http-flv"),
            Self::Rtsp => write!(f, "rtsp"),
            Self::Rtmp => write!(f, "rtmp"),
            Self::Other(tag) => write!(f, "{tag}"),
        }
    }
}

impl Serialize for ConsumerKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConsumerStatus {
    pub id: String,
    pub kind: ConsumerKind,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Registry entry for one attached consumer. The forwarding thread owns the
/// receiving half of `outbound` and the sink.
pub(crate) struct Consumer {
    id: String,
    kind: ConsumerKind,
    outbound: Sender<Bytes>,
    cancel: StopSignal,
    counters: Arc<ConsumerCounters>,
}

impl Consumer {
    /// Create the consumer and start its forwarding thread.
    pub(crate) fn spawn(
        stream_id: &str,
        id: String,
        kind: ConsumerKind,
        capacity: usize,
        sink: Box<dyn Write + Send>,
        registry: Weak<ConsumerMap>,
    ) -> Result<Self> {
        let (outbound, rx) = bounded(capacity);
        let cancel = StopSignal::new();
        let counters = Arc::new(ConsumerCounters::default());

        let forwarder = Forwarder {
            stream_id: stream_id.to_string(),
            id: id.clone(),
            rx,
            sink,
            cancel: cancel.clone(),
            counters: counters.clone(),
            registry,
        };
        std::thread::Builder::new()
            .name(format!("consumer-{id}"))
            .spawn(move || forwarder.run())
            .with_context(|| format!("failed to spawn forwarder for consumer {id}"))?;

        Ok(Self {
            id,
            kind,
            outbound,
            cancel,
            counters,
        })
    }

    /// Queue `packet` without blocking. Returns false when it was dropped.
    pub(crate) fn offer(&self, packet: Bytes) -> bool {
        match self.outbound.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.stop();
    }

    pub(crate) fn status(&self) -> ConsumerStatus {
        ConsumerStatus {
            id: self.id.clone(),
            kind: self.kind.clone(),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Forwarder {
    stream_id: String,
    id: String,
    rx: Receiver<Bytes>,
    sink: Box<dyn Write + Send>,
    cancel: StopSignal,
    counters: Arc<ConsumerCounters>,
    registry: Weak<ConsumerMap>,
}

impl Forwarder {
    fn run(mut self) {
        let rx = self.rx.clone();
        let cancelled = self.cancel.receiver().clone();
        loop {
            select! {
                recv(rx) -> packet => {
                    let Ok(packet) = packet else { break };
                    if let Err(err) = self.deliver(&packet) {
                        log::info!(
                            "hub: consumer {} on {} detached after write failure: {}",
                            self.id,
                            self.stream_id,
                            err
                        );
                        self.detach_self();
                        break;
                    }
                }
                recv(cancelled) -> _ => break,
            }
        }
        log::debug!("hub: forwarder {} on {} exited", self.id, self.stream_id);
    }

    fn deliver(&mut self, packet: &[u8]) -> std::io::Result<()> {
        self.sink.write_all(packet)?;
        self.sink.flush()?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove our own registry entry, unless it was already replaced by a
    /// newer consumer attached under the same id.
    fn detach_self(&self) {
        self.cancel.stop();
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut consumers = registry.write();
        let ours = consumers
            .get(&self.id)
            .is_some_and(|consumer| consumer.cancel.same_as(&self.cancel));
        if ours {
            consumers.remove(&self.id);
        }
    }
}
