//! Live Recorder
//!
//! Resilient recording of device video pushed over WebSocket.
//!
//! # Architecture
//!
//! The recorder keeps three promises:
//!
//! 1. **Never give up on a device**: transport failures are retried forever,
//!    first in place with exponential backoff, then with a fixed reconnect delay.
//! 2. **Bounded segments**: payload is written to dated segment files that
//!    rotate at a size threshold and are pruned to the newest `count`.
//! 3. **Live fan-out never stalls recording**: every hand-off to the
//!    distribution hub is non-blocking and drops on a full queue.
//!
//! # Module Structure
//!
//! - `config`: JSON config file plus env overrides
//! - `transport`: device connection seam and the TLS WebSocket client
//! - `ingest`: per-device session state machine and retry policy
//! - `storage`: segment store, encoder sink and retention sweeper
//! - `hub`: live streams and their consumers
//! - `api`: status endpoints and HTTP live attach points
//! - `supervisor`: wires one session per device with the shared services
//! - `convert`: offline `.hevc` conversion

pub mod api;
pub mod config;
pub mod convert;
pub mod hub;
pub mod ingest;
pub mod shutdown;
pub mod storage;
pub mod supervisor;
pub mod transport;

pub use config::{DeviceSource, RecorderConfig};
pub use hub::{
    Attachment, ConsumerKind, ConsumerStatus, DistributionHub, HubSettings, Stream, StreamStatus,
};
pub use ingest::{IngestionSession, RetryPolicy, SessionSnapshot, SessionState, SessionStatus};
pub use shutdown::StopSignal;
pub use storage::{
    sweep_device, EncodeMode, EncoderSettings, RetentionLayout, RetentionSweeper, Segment,
    SegmentStore, SinkKind, SweepReport,
};
pub use supervisor::{Supervisor, SupervisorHandle};
pub use transport::{Connection, Connector, WsConnection, WsConnector};
