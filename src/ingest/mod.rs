//! Device stream ingestion.
//!
//! One `IngestionSession` per configured device owns that device's
//! connection and segment store. Payload frames flow, in transport order, to:
//! - the `SegmentStore` (durable, rotated segment files)
//! - the device's hub `Stream` (live, best-effort fan-out), when enabled
//!
//! Sessions never terminate on error. Transport and storage failures are
//! retried forever; only the stop signal ends a session.

mod backoff;
mod session;

pub use backoff::RetryPolicy;
pub use session::{IngestionSession, SessionSnapshot, SessionState, SessionStatus};
