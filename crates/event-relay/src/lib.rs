//! Client-side event buffering: events are queued in memory with a bounded
//! capacity and shipped to a collector in batches, one batch in flight at a
//! time, with failed batches put back at the head of the queue.

pub mod buffers;
pub mod config;
pub mod event;
pub mod flush_timer;
pub mod input;
pub mod transport;

#[cfg(test)]
mod testing;

pub use buffers::{EventBuffer, FlushError, FlushOutcome, SkipReason};
pub use config::{BufferConfig, Compression, Config, ConfigError};
pub use event::{Attributes, EventRecord};
pub use transport::{Destination, HttpTransport, Transport, TransportError};
