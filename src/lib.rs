//! Cadence Relay - fixed-rate relay for bursty telemetry streams.
//!
//! A device delivers newline-terminated, comma-separated records in bursts
//! whose chunk boundaries have nothing to do with record boundaries. The
//! relay reassembles records, keeps the numeric fields, buffers the samples
//! and re-emits them to one consumer at a fixed tick rate, emitting an
//! explicit underrun marker when nothing is buffered.
//!
//! # Architecture
//!
//! - **Ingest** - chunk channel, [`framing::LineDecoder`], [`record::parse`]
//! - **RelayBuffer** - bounded drop-oldest queue between the two sides
//! - **CadenceStreamer** - drift-corrected tick loop feeding a [`streamer::TickSink`]
//! - **Session** - owned context tying the above together
//! - **Link** / **Delivery** - device byte source (replaceable at runtime) and
//!   WebSocket consumers
//!
//! # Modules
//!
//! - [`config`] - Configuration loading/saving
//! - [`commands`] - CLI subcommand implementations

pub mod commands;
pub mod config;
pub mod constants;
pub mod delivery;
pub mod framing;
pub mod ingest;
pub mod link;
pub mod record;
pub mod relay_buffer;
pub mod session;
pub mod streamer;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use delivery::{DeliveryOptions, DeliveryServer};
pub use framing::LineDecoder;
pub use link::{LinkManager, LinkStatus, Source};
pub use record::{Rejection, Sample};
pub use relay_buffer::RelayBuffer;
pub use session::{Health, Session, SessionState};
pub use streamer::{CadenceStreamer, StreamerError, StreamerState, Tick, TickSink, TickValue};
