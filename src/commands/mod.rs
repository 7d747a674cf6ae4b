//! CLI subcommand implementations for cadence-relay.
//!
//! - [`serve`] - run the relay: device link, ingest, delivery server
//! - [`replay`] - decode a capture file offline and print samples
//!
//! ```ignore
//! use cadence_relay::commands;
//!
//! commands::replay::run(&path, &config)?;
//! ```

pub mod replay;
pub mod serve;

#[doc(inline)]
pub use replay::run as replay_file;
#[doc(inline)]
pub use serve::run as serve;
