//! # ripple
//!
//! Postgres LISTEN/NOTIFY change-notification fan-out.
//!
//! One process-wide [`Listener`] owns a single notification connection and
//! multiplexes it across any number of in-process [`Watcher`]s, each scoped
//! by channel, operation type, and an optional secondary-index filter.
//! Oversized payloads are resolved on demand from a sideband table.
//!
//! ## Architecture
//!
//! ```text
//! Postgres ──NOTIFY──► transport actor ──► multiplex loop
//!                                              │ (per channel, non-blocking)
//!                                ┌─────────────┼─────────────┐
//!                          staging buf    staging buf    staging buf
//!                                │             │             │
//!                           forwarder     forwarder     forwarder
//!                                │             │             │
//!                           subscriber    subscriber    subscriber
//! ```
//!
//! Two invariants hold at once: a live, keeping-up subscriber never loses
//! an event silently, and a slow subscriber never stalls the delivery loop
//! (its watch is aborted with a distinguished error instead). Connection
//! loss is likewise surfaced, not papered over: every watcher receives one
//! error event and the caller rebuilds from a fresh list+watch, because a
//! notification gap cannot be reconstructed.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ripple::{Listener, ListenerConfig, PgSidebandStore, WatchFilter};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ListenerConfig::new("host=localhost user=app dbname=app");
//! let sideband = Arc::new(PgSidebandStore::connect(&config).await?);
//! let listener = Listener::new(config, sideband);
//!
//! let mut watcher = listener
//!     .listen("repos", "repo", WatchFilter::all())
//!     .await?;
//! // Seed from a synchronous list, then stream from its snapshot time.
//! watcher.send_initial(seed_event).await?;
//! watcher.start_forwarding(snapshot_time, CancellationToken::new());
//!
//! while let Some(event) = watcher.recv().await {
//!     handle(event)?;
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod codec;
mod config;
mod conn;
mod error;
mod event;
mod listener;
mod metrics;
mod sideband;
mod stream;
pub mod testing;
mod watcher;

pub use config::ListenerConfig;
pub use conn::{ConnMessage, Connector, NotifyTransport, PgConnector};
pub use error::WatchError;
pub use event::{EventKind, IndexFilter, Operation, TypeTag, WatchEvent, WatchFilter};
pub use listener::Listener;
pub use metrics::ListenerMetrics;
pub use sideband::{PgSidebandStore, SidebandStore};
pub use stream::EventStream;
pub use watcher::{InitialSeeder, Watcher};
