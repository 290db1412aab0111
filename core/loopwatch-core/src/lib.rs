//! # loopwatch-core
//!
//! Client-side engine for watching iteration-based automation loops. Combines
//! a periodically polled snapshot of persisted runs with a live event stream
//! into one `GroupedRuns` tree.
//!
//! ## Design Principles
//!
//! - **Single writer**: only the [`Reconciler`] mutates the run tree, and the
//!   [`Watcher`] actor is its only caller.
//! - **Nothing fatal**: transport and poll failures are retried and surfaced
//!   as strings; the displayed history is never cleared by an error.
//! - **Append-only timelines**: events within an iteration keep arrival order
//!   and are never removed.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use loopwatch_core::{load_config, Watcher, WatchTarget};
//!
//! let config = load_config(None)?;
//! let handle = Watcher::spawn(&config, WatchTarget::for_loop("loop-1"))?;
//! let mut views = handle.subscribe();
//! while views.changed().await.is_ok() {
//!     println!("{} runs", views.borrow().runs.len());
//! }
//! ```

pub mod config;
pub mod error;
pub mod poll;
pub mod reconcile;
pub mod stream;
pub mod watch;

pub use config::{load_config, StreamScope, WatchConfig};
pub use error::{Result, WatchError};
pub use poll::fetch_snapshot;
pub use reconcile::{merge_snapshot, LiveContext, Reconciler, SyntheticIds, PLACEHOLDER_RUN_ID};
pub use stream::{ConnectionState, StreamClient, StreamNotice, StreamOptions};
pub use watch::{WatchHandle, WatchTarget, WatchView, Watcher};
