//! Live event stream: SSE framing, reconnect policy and the connection task.
//!
//! The stream client knows nothing about runs or iterations. It only turns
//! bytes into typed [`StreamEvent`](loopwatch_protocol::StreamEvent)s and
//! reports connection state.

mod client;
mod reconnect;
mod sse;

pub use client::{ConnectionState, StreamClient, StreamNotice, StreamOptions};
pub use reconnect::{BackoffStrategy, ReconnectPolicy, ReconnectTracker, RetryDecision};
pub use sse::{SseDecoder, SseFrame};
