//! Live event-source connection with bounded reconnects.
//!
//! One `StreamClient` owns at most one connection task. Every transport
//! failure (refused connect, non-2xx, body error, server closing the stream)
//! goes through the same `ReconnectTracker`, so there is never more than one
//! pending retry. The retry counter resets on the first frame of a
//! connection, not on the 2xx that opens it. Notices are delivered to the caller's handler under the
//! dispatch lock; `disconnect()` bumps the generation under that same lock,
//! which means no notice from an old connection is delivered once it returns.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use loopwatch_protocol::{parse_stream_event, StreamEvent};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::reconnect::{ReconnectPolicy, ReconnectTracker, RetryDecision};
use super::sse::SseDecoder;
use crate::error::{Result, WatchError};

const DEFAULT_BUFFER_CAPACITY: usize = 500;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Failed { message: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Terminal error string once retries are exhausted.
    pub fn failure(&self) -> Option<&str> {
        match self {
            ConnectionState::Failed { message } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamNotice {
    Event(StreamEvent),
    State(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub policy: ReconnectPolicy,
    pub buffer_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

type NoticeHandler = Arc<dyn Fn(StreamNotice) + Send + Sync>;

struct Dispatch {
    generation: u64,
    state: ConnectionState,
}

struct Shared {
    dispatch: Mutex<Dispatch>,
    buffer: Mutex<VecDeque<StreamEvent>>,
}

impl Shared {
    fn dispatch(&self) -> MutexGuard<'_, Dispatch> {
        self.dispatch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<StreamEvent>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct StreamClient {
    http: reqwest::Client,
    options: StreamOptions,
    handler: NoticeHandler,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl StreamClient {
    /// Creates a disconnected client. The handler must not block; it runs
    /// on the connection task while the dispatch lock is held.
    pub fn new<F>(options: StreamOptions, handler: F) -> Result<Self>
    where
        F: Fn(StreamNotice) + Send + Sync + 'static,
    {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|source| WatchError::Http {
                context: "build stream client".to_string(),
                source,
            })?;
        Ok(Self::with_http_client(http, options, handler))
    }

    /// The supplied client must not carry a total request timeout, or it
    /// will cut long-lived streams.
    pub fn with_http_client<F>(http: reqwest::Client, options: StreamOptions, handler: F) -> Self
    where
        F: Fn(StreamNotice) + Send + Sync + 'static,
    {
        Self {
            http,
            options,
            handler: Arc::new(handler),
            shared: Arc::new(Shared {
                dispatch: Mutex::new(Dispatch {
                    generation: 0,
                    state: ConnectionState::Disconnected,
                }),
                buffer: Mutex::new(VecDeque::new()),
            }),
            task: None,
        }
    }

    /// Opens a fresh connection, replacing any existing one and resetting
    /// the retry counter. Must be called within a tokio runtime.
    pub fn connect(&mut self, url: &str) -> Result<()> {
        if url.trim().is_empty() {
            return Err(WatchError::EmptyUrl);
        }
        let url = Url::parse(url).map_err(|source| WatchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| WatchError::Runtime(err.to_string()))?;

        self.disconnect();

        let generation = self.shared.dispatch().generation;
        let task = ConnectionTask {
            http: self.http.clone(),
            url,
            policy: self.options.policy.clone(),
            buffer_capacity: self.options.buffer_capacity.max(1),
            generation,
            shared: Arc::clone(&self.shared),
            handler: Arc::clone(&self.handler),
        };
        self.task = Some(runtime.spawn(task.run()));
        Ok(())
    }

    /// Closes the connection and cancels any pending retry. Idempotent.
    pub fn disconnect(&mut self) {
        {
            let mut dispatch = self.shared.dispatch();
            dispatch.generation = dispatch.generation.wrapping_add(1);
            dispatch.state = ConnectionState::Disconnected;
        }
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Live stream disconnected");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.dispatch().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.dispatch().state.is_connected()
    }

    /// The most recent events in arrival order, capped at `buffer_capacity`.
    pub fn recent_events(&self) -> Vec<StreamEvent> {
        self.shared.buffer().iter().cloned().collect()
    }

    pub fn clear_events(&self) {
        self.shared.buffer().clear();
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct ConnectionTask {
    http: reqwest::Client,
    url: Url,
    policy: ReconnectPolicy,
    buffer_capacity: usize,
    generation: u64,
    shared: Arc<Shared>,
    handler: NoticeHandler,
}

enum StreamEnd {
    Superseded,
    Dropped(WatchError),
}

impl ConnectionTask {
    async fn run(self) {
        let mut tracker = ReconnectTracker::new(self.policy.clone());
        let mut last_event_id: Option<String> = None;

        loop {
            if !self.emit_state(ConnectionState::Connecting) {
                return;
            }

            let err = match self.stream_once(&mut tracker, &mut last_event_id).await {
                StreamEnd::Superseded => return,
                StreamEnd::Dropped(err) => err,
            };

            match tracker.on_error() {
                RetryDecision::RetryAfter { attempt, delay } => {
                    warn!(
                        url = %self.url,
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Live stream dropped; scheduling reconnect"
                    );
                    if !self.emit_state(ConnectionState::Reconnecting { attempt, delay }) {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp { message } => {
                    warn!(url = %self.url, error = %err, "{}", message);
                    self.emit_state(ConnectionState::Failed { message });
                    return;
                }
            }
        }
    }

    async fn stream_once(
        &self,
        tracker: &mut ReconnectTracker,
        last_event_id: &mut Option<String>,
    ) -> StreamEnd {
        let mut request = self
            .http
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id.as_deref() {
            request = request.header(LAST_EVENT_ID_HEADER, id);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(source) => {
                return StreamEnd::Dropped(WatchError::Http {
                    context: format!("connect {}", self.url),
                    source,
                })
            }
        };
        if !response.status().is_success() {
            return StreamEnd::Dropped(WatchError::HttpStatus {
                url: self.url.to_string(),
                status: response.status(),
            });
        }

        info!(url = %self.url, "Live stream connected");
        if !self.emit_state(ConnectionState::Connected) {
            return StreamEnd::Superseded;
        }

        let mut decoder = SseDecoder::new();
        let mut delivering = false;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(source) => {
                    return StreamEnd::Dropped(WatchError::Http {
                        context: format!("read {}", self.url),
                        source,
                    })
                }
            };

            for frame in decoder.feed(&chunk) {
                // A 2xx alone does not count; the retry budget resets once
                // the server actually delivers a frame.
                if !delivering {
                    delivering = true;
                    tracker.on_connected();
                }
                match parse_stream_event(&frame.event, &frame.data) {
                    Some(event) => {
                        if !self.emit_event(event) {
                            return StreamEnd::Superseded;
                        }
                    }
                    None => debug!(event = %frame.event, "Dropping unparsable stream payload"),
                }
            }
            if let Some(id) = decoder.last_event_id() {
                *last_event_id = Some(id.to_string());
            }
            if let Some(retry_ms) = decoder.take_retry() {
                debug!(retry_ms, "Server retry hint ignored in favor of configured policy");
            }
        }

        StreamEnd::Dropped(WatchError::StreamClosed(self.url.to_string()))
    }

    fn emit_state(&self, state: ConnectionState) -> bool {
        let mut dispatch = self.shared.dispatch();
        if dispatch.generation != self.generation {
            return false;
        }
        dispatch.state = state.clone();
        (self.handler)(StreamNotice::State(state));
        true
    }

    fn emit_event(&self, event: StreamEvent) -> bool {
        let dispatch = self.shared.dispatch();
        if dispatch.generation != self.generation {
            return false;
        }
        {
            let mut buffer = self.shared.buffer();
            if buffer.len() >= self.buffer_capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }
        (self.handler)(StreamNotice::Event(event));
        drop(dispatch);
        true
    }
}
