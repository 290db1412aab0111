//! The watcher actor and its read model.
//!
//! One tokio task owns the [`Reconciler`]. Stream notices, poll results and
//! handle commands all arrive as [`WatchMsg`]s on a single channel, and each
//! message is applied to completion before the next one is read. Readers get
//! whole [`WatchView`] values through a `tokio::sync::watch` channel.

use std::time::Duration;

use loopwatch_protocol::GroupedRuns;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{StreamScope, WatchConfig};
use crate::error::{Result, WatchError};
use crate::poll::{build_poll_client, fetch_snapshot};
use crate::reconcile::Reconciler;
use crate::stream::{ConnectionState, StreamClient, StreamNotice, StreamOptions};

/// What to observe. A loop id enables polling; the stream scope may point at
/// the same loop or at a single session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub loop_id: Option<String>,
    pub stream: Option<StreamScope>,
}

impl WatchTarget {
    /// Polls the loop and streams it.
    pub fn for_loop(loop_id: impl Into<String>) -> Self {
        let loop_id = loop_id.into();
        Self {
            stream: Some(StreamScope::Loop(loop_id.clone())),
            loop_id: Some(loop_id),
        }
    }

    /// Streams a single session without polling.
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            loop_id: None,
            stream: Some(StreamScope::Session(session_id.into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchView {
    pub runs: GroupedRuns,
    /// True until the first successful poll.
    pub loading: bool,
    /// Last poll failure; cleared by the next successful poll.
    pub error: Option<String>,
    pub is_connected: bool,
    /// Set once stream retries are exhausted.
    pub stream_error: Option<String>,
    pub connection: ConnectionState,
}

impl Default for WatchView {
    fn default() -> Self {
        Self {
            runs: GroupedRuns::new(),
            loading: true,
            error: None,
            is_connected: false,
            stream_error: None,
            connection: ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug)]
enum WatchMsg {
    Stream { epoch: u64, notice: StreamNotice },
    PollDone(Result<GroupedRuns>),
    Refresh,
    Reconnect,
    Shutdown,
}

pub struct WatchHandle {
    commands: mpsc::UnboundedSender<WatchMsg>,
    view: watch::Receiver<WatchView>,
    task: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn view(&self) -> WatchView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchView> {
        self.view.clone()
    }

    /// Polls now, or right after the poll in flight completes.
    pub fn refresh(&self) {
        let _ = self.commands.send(WatchMsg::Refresh);
    }

    /// Reopens the stream with a fresh retry counter.
    pub fn reconnect(&self) {
        let _ = self.commands.send(WatchMsg::Reconnect);
    }

    /// Stops polling and streaming, then waits for the actor to exit.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(WatchMsg::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "Watcher task ended abnormally");
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(WatchMsg::Shutdown);
        }
    }
}

pub struct Watcher {
    reconciler: Reconciler,
    view: watch::Sender<WatchView>,
    inbox: mpsc::UnboundedReceiver<WatchMsg>,
    outbox: mpsc::UnboundedSender<WatchMsg>,
    http: reqwest::Client,
    snapshot_url: Option<Url>,
    stream_url: Option<Url>,
    stream_options: StreamOptions,
    stream: Option<StreamClient>,
    stream_epoch: u64,
    poll_interval: Duration,
    poll_task: Option<JoinHandle<()>>,
    refresh_queued: bool,
    stream_seen: bool,
}

impl Watcher {
    /// Starts the actor on the current tokio runtime.
    pub fn spawn(config: &WatchConfig, target: WatchTarget) -> Result<WatchHandle> {
        if target.loop_id.is_none() && target.stream.is_none() {
            return Err(WatchError::InvalidConfig(
                "nothing to watch: set a loop or a session".to_string(),
            ));
        }
        let snapshot_url = target
            .loop_id
            .as_deref()
            .map(|id| config.snapshot_url(id))
            .transpose()?;
        let stream_url = target
            .stream
            .as_ref()
            .map(|scope| config.stream_url(scope))
            .transpose()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| WatchError::Runtime(err.to_string()))?;

        let (outbox, inbox) = mpsc::unbounded_channel();
        let initial = WatchView {
            loading: snapshot_url.is_some(),
            ..WatchView::default()
        };
        let (view_tx, view_rx) = watch::channel(initial);

        let watcher = Watcher {
            reconciler: Reconciler::new(),
            view: view_tx,
            inbox,
            outbox: outbox.clone(),
            http: build_poll_client(config.request_timeout())?,
            snapshot_url,
            stream_url,
            stream_options: StreamOptions {
                policy: config.stream.reconnect_policy(),
                buffer_capacity: config.stream.buffer_capacity,
            },
            stream: None,
            stream_epoch: 0,
            poll_interval: config.poll_interval(),
            poll_task: None,
            refresh_queued: false,
            stream_seen: false,
        };
        let task = runtime.spawn(watcher.run());

        Ok(WatchHandle {
            commands: outbox,
            view: view_rx,
            task: Some(task),
        })
    }

    async fn run(mut self) {
        self.start_stream();

        let polling = self.snapshot_url.is_some();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick(), if polling => self.start_poll(),
                msg = self.inbox.recv() => match msg {
                    None | Some(WatchMsg::Shutdown) => break,
                    Some(msg) => self.handle(msg),
                },
            }
        }

        self.teardown();
    }

    fn handle(&mut self, msg: WatchMsg) {
        match msg {
            WatchMsg::Stream { epoch, notice } => {
                if epoch == self.stream_epoch {
                    self.on_notice(notice);
                }
            }
            WatchMsg::PollDone(result) => self.on_poll(result),
            WatchMsg::Refresh => {
                if self.poll_task.is_some() {
                    self.refresh_queued = true;
                } else {
                    self.start_poll();
                }
            }
            WatchMsg::Reconnect => {
                info!("Manual stream reconnect");
                self.start_stream();
            }
            WatchMsg::Shutdown => {}
        }
    }

    fn start_stream(&mut self) {
        let Some(url) = self.stream_url.clone() else {
            return;
        };
        // Replacing the client drops the old connection, and the new epoch
        // discards notices still queued from it.
        self.stream = None;
        self.stream_epoch = self.stream_epoch.wrapping_add(1);

        let epoch = self.stream_epoch;
        let outbox = self.outbox.clone();
        let client = StreamClient::new(self.stream_options.clone(), move |notice| {
            let _ = outbox.send(WatchMsg::Stream { epoch, notice });
        })
        .and_then(|mut client| client.connect(url.as_str()).map(|()| client));

        match client {
            Ok(client) => {
                self.stream = Some(client);
                self.view.send_modify(|view| view.stream_error = None);
            }
            Err(err) => {
                warn!(url = %url, error = %err, "Live stream could not start");
                self.view
                    .send_modify(|view| view.stream_error = Some(err.to_string()));
            }
        }
    }

    fn on_notice(&mut self, notice: StreamNotice) {
        match notice {
            StreamNotice::Event(event) => {
                if self.reconciler.apply_live(&event) {
                    let runs = self.reconciler.runs().clone();
                    self.view.send_modify(|view| view.runs = runs);
                }
            }
            StreamNotice::State(state) => {
                debug!(state = ?state, "Stream state changed");
                if matches!(state, ConnectionState::Connected) {
                    // Every connection after the first starts with a replay.
                    if self.stream_seen {
                        self.reconciler.stream_reconnected();
                    }
                    self.stream_seen = true;
                }
                self.view.send_modify(|view| {
                    view.is_connected = state.is_connected();
                    match &state {
                        ConnectionState::Connected => view.stream_error = None,
                        ConnectionState::Failed { message } => {
                            view.stream_error = Some(message.clone())
                        }
                        _ => {}
                    }
                    view.connection = state;
                });
            }
        }
    }

    fn start_poll(&mut self) {
        if self.poll_task.is_some() {
            debug!("Poll still in flight; skipping tick");
            return;
        }
        let Some(url) = self.snapshot_url.clone() else {
            return;
        };
        let http = self.http.clone();
        let outbox = self.outbox.clone();
        self.poll_task = Some(tokio::spawn(async move {
            let result = fetch_snapshot(&http, url.as_str()).await;
            let _ = outbox.send(WatchMsg::PollDone(result));
        }));
    }

    fn on_poll(&mut self, result: Result<GroupedRuns>) {
        self.poll_task = None;
        match result {
            Ok(baseline) => {
                self.reconciler.apply_snapshot(baseline);
                let runs = self.reconciler.runs().clone();
                self.view.send_modify(|view| {
                    if view.error.is_some() {
                        info!("Poll recovered");
                    }
                    view.runs = runs;
                    view.loading = false;
                    view.error = None;
                });
            }
            Err(err) => {
                warn!(error = %err, "Poll failed; keeping current model");
                self.view.send_modify(|view| view.error = Some(err.to_string()));
            }
        }

        if std::mem::take(&mut self.refresh_queued) {
            self.start_poll();
        }
    }

    fn teardown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.disconnect();
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.view.send_modify(|view| {
            view.is_connected = false;
            view.connection = ConnectionState::Disconnected;
        });
        debug!("Watcher stopped");
    }
}
