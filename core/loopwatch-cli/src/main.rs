//! loopwatch: terminal front end for watching automation loops.
//!
//! ## Subcommands
//!
//! - `watch`: reconciled timeline of a loop (poll + live stream)
//! - `snapshot`: one poll, printed as JSON
//! - `tail`: raw live stream events, no reconciliation

mod logging;

use std::collections::HashSet;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use loopwatch_core::poll::build_poll_client;
use loopwatch_core::{
    fetch_snapshot, load_config, ConnectionState, StreamClient, StreamNotice, StreamOptions,
    StreamScope, WatchConfig, WatchError, WatchTarget, WatchView, Watcher,
};
use loopwatch_protocol::{SessionEvent, StreamEvent, StreamPayload};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "loopwatch")]
#[command(about = "Watch automation loop runs as they happen")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.loopwatch/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Backend base URL, overrides config and environment
    #[arg(long, global = true, value_name = "URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a loop's runs, merging polled history with live events
    Watch {
        /// Loop to poll
        #[arg(long = "loop", value_name = "ID")]
        loop_id: String,

        /// Stream this session instead of the whole loop
        #[arg(long = "session", value_name = "ID")]
        session_id: Option<String>,
    },

    /// Fetch the persisted runs once and print them as JSON
    Snapshot {
        #[arg(long = "loop", value_name = "ID")]
        loop_id: String,
    },

    /// Print raw live stream events
    Tail(TailArgs),
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct TailArgs {
    #[arg(long = "loop", value_name = "ID")]
    loop_id: Option<String>,

    #[arg(long = "session", value_name = "ID")]
    session_id: Option<String>,
}

impl TailArgs {
    fn scope(self) -> Option<StreamScope> {
        match (self.loop_id, self.session_id) {
            (_, Some(session_id)) => Some(StreamScope::Session(session_id)),
            (Some(loop_id), None) => Some(StreamScope::Loop(loop_id)),
            (None, None) => None,
        }
    }
}

#[tokio::main]
async fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let config = match resolve_config(cli.config, cli.base_url) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Watch {
            loop_id,
            session_id,
        } => run_watch(&config, loop_id, session_id).await,
        Commands::Snapshot { loop_id } => run_snapshot(&config, &loop_id).await,
        Commands::Tail(args) => match args.scope() {
            Some(scope) => run_tail(&config, scope).await,
            None => Err(WatchError::InvalidConfig(
                "tail needs --loop or --session".to_string(),
            )),
        },
    };

    if let Err(err) = result {
        error!(error = %err, "loopwatch failed");
        std::process::exit(1);
    }
}

fn resolve_config(
    path: Option<PathBuf>,
    base_url: Option<String>,
) -> loopwatch_core::Result<WatchConfig> {
    let mut config = load_config(path)?;
    if let Some(base_url) = base_url {
        config.base_url = base_url;
        config.validate()?;
    }
    Ok(config)
}

async fn run_watch(
    config: &WatchConfig,
    loop_id: String,
    session_id: Option<String>,
) -> loopwatch_core::Result<()> {
    let target = WatchTarget {
        stream: Some(match session_id {
            Some(session_id) => StreamScope::Session(session_id),
            None => StreamScope::Loop(loop_id.clone()),
        }),
        loop_id: Some(loop_id),
    };
    let handle = Watcher::spawn(config, target)?;
    let mut views = handle.subscribe();
    let mut printer = ViewPrinter::default();

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                printer.print(&view);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; shutting down");
                break;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

async fn run_snapshot(config: &WatchConfig, loop_id: &str) -> loopwatch_core::Result<()> {
    let http = build_poll_client(config.request_timeout())?;
    let url = config.snapshot_url(loop_id)?;
    let runs = fetch_snapshot(&http, url.as_str()).await?;
    let rendered =
        serde_json::to_string_pretty(&runs).map_err(|source| WatchError::Json {
            context: "render snapshot".to_string(),
            source,
        })?;
    println!("{rendered}");
    Ok(())
}

async fn run_tail(config: &WatchConfig, scope: StreamScope) -> loopwatch_core::Result<()> {
    let url = config.stream_url(&scope)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = StreamOptions {
        policy: config.stream.reconnect_policy(),
        buffer_capacity: config.stream.buffer_capacity,
    };
    let mut client = StreamClient::new(options, move |notice| {
        let _ = tx.send(notice);
    })?;
    client.connect(url.as_str())?;

    loop {
        tokio::select! {
            notice = rx.recv() => match notice {
                Some(StreamNotice::Event(event)) => println!("{}", describe_stream_event(&event)),
                Some(StreamNotice::State(ConnectionState::Failed { message })) => {
                    eprintln!("stream failed: {message}");
                    break;
                }
                Some(StreamNotice::State(state)) => eprintln!("stream: {}", describe_state(&state)),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect();
    Ok(())
}

/// Prints only what changed since the previous view.
#[derive(Default)]
struct ViewPrinter {
    seen: HashSet<(String, u32, u64)>,
    loading_reported: bool,
    connection: Option<ConnectionState>,
    error: Option<String>,
    stream_error: Option<String>,
}

impl ViewPrinter {
    fn print(&mut self, view: &WatchView) {
        if !view.loading && !self.loading_reported {
            self.loading_reported = true;
            eprintln!("loaded {} run(s)", view.runs.len());
        }
        if self.connection.as_ref() != Some(&view.connection) {
            eprintln!("stream: {}", describe_state(&view.connection));
            self.connection = Some(view.connection.clone());
        }
        if view.error != self.error {
            if let Some(err) = &view.error {
                eprintln!("poll error: {err}");
            }
            self.error = view.error.clone();
        }
        if view.stream_error != self.stream_error {
            if let Some(err) = &view.stream_error {
                eprintln!("stream error: {err} (retries exhausted)");
            }
            self.stream_error = view.stream_error.clone();
        }

        for (run_id, run) in &view.runs {
            for (index, iteration) in &run.iterations {
                for event in &iteration.events {
                    if self.seen.insert((run_id.clone(), *index, event.id)) {
                        println!("{}", describe_event(run_id, *index, event));
                    }
                }
            }
        }
    }
}

fn describe_state(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Disconnected => "disconnected".to_string(),
        ConnectionState::Connecting => "connecting".to_string(),
        ConnectionState::Connected => "connected".to_string(),
        ConnectionState::Reconnecting { attempt, delay } => {
            format!("reconnecting (attempt {attempt}, in {}ms)", delay.as_millis())
        }
        ConnectionState::Failed { message } => format!("failed: {message}"),
    }
}

fn describe_event(run_id: &str, iteration: u32, event: &SessionEvent) -> String {
    let marker = if event.is_live() { "live" } else { "confirmed" };
    let detail = event
        .content
        .as_deref()
        .or(event.tool_name.as_deref())
        .or(event.tool_result.as_deref())
        .or(event.error_message.as_deref())
        .unwrap_or("");
    format!(
        "[{run_id} #{iteration} {marker}] {} {}",
        event.event_type.as_str(),
        one_line(detail)
    )
}

fn describe_stream_event(event: &StreamEvent) -> String {
    let detail = match &event.payload {
        StreamPayload::Status { status } => status.clone().unwrap_or_default(),
        StreamPayload::Text { content, .. } | StreamPayload::Thinking { content } => {
            one_line(content)
        }
        StreamPayload::ToolCall { name, .. } => name.clone(),
        StreamPayload::ToolResult { result, .. } => one_line(result.as_deref().unwrap_or("")),
        StreamPayload::Error { message } => message.clone(),
        StreamPayload::Info { message } => message
            .clone()
            .unwrap_or_else(|| "no active session".to_string()),
        StreamPayload::Unknown { name } => name.clone(),
        _ => String::new(),
    };
    let label = if event.is_idle_marker() {
        "idle"
    } else {
        event.kind().as_str()
    };
    format!("{label} {detail}")
}

fn one_line(text: &str) -> String {
    const MAX_CHARS: usize = 120;
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > MAX_CHARS {
        let truncated: String = flat.chars().take(MAX_CHARS).collect();
        format!("{truncated}…")
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopwatch_protocol::{EventKind, SYNTHETIC_ID_FLOOR};

    #[test]
    fn describe_event_marks_live_and_confirmed() {
        let mut live = SessionEvent::new(SYNTHETIC_ID_FLOOR + 1, "s", EventKind::Text);
        live.content = Some("hello\nworld".to_string());
        assert_eq!(describe_event("r", 2, &live), "[r #2 live] text hello world");

        let mut confirmed = SessionEvent::new(7, "s", EventKind::ToolCall);
        confirmed.tool_name = Some("Read".to_string());
        assert_eq!(describe_event("r", 2, &confirmed), "[r #2 confirmed] tool_call Read");
    }

    #[test]
    fn idle_marker_is_labelled_idle() {
        let idle = loopwatch_protocol::parse_stream_event("info", r#"{"message":"no active session"}"#)
            .expect("info parses");
        assert_eq!(describe_stream_event(&idle), "idle no active session");

        let bare = loopwatch_protocol::parse_stream_event("info", "{}").expect("info parses");
        assert_eq!(describe_stream_event(&bare), "idle no active session");

        let text = loopwatch_protocol::parse_stream_event("text", r#"{"content":"hi"}"#)
            .expect("text parses");
        assert_eq!(describe_stream_event(&text), "text hi");
    }

    #[test]
    fn one_line_truncates_long_text() {
        let long = "x".repeat(200);
        assert_eq!(one_line(&long).chars().count(), 121);
    }

    #[test]
    fn tail_requires_a_scope() {
        assert!(Cli::try_parse_from(["loopwatch", "tail"]).is_err());
        assert!(Cli::try_parse_from(["loopwatch", "tail", "--session", "s-1"]).is_ok());
    }
}
