//! Fake loop backend speaking just enough HTTP/1.1 for the client.
//!
//! Routes:
//! - `GET /api/loops/{id}/stream` and `GET /api/sessions/{id}/tail`: SSE
//! - `GET /api/loops/{id}/runs`: JSON snapshot (500 while unset)

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loopwatch_core::config::StreamConfig;
use loopwatch_core::WatchConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub enum StreamBehavior {
    /// Every connect gets a 503.
    Unavailable,
    /// 200 followed by `frames`, one every `delay`. The connection then
    /// closes unless `hold_open`.
    Frames {
        frames: Vec<String>,
        delay: Duration,
        hold_open: bool,
    },
}

#[derive(Default)]
pub struct Recorded {
    pub stream_hits: AtomicUsize,
    pub snapshot_hits: AtomicUsize,
    pub last_event_ids: Mutex<Vec<Option<String>>>,
}

struct Routes {
    stream: Mutex<StreamBehavior>,
    snapshot: Mutex<Option<String>>,
}

pub struct FakeBackend {
    pub base_url: String,
    pub recorded: Arc<Recorded>,
    routes: Arc<Routes>,
    accept: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start(stream: StreamBehavior, snapshot: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("local addr");
        let recorded = Arc::new(Recorded::default());
        let routes = Arc::new(Routes {
            stream: Mutex::new(stream),
            snapshot: Mutex::new(snapshot.map(str::to_string)),
        });

        let accept = {
            let recorded = Arc::clone(&recorded);
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let recorded = Arc::clone(&recorded);
                    let routes = Arc::clone(&routes);
                    tokio::spawn(serve(socket, routes, recorded));
                }
            })
        };

        Self {
            base_url: format!("http://{addr}"),
            recorded,
            routes,
            accept,
        }
    }

    pub fn set_snapshot(&self, body: Option<&str>) {
        *self.routes.snapshot.lock().expect("snapshot lock") = body.map(str::to_string);
    }

    pub fn set_stream(&self, behavior: StreamBehavior) {
        *self.routes.stream.lock().expect("stream lock") = behavior;
    }

    pub fn stream_hits(&self) -> usize {
        self.recorded.stream_hits.load(Ordering::SeqCst)
    }

    pub fn snapshot_hits(&self) -> usize {
        self.recorded.snapshot_hits.load(Ordering::SeqCst)
    }

    pub fn last_event_ids(&self) -> Vec<Option<String>> {
        self.recorded
            .last_event_ids
            .lock()
            .expect("ids lock")
            .clone()
    }

    /// Config pointed at this backend with fast timers.
    pub fn config(&self, max_retries: u32) -> WatchConfig {
        WatchConfig {
            base_url: self.base_url.clone(),
            poll_interval_ms: 50,
            request_timeout_ms: Some(2_000),
            stream: StreamConfig {
                retry_interval_ms: 10,
                max_retries,
                buffer_capacity: 100,
                ..StreamConfig::default()
            },
        }
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Builds one SSE frame.
pub fn frame(event: &str, data: &str) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

async fn serve(mut socket: TcpStream, routes: Arc<Routes>, recorded: Arc<Recorded>) {
    let Some(head) = read_head(&mut socket).await else {
        return;
    };
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    if path.ends_with("/stream") || path.ends_with("/tail") {
        recorded.stream_hits.fetch_add(1, Ordering::SeqCst);
        recorded
            .last_event_ids
            .lock()
            .expect("ids lock")
            .push(header_value(&head, "last-event-id"));
        let behavior = routes.stream.lock().expect("stream lock").clone();
        serve_stream(socket, behavior).await;
    } else if path.ends_with("/runs") {
        recorded.snapshot_hits.fetch_add(1, Ordering::SeqCst);
        let body = routes.snapshot.lock().expect("snapshot lock").clone();
        match body {
            Some(body) => write_response(&mut socket, "200 OK", "application/json", &body).await,
            None => write_response(&mut socket, "500 Internal Server Error", "text/plain", "down").await,
        }
    } else {
        write_response(&mut socket, "404 Not Found", "text/plain", "not found").await;
    }
}

async fn serve_stream(mut socket: TcpStream, behavior: StreamBehavior) {
    match behavior {
        StreamBehavior::Unavailable => {
            write_response(&mut socket, "503 Service Unavailable", "text/plain", "busy").await
        }
        StreamBehavior::Frames {
            frames,
            delay,
            hold_open,
        } => {
            let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for frame in frames {
                if socket.write_all(frame.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
                tokio::time::sleep(delay).await;
            }
            if hold_open {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            let _ = socket.shutdown().await;
        }
    }
}

async fn read_head(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(buf).ok()
}

fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

async fn write_response(socket: &mut TcpStream, status: &str, content_type: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}
