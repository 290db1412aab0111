//! Snapshot fetch for the polled baseline.

use std::time::Duration;

use loopwatch_protocol::{GroupedRuns, RunsSnapshot};
use reqwest::header::ACCEPT;
use tracing::debug;

use crate::error::{Result, WatchError};

/// Builds the client used for polls. Unlike the stream client, this one
/// may carry a total request timeout.
pub fn build_poll_client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(|source| WatchError::Http {
        context: "build poll client".to_string(),
        source,
    })
}

/// GETs `url` and decodes the `{"runs": {...}}` body.
pub async fn fetch_snapshot(http: &reqwest::Client, url: &str) -> Result<GroupedRuns> {
    let response = http
        .get(url)
        .header(ACCEPT, "application/json")
        .send()
        .await
        .map_err(|source| WatchError::Http {
            context: format!("poll {url}"),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(WatchError::HttpStatus {
            url: url.to_string(),
            status,
        });
    }

    let body = response.bytes().await.map_err(|source| WatchError::Http {
        context: format!("read {url}"),
        source,
    })?;
    let snapshot: RunsSnapshot =
        serde_json::from_slice(&body).map_err(|source| WatchError::Json {
            context: format!("decode snapshot from {url}"),
            source,
        })?;

    debug!(url, runs = snapshot.runs.len(), "Snapshot fetched");
    Ok(snapshot.runs)
}
