use crate::{
    Result,
    app::event_source::{
        ResponseStream,
        StreamService,
    },
    events::{
        EventsSinceResponse,
        StreamResponse,
    },
    lock,
};
use anyhow::{
    Context,
    anyhow,
};
use futures::{
    Stream,
    StreamExt,
    stream,
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longer than the keepalive interval so a healthy feed never trips it.
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const EVENTS_SINCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Indexing service over HTTP: the live feed is newline-delimited JSON.
#[derive(Clone)]
pub struct HttpStreamService {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventsSinceRequest {
    since_block: u64,
}

impl HttpStreamService {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Url::parse(&base_url).with_context(|| format!("invalid stream url {base_url:?}"))?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .context("failed to build HTTP client for stream service")?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl StreamService for HttpStreamService {
    async fn subscribe(&self) -> Result<ResponseStream> {
        let url = format!("{}/stream", self.base_url);
        let res = self
            .http
            .get(url)
            .send()
            .await
            .context("stream subscribe request failed")?;
        let status = res.status();
        if !status.is_success() {
            let body = res
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable body>".to_string());
            return Err(anyhow!("stream service responded with {status}: {body}"));
        }
        Ok(ndjson(res.bytes_stream()))
    }

    async fn events_since(&self, since_block: u64) -> Result<EventsSinceResponse> {
        let url = format!("{}/events-since", self.base_url);
        let res = self
            .http
            .post(url)
            .timeout(EVENTS_SINCE_TIMEOUT)
            .json(&EventsSinceRequest { since_block })
            .send()
            .await
            .context("events-since request failed")?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .context("failed to read events-since response body")?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(anyhow!(
                "stream service responded with {status} when fetching events since {since_block}: {body}"
            ));
        }
        serde_json::from_slice(&bytes).context("invalid events-since payload")
    }
}

/// Splits a byte stream into one `StreamResponse` per line. Blank lines are
/// skipped; a read error ends the stream after being reported.
pub fn ndjson<S, B, E>(bytes: S) -> ResponseStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = (bytes.boxed(), Vec::<u8>::new(), false);
    stream::unfold(state, |(mut bytes, mut buffer, done)| async move {
        if done {
            return None;
        }
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_line(&line) {
                    Some(item) => return Some((item, (bytes, buffer, false))),
                    None => continue,
                }
            }
            match bytes.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    let err = anyhow::Error::new(err).context("stream read failed");
                    return Some((Err(err), (bytes, buffer, true)));
                }
                None => {
                    let rest = std::mem::take(&mut buffer);
                    return parse_line(&rest).map(|item| (item, (bytes, buffer, true)));
                }
            }
        }
    })
    .boxed()
}

fn parse_line(line: &[u8]) -> Option<Result<StreamResponse>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_slice(line).context("invalid stream message"))
}

/// Reuses one client per service URL.
#[derive(Default)]
pub struct SyncContext {
    clients: Mutex<HashMap<String, Arc<HttpStreamService>>>,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_service(&self, url: &str) -> Result<Arc<HttpStreamService>> {
        let key = url.trim_end_matches('/');
        let mut clients = lock(&self.clients);
        if let Some(client) = clients.get(key) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(HttpStreamService::new(key)?);
        clients.insert(key.to_string(), Arc::clone(&client));
        Ok(client)
    }

    pub fn len(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
