use crate::{
    Result,
    app::event_source::{
        ChainLogSource,
        StreamService,
    },
    events::NetworkComponentUpdate,
    transform::{
        Decode,
        parse_events_since,
    },
};
use anyhow::Context;
use std::{
    future::Future,
    sync::Arc,
    time::Duration,
};
use tokio::time::timeout;
use tracing::{
    debug,
    warn,
};

pub const DEFAULT_CHUNK_SIZE: u64 = 50;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type Progress<'a> = &'a (dyn Fn(u8) + Send + Sync);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapFillOptions {
    pub skip_rpc_fallback: bool,
    pub chunk_size: u64,
    /// Upper bound for each service or chain log request.
    pub request_timeout: Duration,
}

impl Default for GapFillOptions {
    fn default() -> Self {
        Self {
            skip_rpc_fallback: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Recovers events missed by the live stream. Tries the indexing service
/// first and falls back to chunked chain log queries.
pub struct GapFiller<S, C, D> {
    service: Arc<S>,
    logs: Option<Arc<C>>,
    decode: Arc<D>,
    options: GapFillOptions,
}

impl<S, C, D> Clone for GapFiller<S, C, D> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            logs: self.logs.clone(),
            decode: Arc::clone(&self.decode),
            options: self.options,
        }
    }
}

impl<S: StreamService, C: ChainLogSource, D: Decode> GapFiller<S, C, D> {
    pub fn new(
        service: Arc<S>,
        logs: Option<Arc<C>>,
        decode: Arc<D>,
        options: GapFillOptions,
    ) -> Self {
        Self {
            service,
            logs,
            decode,
            options,
        }
    }

    /// Never fails: when both sources fail the gap is logged and left empty.
    pub async fn fetch_gap_events(
        &self,
        from_block: u64,
        to_block: Option<u64>,
        progress: Option<Progress<'_>>,
    ) -> Vec<NetworkComponentUpdate> {
        match self.from_service(from_block).await {
            Ok(events) => {
                debug!(from_block, events = events.len(), "Gap filled from indexing service");
                if let Some(progress) = progress {
                    progress(100);
                }
                return events;
            }
            Err(err) => {
                warn!(?err, from_block, "Indexing service gap fill failed, falling back to chain logs");
            }
        }

        if self.options.skip_rpc_fallback {
            warn!(from_block, "Chain log fallback skipped");
            return Vec::new();
        }

        match self.from_chain_logs(from_block, to_block, progress).await {
            Ok(events) => {
                debug!(from_block, events = events.len(), "Gap filled from chain logs");
                events
            }
            Err(err) => {
                warn!(?err, from_block, "Chain log gap fill failed");
                Vec::new()
            }
        }
    }

    async fn from_service(&self, from_block: u64) -> Result<Vec<NetworkComponentUpdate>> {
        let response = bounded(self.options.request_timeout, self.service.events_since(from_block))
            .await
            .context("Indexing service events-since request failed")?;
        parse_events_since(self.decode.as_ref(), &response, from_block)
    }

    async fn from_chain_logs(
        &self,
        from_block: u64,
        to_block: Option<u64>,
        progress: Option<Progress<'_>>,
    ) -> Result<Vec<NetworkComponentUpdate>> {
        let logs = self
            .logs
            .as_ref()
            .context("No chain log source configured")?;
        let to_block = match to_block {
            Some(to_block) => to_block,
            None => bounded(self.options.request_timeout, logs.latest_block())
                .await
                .context("Failed to read chain head")?,
        };
        fetch_chunked(
            logs.as_ref(),
            from_block,
            to_block,
            self.options.chunk_size,
            self.options.request_timeout,
            progress,
        )
        .await
    }
}

/// Fetches `[from_block, to_block]` in inclusive chunks, reporting percent done.
pub async fn fetch_chunked<C: ChainLogSource>(
    logs: &C,
    from_block: u64,
    to_block: u64,
    chunk_size: u64,
    request_timeout: Duration,
    progress: Option<Progress<'_>>,
) -> Result<Vec<NetworkComponentUpdate>> {
    let chunk_size = chunk_size.max(1);
    let total = to_block.saturating_sub(from_block) + 1;
    let mut events = Vec::new();
    let mut start = from_block;
    while start <= to_block {
        let end = start.saturating_add(chunk_size - 1).min(to_block);
        let chunk = bounded(request_timeout, logs.fetch_world_events(start, end))
            .await
            .with_context(|| format!("Failed to fetch logs for blocks {start}..={end}"))?;
        events.extend(chunk);
        if let Some(progress) = progress {
            let done = end - from_block + 1;
            progress((done * 100 / total) as u8);
        }
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    Ok(events)
}

async fn bounded<T>(limit: Duration, request: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(limit, request)
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {limit:?}"))?
}
