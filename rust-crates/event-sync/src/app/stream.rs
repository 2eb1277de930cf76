use crate::{
    Result,
    app::{
        event_source::{
            ChainLogSource,
            StreamService,
        },
        gapfill::GapFiller,
    },
    events::{
        NetworkEvent,
        StreamResponse,
    },
    lock,
    transform::{
        Decode,
        into_network_events,
        parse_system_calls,
        transform_stream_response,
    },
};
use anyhow::anyhow;
use futures::StreamExt;
use std::{
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{
        Notify,
        mpsc,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};


/// The service sends at least one message per interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const STREAM_TIMEOUT_BUFFER: Duration = Duration::from_millis(500);
pub const RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub keepalive_interval: Duration,
    pub timeout_buffer: Duration,
    /// The last delay repeats once the ladder is exhausted.
    pub retry_delays: Vec<Duration>,
    pub include_system_calls: bool,
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            timeout_buffer: STREAM_TIMEOUT_BUFFER,
            retry_delays: RETRY_DELAYS.to_vec(),
            include_system_calls: false,
            channel_capacity: 64,
        }
    }
}

impl StreamConfig {
    pub fn message_timeout(&self) -> Duration {
        self.keepalive_interval + self.timeout_buffer
    }

    pub fn retry_delay(&self, attempt: usize) -> Duration {
        self.retry_delays
            .get(attempt)
            .or(self.retry_delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Where the stream believes it is. Survives reconnects so a gap opened
/// by a disconnect is detected on the next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingState {
    /// `None` until a message is seen; never matches an incoming message.
    pub expected_prev_log_index: Option<u64>,
    pub expected_prev_log_block: u64,
    pub is_first_message: bool,
}

impl Default for TrackingState {
    fn default() -> Self {
        Self {
            expected_prev_log_index: None,
            expected_prev_log_block: 0,
            is_first_message: true,
        }
    }
}

/// Control surface of a running stream client.
#[derive(Clone, Default)]
pub struct StreamHandle {
    wake: Arc<Notify>,
    tracking: Arc<Mutex<TrackingState>>,
    shutdown: CancellationToken,
}

impl StreamHandle {
    /// Forces a reconnect now, whether streaming or waiting to retry.
    pub fn wake(&self) {
        debug!("Wake signal received");
        self.wake.notify_one();
    }

    /// Moves the block cursor forward after events were applied elsewhere.
    pub fn block_update(&self, block_number: u64) {
        let mut tracking = lock(&self.tracking);
        if block_number > tracking.expected_prev_log_block {
            debug!(block_number, "Block update from foreground");
            tracking.expected_prev_log_block = block_number;
        }
    }

    /// Treats `block_number` as already applied: the first message is
    /// checked against it and the difference is gap filled.
    pub fn resume_from(&self, block_number: u64) {
        let mut tracking = lock(&self.tracking);
        tracking.is_first_message = false;
        tracking.expected_prev_log_block = block_number;
        tracking.expected_prev_log_index = None;
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn tracking(&self) -> TrackingState {
        *lock(&self.tracking)
    }
}

enum SessionEnd {
    Woken,
    ReceiverClosed,
    Failed(anyhow::Error),
}

/// Keeps a subscription to the indexing service alive and turns its
/// messages into ordered, gap-free batches of network events.
pub struct EventStreamClient<S, C, D> {
    service: Arc<S>,
    gaps: GapFiller<S, C, D>,
    decode: Arc<D>,
    config: StreamConfig,
    handle: StreamHandle,
}

impl<S: StreamService, C: ChainLogSource, D: Decode> EventStreamClient<S, C, D> {
    pub fn new(
        service: Arc<S>,
        gaps: GapFiller<S, C, D>,
        decode: Arc<D>,
        config: StreamConfig,
    ) -> Self {
        Self {
            service,
            gaps,
            decode,
            config,
            handle: StreamHandle::default(),
        }
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub fn spawn(self) -> (StreamHandle, mpsc::Receiver<Vec<NetworkEvent>>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let handle = self.handle();
        let task = tokio::spawn(self.run(sender));
        (handle, receiver, task)
    }

    pub async fn run(self, events: mpsc::Sender<Vec<NetworkEvent>>) {
        let shutdown = self.handle.shutdown.clone();
        let mut attempt = 0;
        loop {
            let mut delivered = false;
            let end = tokio::select! {
                _ = shutdown.cancelled() => break,
                end = self.session(&events, &mut delivered) => end,
            };
            if delivered {
                attempt = 0;
            }
            match end {
                SessionEnd::ReceiverClosed => {
                    debug!("Event receiver dropped, stopping stream");
                    break;
                }
                SessionEnd::Woken => {
                    debug!("Reconnecting after wake");
                }
                SessionEnd::Failed(err) => {
                    let delay = self.config.retry_delay(attempt);
                    attempt += 1;
                    warn!(?err, attempt, ?delay, "Event stream interrupted, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.handle.wake.notified() => {
                            debug!("Wake during retry delay, reconnecting now");
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!("Event stream stopped");
    }

    async fn session(
        &self,
        events: &mpsc::Sender<Vec<NetworkEvent>>,
        delivered: &mut bool,
    ) -> SessionEnd {
        let timeout = self.config.message_timeout();
        let subscribed = tokio::select! {
            _ = self.handle.wake.notified() => return SessionEnd::Woken,
            subscribed = tokio::time::timeout(timeout, self.service.subscribe()) => subscribed,
        };
        let mut stream = match subscribed {
            Err(_) => return SessionEnd::Failed(anyhow!("Subscribe timed out after {timeout:?}")),
            Ok(Err(err)) => return SessionEnd::Failed(err),
            Ok(Ok(stream)) => stream,
        };
        debug!(tracking = ?self.handle.tracking(), "Subscribed to event stream");

        loop {
            let next = tokio::select! {
                _ = self.handle.wake.notified() => return SessionEnd::Woken,
                next = tokio::time::timeout(timeout, stream.next()) => next,
            };
            let response = match next {
                Err(_) => {
                    return SessionEnd::Failed(anyhow!("Stream timeout, no data for {timeout:?}"));
                }
                Ok(None) => return SessionEnd::Failed(anyhow!("Stream closed by server")),
                Ok(Some(Err(err))) => return SessionEnd::Failed(err),
                Ok(Some(Ok(response))) => response,
            };
            // Tracking only moves once a gap fill completes, so an abandoned
            // fill is detected again on the next session.
            let processed = tokio::select! {
                _ = self.handle.wake.notified() => return SessionEnd::Woken,
                processed = self.process(response) => processed,
            };
            let batch = match processed {
                Ok(batch) => batch,
                Err(err) => return SessionEnd::Failed(err),
            };
            *delivered = true;
            if events.send(batch).await.is_err() {
                return SessionEnd::ReceiverClosed;
            }
        }
    }

    async fn process(&self, response: StreamResponse) -> Result<Vec<NetworkEvent>> {
        let mut updates = transform_stream_response(self.decode.as_ref(), &response)?;

        if let Some(from_block) = self.gap_start(&response) {
            let mut gap = self
                .gaps
                .fetch_gap_events(from_block, Some(response.block_number), None)
                .await;
            debug!(from_block, recovered = gap.len(), "Prepending gap events");
            gap.append(&mut updates);
            updates = gap;
        }

        {
            let mut tracking = lock(&self.handle.tracking);
            tracking.expected_prev_log_index = Some(response.log_index);
            tracking.expected_prev_log_block = response.block_number;
        }

        if updates.is_empty() {
            return Ok(vec![NetworkEvent::Keepalive {
                block_number: response.block_number,
            }]);
        }

        let calls = if self.config.include_system_calls {
            parse_system_calls(&updates)
        } else {
            Vec::new()
        };
        let mut batch = into_network_events(updates);
        batch.extend(calls.into_iter().map(NetworkEvent::SystemCall));
        Ok(batch)
    }

    fn gap_start(&self, response: &StreamResponse) -> Option<u64> {
        let mut tracking = lock(&self.handle.tracking);
        if tracking.is_first_message {
            tracking.is_first_message = false;
            debug!(
                block_number = response.block_number,
                log_index = response.log_index,
                "Stream started"
            );
            return None;
        }
        let block_matches = response.prev_log_block_number == tracking.expected_prev_log_block;
        let index_matches = Some(response.prev_log_index) == tracking.expected_prev_log_index;
        if block_matches && index_matches {
            return None;
        }
        warn!(
            expected_block = tracking.expected_prev_log_block,
            got_block = response.prev_log_block_number,
            expected_index = ?tracking.expected_prev_log_index,
            got_index = response.prev_log_index,
            "Stream continuity broken, filling gap"
        );
        Some(tracking.expected_prev_log_block)
    }
}
