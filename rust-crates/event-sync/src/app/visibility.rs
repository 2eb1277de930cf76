use crate::{
    app::{
        event_source::StreamService,
        stream::{
            KEEPALIVE_INTERVAL,
            StreamHandle,
        },
    },
    events::{
        NetworkComponentUpdate,
        NetworkEvent,
    },
    transform::{
        Decode,
        parse_events_since,
    },
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;
use tracing::{
    debug,
    warn,
};

pub const WAKE_DEBOUNCE: Duration = Duration::from_secs(1);
pub const HEALTH_CHECK_BUFFER: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityConfig {
    pub debounce: Duration,
    /// A stream that delivered within this window is left alone.
    pub health_threshold: Duration,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            debounce: WAKE_DEBOUNCE,
            health_threshold: KEEPALIVE_INTERVAL + HEALTH_CHECK_BUFFER,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForegroundOutcome {
    Debounced,
    Healthy,
    /// Nothing has been applied yet, so there is no block to catch up from.
    NoBaseline,
    UpToDate,
    Filled {
        events: Vec<NetworkComponentUpdate>,
        latest_block: u64,
    },
    Failed,
}

/// Catches up after the process was suspended or backgrounded: wakes the
/// stream and, when it looks stale, fetches missed events directly.
pub struct VisibilityReconciler<S, D> {
    service: Arc<S>,
    decode: Arc<D>,
    stream: StreamHandle,
    config: VisibilityConfig,
    last_wake: Option<Instant>,
    last_known_block: u64,
    last_event_time: Option<Instant>,
}

impl<S: StreamService, D: Decode> VisibilityReconciler<S, D> {
    pub fn new(service: Arc<S>, decode: Arc<D>, stream: StreamHandle, config: VisibilityConfig) -> Self {
        Self {
            service,
            decode,
            stream,
            config,
            last_wake: None,
            last_known_block: 0,
            last_event_time: None,
        }
    }

    pub fn with_last_known_block(mut self, block_number: u64) -> Self {
        self.last_known_block = block_number;
        self
    }

    pub fn last_known_block(&self) -> u64 {
        self.last_known_block
    }

    pub fn observe(&mut self, batch: &[NetworkEvent]) {
        if let Some(latest) = batch.iter().filter_map(NetworkEvent::block_number).max() {
            self.last_known_block = self.last_known_block.max(latest);
        }
        self.last_event_time = Some(Instant::now());
    }

    pub async fn on_foreground(&mut self) -> ForegroundOutcome {
        let now = Instant::now();
        if self
            .last_wake
            .is_some_and(|last| now.duration_since(last) < self.config.debounce)
        {
            debug!("Wake debounced");
            return ForegroundOutcome::Debounced;
        }
        self.last_wake = Some(now);
        self.stream.wake();

        if let Some(last) = self.last_event_time {
            let quiet = now.duration_since(last);
            if quiet < self.config.health_threshold {
                debug!(?quiet, "Stream healthy, skipping direct catch-up");
                return ForegroundOutcome::Healthy;
            }
        }
        if self.last_known_block == 0 {
            return ForegroundOutcome::NoBaseline;
        }

        let since = self.last_known_block;
        debug!(since, "Stream looks stale, fetching missed events");
        let response = match self.service.events_since(since).await {
            Ok(response) => response,
            Err(err) => {
                warn!(?err, since, "Direct catch-up failed");
                return ForegroundOutcome::Failed;
            }
        };
        let events = match parse_events_since(self.decode.as_ref(), &response, since) {
            Ok(events) => events,
            Err(err) => {
                warn!(?err, since, "Failed to decode catch-up events");
                return ForegroundOutcome::Failed;
            }
        };
        if events.is_empty() {
            return ForegroundOutcome::UpToDate;
        }

        self.last_known_block = self.last_known_block.max(response.latest_block);
        self.last_event_time = Some(Instant::now());
        self.stream.block_update(self.last_known_block);
        debug!(
            recovered = events.len(),
            latest_block = response.latest_block,
            "Caught up from foreground"
        );
        ForegroundOutcome::Filled {
            events,
            latest_block: response.latest_block,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        app::test_helpers::{
            FakeStreamService,
            set_event,
        },
        events::EventsSinceResponse,
        transform::HexDecode,
    };

    fn reconciler(service: &FakeStreamService, handle: &StreamHandle) -> VisibilityReconciler<FakeStreamService, HexDecode> {
        VisibilityReconciler::new(
            Arc::new(service.clone()),
            Arc::new(HexDecode),
            handle.clone(),
            VisibilityConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn on_foreground__stale_stream_fills_and_advances_cursor() {
        // given
        let service = FakeStreamService::default();
        service.respond_events_since(Ok(EventsSinceResponse {
            events: vec![set_event("0x1", "0xa", "0x01", "0xt1")],
            latest_block: 140,
        }));
        let handle = StreamHandle::default();
        let mut reconciler = reconciler(&service, &handle);
        reconciler.observe(&[NetworkEvent::Keepalive { block_number: 120 }]);
        tokio::time::sleep(Duration::from_secs(30)).await;

        // when
        let outcome = reconciler.on_foreground().await;

        // then
        let ForegroundOutcome::Filled { events, latest_block } = outcome else {
            panic!("expected fill, got {outcome:?}");
        };
        assert_eq!(latest_block, 140);
        assert_eq!(events[0].block_number, 120);
        assert_eq!(service.events_since_calls(), vec![120]);
        assert_eq!(reconciler.last_known_block(), 140);
        assert_eq!(handle.tracking().expected_prev_log_block, 140);
    }

    #[tokio::test(start_paused = true)]
    async fn on_foreground__recent_events_are_healthy() {
        let service = FakeStreamService::default();
        let handle = StreamHandle::default();
        let mut reconciler = reconciler(&service, &handle);
        reconciler.observe(&[NetworkEvent::Keepalive { block_number: 5 }]);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let outcome = reconciler.on_foreground().await;

        assert_eq!(outcome, ForegroundOutcome::Healthy);
        assert!(service.events_since_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn on_foreground__second_call_within_debounce_is_ignored() {
        // given
        let service = FakeStreamService::default();
        let handle = StreamHandle::default();
        let mut reconciler = reconciler(&service, &handle);

        // when
        let first = reconciler.on_foreground().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let second = reconciler.on_foreground().await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        let third = reconciler.on_foreground().await;

        // then
        assert_eq!(first, ForegroundOutcome::NoBaseline);
        assert_eq!(second, ForegroundOutcome::Debounced);
        assert_eq!(third, ForegroundOutcome::NoBaseline);
    }

    #[tokio::test(start_paused = true)]
    async fn on_foreground__empty_catch_up_keeps_cursor() {
        let service = FakeStreamService::default();
        service.respond_events_since(Ok(EventsSinceResponse {
            events: vec![],
            latest_block: 999,
        }));
        let handle = StreamHandle::default();
        let mut reconciler = reconciler(&service, &handle).with_last_known_block(50);

        let outcome = reconciler.on_foreground().await;

        assert_eq!(outcome, ForegroundOutcome::UpToDate);
        assert_eq!(reconciler.last_known_block(), 50);
        assert_eq!(handle.tracking().expected_prev_log_block, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn on_foreground__service_error_reports_failure() {
        let service = FakeStreamService::default();
        service.respond_events_since(Err(anyhow::anyhow!("unavailable")));
        let handle = StreamHandle::default();
        let mut reconciler = reconciler(&service, &handle).with_last_known_block(50);

        assert_eq!(reconciler.on_foreground().await, ForegroundOutcome::Failed);
    }
}
