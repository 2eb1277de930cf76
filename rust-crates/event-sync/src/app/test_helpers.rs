use crate::{
    Result,
    app::event_source::{
        ChainLogSource,
        ResponseStream,
        StreamService,
    },
    events::{
        EcsEvent,
        EcsEventType,
        EventsSinceResponse,
        NetworkComponentUpdate,
        StreamResponse,
    },
    lock,
};
use anyhow::anyhow;
use futures::StreamExt;
use std::{
    collections::VecDeque,
    future::pending,
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub type SessionSender = mpsc::UnboundedSender<Result<StreamResponse>>;

pub fn set_event(component: &str, entity: &str, value: &str, tx: &str) -> EcsEvent {
    EcsEvent {
        event_type: EcsEventType::ComponentValueSet,
        component_id: component.to_string(),
        entity_id: entity.to_string(),
        value: Some(value.to_string()),
        tx_hash: tx.to_string(),
        tx_metadata: None,
    }
}

pub fn message(block_number: u64, log_index: u64, prev: (u64, u64), events: Vec<EcsEvent>) -> StreamResponse {
    StreamResponse {
        block_number,
        log_index,
        prev_log_block_number: prev.0,
        prev_log_index: prev.1,
        ecs_events: events,
    }
}

enum Scripted {
    Session(UnboundedReceiverStream<Result<StreamResponse>>),
    Fail(anyhow::Error),
    Hang,
}

#[derive(Default)]
struct ServiceState {
    sessions: VecDeque<Scripted>,
    subscribe_times: Vec<Instant>,
    events_since: VecDeque<Result<EventsSinceResponse>>,
    events_since_calls: Vec<u64>,
    hang_events_since: bool,
}

/// Scripted indexing service. Each `subscribe` takes the next scripted
/// session; tests push messages through the returned sender and end the
/// session by dropping it.
#[derive(Clone, Default)]
pub struct FakeStreamService {
    state: Arc<Mutex<ServiceState>>,
}

impl FakeStreamService {
    pub fn new_session(&self) -> SessionSender {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.state)
            .sessions
            .push_back(Scripted::Session(UnboundedReceiverStream::new(receiver)));
        sender
    }

    pub fn fail_next_subscribe(&self) {
        lock(&self.state)
            .sessions
            .push_back(Scripted::Fail(anyhow!("connection refused")));
    }

    /// The next subscribe never resolves, like a server that accepts the
    /// connection and then goes silent.
    pub fn hang_next_subscribe(&self) {
        lock(&self.state).sessions.push_back(Scripted::Hang);
    }

    pub fn hang_events_since(&self) {
        lock(&self.state).hang_events_since = true;
    }

    pub fn subscribe_count(&self) -> usize {
        lock(&self.state).subscribe_times.len()
    }

    /// Gaps between consecutive subscribe attempts.
    pub fn subscribe_intervals(&self) -> Vec<Duration> {
        lock(&self.state)
            .subscribe_times
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }

    pub fn respond_events_since(&self, response: Result<EventsSinceResponse>) {
        lock(&self.state).events_since.push_back(response);
    }

    pub fn events_since_calls(&self) -> Vec<u64> {
        lock(&self.state).events_since_calls.clone()
    }
}

impl StreamService for FakeStreamService {
    async fn subscribe(&self) -> Result<ResponseStream> {
        let next = {
            let mut state = lock(&self.state);
            state.subscribe_times.push(Instant::now());
            state.sessions.pop_front()
        };
        match next {
            Some(Scripted::Session(stream)) => Ok(stream.boxed()),
            Some(Scripted::Fail(err)) => Err(err),
            Some(Scripted::Hang) => pending().await,
            None => Err(anyhow!("no session scripted")),
        }
    }

    async fn events_since(&self, since_block: u64) -> Result<EventsSinceResponse> {
        let next = {
            let mut state = lock(&self.state);
            state.events_since_calls.push(since_block);
            if state.hang_events_since {
                None
            } else {
                Some(
                    state
                        .events_since
                        .pop_front()
                        .unwrap_or_else(|| Err(anyhow!("no events_since response scripted"))),
                )
            }
        };
        match next {
            Some(response) => response,
            None => pending().await,
        }
    }
}

#[derive(Default)]
struct LogsState {
    latest_block: u64,
    updates: Vec<NetworkComponentUpdate>,
    ranges: Vec<(u64, u64)>,
    fail: bool,
}

#[derive(Clone, Default)]
pub struct FakeChainLogs {
    state: Arc<Mutex<LogsState>>,
}

impl FakeChainLogs {
    pub fn set_latest_block(&self, block: u64) {
        lock(&self.state).latest_block = block;
    }

    pub fn add_update(&self, block: u64, component: &str, entity: &str) {
        lock(&self.state).updates.push(NetworkComponentUpdate {
            component: component.to_string(),
            entity: entity.to_string(),
            value: Some(serde_json::json!(block)),
            block_number: block,
            last_event_in_tx: true,
            tx_hash: format!("0x{block:x}"),
            tx_metadata: None,
        });
    }

    pub fn fail_fetches(&self) {
        lock(&self.state).fail = true;
    }

    pub fn requested_ranges(&self) -> Vec<(u64, u64)> {
        lock(&self.state).ranges.clone()
    }
}

impl ChainLogSource for FakeChainLogs {
    async fn latest_block(&self) -> Result<u64> {
        Ok(lock(&self.state).latest_block)
    }

    async fn fetch_world_events(&self, from_block: u64, to_block: u64) -> Result<Vec<NetworkComponentUpdate>> {
        let mut state = lock(&self.state);
        if state.fail {
            return Err(anyhow!("rpc unavailable"));
        }
        state.ranges.push((from_block, to_block));
        Ok(state
            .updates
            .iter()
            .filter(|u| (from_block..=to_block).contains(&u.block_number))
            .cloned()
            .collect())
    }
}
