#![allow(non_snake_case)]

use anyhow::anyhow;
use deployments::{
    DeploymentEnv,
    DeploymentStore,
    record_network,
};
use event_sync::{
    Result,
    app::{
        App,
        RunState,
        ecs::{
            EcsStore,
            InMemoryEcs,
        },
        event_source::{
            ResponseStream,
            StreamService,
        },
        gapfill::{
            GapFillOptions,
            GapFiller,
        },
        http_stream_service::SyncContext,
        json_rpc_log_source::{
            JsonRpcLogSource,
            WorldLogDecoder,
        },
        sled_storage::SledStateStorage,
        state_storage::StateStorage,
        stream::{
            EventStreamClient,
            StreamConfig,
            StreamHandle,
        },
        visibility::{
            VisibilityConfig,
            VisibilityReconciler,
        },
    },
    events::{
        EcsEvent,
        EcsEventType,
        EventsSinceResponse,
        StreamResponse,
    },
    snapshot::StateCache,
    transform::HexDecode,
};
use serde_json::json;
use std::{
    collections::VecDeque,
    future::pending,
    sync::{
        Arc,
        Mutex,
    },
};
use tempdir::TempDir;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

type Session = mpsc::UnboundedSender<Result<StreamResponse>>;
type NoChainLogs = JsonRpcLogSource<WorldLogDecoder, HexDecode>;
type SyncApp<St> = App<ScriptedService, HexDecode, InMemoryEcs, St>;

#[derive(Default)]
struct ScriptedState {
    sessions: VecDeque<UnboundedReceiverStream<Result<StreamResponse>>>,
    events_since: VecDeque<EventsSinceResponse>,
    events_since_calls: Vec<u64>,
}

/// Indexing service whose live sessions are fed by the test.
#[derive(Default)]
struct ScriptedService {
    state: Mutex<ScriptedState>,
}

impl ScriptedService {
    fn new_session(&self) -> Session {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .unwrap()
            .sessions
            .push_back(UnboundedReceiverStream::new(rx));
        tx
    }

    fn respond_events_since(&self, response: EventsSinceResponse) {
        self.state.lock().unwrap().events_since.push_back(response);
    }

    fn events_since_calls(&self) -> Vec<u64> {
        self.state.lock().unwrap().events_since_calls.clone()
    }
}

impl StreamService for ScriptedService {
    async fn subscribe(&self) -> Result<ResponseStream> {
        let session = self.state.lock().unwrap().sessions.pop_front();
        session
            .map(|stream| Box::pin(stream) as ResponseStream)
            .ok_or_else(|| anyhow!("no session scripted"))
    }

    async fn events_since(&self, since_block: u64) -> Result<EventsSinceResponse> {
        let mut state = self.state.lock().unwrap();
        state.events_since_calls.push(since_block);
        state
            .events_since
            .pop_front()
            .ok_or_else(|| anyhow!("no events_since response scripted"))
    }
}

fn set(component: &str, entity: &str, value: &str, tx: &str) -> EcsEvent {
    EcsEvent {
        event_type: EcsEventType::ComponentValueSet,
        component_id: component.to_string(),
        entity_id: entity.to_string(),
        value: Some(value.to_string()),
        tx_hash: tx.to_string(),
        tx_metadata: None,
    }
}

fn removed(component: &str, entity: &str, tx: &str) -> EcsEvent {
    EcsEvent {
        event_type: EcsEventType::ComponentValueRemoved,
        component_id: component.to_string(),
        entity_id: entity.to_string(),
        value: None,
        tx_hash: tx.to_string(),
        tx_metadata: None,
    }
}

fn message(block: u64, log_index: u64, prev: (u64, u64), events: Vec<EcsEvent>) -> StreamResponse {
    StreamResponse {
        block_number: block,
        log_index,
        prev_log_block_number: prev.0,
        prev_log_index: prev.1,
        ecs_events: events,
    }
}

struct Running<St> {
    app: SyncApp<St>,
    stream: StreamHandle,
    task: JoinHandle<()>,
}

fn start<St: StateStorage>(
    service: &Arc<ScriptedService>,
    storage: St,
    resume_from: Option<u64>,
) -> Running<St> {
    let decode = Arc::new(HexDecode);
    let gaps = GapFiller::<_, NoChainLogs, _>::new(
        Arc::clone(service),
        None,
        Arc::clone(&decode),
        GapFillOptions {
            skip_rpc_fallback: true,
            ..GapFillOptions::default()
        },
    );
    let client = EventStreamClient::new(
        Arc::clone(service),
        gaps,
        Arc::clone(&decode),
        StreamConfig::default(),
    );
    if let Some(block) = resume_from {
        client.handle().resume_from(block);
    }
    let (stream, events, task) = client.spawn();
    let reconciler = VisibilityReconciler::new(
        Arc::clone(service),
        decode,
        stream.clone(),
        VisibilityConfig::default(),
    );
    let (_foreground, foreground_rx) = mpsc::channel(1);
    let app = App::new(
        events,
        foreground_rx,
        stream.clone(),
        reconciler,
        InMemoryEcs::default(),
        StateCache::default(),
        storage,
        100,
    );
    Running { app, stream, task }
}

#[tokio::test]
async fn sync__streamed_state_survives_checkpoint_and_replay() {
    // given
    let dir = TempDir::new("sync_flow_checkpoint").unwrap();
    let db = sled::open(dir.path()).unwrap();
    let service = Arc::new(ScriptedService::default());
    let session = service.new_session();
    let mut running = start(&service, SledStateStorage::new(&db).unwrap(), None);
    session
        .send(Ok(message(
            10,
            1,
            (9, 0),
            vec![
                set("0x0a", "0x01", "0x2a", "0xt1"),
                set("0x0b", "0x01", "0x01", "0xt1"),
            ],
        )))
        .unwrap();
    session
        .send(Ok(message(
            11,
            0,
            (10, 1),
            vec![
                removed("0x0b", "0x01", "0xt2"),
                set("0x0a", "0x02", "0x07", "0xt2"),
            ],
        )))
        .unwrap();

    // when
    for _ in 0..2 {
        let state = running.app.run(pending()).await.unwrap();
        assert_eq!(state, RunState::Continue);
    }
    let state = running.app.run(async {}).await.unwrap();
    running.task.await.unwrap();

    // then
    assert_eq!(state, RunState::Exit);
    assert!(running.stream.is_shutdown());
    let live = running.app.ecs();
    assert_eq!(live.get_component_value("0xa", "0x1"), Some(&json!("0x2a")));
    assert_eq!(live.get_component_value("0xa", "0x2"), Some(&json!("0x07")));
    assert!(!live.has_component("0xb", "0x1"));

    let restored = SledStateStorage::new(&db).unwrap().from_store().unwrap();
    assert_eq!(restored.block_number, 11);
    assert_eq!(restored.len(), 2);
    let mut replayed = InMemoryEcs::default();
    assert_eq!(restored.replay_into(&mut replayed), 2);
    assert_eq!(
        replayed.get_component_value("0xa", "0x1"),
        live.get_component_value("0xa", "0x1")
    );
    assert_eq!(
        replayed.get_component_value("0xa", "0x2"),
        live.get_component_value("0xa", "0x2")
    );
    assert!(!replayed.has_component("0xb", "0x1"));
}

#[tokio::test]
async fn sync__resume_from_recorded_start_block_fills_gap_first() {
    // given
    let root = TempDir::new("sync_flow_deployments").unwrap();
    let store = DeploymentStore::in_root(root.path(), DeploymentEnv::Local).unwrap();
    record_network(
        &store,
        "http://localhost:7070/",
        Some("http://localhost:8545"),
        "0xWorld",
        1337,
        Some(40),
    )
    .unwrap();
    let record = store.load().unwrap().unwrap();

    let context = SyncContext::new();
    let http = context.stream_service(&record.stream_url).unwrap();
    assert_eq!(http.base_url(), "http://localhost:7070");

    let dir = TempDir::new("sync_flow_resume").unwrap();
    let db = sled::open(dir.path()).unwrap();
    let service = Arc::new(ScriptedService::default());
    service.respond_events_since(EventsSinceResponse {
        events: vec![set("0x0c", "0x05", "0x01", "0xt0")],
        latest_block: 44,
    });
    let session = service.new_session();
    let mut running = start(&service, SledStateStorage::new(&db).unwrap(), record.start_block);

    // when
    session
        .send(Ok(message(45, 0, (44, 3), vec![set("0x0c", "0x06", "0x02", "0xt1")])))
        .unwrap();
    running.app.run(pending()).await.unwrap();
    running.app.run(async {}).await.unwrap();
    running.task.await.unwrap();

    // then
    assert_eq!(service.events_since_calls(), vec![40]);
    let ecs = running.app.ecs();
    assert_eq!(ecs.get_component_value("0xc", "0x5"), Some(&json!("0x01")));
    assert_eq!(ecs.get_component_value("0xc", "0x6"), Some(&json!("0x02")));
    assert_eq!(ecs.entities_with("0xc"), vec!["0x5", "0x6"]);
    let restored = SledStateStorage::new(&db).unwrap().from_store().unwrap();
    assert_eq!(restored.block_number, 45);
}

#[tokio::test]
async fn sync__keepalive_only_stream_advances_checkpoint_block() {
    // given
    let dir = TempDir::new("sync_flow_keepalive").unwrap();
    let db = sled::open(dir.path()).unwrap();
    let service = Arc::new(ScriptedService::default());
    let session = service.new_session();
    let mut running = start(&service, SledStateStorage::new(&db).unwrap(), None);
    let mut system_calls = running.app.subscribe_system_calls();

    // when
    session.send(Ok(message(7, 0, (6, 0), vec![]))).unwrap();
    running.app.run(pending()).await.unwrap();
    let state = running.app.run(async {}).await.unwrap();
    running.task.await.unwrap();

    // then
    assert_eq!(state, RunState::Exit);
    assert!(system_calls.try_recv().is_err());
    assert_eq!(running.app.cache().block_number, 7);
    let restored = SledStateStorage::new(&db).unwrap().from_store().unwrap();
    assert_eq!(restored.block_number, 7);
    assert!(restored.is_empty());
}
