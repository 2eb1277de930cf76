#![allow(non_snake_case)]

use serde_json::{
    Value,
    json,
};
use std::sync::Arc;
use tx_queue::{
    ActionState,
    ActionTracker,
    CallEncoder,
    Error,
    GasEstimationCache,
    QueueConfig,
    Result,
    SubmissionError,
    Systems,
    TransactionQueue,
    TxRequest,
    test_helpers::{
        FakeProvider,
        FakeSigner,
    },
};

struct ArgCountEncoder;

impl CallEncoder for ArgCountEncoder {
    fn encode(&self, system: &str, method: &str, args: &[Value]) -> Result<TxRequest> {
        Ok(TxRequest::new(system, format!("{method}:{}", args.len())))
    }
}

struct Client {
    signer: FakeSigner,
    queue: TransactionQueue<FakeSigner>,
    systems: Systems<FakeSigner, ArgCountEncoder>,
    tracker: ActionTracker<FakeProvider>,
}

fn client(signer: FakeSigner) -> Client {
    let queue = TransactionQueue::new(
        Arc::new(signer.clone()),
        Arc::new(GasEstimationCache::default()),
        QueueConfig::default(),
    );
    let systems = Systems::new(
        &queue,
        Arc::new(ArgCountEncoder),
        ["system.harvest.start", "system.harvest.stop", "system.account.move"],
    );
    let tracker = ActionTracker::new(Arc::new(signer.fake_provider().clone()));
    Client {
        signer,
        queue,
        systems,
        tracker,
    }
}

#[tokio::test]
async fn actions__burst_recovers_from_nonce_conflict_and_completes_in_sequence() {
    // given
    let signer = FakeSigner::with_nonce(5);
    signer.fail_next_send(SubmissionError::nonce_expired("nonce too low"), Some(6));
    let client = client(signer);

    // when
    let mut indices = Vec::new();
    for (system, arg) in [
        ("system.harvest.start", 1),
        ("system.account.move", 12),
        ("system.harvest.stop", 1),
    ] {
        let request = client
            .systems
            .get(system)
            .unwrap()
            .action("executeTyped", vec![json!(arg)], format!("{system} {arg}"));
        indices.push(client.tracker.add(request));
    }
    let mut actions = Vec::new();
    for index in indices {
        actions.push(client.tracker.wait(index).await.unwrap());
    }

    // then
    assert!(actions.iter().all(|a| a.state == ActionState::Complete));
    assert!(actions.iter().all(|a| a.tx_hash.is_some()));
    assert_eq!(client.signer.sent_nonces(), vec![5, 6, 7, 8]);
    assert_eq!(client.queue.nonces().current(), Some(9));
    assert_eq!(client.signer.nonce_fetches(), 2);
}

#[tokio::test]
async fn actions__reverted_broadcast_fails_action_but_next_call_uses_next_nonce() {
    // given
    let signer = FakeSigner::with_nonce(20);
    signer.fail_next_send(
        SubmissionError::new("execution reverted").broadcast(Some("0xdead".to_string())),
        None,
    );
    signer.fake_provider().respond(
        "debug_traceTransaction",
        Ok(json!({ "revertReason": "Harvest: not started", "output": "0x" })),
    );
    let client = client(signer);
    let stop = client.systems.get("system.harvest.stop").unwrap();

    // when
    let failed = client
        .tracker
        .add(stop.action("executeTyped", vec![json!(3)], "Stop harvest"));
    let failed = client.tracker.wait(failed).await.unwrap();
    let retried = client
        .tracker
        .add(stop.action("executeTyped", vec![json!(3)], "Stop harvest again"));
    let retried = client.tracker.wait(retried).await.unwrap();

    // then
    assert_eq!(failed.state, ActionState::Failed);
    assert_eq!(failed.metadata.as_deref(), Some("Harvest: not started"));
    assert_eq!(retried.state, ActionState::Complete);
    assert_eq!(client.signer.sent_nonces(), vec![20, 21]);
}

#[tokio::test]
async fn actions__sync_send_completes_from_returned_receipt() {
    // given
    let client = client(FakeSigner::with_nonce(0).sync_send());

    // when
    let request = client
        .systems
        .get("system.account.move")
        .unwrap()
        .action("executeTyped", vec![json!(4)], "Move to room 4");
    let index = client.tracker.add(request);
    let action = client.tracker.wait(index).await.unwrap();

    // then
    assert_eq!(action.state, ActionState::Complete);
    assert_eq!(action.action, "system.account.move.executeTyped");
    let provider = client.signer.fake_provider();
    assert_eq!(provider.calls_to("eth_sendRawTransactionSync"), 1);
    assert_eq!(client.queue.nonces().current(), Some(1));
}

#[tokio::test]
async fn systems__unknown_system_is_rejected_before_queueing() {
    let client = client(FakeSigner::with_nonce(0));

    let result = client.systems.get("system.kami.feed");

    assert!(matches!(result, Err(Error::UnknownSystem(name)) if name == "system.kami.feed"));
    assert_eq!(client.queue.pending(), 0);
    assert!(client.signer.sent().is_empty());
}
