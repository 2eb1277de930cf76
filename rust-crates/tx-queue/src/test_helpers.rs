//! Scriptable signer and provider fakes shared by unit and integration tests.

use crate::{
    lock,
    signer::{
        RpcProvider,
        Signer,
        SubmissionError,
        TxOverrides,
        TxReceipt,
        TxRequest,
    },
};
use serde_json::{
    Value,
    json,
};
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTx {
    pub to: String,
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ScriptedFailure {
    pub error: SubmissionError,
    /// Chain nonce after the failure, e.g. when another client consumed ours.
    pub chain_nonce_after: Option<u64>,
}

#[derive(Debug, Default)]
struct FakeSignerState {
    chain_nonce: u64,
    nonce_fetches: u32,
    nonce_failure: Option<SubmissionError>,
    nonce_delay: Option<Duration>,
    estimate: Option<u64>,
    estimate_failure: Option<SubmissionError>,
    estimate_calls: u32,
    script: VecDeque<Option<ScriptedFailure>>,
    always_fail: Option<SubmissionError>,
    sent: Vec<SentTx>,
    hash_counter: u64,
}

#[derive(Debug, Clone, Default)]
pub struct FakeSigner {
    state: Arc<Mutex<FakeSignerState>>,
    provider: FakeProvider,
    sync_send: bool,
}

impl FakeSigner {
    pub fn with_nonce(nonce: u64) -> Self {
        let signer = Self::default();
        signer.set_chain_nonce(nonce);
        signer
    }

    pub fn sync_send(mut self) -> Self {
        self.sync_send = true;
        self
    }

    pub fn fake_provider(&self) -> &FakeProvider {
        &self.provider
    }

    pub fn set_chain_nonce(&self, nonce: u64) {
        lock(&self.state).chain_nonce = nonce;
    }

    pub fn fail_nonce_fetch(&self, error: SubmissionError) {
        lock(&self.state).nonce_failure = Some(error);
    }

    /// Every nonce fetch waits this long before answering.
    pub fn set_nonce_delay(&self, delay: Duration) {
        lock(&self.state).nonce_delay = Some(delay);
    }

    pub fn set_estimate(&self, estimate: u64) {
        lock(&self.state).estimate = Some(estimate);
    }

    pub fn fail_estimates(&self, error: SubmissionError) {
        lock(&self.state).estimate_failure = Some(error);
    }

    /// Queues a failure behind any sends already scripted.
    pub fn fail_next_send(&self, error: SubmissionError, chain_nonce_after: Option<u64>) {
        lock(&self.state).script.push_back(Some(ScriptedFailure {
            error,
            chain_nonce_after,
        }));
    }

    pub fn succeed_next_send(&self) {
        lock(&self.state).script.push_back(None);
    }

    pub fn fail_every_send(&self, error: SubmissionError) {
        lock(&self.state).always_fail = Some(error);
    }

    pub fn nonce_fetches(&self) -> u32 {
        lock(&self.state).nonce_fetches
    }

    pub fn estimate_calls(&self) -> u32 {
        lock(&self.state).estimate_calls
    }

    pub fn sent(&self) -> Vec<SentTx> {
        lock(&self.state).sent.clone()
    }

    pub fn sent_nonces(&self) -> Vec<u64> {
        self.sent().iter().filter_map(|tx| tx.nonce).collect()
    }

    fn record_send(&self, tx: &TxRequest, overrides: TxOverrides) -> Result<String, SubmissionError> {
        let mut state = lock(&self.state);
        state.sent.push(SentTx {
            to: tx.to.clone(),
            nonce: overrides.nonce,
            gas_limit: overrides.gas_limit,
        });
        if let Some(error) = state.always_fail.clone() {
            return Err(error);
        }
        if let Some(Some(failure)) = state.script.pop_front() {
            if let Some(nonce) = failure.chain_nonce_after {
                state.chain_nonce = nonce;
            }
            return Err(failure.error);
        }
        if let Some(nonce) = overrides.nonce {
            state.chain_nonce = nonce + 1;
        }
        state.hash_counter += 1;
        Ok(format!("0x{:064x}", state.hash_counter))
    }
}

impl Signer for FakeSigner {
    type Provider = FakeProvider;

    fn provider(&self) -> &FakeProvider {
        &self.provider
    }

    async fn get_nonce(&self) -> Result<u64, SubmissionError> {
        let delay = lock(&self.state).nonce_delay;
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        let mut state = lock(&self.state);
        state.nonce_fetches += 1;
        match state.nonce_failure.take() {
            Some(error) => Err(error),
            None => Ok(state.chain_nonce),
        }
    }

    async fn estimate_gas(&self, _tx: &TxRequest) -> Result<u64, SubmissionError> {
        let mut state = lock(&self.state);
        state.estimate_calls += 1;
        if let Some(error) = state.estimate_failure.clone() {
            return Err(error);
        }
        Ok(state.estimate.unwrap_or(21_000))
    }

    async fn sign_transaction(
        &self,
        tx: &TxRequest,
        overrides: TxOverrides,
    ) -> Result<String, SubmissionError> {
        let hash = self.record_send(tx, overrides)?;
        // the fake "raw transaction" is just the hash it will land under
        Ok(hash)
    }

    async fn send_transaction(
        &self,
        tx: &TxRequest,
        overrides: TxOverrides,
    ) -> Result<String, SubmissionError> {
        tokio::task::yield_now().await;
        self.record_send(tx, overrides)
    }

    fn supports_sync_send(&self) -> bool {
        self.sync_send
    }
}

#[derive(Debug, Default)]
struct FakeProviderState {
    calls: Vec<(String, Value)>,
    responses: HashMap<String, Result<Value, SubmissionError>>,
    receipt_status: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeProviderState>>,
}

impl FakeProvider {
    pub fn respond(&self, method: &str, response: Result<Value, SubmissionError>) {
        lock(&self.state)
            .responses
            .insert(method.to_string(), response);
    }

    /// Receipts default to status 1.
    pub fn set_receipt_status(&self, hash: &str, status: u64) {
        lock(&self.state)
            .receipt_status
            .insert(hash.to_string(), status);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        lock(&self.state).calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    fn status_of(&self, hash: &str) -> u64 {
        lock(&self.state)
            .receipt_status
            .get(hash)
            .copied()
            .unwrap_or(1)
    }
}

impl RpcProvider for FakeProvider {
    async fn send(&self, method: &str, params: Value) -> Result<Value, SubmissionError> {
        let response = {
            let mut state = lock(&self.state);
            state.calls.push((method.to_string(), params.clone()));
            state.responses.get(method).cloned()
        };
        match (method, response) {
            (_, Some(response)) => response,
            ("eth_sendRawTransactionSync", None) => {
                let hash = params[0].as_str().unwrap_or_default().to_string();
                let status = self.status_of(&hash);
                Ok(json!({
                    "transactionHash": hash,
                    "blockNumber": "0x1",
                    "status": format!("0x{status:x}"),
                }))
            }
            (method, None) => Err(SubmissionError::new(format!("no response for {method}"))),
        }
    }

    async fn wait_for_receipt(&self, hash: &str) -> Result<TxReceipt, SubmissionError> {
        tokio::task::yield_now().await;
        Ok(TxReceipt {
            transaction_hash: hash.to_string(),
            block_number: Some(1),
            status: self.status_of(hash),
            gas_used: None,
        })
    }
}
