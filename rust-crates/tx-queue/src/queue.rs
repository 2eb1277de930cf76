use crate::{
    Error,
    Result,
    gas_cache::{
        GasEstimationCache,
        KeyOptions,
    },
    lock,
    nonce::NonceManager,
    priority_queue::{
        DEFAULT_PRIORITY,
        PriorityQueue,
    },
    signer::{
        RpcProvider,
        Signer,
        SubmissionError,
        TxOverrides,
        TxReceipt,
        TxRequest,
        TxResult,
    },
};
use serde_json::{
    Value,
    json,
};
use std::{
    future::Future,
    sync::{
        Arc,
        Mutex,
    },
};
use tokio::sync::oneshot;
use tracing::{
    debug,
    info,
    warn,
};
use uuid::Uuid;


pub const MAX_NONCE_RETRIES: u32 = 1;
pub const DEFAULT_GAS_LIMIT: u64 = 6_000_000;
pub const SYNC_SEND_TIMEOUT_MS: u64 = 8_000;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_nonce_retries: u32,
    /// Used when live estimation fails.
    pub fallback_gas_limit: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_nonce_retries: MAX_NONCE_RETRIES,
            fallback_gas_limit: DEFAULT_GAS_LIMIT,
        }
    }
}

/// One call waiting for the submission gate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueuedCall {
    pub system: String,
    pub method: String,
    /// Only their shapes matter here; they key the gas cache.
    pub args: Vec<Value>,
    pub tx: TxRequest,
    pub gas_limit: Option<u64>,
    pub tax_enabled: bool,
    pub priority: i64,
}

impl QueuedCall {
    pub fn new(system: impl Into<String>, method: impl Into<String>, tx: TxRequest) -> Self {
        Self {
            system: system.into(),
            method: method.into(),
            tx,
            priority: DEFAULT_PRIORITY,
            ..Self::default()
        }
    }

    /// A call with no system identity. Never cached.
    pub fn raw(tx: TxRequest) -> Self {
        Self {
            tx,
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tax(mut self, tax_enabled: bool) -> Self {
        self.tax_enabled = tax_enabled;
        self
    }

    fn cache_key(&self, cache: &GasEstimationCache) -> Option<String> {
        if self.system.is_empty() {
            return None;
        }
        Some(cache.generate_key(
            &self.system,
            &self.method,
            &self.args,
            KeyOptions {
                tax_enabled: self.tax_enabled,
            },
        ))
    }
}

struct QueueItem {
    call: QueuedCall,
    resolve: oneshot::Sender<Result<TxResult>>,
}

/// Serializes on-chain submission for one signer.
///
/// Every submitted call spawns a worker that waits on the gate; inside the
/// gate the worker pops the highest-priority pending call, so calls queued
/// behind an in-flight submission are reordered by priority.
pub struct TransactionQueue<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for TransactionQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S> {
    signer: Arc<S>,
    nonces: NonceManager<S>,
    gas_cache: Arc<GasEstimationCache>,
    pending: Mutex<PriorityQueue<QueueItem>>,
    gate: tokio::sync::Mutex<()>,
    config: QueueConfig,
}

impl<S: Signer> TransactionQueue<S> {
    pub fn new(signer: Arc<S>, gas_cache: Arc<GasEstimationCache>, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                nonces: NonceManager::new(Arc::clone(&signer)),
                signer,
                gas_cache,
                pending: Mutex::new(PriorityQueue::new()),
                gate: tokio::sync::Mutex::new(()),
                config,
            }),
        }
    }

    pub fn signer(&self) -> &Arc<S> {
        &self.inner.signer
    }

    pub fn nonces(&self) -> &NonceManager<S> {
        &self.inner.nonces
    }

    pub fn gas_cache(&self) -> &Arc<GasEstimationCache> {
        &self.inner.gas_cache
    }

    /// Calls not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Enqueues immediately; the returned future resolves once the call was
    /// submitted or failed for good. Must be called inside a Tokio runtime.
    pub fn submit(&self, call: QueuedCall) -> impl Future<Output = Result<TxResult>> + Send + 'static {
        let (resolve, result) = oneshot::channel();
        let id = Uuid::new_v4().to_string();
        let priority = call.priority;
        debug!(%id, system = %call.system, method = %call.method, priority, "transaction queued");
        lock(&self.inner.pending).add_with_priority(id, QueueItem { call, resolve }, priority);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.process_next().await });

        async move { result.await.map_err(|_| Error::QueueClosed)? }
    }
}

impl<S: Signer> Inner<S> {
    async fn process_next(&self) {
        let _gate = self.gate.lock().await;
        let item = { lock(&self.pending).next() };
        let Some(QueueItem { call, resolve }) = item else {
            return;
        };

        let result = self.submit_exclusive(&call).await;
        match &result {
            Ok(TxResult {
                hash,
                receipt: Some(receipt),
            }) => info!(%hash, block = ?receipt.block_number, "transaction confirmed"),
            Ok(TxResult { hash, receipt: None }) => info!(%hash, "transaction sent"),
            Err(err) => warn!(%err, system = %call.system, method = %call.method, "transaction failed"),
        }
        if resolve.send(result).is_err() {
            debug!("caller dropped before the transaction resolved");
        }
    }

    async fn submit_exclusive(&self, call: &QueuedCall) -> Result<TxResult> {
        let snapshot = self.nonces.read().await?;
        let overrides = TxOverrides {
            nonce: Some(snapshot.nonce),
            gas_limit: Some(self.estimate_gas(call).await),
        };
        self.execute_with_retry(call, overrides).await
    }

    async fn estimate_gas(&self, call: &QueuedCall) -> u64 {
        if let Some(gas_limit) = call.gas_limit {
            debug!(gas_limit, "using caller gas limit");
            return gas_limit;
        }
        let key = call.cache_key(&self.gas_cache);
        if let Some(cached) = key.as_deref().and_then(|key| self.gas_cache.get(key)) {
            return cached;
        }
        match self.signer.estimate_gas(&call.tx).await {
            Ok(estimate) => match key {
                Some(key) => self.gas_cache.set(&key, estimate),
                None => estimate,
            },
            Err(err) => {
                warn!(
                    %err,
                    fallback = self.config.fallback_gas_limit,
                    "gas estimation failed, using fallback gas limit"
                );
                self.config.fallback_gas_limit
            }
        }
    }

    async fn execute_with_retry(&self, call: &QueuedCall, mut overrides: TxOverrides) -> Result<TxResult> {
        let mut retries = 0;
        loop {
            let err = match self.execute(&call.tx, overrides).await {
                Ok(result) => {
                    self.nonces.increment();
                    return Ok(result);
                }
                Err(err) => err,
            };
            warn!(code = ?err.code, %err, nonce = ?overrides.nonce, "transaction execution failed");

            if err.is_nonce_error() {
                if retries >= self.config.max_nonce_retries {
                    warn!(retries, "nonce retries exhausted");
                    return Err(err.into());
                }
                retries += 1;
                self.nonces.reset().await?;
                overrides.nonce = Some(self.nonces.read().await?.nonce);
                info!(attempt = retries, nonce = ?overrides.nonce, "retrying transaction with fresh nonce");
                continue;
            }

            if err.should_increment_nonce() {
                self.nonces.increment();
            }
            return Err(err.into());
        }
    }

    async fn execute(&self, tx: &TxRequest, overrides: TxOverrides) -> Result<TxResult, SubmissionError> {
        if !self.signer.supports_sync_send() {
            let hash = self.signer.send_transaction(tx, overrides).await?;
            return Ok(TxResult { hash, receipt: None });
        }

        let raw = self.signer.sign_transaction(tx, overrides).await?;
        let response = self
            .signer
            .provider()
            .send("eth_sendRawTransactionSync", json!([raw, SYNC_SEND_TIMEOUT_MS]))
            .await?;
        let receipt = TxReceipt::from_rpc(&response)?;
        if !receipt.succeeded() {
            return Err(SubmissionError::new(format!(
                "transaction {} failed with status {}",
                receipt.transaction_hash, receipt.status
            ))
            .broadcast(Some(receipt.transaction_hash)));
        }
        Ok(TxResult {
            hash: receipt.transaction_hash.clone(),
            receipt: Some(receipt),
        })
    }
}
