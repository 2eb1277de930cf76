use crate::{
    Error,
    Result,
    lock,
    signer::{
        RpcProvider,
        SubmissionError,
        TxResult,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{
    Value,
    json,
};
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{
    debug,
    info,
    warn,
};
use uuid::Uuid;


pub type ActionIndex = u64;

pub const DEFAULT_REMOVE_DELAY: Duration = Duration::from_secs(5);
const UPDATES_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActionState {
    Requested,
    Executing,
    WaitingForTxEvents,
    Complete,
    Failed,
    Canceled,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub index: ActionIndex,
    pub id: String,
    pub description: String,
    pub action: String,
    pub params: Vec<Value>,
    pub state: ActionState,
    pub time: DateTime<Utc>,
    pub tx_hash: Option<String>,
    /// Failure reason once `Failed`.
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionUpdate {
    pub index: ActionIndex,
    pub id: String,
    pub state: ActionState,
    pub tx_hash: Option<String>,
    pub metadata: Option<String>,
}

impl From<&Action> for ActionUpdate {
    fn from(action: &Action) -> Self {
        Self {
            index: action.index,
            id: action.id.clone(),
            state: action.state,
            tx_hash: action.tx_hash.clone(),
            metadata: action.metadata.clone(),
        }
    }
}

type ExecuteFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<TxResult>> + Send>;

/// A user intent ready to be tracked. `execute` runs at most once.
pub struct ActionRequest {
    pub id: Option<String>,
    pub action: String,
    pub description: String,
    pub params: Vec<Value>,
    pub skip_confirmation: bool,
    execute: ExecuteFn,
}

impl fmt::Debug for ActionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRequest")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("description", &self.description)
            .field("params", &self.params)
            .field("skip_confirmation", &self.skip_confirmation)
            .finish_non_exhaustive()
    }
}

impl ActionRequest {
    pub fn new<F, Fut>(action: impl Into<String>, description: impl Into<String>, execute: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<TxResult>> + Send + 'static,
    {
        Self {
            id: None,
            action: action.into(),
            description: description.into(),
            params: Vec::new(),
            skip_confirmation: false,
            execute: Box::new(move || Box::pin(execute())),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn skip_confirmation(mut self) -> Self {
        self.skip_confirmation = true;
        self
    }
}

#[derive(Default)]
struct Registry {
    next_index: ActionIndex,
    by_id: HashMap<String, ActionIndex>,
    /// Indices whose request is still addressable by cancel/remove.
    live: HashMap<ActionIndex, String>,
    actions: HashMap<ActionIndex, Action>,
}

/// Observable lifecycle for submitted intents.
///
/// Every state change is published on a broadcast channel; the registry keeps
/// the latest snapshot of each action until it is removed.
pub struct ActionTracker<P> {
    inner: Arc<TrackerInner<P>>,
}

impl<P> Clone for ActionTracker<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct TrackerInner<P> {
    provider: Arc<P>,
    registry: Mutex<Registry>,
    updates: broadcast::Sender<ActionUpdate>,
}

impl<P: RpcProvider> ActionTracker<P> {
    pub fn new(provider: Arc<P>) -> Self {
        let (updates, _) = broadcast::channel(UPDATES_CAPACITY);
        Self {
            inner: Arc::new(TrackerInner {
                provider,
                registry: Mutex::new(Registry::default()),
                updates,
            }),
        }
    }

    /// Registers the request and starts executing it. A request whose id is
    /// already live is not run again; the existing index is returned.
    pub fn add(&self, request: ActionRequest) -> ActionIndex {
        let ActionRequest {
            id,
            action,
            description,
            params,
            skip_confirmation,
            execute,
        } = request;
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let index = {
            let mut registry = lock(&self.inner.registry);
            if let Some(existing) = registry.by_id.get(&id) {
                warn!(%id, index = existing, "action is already requested");
                return *existing;
            }
            let index = registry.next_index;
            registry.next_index += 1;
            registry.by_id.insert(id.clone(), index);
            registry.live.insert(index, id.clone());
            let record = Action {
                index,
                id,
                description,
                action,
                params,
                state: ActionState::Requested,
                time: Utc::now(),
                tx_hash: None,
                metadata: None,
            };
            let _ = self.inner.updates.send(ActionUpdate::from(&record));
            registry.actions.insert(index, record);
            index
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.execute(index, execute, skip_confirmation).await });
        index
    }

    /// Only a `Requested` action can be canceled.
    pub fn cancel(&self, index: ActionIndex) -> bool {
        let mut registry = lock(&self.inner.registry);
        if !registry.live.contains_key(&index) {
            warn!(index, "cannot cancel unknown action");
            return false;
        }
        let Some(action) = registry.actions.get_mut(&index) else {
            return false;
        };
        if action.state != ActionState::Requested {
            warn!(index, state = ?action.state, "cannot cancel action past Requested");
            return false;
        }
        action.state = ActionState::Canceled;
        info!(index, id = %action.id, "action canceled");
        let _ = self.inner.updates.send(ActionUpdate::from(&*action));
        true
    }

    /// Frees the id at once and drops the record after `delay`.
    pub fn remove(&self, index: ActionIndex, delay: Duration) -> bool {
        {
            let mut registry = lock(&self.inner.registry);
            let Some(id) = registry.live.remove(&index) else {
                warn!(index, "cannot remove unknown action");
                return false;
            };
            registry.by_id.remove(&id);
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&inner.registry).actions.remove(&index);
            debug!(index, "action record dropped");
        });
        true
    }

    pub fn get(&self, index: ActionIndex) -> Option<Action> {
        lock(&self.inner.registry).actions.get(&index).cloned()
    }

    pub fn index_of(&self, id: &str) -> Option<ActionIndex> {
        lock(&self.inner.registry).by_id.get(id).copied()
    }

    pub fn actions(&self) -> Vec<Action> {
        let mut actions: Vec<_> = lock(&self.inner.registry).actions.values().cloned().collect();
        actions.sort_by_key(|action| action.index);
        actions
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActionUpdate> {
        self.inner.updates.subscribe()
    }

    /// Resolves with the action once it reaches a terminal state.
    pub async fn wait(&self, index: ActionIndex) -> Result<Action> {
        let mut updates = self.subscribe();
        loop {
            match self.get(index) {
                Some(action) if action.state.is_terminal() => return Ok(action),
                Some(_) => {}
                None => return Err(Error::UnknownAction(index)),
            }
            match updates.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(Error::UnknownAction(index)),
            }
        }
    }
}

impl<P: RpcProvider> TrackerInner<P> {
    async fn execute(&self, index: ActionIndex, execute: ExecuteFn, skip_confirmation: bool) {
        if !self.advance(index, ActionState::Requested, ActionState::Executing) {
            debug!(index, "action no longer requested, skipping execution");
            return;
        }

        match self.run(index, execute, skip_confirmation).await {
            Ok(hash) => {
                self.update(index, |action| {
                    action.tx_hash = Some(hash);
                    action.state = ActionState::Complete;
                });
            }
            Err(err) => {
                let reason = self.failure_reason(&err).await;
                warn!(index, %reason, "action failed");
                self.update(index, |action| {
                    if action.tx_hash.is_none() {
                        action.tx_hash = err.as_submission().and_then(|e| e.tx_hash.clone());
                    }
                    action.state = ActionState::Failed;
                    action.metadata = Some(reason);
                });
            }
        }
    }

    async fn run(&self, index: ActionIndex, execute: ExecuteFn, skip_confirmation: bool) -> Result<String> {
        let tx = execute().await?;
        self.update(index, |action| action.state = ActionState::WaitingForTxEvents);

        if !skip_confirmation && tx.receipt.is_none() {
            let receipt = self.provider.wait_for_receipt(&tx.hash).await?;
            if !receipt.succeeded() {
                return Err(SubmissionError::new(format!("transaction {} reverted", tx.hash))
                    .broadcast(Some(tx.hash))
                    .into());
            }
        }
        Ok(tx.hash)
    }

    /// Trace-derived revert reason when the hash is known, otherwise whatever
    /// the error itself carries.
    async fn failure_reason(&self, err: &Error) -> String {
        let Some(submission) = err.as_submission() else {
            return err.to_string();
        };
        if let Some(hash) = submission.tx_hash.as_deref() {
            match self
                .provider
                .send("debug_traceTransaction", json!([hash, { "tracer": "callTracer" }]))
                .await
            {
                Ok(trace) => {
                    let traced = ["revertReason", "error", "output"]
                        .iter()
                        .filter_map(|field| trace.get(field).and_then(Value::as_str))
                        .find(|reason| !reason.is_empty());
                    if let Some(reason) = traced {
                        return reason.to_string();
                    }
                }
                Err(trace_err) => debug!(%hash, %trace_err, "revert trace unavailable"),
            }
        }
        submission.revert_message()
    }

    fn advance(&self, index: ActionIndex, from: ActionState, to: ActionState) -> bool {
        let mut registry = lock(&self.registry);
        let Some(action) = registry.actions.get_mut(&index) else {
            return false;
        };
        if action.state != from {
            return false;
        }
        action.state = to;
        let _ = self.updates.send(ActionUpdate::from(&*action));
        true
    }

    fn update(&self, index: ActionIndex, apply: impl FnOnce(&mut Action)) {
        let mut registry = lock(&self.registry);
        if let Some(action) = registry.actions.get_mut(&index) {
            apply(action);
            let _ = self.updates.send(ActionUpdate::from(&*action));
        }
    }
}
