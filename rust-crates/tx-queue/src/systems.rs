use crate::{
    Error,
    Result,
    actions::ActionRequest,
    queue::{
        QueuedCall,
        TransactionQueue,
    },
    signer::{
        Signer,
        TxRequest,
        TxResult,
    },
};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::Arc,
};

/// Produces calldata for a system call. ABI encoding lives outside this crate.
pub trait CallEncoder: Send + Sync + 'static {
    fn encode(&self, system: &str, method: &str, args: &[Value]) -> Result<TxRequest>;
}

/// Per-call options passed alongside the arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub gas_limit: Option<u64>,
    pub priority: i64,
    pub tax_enabled: bool,
}

/// Typed handle to one on-chain system; every call goes through the queue.
pub struct SystemClient<S, E> {
    name: String,
    queue: TransactionQueue<S>,
    encoder: Arc<E>,
}

impl<S, E> Clone for SystemClient<S, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            queue: self.queue.clone(),
            encoder: Arc::clone(&self.encoder),
        }
    }
}

impl<S: Signer, E: CallEncoder> SystemClient<S, E> {
    pub fn new(name: impl Into<String>, queue: TransactionQueue<S>, encoder: Arc<E>) -> Self {
        Self {
            name: name.into(),
            queue,
            encoder,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<TxResult> {
        self.call_with(method, args, CallOptions::default()).await
    }

    pub async fn call_with(&self, method: &str, args: Vec<Value>, options: CallOptions) -> Result<TxResult> {
        let call = self.queued_call(method, args, options)?;
        self.queue.submit(call).await
    }

    /// Wraps a call as a trackable action. Encoding happens when the action runs.
    pub fn action(
        &self,
        method: &str,
        args: Vec<Value>,
        description: impl Into<String>,
    ) -> ActionRequest {
        let client = self.clone();
        let method = method.to_string();
        let params = args.clone();
        ActionRequest::new(format!("{}.{}", self.name, method), description, move || async move {
            client.call(&method, args).await
        })
        .with_params(params)
    }

    fn queued_call(&self, method: &str, args: Vec<Value>, options: CallOptions) -> Result<QueuedCall> {
        let tx = self.encoder.encode(&self.name, method, &args)?;
        let mut call = QueuedCall::new(&self.name, method, tx)
            .with_args(args)
            .with_priority(options.priority)
            .with_tax(options.tax_enabled);
        call.gas_limit = options.gas_limit;
        Ok(call)
    }
}

/// Every system the client knows about, sharing one queue and encoder.
pub struct Systems<S, E> {
    clients: BTreeMap<String, SystemClient<S, E>>,
}

impl<S: Signer, E: CallEncoder> Systems<S, E> {
    pub fn new<I, N>(queue: &TransactionQueue<S>, encoder: Arc<E>, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let clients = names
            .into_iter()
            .map(|name| {
                let client = SystemClient::new(name, queue.clone(), Arc::clone(&encoder));
                (client.name().to_string(), client)
            })
            .collect();
        Self { clients }
    }

    pub fn get(&self, name: &str) -> Result<&SystemClient<S, E>> {
        self.clients
            .get(name)
            .ok_or_else(|| Error::UnknownSystem(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        actions::{
            ActionState,
            ActionTracker,
        },
        gas_cache::GasEstimationCache,
        queue::QueueConfig,
        test_helpers::FakeSigner,
    };
    use serde_json::json;

    struct HexEncoder;

    impl CallEncoder for HexEncoder {
        fn encode(&self, system: &str, method: &str, args: &[Value]) -> Result<TxRequest> {
            if method.is_empty() {
                return Err(Error::Encode {
                    system: system.to_string(),
                    method: method.to_string(),
                    reason: "missing method".to_string(),
                });
            }
            Ok(TxRequest::new(system, format!("{method}({})", args.len())))
        }
    }

    fn systems(signer: &FakeSigner) -> Systems<FakeSigner, HexEncoder> {
        let queue = TransactionQueue::new(
            Arc::new(signer.clone()),
            Arc::new(GasEstimationCache::default()),
            QueueConfig::default(),
        );
        Systems::new(&queue, Arc::new(HexEncoder), ["system.harvest.start", "system.account.move"])
    }

    #[tokio::test]
    async fn call__encodes_and_submits_through_queue() {
        // given
        let signer = FakeSigner::with_nonce(2);
        let systems = systems(&signer);

        // when
        systems
            .get("system.account.move")
            .unwrap()
            .call("executeTyped", vec![json!(12)])
            .await
            .unwrap();

        // then
        let sent = signer.sent();
        assert_eq!(sent[0].to, "system.account.move");
        assert_eq!(sent[0].nonce, Some(2));
    }

    #[tokio::test]
    async fn call_with__passes_explicit_gas_limit() {
        let signer = FakeSigner::with_nonce(0);
        let systems = systems(&signer);

        systems
            .get("system.harvest.start")
            .unwrap()
            .call_with(
                "executeTyped",
                vec![json!(1), json!(2)],
                CallOptions {
                    gas_limit: Some(1_234_567),
                    ..CallOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(signer.sent()[0].gas_limit, Some(1_234_567));
        assert_eq!(signer.estimate_calls(), 0);
    }

    #[tokio::test]
    async fn call__encode_error_never_reaches_signer() {
        let signer = FakeSigner::with_nonce(0);
        let systems = systems(&signer);

        let result = systems.get("system.account.move").unwrap().call("", vec![]).await;

        assert!(matches!(result, Err(Error::Encode { .. })));
        assert!(signer.sent().is_empty());
    }

    #[test]
    fn get__unknown_system_errors() {
        let signer = FakeSigner::with_nonce(0);
        let queue = TransactionQueue::new(
            Arc::new(signer),
            Arc::new(GasEstimationCache::default()),
            QueueConfig::default(),
        );
        let systems = Systems::new(&queue, Arc::new(HexEncoder), ["system.a"]);

        assert!(matches!(systems.get("system.b"), Err(Error::UnknownSystem(_))));
        assert_eq!(systems.names().collect::<Vec<_>>(), vec!["system.a"]);
    }

    #[tokio::test]
    async fn action__tracks_system_call_to_completion() {
        // given
        let signer = FakeSigner::with_nonce(0);
        let systems = systems(&signer);
        let tracker = ActionTracker::new(Arc::new(signer.fake_provider().clone()));

        // when
        let request = systems
            .get("system.harvest.start")
            .unwrap()
            .action("executeTyped", vec![json!(7)], "Start harvest");
        let index = tracker.add(request);
        let action = tracker.wait(index).await.unwrap();

        // then
        assert_eq!(action.state, ActionState::Complete);
        assert_eq!(action.action, "system.harvest.start.executeTyped");
        assert_eq!(action.params, vec![json!(7)]);
        assert_eq!(signer.sent().len(), 1);
    }
}
