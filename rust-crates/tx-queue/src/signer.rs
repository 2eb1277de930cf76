use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;
use std::future::Future;

pub const NONCE_EXPIRED: &str = "NONCE_EXPIRED";
pub const TRANSACTION_REPLACED: &str = "TRANSACTION_REPLACED";
pub const ACTION_REJECTED: &str = "ACTION_REJECTED";

const ACCOUNT_SEQUENCE_MESSAGE: &str = "account sequence";
const USER_REJECTED_REASON: &str = "user rejected transaction";

/// Unsigned call as produced by the calldata encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    pub to: String,
    pub data: String,
    #[serde(default)]
    pub value: u128,
}

impl TxRequest {
    pub fn new(to: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            data: data.into(),
            value: 0,
        }
    }

    pub fn with_value(mut self, value: u128) -> Self {
        self.value = value;
        self
    }
}

/// Fields the queue fills in right before signing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOverrides {
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub block_number: Option<u64>,
    pub status: u64,
    pub gas_used: Option<u64>,
}

impl TxReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == 1
    }

    /// Parse a JSON-RPC receipt object. Quantities may be hex strings or plain numbers.
    pub fn from_rpc(value: &Value) -> Result<Self, SubmissionError> {
        let transaction_hash = value
            .get("transactionHash")
            .or_else(|| value.get("hash"))
            .and_then(Value::as_str)
            .ok_or_else(|| SubmissionError::new("receipt is missing transactionHash"))?
            .to_string();
        let status = value
            .get("status")
            .and_then(parse_quantity)
            .ok_or_else(|| SubmissionError::new("receipt is missing status"))?;
        Ok(Self {
            transaction_hash,
            block_number: value.get("blockNumber").and_then(parse_quantity),
            status,
            gas_used: value.get("gasUsed").and_then(parse_quantity),
        })
    }
}

fn parse_quantity(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    pub hash: String,
    /// Present when the transport confirmed synchronously.
    pub receipt: Option<TxReceipt>,
}

/// Failure reported by a signer or provider.
///
/// Mirrors the structured errors wallets return so the queue can tell nonce
/// conflicts, user rejections and already-broadcast failures apart.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SubmissionError {
    pub code: Option<String>,
    pub message: String,
    pub reason: Option<String>,
    pub data: Option<String>,
    pub inner: Option<Box<SubmissionError>>,
    pub tx_hash: Option<String>,
    /// The transaction reached the network before failing.
    pub broadcast: bool,
}

impl SubmissionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn nonce_expired(message: impl Into<String>) -> Self {
        Self::new(message).with_code(NONCE_EXPIRED)
    }

    pub fn replaced(message: impl Into<String>) -> Self {
        Self::new(message).with_code(TRANSACTION_REPLACED)
    }

    pub fn user_rejected() -> Self {
        Self::new("user rejected action")
            .with_code(ACTION_REJECTED)
            .with_reason(USER_REJECTED_REASON)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_inner(mut self, inner: SubmissionError) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    pub fn broadcast(mut self, tx_hash: Option<String>) -> Self {
        self.broadcast = true;
        self.tx_hash = tx_hash;
        self
    }

    fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }

    pub fn is_nonce_error(&self) -> bool {
        self.has_code(NONCE_EXPIRED)
            || self.has_code(TRANSACTION_REPLACED)
            || self.message.contains(ACCOUNT_SEQUENCE_MESSAGE)
    }

    pub fn is_user_rejection(&self) -> bool {
        self.has_code(ACTION_REJECTED)
            || self
                .reason
                .as_deref()
                .is_some_and(|reason| reason.contains(USER_REJECTED_REASON))
    }

    /// Whether the chain consumed the nonce even though the call failed.
    pub fn should_increment_nonce(&self) -> bool {
        self.broadcast && !self.is_user_rejection()
    }

    /// Best human-readable reason: `reason`, then the nested error, then `data`,
    /// then the top-level message.
    pub fn revert_message(&self) -> String {
        if let Some(reason) = self.reason.as_deref().filter(|r| !r.is_empty()) {
            return reason.to_string();
        }
        if let Some(inner) = self.inner.as_deref().filter(|e| !e.message.is_empty()) {
            return inner.message.clone();
        }
        if let Some(data) = self.data.as_deref().filter(|d| !d.is_empty()) {
            return data.to_string();
        }
        self.message.clone()
    }
}

/// Generic JSON-RPC escape hatch of the connected node.
pub trait RpcProvider: Send + Sync + 'static {
    fn send(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, SubmissionError>> + Send;

    fn wait_for_receipt(
        &self,
        hash: &str,
    ) -> impl Future<Output = Result<TxReceipt, SubmissionError>> + Send;
}

/// Account capable of signing for the queue. Treated as opaque.
pub trait Signer: Send + Sync + 'static {
    type Provider: RpcProvider;

    fn provider(&self) -> &Self::Provider;

    fn get_nonce(&self) -> impl Future<Output = Result<u64, SubmissionError>> + Send;

    fn estimate_gas(
        &self,
        tx: &TxRequest,
    ) -> impl Future<Output = Result<u64, SubmissionError>> + Send;

    fn sign_transaction(
        &self,
        tx: &TxRequest,
        overrides: TxOverrides,
    ) -> impl Future<Output = Result<String, SubmissionError>> + Send;

    /// Broadcast and return the transaction hash without waiting for inclusion.
    fn send_transaction(
        &self,
        tx: &TxRequest,
        overrides: TxOverrides,
    ) -> impl Future<Output = Result<String, SubmissionError>> + Send;

    /// Local key signers can use `eth_sendRawTransactionSync` and get the
    /// receipt back in the same round trip.
    fn supports_sync_send(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use serde_json::json;

    #[test]
    fn is_nonce_error__matches_expired_replaced_and_sequence_messages() {
        assert!(SubmissionError::nonce_expired("nonce too low").is_nonce_error());
        assert!(SubmissionError::replaced("replaced").is_nonce_error());
        assert!(
            SubmissionError::new("account sequence mismatch, expected 4").is_nonce_error()
        );
        assert!(!SubmissionError::new("execution reverted").is_nonce_error());
    }

    #[test]
    fn should_increment_nonce__requires_broadcast_and_no_rejection() {
        let broadcast = SubmissionError::new("reverted").broadcast(Some("0x1".into()));
        assert!(broadcast.should_increment_nonce());

        let not_sent = SubmissionError::new("insufficient funds");
        assert!(!not_sent.should_increment_nonce());

        let rejected = SubmissionError::user_rejected().broadcast(None);
        assert!(!rejected.should_increment_nonce());
    }

    #[test]
    fn revert_message__prefers_reason_then_inner_then_data() {
        let with_reason = SubmissionError::new("outer")
            .with_reason("Kami: not enough stamina")
            .with_inner(SubmissionError::new("inner"));
        assert_eq!(with_reason.revert_message(), "Kami: not enough stamina");

        let with_inner = SubmissionError::new("outer")
            .with_inner(SubmissionError::new("inner"))
            .with_data("0xdeadbeef");
        assert_eq!(with_inner.revert_message(), "inner");

        let with_data = SubmissionError::new("outer").with_data("0xdeadbeef");
        assert_eq!(with_data.revert_message(), "0xdeadbeef");

        assert_eq!(SubmissionError::new("outer").revert_message(), "outer");
    }

    #[test]
    fn from_rpc__parses_hex_quantities() {
        // given
        let raw = json!({
            "transactionHash": "0xabc",
            "blockNumber": "0x10",
            "status": "0x1",
            "gasUsed": 21000,
        });

        // when
        let receipt = TxReceipt::from_rpc(&raw).unwrap();

        // then
        assert_eq!(
            receipt,
            TxReceipt {
                transaction_hash: "0xabc".into(),
                block_number: Some(16),
                status: 1,
                gas_used: Some(21000),
            }
        );
        assert!(receipt.succeeded());
    }
}
