use crate::{
    Result,
    app::event_source::ChainLogSource,
    events::{
        EcsEvent,
        EcsEventType,
        NetworkComponentUpdate,
    },
    transform::{
        Decode,
        transform_world_events,
    },
};
use anyhow::{
    Context,
    anyhow,
    bail,
};
use serde::{
    Deserialize,
    de::DeserializeOwned,
};
use serde_json::{
    Value,
    json,
};
use std::{
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub transaction_hash: String,
    #[serde(default)]
    pub log_index: Option<String>,
}

impl RpcLog {
    pub fn block(&self) -> Result<u64> {
        parse_quantity(&self.block_number)
    }
}

/// Maps a raw world log to an event; `None` skips logs it does not know.
pub trait LogDecoder: Send + Sync + 'static {
    fn decode_log(&self, log: &RpcLog) -> Result<Option<EcsEvent>>;
}

/// World logs carry `(signature, component id, component address, entity)`
/// as topics and the ABI-encoded value as data. A removal has no data.
pub struct WorldLogDecoder;

impl LogDecoder for WorldLogDecoder {
    fn decode_log(&self, log: &RpcLog) -> Result<Option<EcsEvent>> {
        let [_, component_id, _, entity_id] = log.topics.as_slice() else {
            return Ok(None);
        };
        let data = log.data.trim_start_matches("0x");
        let (event_type, value) = if data.is_empty() {
            (EcsEventType::ComponentValueRemoved, None)
        } else {
            (EcsEventType::ComponentValueSet, Some(abi_bytes(data)?))
        };
        Ok(Some(EcsEvent {
            event_type,
            component_id: component_id.clone(),
            entity_id: entity_id.clone(),
            value,
            tx_hash: log.transaction_hash.clone(),
            tx_metadata: None,
        }))
    }
}

/// Unwraps a single dynamic `bytes` argument: offset word, length word, payload.
fn abi_bytes(data: &str) -> Result<String> {
    let raw = hex::decode(data).context("log data is not hex")?;
    if raw.len() < 64 {
        bail!("log data too short for bytes argument: {} bytes", raw.len());
    }
    let offset = word_to_usize(&raw[..32])?;
    let len_end = offset.checked_add(32).context("bytes offset overflow")?;
    let len_word = raw
        .get(offset..len_end)
        .context("bytes offset out of range")?;
    let len = word_to_usize(len_word)?;
    let payload_end = len_end.checked_add(len).context("bytes length overflow")?;
    let payload = raw
        .get(len_end..payload_end)
        .context("bytes payload out of range")?;
    Ok(format!("0x{}", hex::encode(payload)))
}

fn word_to_usize(word: &[u8]) -> Result<usize> {
    let (high, low) = word.split_at(word.len() - 8);
    if high.iter().any(|b| *b != 0) {
        bail!("ABI word does not fit in 64 bits");
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(low);
    usize::try_from(u64::from_be_bytes(bytes)).context("ABI word does not fit in usize")
}

fn parse_quantity(value: &str) -> Result<u64> {
    let digits = value.trim_start_matches("0x");
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex quantity {value:?}"))
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Chain logs over JSON-RPC `eth_blockNumber` / `eth_getLogs`.
pub struct JsonRpcLogSource<L, D> {
    url: String,
    http: reqwest::Client,
    world_address: String,
    decoder: L,
    decode: Arc<D>,
    next_id: AtomicU64,
}

impl<L: LogDecoder, D: Decode> JsonRpcLogSource<L, D> {
    pub fn new(url: impl Into<String>, world_address: impl Into<String>, decoder: L, decode: Arc<D>) -> Result<Self> {
        let url = url.into();
        Url::parse(&url).with_context(|| format!("invalid rpc url {url:?}"))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client for rpc")?;
        Ok(Self {
            url,
            http,
            world_address: world_address.into(),
            decoder,
            decode,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let res = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .with_context(|| format!("failed to read {method} response body"))?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(anyhow!("rpc responded with {status} to {method}: {body}"));
        }
        let response: RpcResponse<T> =
            serde_json::from_slice(&bytes).with_context(|| format!("invalid {method} payload"))?;
        if let Some(error) = response.error {
            bail!("{method} failed with code {}: {}", error.code, error.message);
        }
        response
            .result
            .with_context(|| format!("{method} returned no result"))
    }

    fn decode_logs(&self, logs: &[RpcLog]) -> Result<Vec<NetworkComponentUpdate>> {
        let mut updates = Vec::with_capacity(logs.len());
        let mut current_block = None;
        let mut block_events = Vec::new();
        for log in logs {
            let block = log.block()?;
            if current_block.is_some_and(|b| b != block) {
                self.flush_block(&mut updates, &mut block_events, current_block)?;
            }
            current_block = Some(block);
            if let Some(event) = self.decoder.decode_log(log)? {
                block_events.push(event);
            }
        }
        self.flush_block(&mut updates, &mut block_events, current_block)?;
        Ok(updates)
    }

    fn flush_block(
        &self,
        updates: &mut Vec<NetworkComponentUpdate>,
        events: &mut Vec<EcsEvent>,
        block: Option<u64>,
    ) -> Result<()> {
        if let Some(block) = block {
            updates.extend(transform_world_events(self.decode.as_ref(), events, block)?);
        }
        events.clear();
        Ok(())
    }
}

impl<L: LogDecoder, D: Decode> ChainLogSource for JsonRpcLogSource<L, D> {
    async fn latest_block(&self) -> Result<u64> {
        let quantity: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&quantity)
    }

    async fn fetch_world_events(&self, from_block: u64, to_block: u64) -> Result<Vec<NetworkComponentUpdate>> {
        let filter = json!([{
            "address": self.world_address,
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
        }]);
        let logs: Vec<RpcLog> = self.call("eth_getLogs", filter).await?;
        self.decode_logs(&logs)
    }
}
