use serde::{
    Deserialize,
    Serialize,
};

/// Decoded component value. Shape is owned by the decoder.
pub type ComponentValue = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcsEventType {
    ComponentValueSet,
    ComponentValueRemoved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxMetadata {
    pub to: String,
    pub data: String,
    /// Decimal wei amount.
    #[serde(default)]
    pub value: String,
}

/// One world event as sent by the indexing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsEvent {
    pub event_type: EcsEventType,
    pub component_id: String,
    pub entity_id: String,
    /// Hex-encoded raw value, present for `ComponentValueSet`.
    #[serde(default)]
    pub value: Option<String>,
    pub tx_hash: String,
    #[serde(default)]
    pub tx_metadata: Option<TxMetadata>,
}

/// One push message of the live stream. `prev_*` point at the message the
/// server sent before this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    pub block_number: u64,
    pub log_index: u64,
    pub prev_log_block_number: u64,
    pub prev_log_index: u64,
    #[serde(default)]
    pub ecs_events: Vec<EcsEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsSinceResponse {
    #[serde(default)]
    pub events: Vec<EcsEvent>,
    pub latest_block: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkComponentUpdate {
    pub component: String,
    pub entity: String,
    /// `None` removes the component from the entity.
    pub value: Option<ComponentValue>,
    pub block_number: u64,
    pub last_event_in_tx: bool,
    pub tx_hash: String,
    pub tx_metadata: Option<TxMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCallTransaction {
    pub to: String,
    pub data: String,
    pub value: u128,
    pub hash: String,
}

/// All updates one transaction produced, with the call that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemCall {
    pub tx: SystemCallTransaction,
    pub updates: Vec<NetworkComponentUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetworkEvent {
    ComponentUpdate(NetworkComponentUpdate),
    SystemCall(SystemCall),
    /// The server had nothing new for this block.
    Keepalive { block_number: u64 },
}

impl NetworkEvent {
    pub fn block_number(&self) -> Option<u64> {
        match self {
            NetworkEvent::ComponentUpdate(update) => Some(update.block_number),
            NetworkEvent::Keepalive { block_number } => Some(*block_number),
            NetworkEvent::SystemCall(_) => None,
        }
    }
}
