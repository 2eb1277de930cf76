use crate::{
    Result,
    events::{
        ComponentValue,
        EcsEvent,
        EcsEventType,
        EventsSinceResponse,
        NetworkComponentUpdate,
        NetworkEvent,
        StreamResponse,
        SystemCall,
        SystemCallTransaction,
    },
};
use anyhow::Context;

/// Turns a component's raw hex value into its structured form.
pub trait Decode: Send + Sync + 'static {
    fn decode(&self, component: &str, raw: &str) -> Result<ComponentValue>;
}

/// Keeps values as normalized hex strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct HexDecode;

impl Decode for HexDecode {
    fn decode(&self, _component: &str, raw: &str) -> Result<ComponentValue> {
        let digits = raw.trim_start_matches("0x");
        hex::decode(digits).with_context(|| format!("Invalid hex value {raw:?}"))?;
        Ok(ComponentValue::String(format!("0x{}", digits.to_ascii_lowercase())))
    }
}

/// Lowercase, `0x`-prefixed, no leading zero digits. Zero stays `0x0`.
pub fn format_entity_id(id: &str) -> String {
    let digits = id
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .trim_start_matches('0')
        .to_ascii_lowercase();
    if digits.is_empty() {
        "0x0".to_string()
    } else {
        format!("0x{digits}")
    }
}

pub fn format_component_id(id: &str) -> String {
    format_entity_id(id)
}

pub fn transform_world_events(
    decode: &impl Decode,
    events: &[EcsEvent],
    block_number: u64,
) -> Result<Vec<NetworkComponentUpdate>> {
    events
        .iter()
        .enumerate()
        .map(|(i, event)| {
            let component = format_component_id(&event.component_id);
            let value = match (event.event_type, &event.value) {
                (EcsEventType::ComponentValueSet, Some(raw)) => Some(
                    decode
                        .decode(&component, raw)
                        .with_context(|| format!("Failed to decode value of {component}"))?,
                ),
                (EcsEventType::ComponentValueSet, None) => {
                    anyhow::bail!("Set event for {component} carries no value")
                }
                (EcsEventType::ComponentValueRemoved, _) => None,
            };
            let last_event_in_tx = events
                .get(i + 1)
                .is_none_or(|next| next.tx_hash != event.tx_hash);
            Ok(NetworkComponentUpdate {
                component,
                entity: format_entity_id(&event.entity_id),
                value,
                block_number,
                last_event_in_tx,
                tx_hash: event.tx_hash.clone(),
                tx_metadata: event.tx_metadata.clone(),
            })
        })
        .collect()
}

pub fn transform_stream_response(
    decode: &impl Decode,
    response: &StreamResponse,
) -> Result<Vec<NetworkComponentUpdate>> {
    transform_world_events(decode, &response.ecs_events, response.block_number)
}

/// Gap-fill responses do not carry per-event blocks; every update is tagged
/// with the block the fill started from.
pub fn parse_events_since(
    decode: &impl Decode,
    response: &EventsSinceResponse,
    block_number: u64,
) -> Result<Vec<NetworkComponentUpdate>> {
    transform_world_events(decode, &response.events, block_number)
}

/// Groups consecutive-or-not updates by transaction, in first-seen order.
pub fn group_by_tx_hash(
    updates: &[NetworkComponentUpdate],
) -> Vec<(String, Vec<NetworkComponentUpdate>)> {
    let mut groups: Vec<(String, Vec<NetworkComponentUpdate>)> = Vec::new();
    for update in updates {
        match groups.iter_mut().find(|(hash, _)| *hash == update.tx_hash) {
            Some((_, group)) => group.push(update.clone()),
            None => groups.push((update.tx_hash.clone(), vec![update.clone()])),
        }
    }
    groups
}

/// One system call per transaction whose updates carry call metadata.
pub fn parse_system_calls(updates: &[NetworkComponentUpdate]) -> Vec<SystemCall> {
    group_by_tx_hash(updates)
        .into_iter()
        .filter_map(|(hash, updates)| {
            let metadata = updates.iter().find_map(|u| u.tx_metadata.clone())?;
            let value = metadata.value.parse::<u128>().unwrap_or_else(|_| {
                tracing::warn!(tx = %hash, value = %metadata.value, "Unparseable call value, using 0");
                0
            });
            Some(SystemCall {
                tx: SystemCallTransaction {
                    to: metadata.to,
                    data: metadata.data,
                    value,
                    hash,
                },
                updates,
            })
        })
        .collect()
}

pub fn into_network_events(updates: Vec<NetworkComponentUpdate>) -> Vec<NetworkEvent> {
    updates.into_iter().map(NetworkEvent::ComponentUpdate).collect()
}
