//! Value ↔ capdata. Outbound serialization exports objects and promises as
//! it meets them, so slot numbering follows argument order.

use serde_json::{json, Map, Value as Json};

use capkernel_types::{slot_ref, CapData, CapDataError, DispatchError, VatSlot, QCLASS};

use crate::value::Value;
use crate::vat::VatState;

pub(crate) fn serialize(state: &mut VatState, value: &Value) -> Result<CapData<VatSlot>, CapDataError> {
    let mut slots = Vec::new();
    let body = encode(state, value, &mut slots)?;
    Ok(CapData::from_json(&body, slots))
}

pub(crate) fn serialize_args(state: &mut VatState, args: &[Value]) -> Result<CapData<VatSlot>, CapDataError> {
    let mut slots = Vec::new();
    let items = args
        .iter()
        .map(|arg| encode(state, arg, &mut slots))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CapData::from_json(&Json::Array(items), slots))
}

fn slot_index(slots: &mut Vec<VatSlot>, slot: VatSlot) -> usize {
    match slots.iter().position(|s| *s == slot) {
        Some(index) => index,
        None => {
            slots.push(slot);
            slots.len() - 1
        }
    }
}

fn encode(state: &mut VatState, value: &Value, slots: &mut Vec<VatSlot>) -> Result<Json, CapDataError> {
    Ok(match value {
        Value::Undefined => json!({ QCLASS: "undefined" }),
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) => Json::Number(n.clone()),
        Value::String(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(
            items
                .iter()
                .map(|item| encode(state, item, slots))
                .collect::<Result<_, _>>()?,
        ),
        Value::Record(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                if key == QCLASS {
                    return Err(CapDataError::Unsupported(format!(
                        "record key {QCLASS:?} is reserved"
                    )));
                }
                out.insert(key.clone(), encode(state, item, slots)?);
            }
            Json::Object(out)
        }
        Value::Error { name, message } => json!({ QCLASS: "error", "name": name, "message": message }),
        Value::Object(object) => {
            let slot = state.export_object(*object);
            slot_ref(slot_index(slots, slot))
        }
        Value::Promise(promise) => {
            let slot = state.promise_slot(*promise);
            slot_ref(slot_index(slots, slot))
        }
    })
}

pub(crate) fn unserialize(state: &mut VatState, data: &CapData<VatSlot>) -> Result<Value, DispatchError> {
    data.validate()?;
    let body = data.body_json()?;
    decode(state, &body, &data.slots)
}

fn decode(state: &mut VatState, json: &Json, slots: &[VatSlot]) -> Result<Value, DispatchError> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => Value::Number(n.clone()),
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::List(
            items
                .iter()
                .map(|item| decode(state, item, slots))
                .collect::<Result<_, _>>()?,
        ),
        Json::Object(map) => match map.get(QCLASS) {
            None => Value::Record(
                map.iter()
                    .map(|(key, item)| Ok((key.clone(), decode(state, item, slots)?)))
                    .collect::<Result<_, DispatchError>>()?,
            ),
            Some(class) => match class.as_str() {
                Some("slot") => {
                    let slot = map
                        .get("index")
                        .and_then(Json::as_u64)
                        .and_then(|index| slots.get(index as usize))
                        .ok_or_else(|| CapDataError::MalformedQClass(json.to_string()))?;
                    state.import_slot(*slot)?
                }
                Some("error") => {
                    let field = |name: &str| map.get(name).and_then(Json::as_str).unwrap_or_default().to_string();
                    Value::Error {
                        name: field("name"),
                        message: field("message"),
                    }
                }
                Some("undefined") => Value::Undefined,
                _ => return Err(CapDataError::MalformedQClass(json.to_string()).into()),
            },
        },
    })
}
