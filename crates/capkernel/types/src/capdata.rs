//! The "caps-and-index" wire format used for every argument list,
//! resolution value and rejection reason.
//!
//! `body` is JSON. Any capability inside it is the object
//! `{"@qclass":"slot","index":i}` where `i` indexes `slots`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::error::CapDataError;

pub const QCLASS: &str = "@qclass";

/// Serialized structured data plus the capabilities it references.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<S> {
    pub body: String,
    pub slots: Vec<S>,
}

impl<S> CapData<S> {
    pub fn new(body: impl Into<String>, slots: Vec<S>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    /// Capdata with a JSON body and the given slots.
    pub fn from_json(body: &Json, slots: Vec<S>) -> Self {
        Self {
            body: body.to_string(),
            slots,
        }
    }

    /// An error value with no capabilities, as used for kernel-originated
    /// rejections.
    pub fn error(name: &str, message: impl Into<String>) -> Self {
        let body = json!({ QCLASS: "error", "name": name, "message": message.into() });
        Self::from_json(&body, Vec::new())
    }

    /// Parse the body.
    pub fn body_json(&self) -> Result<Json, CapDataError> {
        serde_json::from_str(&self.body).map_err(|e| CapDataError::InvalidBody(e.to_string()))
    }

    /// Check that the body is JSON and every slot reference is in range.
    pub fn validate(&self) -> Result<(), CapDataError> {
        let body = self.body_json()?;
        walk_slot_refs(&body, &mut |index| {
            if index as usize >= self.slots.len() {
                Err(CapDataError::SlotIndexOutOfRange {
                    index,
                    len: self.slots.len(),
                })
            } else {
                Ok(())
            }
        })
    }

    /// Translate every slot, keeping the body untouched.
    pub fn try_map_slots<T, E, F>(&self, mut f: F) -> Result<CapData<T>, E>
    where
        F: FnMut(&S) -> Result<T, E>,
    {
        let slots = self.slots.iter().map(&mut f).collect::<Result<Vec<_>, E>>()?;
        Ok(CapData {
            body: self.body.clone(),
            slots,
        })
    }
}

/// The JSON encoding of a reference to `slots[index]`.
pub fn slot_ref(index: usize) -> Json {
    json!({ QCLASS: "slot", "index": index })
}

/// Visit every `{"@qclass":"slot"}` index inside a body, rejecting any
/// malformed `@qclass` record along the way.
pub fn walk_slot_refs<F>(body: &Json, visit: &mut F) -> Result<(), CapDataError>
where
    F: FnMut(u64) -> Result<(), CapDataError>,
{
    match body {
        Json::Array(items) => {
            for item in items {
                walk_slot_refs(item, visit)?;
            }
            Ok(())
        }
        Json::Object(map) => match map.get(QCLASS) {
            Some(Json::String(class)) => match class.as_str() {
                "slot" => {
                    let index = map
                        .get("index")
                        .and_then(Json::as_u64)
                        .ok_or_else(|| CapDataError::MalformedQClass(body.to_string()))?;
                    visit(index)
                }
                "error" | "undefined" => Ok(()),
                other => Err(CapDataError::MalformedQClass(format!(
                    "unknown @qclass {other:?}"
                ))),
            },
            Some(_) => Err(CapDataError::MalformedQClass(body.to_string())),
            None => {
                for value in map.values() {
                    walk_slot_refs(value, visit)?;
                }
                Ok(())
            }
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::{KernelSlot, VatSlot};

    #[test]
    fn slot_ref_encoding_matches_wire_form() {
        let body = json!([slot_ref(0)]);
        assert_eq!(body.to_string(), r#"[{"@qclass":"slot","index":0}]"#);
    }

    #[test]
    fn validate_accepts_in_range_refs() {
        let data = CapData::from_json(
            &json!({"a": [slot_ref(0), {"b": slot_ref(1)}]}),
            vec![KernelSlot::object(20), KernelSlot::promise(40)],
        );
        assert!(data.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_refs() {
        let data = CapData::from_json(&json!([slot_ref(2)]), vec![KernelSlot::object(20)]);
        assert_eq!(
            data.validate(),
            Err(CapDataError::SlotIndexOutOfRange { index: 2, len: 1 })
        );
    }

    #[test]
    fn validate_rejects_bad_body_and_qclass() {
        let bad_json: CapData<KernelSlot> = CapData::new("[", vec![]);
        assert!(matches!(bad_json.validate(), Err(CapDataError::InvalidBody(_))));

        let bad_class: CapData<KernelSlot> =
            CapData::from_json(&json!({ QCLASS: "bigint" }), vec![]);
        assert!(matches!(bad_class.validate(), Err(CapDataError::MalformedQClass(_))));
    }

    #[test]
    fn error_body_is_plain_data() {
        let data: CapData<VatSlot> = CapData::error("TypeError", "data is not callable");
        assert!(data.slots.is_empty());
        let body = data.body_json().unwrap();
        assert_eq!(body[QCLASS], "error");
        assert_eq!(body["name"], "TypeError");
    }

    #[test]
    fn map_slots_preserves_body() {
        let data = CapData::new("[1]", vec!["o-1".parse::<VatSlot>().unwrap()]);
        let mapped: CapData<KernelSlot> = data
            .try_map_slots(|_| Ok::<_, ()>(KernelSlot::object(21)))
            .unwrap();
        assert_eq!(mapped.body, "[1]");
        assert_eq!(mapped.slots, vec![KernelSlot::object(21)]);
    }
}
