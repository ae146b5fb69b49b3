//! Event payloads crossing the host/script boundary.
//!
//! [`EventPayload`] is the closed, tree-shaped value every event carries.
//! Script engines hand the bridge a [`ScriptValue`] instead: a root value plus a
//! heap of array/object nodes addressed by index, which is how a script-side
//! object graph (shared references and cycles included) is described without
//! touching engine internals. [`ScriptValue::to_payload`] turns that graph into
//! a tree and rejects cycles explicitly.

use serde::{Deserialize, Serialize};

use crate::error::MarshalError;

/// Maximum nesting accepted when marshalling a script value.
pub const MAX_PAYLOAD_DEPTH: usize = 512;

/// Maximum number of values a marshalled payload may expand to. Shared
/// references are copied, so a small heap can describe a huge tree.
pub const MAX_PAYLOAD_NODES: usize = 1 << 20;

// ─────────────────────────────────────────────────────────────────────────────
// EventPayload
// ─────────────────────────────────────────────────────────────────────────────

/// A JSON-like event payload.
///
/// Objects keep their keys in insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(into = "serde_json::Value", from = "serde_json::Value")]
pub enum EventPayload {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<EventPayload>),
    Object(Vec<(String, EventPayload)>),
}

impl EventPayload {
    /// Build an object payload from key/value pairs. Later duplicates replace earlier ones.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, EventPayload)>,
    {
        let mut out: Vec<(String, EventPayload)> = Vec::new();
        for (key, value) in entries {
            insert_entry(&mut out, key.into(), value);
        }
        EventPayload::Object(out)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, EventPayload::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            EventPayload::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EventPayload::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EventPayload::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[EventPayload]> {
        match self {
            EventPayload::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[(String, EventPayload)]> {
        match self {
            EventPayload::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up a key of an object payload.
    pub fn get(&self, key: &str) -> Option<&EventPayload> {
        self.as_object()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Set a key on an object payload. Returns false if this is not an object.
    pub fn set(&mut self, key: impl Into<String>, value: EventPayload) -> bool {
        match self {
            EventPayload::Object(entries) => {
                insert_entry(entries, key.into(), value);
                true
            }
            _ => false,
        }
    }

    /// Deserialize the payload into a typed value.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::from(self.clone()))
    }
}

fn insert_entry(entries: &mut Vec<(String, EventPayload)>, key: String, value: EventPayload) {
    match entries.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => entries.push((key, value)),
    }
}

impl From<serde_json::Value> for EventPayload {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => EventPayload::Null,
            serde_json::Value::Bool(b) => EventPayload::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map_or(EventPayload::Null, EventPayload::Number),
            serde_json::Value::String(s) => EventPayload::String(s),
            serde_json::Value::Array(items) => {
                EventPayload::Array(items.into_iter().map(EventPayload::from).collect())
            }
            serde_json::Value::Object(map) => {
                EventPayload::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<EventPayload> for serde_json::Value {
    fn from(payload: EventPayload) -> Self {
        match payload {
            EventPayload::Null => serde_json::Value::Null,
            EventPayload::Bool(b) => serde_json::Value::Bool(b),
            EventPayload::Number(n) => number_to_json(n),
            EventPayload::String(s) => serde_json::Value::String(s),
            EventPayload::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            EventPayload::Object(entries) => serde_json::Value::Object(
                entries.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

/// Integral values become JSON integers so typed consumers can read them as ints.
fn number_to_json(n: f64) -> serde_json::Value {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    // -0.0 keeps its sign as a float
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER && (n != 0.0 || n.is_sign_positive()) {
        return serde_json::Value::Number((n as i64).into());
    }
    // NaN and infinities have no JSON form
    serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

impl From<bool> for EventPayload {
    fn from(b: bool) -> Self {
        EventPayload::Bool(b)
    }
}

impl From<f64> for EventPayload {
    fn from(n: f64) -> Self {
        EventPayload::Number(n)
    }
}

impl From<i32> for EventPayload {
    fn from(n: i32) -> Self {
        EventPayload::Number(n as f64)
    }
}

impl From<&str> for EventPayload {
    fn from(s: &str) -> Self {
        EventPayload::String(s.to_string())
    }
}

impl From<String> for EventPayload {
    fn from(s: String) -> Self {
        EventPayload::String(s)
    }
}

impl<T: Into<EventPayload>> From<Vec<T>> for EventPayload {
    fn from(items: Vec<T>) -> Self {
        EventPayload::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<EventPayload>> From<Option<T>> for EventPayload {
    fn from(value: Option<T>) -> Self {
        value.map_or(EventPayload::Null, Into::into)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Script-side values
// ─────────────────────────────────────────────────────────────────────────────

/// A scalar or a reference into the [`ScriptValue`] heap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum RawValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Ref(usize),
}

/// A heap node of a [`ScriptValue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum RawNode {
    Array(Vec<RawValue>),
    Object(Vec<(String, RawValue)>),
}

/// A raw value as produced by a script engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptValue {
    pub root: RawValue,
    #[serde(default)]
    pub heap: Vec<RawNode>,
}

impl ScriptValue {
    /// A heap-less scalar value.
    pub fn scalar(root: RawValue) -> Self {
        Self {
            root,
            heap: Vec::new(),
        }
    }

    /// Marshal into an [`EventPayload`].
    ///
    /// Shared references are copied into each place they appear; a reference
    /// back to a node that is still being visited is a cycle and fails, as
    /// does a tree larger than [`MAX_PAYLOAD_NODES`].
    pub fn to_payload(&self) -> Result<EventPayload, MarshalError> {
        let mut walk = Walk {
            on_path: vec![false; self.heap.len()],
            remaining: MAX_PAYLOAD_NODES,
        };
        self.convert(&self.root, &mut walk, 0)
    }

    fn convert(
        &self,
        value: &RawValue,
        walk: &mut Walk,
        depth: usize,
    ) -> Result<EventPayload, MarshalError> {
        walk.remaining = walk
            .remaining
            .checked_sub(1)
            .ok_or(MarshalError::TooLarge(MAX_PAYLOAD_NODES))?;
        match value {
            RawValue::Undefined | RawValue::Null => Ok(EventPayload::Null),
            RawValue::Bool(b) => Ok(EventPayload::Bool(*b)),
            RawValue::Number(n) if n.is_finite() => Ok(EventPayload::Number(*n)),
            RawValue::Number(_) => Ok(EventPayload::Null),
            RawValue::String(s) => Ok(EventPayload::String(s.clone())),
            RawValue::Ref(idx) => {
                if depth >= MAX_PAYLOAD_DEPTH {
                    return Err(MarshalError::TooDeep(MAX_PAYLOAD_DEPTH));
                }
                let node = self
                    .heap
                    .get(*idx)
                    .ok_or(MarshalError::DanglingReference(*idx))?;
                if walk.on_path[*idx] {
                    return Err(MarshalError::Cycle(*idx));
                }

                walk.on_path[*idx] = true;
                let result = match node {
                    RawNode::Array(items) => items
                        .iter()
                        .map(|item| self.convert(item, walk, depth + 1))
                        .collect::<Result<Vec<_>, _>>()
                        .map(EventPayload::Array),
                    RawNode::Object(entries) => {
                        let mut out = Vec::with_capacity(entries.len());
                        for (key, item) in entries {
                            let converted = self.convert(item, walk, depth + 1)?;
                            insert_entry(&mut out, key.clone(), converted);
                        }
                        Ok(EventPayload::Object(out))
                    }
                };
                walk.on_path[*idx] = false;
                result
            }
        }
    }
}

/// Traversal state for [`ScriptValue::to_payload`].
struct Walk {
    on_path: Vec<bool>,
    remaining: usize,
}

impl From<&EventPayload> for ScriptValue {
    fn from(payload: &EventPayload) -> Self {
        fn push(payload: &EventPayload, heap: &mut Vec<RawNode>) -> RawValue {
            match payload {
                EventPayload::Null => RawValue::Null,
                EventPayload::Bool(b) => RawValue::Bool(*b),
                EventPayload::Number(n) => RawValue::Number(*n),
                EventPayload::String(s) => RawValue::String(s.clone()),
                EventPayload::Array(items) => {
                    let idx = heap.len();
                    heap.push(RawNode::Array(Vec::new()));
                    let values = items.iter().map(|item| push(item, heap)).collect();
                    heap[idx] = RawNode::Array(values);
                    RawValue::Ref(idx)
                }
                EventPayload::Object(entries) => {
                    let idx = heap.len();
                    heap.push(RawNode::Object(Vec::new()));
                    let values = entries
                        .iter()
                        .map(|(k, v)| (k.clone(), push(v, heap)))
                        .collect();
                    heap[idx] = RawNode::Object(values);
                    RawValue::Ref(idx)
                }
            }
        }

        let mut heap = Vec::new();
        let root = push(payload, &mut heap);
        Self { root, heap }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
