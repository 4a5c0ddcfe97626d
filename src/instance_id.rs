//! CBOR instance-identifiers (RFC 9254 section 6.13.1)
//!
//! An instance-identifier is the target SID alone, or `[SID, key1, key2, ...]`
//! when list entries along the path need selecting. iFETCH bodies are CBOR
//! sequences of identifiers; iPATCH bodies and iFETCH replies are CBOR
//! sequences of `{identifier: value}` maps.

use std::io::Cursor;

use ciborium::Value;

use crate::error::{CoreconfError, Result};

/// Target SID plus the keys of every list on the way
#[derive(Debug, Clone, PartialEq)]
pub struct InstancePath {
    pub sid: i64,
    pub keys: Vec<Value>,
}

impl InstancePath {
    pub fn new(sid: i64) -> Self {
        Self {
            sid,
            keys: Vec::new(),
        }
    }

    /// Append a key value for list entry selection
    pub fn push_key(&mut self, key: Value) {
        self.keys.push(key);
    }

    pub fn to_cbor_value(&self) -> Value {
        if self.keys.is_empty() {
            return Value::Integer(self.sid.into());
        }
        let mut items = Vec::with_capacity(self.keys.len() + 1);
        items.push(Value::Integer(self.sid.into()));
        items.extend(self.keys.iter().cloned());
        Value::Array(items)
    }

    pub fn from_cbor_value(value: &Value) -> Result<Self> {
        let sid_of = |v: &Value| match v {
            Value::Integer(i) => i64::try_from(*i).ok(),
            _ => None,
        };
        match value {
            Value::Integer(_) => Ok(Self::new(sid_of(value).ok_or_else(|| bad(value))?)),
            Value::Array(items) => {
                let (first, keys) = items.split_first().ok_or_else(|| bad(value))?;
                Ok(Self {
                    sid: sid_of(first).ok_or_else(|| bad(value))?,
                    keys: keys.to_vec(),
                })
            }
            _ => Err(bad(value)),
        }
    }

    pub fn encode_cbor(&self) -> Result<Vec<u8>> {
        to_bytes(&self.to_cbor_value())
    }
}

fn bad(value: &Value) -> CoreconfError {
    CoreconfError::CborDecode(format!("invalid instance-identifier: {value:?}"))
}

/// Instance with its value; a `null` value deletes the node on iPATCH
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub path: InstancePath,
    pub value: Value,
}

impl Instance {
    pub fn new(path: InstancePath, value: Value) -> Self {
        Self { path, value }
    }

    pub fn delete(path: InstancePath) -> Self {
        Self {
            path,
            value: Value::Null,
        }
    }

    /// Encode as a CBOR map `{identifier: value}`
    pub fn to_cbor_value(&self) -> Value {
        Value::Map(vec![(self.path.to_cbor_value(), self.value.clone())])
    }

    pub fn encode_cbor(&self) -> Result<Vec<u8>> {
        to_bytes(&self.to_cbor_value())
    }
}

pub(crate) fn to_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| CoreconfError::CborEncode(e.to_string()))?;
    Ok(bytes)
}

/// Split a CBOR sequence into its items
pub fn decode_sequence(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    let mut cursor = Cursor::new(bytes);
    while (cursor.position() as usize) < bytes.len() {
        let value: Value = ciborium::from_reader(&mut cursor)
            .map_err(|e| CoreconfError::CborDecode(e.to_string()))?;
        items.push(value);
    }
    Ok(items)
}

/// Decode an instances CBOR sequence
pub fn decode_instances(bytes: &[u8]) -> Result<Vec<Instance>> {
    let mut instances = Vec::new();
    for item in decode_sequence(bytes)? {
        let Value::Map(entries) = item else {
            return Err(CoreconfError::CborDecode(format!(
                "expected an instance map, got {item:?}"
            )));
        };
        for (key, value) in entries {
            instances.push(Instance::new(InstancePath::from_cbor_value(&key)?, value));
        }
    }
    Ok(instances)
}
