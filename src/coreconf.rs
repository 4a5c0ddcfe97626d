//! Core CORECONF conversion logic
//!
//! Map keys are SIDs. The first key of every map is the absolute SID and
//! each later key is the signed difference to the key before it, so the
//! decoder must read keys in the order they were written.

use std::path::Path;

use ciborium::Value as Cbor;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::SortMode;
use crate::error::{CoreconfError, Result};
use crate::instance_id::{Instance, decode_instances, to_bytes};
use crate::path::{convert_instance_identifier_to_rfc7951, flatten_rfc7951};
use crate::schema::{NodeKind, Schema, SchemaExtractor, strip_prefixes};
use crate::sid::{SidFile, SidTable};
use crate::types::{
    LeafType, YangType, cast_from_coreconf, cast_to_coreconf, cbor_to_json, json_to_cbor,
};

/// Shape of decoded data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Hierarchical RFC 7951 tree
    #[default]
    Rfc7951,
    /// `[{"/path": value}, ...]`, one entry per leaf
    InstanceIdentifier,
}

/// CORECONF model for JSON/CBOR conversion
#[derive(Debug, Clone, Default)]
pub struct CoreconfModel {
    sids: SidTable,
    schema: Schema,
}

impl CoreconfModel {
    pub fn new(sids: SidTable, schema: Schema) -> Self {
        Self { sids, schema }
    }

    /// Model from a single SID file; leaf types come from the file itself
    pub fn from_sid_str(sid_content: &str) -> Result<Self> {
        let mut sids = SidTable::new();
        sids.add_file(sid_content.parse::<SidFile>()?);
        Ok(Self::new(sids, Schema::default()))
    }

    /// Load every SID file and YANG module of a cached catalog
    pub fn from_catalog(dir: impl AsRef<Path>, compiler: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let sids = SidTable::load_dir(dir)?;
        let schema = SchemaExtractor::new(compiler).extract_dir(dir)?;
        debug!(dir = %dir.display(), sids = sids.len(), leaves = schema.types.len(), "model loaded");
        Ok(Self::new(sids, schema))
    }

    pub fn sids(&self) -> &SidTable {
        &self.sids
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Leaf type of a SID-file identifier; the type table wins over SID files
    pub fn leaf_type(&self, identifier: &str) -> Option<&LeafType> {
        self.schema
            .types
            .get(&strip_prefixes(identifier))
            .or_else(|| self.sids.get_type(identifier))
    }

    pub fn node_kind(&self, identifier: &str) -> Option<NodeKind> {
        self.schema.info.node_kind(&strip_prefixes(identifier))
    }

    /// Encode an RFC 7951 tree into SID-keyed CBOR bytes
    pub fn encode(&self, tree: &Value, mode: SortMode) -> Result<Vec<u8>> {
        to_bytes(&self.encode_value(tree, mode)?)
    }

    pub fn encode_value(&self, tree: &Value, mode: SortMode) -> Result<Cbor> {
        let root = tree.as_object().ok_or_else(|| {
            CoreconfError::type_conversion("/", "top level must be an object")
        })?;
        self.encode_members(root, "", mode)
    }

    /// Encode the members of a container or list entry found at `identifier`
    pub fn encode_members(&self, members: &Map<String, Value>, identifier: &str, mode: SortMode) -> Result<Cbor> {
        let mut children = Vec::with_capacity(members.len());
        for (key, value) in members {
            let child = format!("{identifier}/{key}");
            let sid = self
                .sids
                .get_sid(&child)
                .ok_or_else(|| CoreconfError::SidNotFound(child.clone()))?;
            let local = key.split_once(':').map_or(key.as_str(), |(_, n)| n);
            children.push((local, sid, self.encode_node(&child, value, mode)?));
        }

        match mode {
            SortMode::Rfc8949 => children.sort_by_key(|(_, sid, _)| *sid),
            SortMode::Velocity => children.sort_by_key(|(local, sid, _)| {
                (self.schema.info.order_of(local).unwrap_or(usize::MAX), *sid)
            }),
        }

        let mut previous: Option<i64> = None;
        let entries = children
            .into_iter()
            .map(|(_, sid, value)| {
                let key = previous.map_or(sid, |p| sid - p);
                previous = Some(sid);
                (Cbor::Integer(key.into()), value)
            })
            .collect();
        Ok(Cbor::Map(entries))
    }

    /// Encode the value of the node at `identifier`
    pub fn encode_node(&self, identifier: &str, value: &Value, mode: SortMode) -> Result<Cbor> {
        let kind = self
            .node_kind(identifier)
            .unwrap_or_else(|| self.guess_json_kind(identifier, value));

        match (kind, value) {
            (NodeKind::Container, Value::Object(members)) => {
                self.encode_members(members, identifier, mode)
            }
            (NodeKind::List, Value::Array(entries)) => entries
                .iter()
                .map(|entry| match entry {
                    Value::Object(members) => self.encode_members(members, identifier, mode),
                    _ => Err(CoreconfError::type_conversion(identifier, "list entry must be an object")),
                })
                .collect::<Result<_>>()
                .map(Cbor::Array),
            (NodeKind::List, Value::Object(members)) => {
                Ok(Cbor::Array(vec![self.encode_members(members, identifier, mode)?]))
            }
            (NodeKind::LeafList, Value::Array(items)) => items
                .iter()
                .map(|item| self.encode_leaf(identifier, item))
                .collect::<Result<_>>()
                .map(Cbor::Array),
            (NodeKind::LeafList, scalar) => Ok(Cbor::Array(vec![self.encode_leaf(identifier, scalar)?])),
            (NodeKind::Leaf, value) => self.encode_leaf(identifier, value),
            (_, other) => Err(CoreconfError::type_conversion(
                identifier,
                format!("{kind:?} cannot hold {other}"),
            )),
        }
    }

    fn encode_leaf(&self, identifier: &str, value: &Value) -> Result<Cbor> {
        match self.leaf_type(identifier) {
            Some(ty) => cast_to_coreconf(value, ty, &self.sids, identifier),
            None => json_to_cbor(value, identifier),
        }
    }

    /// Encode a list key written as predicate text
    pub fn encode_key(&self, identifier: &str, raw: &str) -> Result<Cbor> {
        let Some(ty) = self.leaf_type(identifier) else {
            return Ok(Cbor::Text(raw.to_string()));
        };
        let text = Value::String(raw.to_string());
        match cast_to_coreconf(&text, ty, &self.sids, identifier) {
            Ok(cbor) => Ok(cbor),
            Err(text_err) => match serde_json::from_str::<Value>(raw) {
                Ok(parsed) => cast_to_coreconf(&parsed, ty, &self.sids, identifier),
                Err(_) => Err(text_err),
            },
        }
    }

    fn guess_json_kind(&self, identifier: &str, value: &Value) -> NodeKind {
        let empty_leaf = matches!(
            self.leaf_type(identifier).map(|t| &t.base),
            Some(YangType::Empty)
        );
        match value {
            Value::Object(_) => NodeKind::Container,
            Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
                NodeKind::List
            }
            Value::Array(_) if !empty_leaf => NodeKind::LeafList,
            _ => NodeKind::Leaf,
        }
    }

    /// Decode SID-keyed CBOR bytes
    pub fn decode(&self, bytes: &[u8], format: OutputFormat) -> Result<Value> {
        let value: Cbor =
            ciborium::from_reader(bytes).map_err(|e| CoreconfError::CborDecode(e.to_string()))?;
        self.decode_value(&value, format)
    }

    pub fn decode_value(&self, value: &Cbor, format: OutputFormat) -> Result<Value> {
        let Cbor::Map(entries) = value else {
            return Err(CoreconfError::CborDecode(format!(
                "top level must be a map, got {value:?}"
            )));
        };
        let tree = Value::Object(self.decode_members(entries)?);
        self.shape(tree, format)
    }

    fn shape(&self, tree: Value, format: OutputFormat) -> Result<Value> {
        match format {
            OutputFormat::Rfc7951 => Ok(tree),
            OutputFormat::InstanceIdentifier => flatten_rfc7951(&tree, &self.schema.info),
        }
    }

    /// Decode the members of a map, naming each by its SID's identifier
    pub fn decode_members(&self, entries: &[(Cbor, Cbor)]) -> Result<Map<String, Value>> {
        let mut members = Map::new();
        let mut previous: Option<i64> = None;
        for (key, value) in entries {
            let delta = match key {
                Cbor::Integer(i) => i64::try_from(*i).ok(),
                _ => None,
            }
            .ok_or_else(|| CoreconfError::CborDecode(format!("map key {key:?} is not a SID")))?;
            let sid = match previous {
                None => delta,
                Some(p) => p.checked_add(delta).ok_or_else(|| {
                    CoreconfError::CborDecode(format!("SID delta {delta} after {p} overflows"))
                })?,
            };
            previous = Some(sid);

            let identifier = self
                .sids
                .get_identifier(sid)
                .ok_or(CoreconfError::IdentifierNotFound(sid))?;
            let name = identifier.rsplit('/').next().unwrap_or(identifier);
            members.insert(name.to_string(), self.decode_node(identifier, value)?);
        }
        Ok(members)
    }

    /// Decode the value of the node at `identifier`
    pub fn decode_node(&self, identifier: &str, value: &Cbor) -> Result<Value> {
        let kind = self.node_kind(identifier).unwrap_or(match value {
            Cbor::Map(_) => NodeKind::Container,
            Cbor::Array(items) if !items.is_empty() && items.iter().all(|i| matches!(i, Cbor::Map(_))) => {
                NodeKind::List
            }
            Cbor::Array(_) => NodeKind::LeafList,
            _ => NodeKind::Leaf,
        });

        match (kind, value) {
            (NodeKind::Container, Cbor::Map(entries)) => Ok(Value::Object(self.decode_members(entries)?)),
            (NodeKind::List, Cbor::Array(entries)) => entries
                .iter()
                .map(|entry| match entry {
                    Cbor::Map(members) => Ok(Value::Object(self.decode_members(members)?)),
                    _ => Err(CoreconfError::CborDecode(format!(
                        "entry of list {identifier} is not a map"
                    ))),
                })
                .collect::<Result<_>>()
                .map(Value::Array),
            (NodeKind::List, Cbor::Map(members)) => {
                Ok(Value::Array(vec![Value::Object(self.decode_members(members)?)]))
            }
            (NodeKind::LeafList, Cbor::Array(items)) => items
                .iter()
                .map(|item| self.decode_leaf(identifier, item))
                .collect::<Result<_>>()
                .map(Value::Array),
            (NodeKind::LeafList, scalar) => Ok(Value::Array(vec![self.decode_leaf(identifier, scalar)?])),
            (NodeKind::Leaf, value) => self.decode_leaf(identifier, value),
            (_, other) => Err(CoreconfError::CborDecode(format!(
                "{kind:?} {identifier} cannot hold {other:?}"
            ))),
        }
    }

    fn decode_leaf(&self, identifier: &str, value: &Cbor) -> Result<Value> {
        match self.leaf_type(identifier) {
            Some(ty) => cast_from_coreconf(value, ty, &self.sids, identifier),
            None => cbor_to_json(value, identifier),
        }
    }

    /// Encode the value written at an instance target
    pub fn encode_instance_value(&self, identifier: &str, value: &Value, mode: SortMode) -> Result<Cbor> {
        match value {
            // A container, or one entry of a list
            Value::Object(members) => self.encode_members(members, identifier, mode),
            Value::Null => Ok(Cbor::Null),
            other => self.encode_node(identifier, other, mode),
        }
    }

    /// Decode an instances CBOR sequence (iFETCH reply) into one tree
    pub fn decode_instances(&self, bytes: &[u8], format: OutputFormat) -> Result<Value> {
        let pairs = decode_instances(bytes)?
            .iter()
            .map(|instance| self.instance_pair(instance))
            .collect::<Result<Vec<_>>>()?;
        if pairs.is_empty() {
            return Ok(match format {
                OutputFormat::Rfc7951 => Value::Object(Map::new()),
                OutputFormat::InstanceIdentifier => Value::Array(pairs),
            });
        }
        let tree = convert_instance_identifier_to_rfc7951(&Value::Array(pairs))?;
        self.shape(tree, format)
    }

    /// `{"/path[key='v']": value}` for one decoded instance
    fn instance_pair(&self, instance: &Instance) -> Result<Value> {
        let sid = instance.path.sid;
        let identifier = self
            .sids
            .get_identifier(sid)
            .ok_or(CoreconfError::IdentifierNotFound(sid))?;

        let mut keys = instance.path.keys.iter();
        let mut path = String::new();
        let mut prefix = String::new();
        for segment in identifier.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            path.push('/');
            path.push_str(segment);
            if self.list_identifier_kind(&prefix) != Some(NodeKind::List) {
                continue;
            }
            for key_name in self.list_key_names(&prefix) {
                let Some(raw) = keys.next() else { break };
                let key_identifier = format!("{prefix}/{key_name}");
                let key = match self.decode_leaf(&key_identifier, raw)? {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                if key.contains('\'') {
                    path.push_str(&format!("[{key_name}=\"{key}\"]"));
                } else {
                    path.push_str(&format!("[{key_name}='{key}']"));
                }
            }
        }

        let value = match &instance.value {
            Cbor::Map(members) => Value::Object(self.decode_members(members)?),
            Cbor::Null => Value::Null,
            other => self.decode_node(identifier, other)?,
        };
        let mut pair = Map::new();
        pair.insert(path, value);
        Ok(Value::Object(pair))
    }

    fn list_identifier_kind(&self, identifier: &str) -> Option<NodeKind> {
        self.node_kind(identifier).or_else(|| {
            let sid = self.sids.get_sid(identifier)?;
            self.sids.get_keys(sid).map(|_| NodeKind::List)
        })
    }

    /// Key leaf names of a list, from the schema or else the SID files
    fn list_key_names(&self, identifier: &str) -> Vec<String> {
        if let Some(keys) = self.schema.info.list_keys(&strip_prefixes(identifier)) {
            return keys.to_vec();
        }
        self.sids
            .get_sid(identifier)
            .and_then(|sid| self.sids.get_keys(sid))
            .unwrap_or_default()
            .iter()
            .filter_map(|key_sid| self.sids.get_identifier(*key_sid))
            .filter_map(|id| id.rsplit('/').next())
            .map(str::to_string)
            .collect()
    }
}
