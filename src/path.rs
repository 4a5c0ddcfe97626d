//! Instance-identifier paths
//!
//! Parses `/module:container/list[key='value']/leaf` strings, folds
//! `[{path: value}, ...]` arrays into RFC 7951 trees (and flattens them
//! back), and resolves paths to SIDs.

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{CoreconfError, Result};
use crate::schema::{NodeKind, SchemaInfo, strip_prefixes};
use crate::sid::SidTable;

static NULL: Value = Value::Null;

/// One `/`-separated step of an instance-identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub module: Option<String>,
    pub name: String,
    /// Predicates in written order; non-empty for list entries
    pub keys: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Node,
    List,
}

impl PathSegment {
    pub fn kind(&self) -> SegmentKind {
        if self.keys.is_empty() {
            SegmentKind::Node
        } else {
            SegmentKind::List
        }
    }
}

/// What resolved SIDs are used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Read query: unresolvable paths are dropped with a warning
    Query,
    /// Write: unresolvable paths are an error
    Patch,
}

/// A list key along a resolved path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRef {
    /// SID-file identifier of the key leaf
    pub identifier: String,
    /// Value as written in the predicate
    pub value: String,
}

/// A path resolved against the SID table
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInstance {
    pub path: String,
    /// SID-file identifier (`/mod:a/b`) of the target node
    pub identifier: String,
    pub sid: i64,
    /// Keys of every list on the way, outermost first
    pub keys: Vec<KeyRef>,
    /// Value to write; `null` for queries
    pub value: Value,
}

impl ResolvedInstance {
    /// Prefix-free schema path of the target node
    pub fn schema_path(&self) -> String {
        strip_prefixes(&self.identifier)
    }
}

/// Parse an instance-identifier string into its segments
pub fn parse_instance_identifier_path(path: &str) -> Result<Vec<PathSegment>> {
    let invalid = |segment: &str| CoreconfError::InvalidPath {
        segment: segment.to_string(),
        path: path.to_string(),
    };

    let body = path.strip_prefix('/').ok_or_else(|| invalid(path))?;
    split_segments(body)
        .into_iter()
        .map(|raw| parse_segment(raw).ok_or_else(|| invalid(raw)))
        .collect()
}

/// Split on `/` outside of predicates and quoted values
fn split_segments(body: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in body.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, '/') if depth == 0 => {
                segments.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&body[start..]);
    segments
}

fn parse_segment(raw: &str) -> Option<PathSegment> {
    let (head, mut rest) = raw.split_at(raw.find('[').unwrap_or(raw.len()));
    let (module, name) = match head.split_once(':') {
        Some((m, n)) => (Some(m), n),
        None => (None, head),
    };
    if !is_identifier(name) || module.is_some_and(|m| !is_identifier(m)) {
        return None;
    }

    let mut keys = Vec::new();
    while !rest.is_empty() {
        rest = rest.strip_prefix('[')?;
        let (key, after) = rest.split_once('=')?;
        let key = key.trim();
        let key = key.split_once(':').map_or(key, |(_, local)| local);
        if !is_identifier(key) {
            return None;
        }

        let after = after.trim_start();
        let quote = after.chars().next().filter(|c| matches!(c, '\'' | '"'))?;
        let after = &after[1..];
        let end = after.find(quote)?;
        keys.push((key.to_string(), after[..end].to_string()));
        rest = after[end + 1..].trim_start().strip_prefix(']')?;
    }

    Some(PathSegment {
        module: module.map(str::to_string),
        name: name.to_string(),
        keys,
    })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// RFC 7951 member names: module-qualified only where the module changes
fn member_names(segments: &[PathSegment], path: &str) -> Result<Vec<String>> {
    let mut parent: Option<&str> = None;
    let mut names = Vec::with_capacity(segments.len());
    for seg in segments {
        let module = seg.module.as_deref().or(parent).ok_or_else(|| {
            CoreconfError::InvalidPath {
                segment: seg.name.clone(),
                path: path.to_string(),
            }
        })?;
        names.push(if Some(module) == parent {
            seg.name.clone()
        } else {
            format!("{module}:{}", seg.name)
        });
        parent = Some(module);
    }
    Ok(names)
}

/// True for `[{"/path": value}, ...]`
pub fn is_instance_identifier_format(data: &Value) -> bool {
    match data {
        Value::Array(items) if !items.is_empty() => items.iter().all(|item| {
            item.as_object()
                .is_some_and(|obj| obj.len() == 1 && obj.keys().all(|k| k.starts_with('/')))
        }),
        _ => false,
    }
}

fn instance_entries(data: &Value) -> Result<Vec<(&str, &Value)>> {
    if !is_instance_identifier_format(data) {
        return Err(conflict("/", "expected an array of single-key objects keyed by '/' paths"));
    }
    Ok(data
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .flat_map(|obj| obj.iter().map(|(k, v)| (k.as_str(), v)))
        .collect())
}

fn conflict(path: &str, reason: impl Into<String>) -> CoreconfError {
    CoreconfError::PathConflict {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Fold instance-identifier pairs into one RFC 7951 tree
pub fn convert_instance_identifier_to_rfc7951(data: &Value) -> Result<Value> {
    let mut root = Map::new();
    for (path, value) in instance_entries(data)? {
        let segments = parse_instance_identifier_path(path)?;
        let names = member_names(&segments, path)?;
        insert_path(&mut root, &segments, &names, value, path)?;
    }
    Ok(Value::Object(root))
}

fn insert_path(
    root: &mut Map<String, Value>,
    segments: &[PathSegment],
    names: &[String],
    value: &Value,
    path: &str,
) -> Result<()> {
    let mut current = root;
    let last = segments.len() - 1;

    for (i, (seg, name)) in segments.iter().zip(names).enumerate() {
        if seg.keys.is_empty() {
            if i == last {
                merge_value(current, name, value.clone());
                return Ok(());
            }
            current = current
                .entry(name.clone())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .ok_or_else(|| conflict(path, format!("'{name}' is not a container")))?;
            continue;
        }

        let list = current
            .entry(name.clone())
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| conflict(path, format!("'{name}' is not a list")))?;
        let index = match list.iter().position(|e| entry_matches(e, &seg.keys)) {
            Some(index) => index,
            None => {
                let entry = seg
                    .keys
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                list.push(Value::Object(entry));
                list.len() - 1
            }
        };
        let entry = list[index]
            .as_object_mut()
            .ok_or_else(|| conflict(path, format!("entry of '{name}' is not an object")))?;

        if i == last {
            match value {
                Value::Object(fields) => {
                    for (k, v) in fields {
                        merge_value(entry, k, v.clone());
                    }
                }
                Value::Null => {}
                _ => return Err(conflict(path, "a list entry takes an object value")),
            }
            return Ok(());
        }
        current = entry;
    }
    Ok(())
}

fn merge_value(map: &mut Map<String, Value>, key: &str, value: Value) {
    match (map.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                merge_value(existing, &k, v);
            }
        }
        (_, value) => {
            map.insert(key.to_string(), value);
        }
    }
}

fn entry_matches(entry: &Value, keys: &[(String, String)]) -> bool {
    keys.iter()
        .all(|(k, v)| entry.get(k).is_some_and(|found| key_string(found) == *v))
}

fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn predicate(key: &str, value: &str) -> String {
    if value.contains('\'') {
        format!("[{key}=\"{value}\"]")
    } else {
        format!("[{key}='{value}']")
    }
}

/// Flatten an RFC 7951 tree into instance-identifier pairs, one per leaf
/// (key leaves included), leaf-list and empty container
pub fn flatten_rfc7951(tree: &Value, info: &SchemaInfo) -> Result<Value> {
    let root = tree
        .as_object()
        .ok_or_else(|| conflict("/", "expected an object"))?;
    let mut out = Vec::new();
    for (key, value) in root {
        flatten_node(key, value, "", "", info, &mut out)?;
    }
    Ok(Value::Array(out))
}

fn flatten_node(
    key: &str,
    value: &Value,
    parent_path: &str,
    parent_schema: &str,
    info: &SchemaInfo,
    out: &mut Vec<Value>,
) -> Result<()> {
    let local = key.split_once(':').map_or(key, |(_, n)| n);
    let path = format!("{parent_path}/{key}");
    let schema_path = if parent_schema.is_empty() {
        local.to_string()
    } else {
        format!("{parent_schema}/{local}")
    };
    let kind = info
        .node_kind(&schema_path)
        .unwrap_or_else(|| guess_kind(value));

    match (kind, value) {
        (NodeKind::Container, Value::Object(children)) if !children.is_empty() => {
            for (k, v) in children {
                flatten_node(k, v, &path, &schema_path, info, out)?;
            }
        }
        (NodeKind::List, Value::Array(entries)) if !entries.is_empty() => {
            let keys = info
                .list_keys(&schema_path)
                .filter(|k| !k.is_empty())
                .ok_or_else(|| conflict(&path, "list has no known keys"))?;
            for entry in entries {
                let fields = entry
                    .as_object()
                    .ok_or_else(|| conflict(&path, "list entry is not an object"))?;
                let mut entry_path = path.clone();
                for k in keys {
                    let v = fields
                        .get(k)
                        .ok_or_else(|| conflict(&path, format!("list entry lacks key '{k}'")))?;
                    entry_path.push_str(&predicate(k, &key_string(v)));
                }
                for (k, v) in fields {
                    flatten_node(k, v, &entry_path, &schema_path, info, out)?;
                }
            }
        }
        _ => {
            let mut pair = Map::new();
            pair.insert(path, value.clone());
            out.push(Value::Object(pair));
        }
    }
    Ok(())
}

fn guess_kind(value: &Value) -> NodeKind {
    match value {
        Value::Object(_) => NodeKind::Container,
        Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
            NodeKind::List
        }
        Value::Array(_) => NodeKind::LeafList,
        _ => NodeKind::Leaf,
    }
}

/// Resolve the target SID and list keys of every path in `data`
///
/// Queries accept bare path strings as well as `{path: value}` objects.
pub fn extract_sids_from_instance_identifier(
    data: &Value,
    sids: &SidTable,
    intent: Intent,
) -> Result<Vec<ResolvedInstance>> {
    let entries: Vec<(&str, &Value)> = match (intent, data) {
        (Intent::Query, Value::Array(items)) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|p| (p, &NULL))
            .collect(),
        _ => instance_entries(data)?,
    };

    let mut resolved = Vec::with_capacity(entries.len());
    for (path, value) in entries {
        let segments = parse_instance_identifier_path(path)?;
        let names = member_names(&segments, path)?;

        let mut identifier = String::new();
        let mut keys = Vec::new();
        for (seg, name) in segments.iter().zip(&names) {
            identifier.push('/');
            identifier.push_str(name);
            keys.extend(seg.keys.iter().map(|(k, v)| KeyRef {
                identifier: format!("{identifier}/{k}"),
                value: v.clone(),
            }));
        }

        let Some(sid) = sids.get_sid(&identifier) else {
            match intent {
                Intent::Query => {
                    warn!(path = %path, identifier = %identifier, "no SID for query path, dropping it");
                    continue;
                }
                Intent::Patch => return Err(CoreconfError::SidNotFound(identifier)),
            }
        };

        resolved.push(ResolvedInstance {
            path: path.to_string(),
            identifier,
            sid,
            keys,
            value: match intent {
                Intent::Query => Value::Null,
                Intent::Patch => value.clone(),
            },
        });
    }
    Ok(resolved)
}
