use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::bimap::BiMap;
use crate::error::{CoreconfError, Result};
use crate::types::LeafType;

/// Represents a parsed YANG SID file
#[derive(Debug, Clone)]
pub struct SidFile {
    /// Module name from the SID file
    pub module_name: String,
    /// Module revision
    pub module_revision: String,
    /// Identifier (data path, identity or module name) to SID
    pub sids: BiMap<String, i64>,
    /// Mapping from identifier path to the leaf type recorded in the file
    pub types: HashMap<String, LeafType>,
    /// Key SIDs for list entries, by list SID
    pub key_mapping: HashMap<i64, Vec<i64>>,
}

/// Raw SID file structure for deserialization
#[derive(Debug, Deserialize)]
struct RawSidFile {
    #[serde(rename = "module-name")]
    module_name: String,
    #[serde(rename = "module-revision", default)]
    module_revision: String,
    #[serde(alias = "items")]
    item: Vec<RawSidItem>,
    #[serde(rename = "key-mapping", default)]
    key_mapping: HashMap<String, Vec<i64>>,
}

#[derive(Debug, Deserialize)]
struct RawSidItem {
    identifier: String,
    sid: i64,
    #[serde(rename = "type")]
    item_type: Option<Value>,
}

impl SidFile {
    /// Parse a SID file from the given path
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content).map_err(|e| match e {
            CoreconfError::Json(e) => {
                CoreconfError::InvalidSidFile(format!("{}: {e}", path.as_ref().display()))
            }
            other => other,
        })
    }

    /// Parse a SID file from a JSON string
    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: RawSidFile = serde_json::from_str(content)?;

        let mut sids = BiMap::new();
        let mut types = HashMap::new();

        for item in raw.item {
            if let Some(ref type_val) = item.item_type {
                types.insert(item.identifier.clone(), LeafType::from_sid_type(type_val));
            }
            for (old_id, old_sid) in sids.insert(item.identifier, item.sid) {
                warn!(module = %raw.module_name, identifier = %old_id, sid = old_sid, "SID file entry overridden");
            }
        }

        let key_mapping = raw
            .key_mapping
            .into_iter()
            .filter_map(|(k, v)| k.parse().ok().map(|sid| (sid, v)))
            .collect();

        Ok(SidFile {
            module_name: raw.module_name,
            module_revision: raw.module_revision,
            sids,
            types,
            key_mapping,
        })
    }
}

impl std::str::FromStr for SidFile {
    type Err = CoreconfError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_json_str(s)
    }
}

/// SID table merged from every SID file of a catalog
///
/// Identifiers are kept exactly as SID files spell them: data nodes as
/// `/module:top/child/other-module:grandchild`, identities as
/// `module:identity`, modules by bare name.
#[derive(Debug, Clone, Default)]
pub struct SidTable {
    sids: BiMap<String, i64>,
    types: HashMap<String, LeafType>,
    key_mapping: HashMap<i64, Vec<i64>>,
    modules: Vec<String>,
}

impl SidTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.sid` file in a directory
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let mut paths: Vec<_> = fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "sid"))
            .collect();
        paths.sort();

        let mut table = Self::new();
        for path in paths {
            table.add_file(SidFile::from_file(&path)?);
        }
        debug!(dir = %dir.as_ref().display(), modules = table.modules.len(), sids = table.len(), "SID table loaded");
        Ok(table)
    }

    pub fn add_file(&mut self, file: SidFile) {
        for (identifier, &sid) in file.sids.iter() {
            self.insert(identifier.clone(), sid);
        }
        self.types.extend(file.types);
        self.key_mapping.extend(file.key_mapping);
        self.modules.push(file.module_name);
    }

    pub fn insert(&mut self, identifier: impl Into<String>, sid: i64) {
        for (old_id, old_sid) in self.sids.insert(identifier.into(), sid) {
            warn!(identifier = %old_id, sid = old_sid, "SID assignment replaced");
        }
    }

    pub fn get_sid(&self, identifier: &str) -> Option<i64> {
        self.sids.get_by_left(&identifier.to_string()).copied()
    }

    pub fn get_identifier(&self, sid: i64) -> Option<&str> {
        self.sids.get_by_right(&sid).map(String::as_str)
    }

    /// Largest assigned SID strictly below `sid`
    pub fn nearest_below(&self, sid: i64) -> Option<(i64, &str)> {
        self.sids
            .nearest_below(&sid)
            .map(|(s, id)| (*s, id.as_str()))
    }

    /// Type recorded in the SID files, used when the type table has no entry
    pub fn get_type(&self, identifier: &str) -> Option<&LeafType> {
        self.types.get(identifier)
    }

    /// Key SIDs of a list, in key order
    pub fn get_keys(&self, list_sid: i64) -> Option<&[i64]> {
        self.key_mapping.get(&list_sid).map(Vec::as_slice)
    }

    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.sids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sids.is_empty()
    }
}
