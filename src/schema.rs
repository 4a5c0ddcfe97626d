//! YANG schema extraction
//!
//! YANG sources are compiled to YIN (the XML rendition of YANG) by an
//! external compiler, `pyang` by default, and walked into a [`TypeTable`]
//! and a [`SchemaInfo`]. Schema paths drop module prefixes and the
//! transparent `choice`/`case` levels, e.g. `interfaces/interface/type`.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, trace};

use crate::error::{CoreconfError, Result};
use crate::types::{LeafType, RangeSet, YangType};

/// Deepest schema nesting visited before giving up
pub const MAX_DEPTH: usize = 64;

/// Kind of a data node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Container,
    List,
    Leaf,
    LeafList,
}

/// Schema path to the resolved type of each leaf and leaf-list
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    types: HashMap<String, LeafType>,
}

impl TypeTable {
    pub fn get(&self, schema_path: &str) -> Option<&LeafType> {
        self.types.get(schema_path)
    }

    pub fn insert(&mut self, schema_path: impl Into<String>, ty: LeafType) {
        self.types.insert(schema_path.into(), ty);
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Give every leafref the type of the leaf it points at.
    ///
    /// Leafrefs whose target is missing keep their `Leafref` type.
    fn resolve_leafrefs(&mut self) {
        let resolved: Vec<(String, LeafType)> = self
            .types
            .iter()
            .filter_map(|(leaf, ty)| Some((leaf.clone(), self.follow_leafref(leaf, ty, 0)?)))
            .collect();
        for (leaf, ty) in resolved {
            trace!(leaf = %leaf, "leafref resolved");
            self.types.insert(leaf, ty);
        }
    }

    /// The replacement type of `ty` at `leaf`, or `None` if nothing changes
    fn follow_leafref(&self, leaf: &str, ty: &LeafType, hops: usize) -> Option<LeafType> {
        if hops > MAX_DEPTH {
            return None;
        }
        match &ty.base {
            YangType::Leafref { path: Some(reference) } => {
                let target = leafref_target(leaf, reference)?;
                let target_ty = self.types.get(&target)?;
                let resolved = match self.follow_leafref(&target, target_ty, hops + 1) {
                    Some(deeper) => deeper,
                    None => target_ty.clone(),
                };
                if matches!(resolved.base, YangType::Leafref { .. }) {
                    debug!(leaf, target = %target, "leafref target is unresolved");
                    return None;
                }
                Some(resolved)
            }
            YangType::Union(members) => {
                let followed: Vec<Option<LeafType>> = members
                    .iter()
                    .map(|member| self.follow_leafref(leaf, member, hops + 1))
                    .collect();
                if followed.iter().all(Option::is_none) {
                    return None;
                }
                let members = members
                    .iter()
                    .zip(followed)
                    .map(|(member, f)| f.unwrap_or_else(|| member.clone()))
                    .collect();
                Some(LeafType {
                    base: YangType::Union(members),
                    ..ty.clone()
                })
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Node kinds, list keys and the canonical child order
#[derive(Debug, Clone, Default)]
pub struct SchemaInfo {
    /// Local node name to first-seen position
    node_order: HashMap<String, usize>,
    node_types: HashMap<String, NodeKind>,
    list_keys: HashMap<String, Vec<String>>,
}

impl SchemaInfo {
    fn record(&mut self, schema_path: &str, name: &str, kind: NodeKind) {
        let next = self.node_order.len();
        self.node_order.entry(name.to_string()).or_insert(next);
        self.node_types.insert(schema_path.to_string(), kind);
    }

    /// Register a node outside of extraction (hand-built schemas)
    pub fn add_node(&mut self, schema_path: &str, kind: NodeKind) {
        let name = schema_path.rsplit('/').next().unwrap_or(schema_path);
        self.record(schema_path, name, kind);
    }

    pub fn set_list_keys(&mut self, schema_path: &str, keys: Vec<String>) {
        self.list_keys.insert(schema_path.to_string(), keys);
    }

    /// Position of a local node name in first-seen order
    pub fn order_of(&self, name: &str) -> Option<usize> {
        self.node_order.get(name).copied()
    }

    pub fn node_kind(&self, schema_path: &str) -> Option<NodeKind> {
        self.node_types.get(schema_path).copied()
    }

    pub fn list_keys(&self, schema_path: &str) -> Option<&[String]> {
        self.list_keys.get(schema_path).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.node_types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_types.is_empty()
    }
}

/// Result of extracting one or more modules
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub types: TypeTable,
    pub info: SchemaInfo,
}

/// Turns YANG sources into a [`Schema`] through an external YANG compiler
#[derive(Debug, Clone)]
pub struct SchemaExtractor {
    compiler: String,
    search_dirs: Vec<PathBuf>,
}

impl Default for SchemaExtractor {
    fn default() -> Self {
        Self::new("pyang")
    }
}

impl SchemaExtractor {
    pub fn new(compiler: impl Into<String>) -> Self {
        Self {
            compiler: compiler.into(),
            search_dirs: Vec::new(),
        }
    }

    /// Add a directory the compiler searches for imported modules
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dirs.push(dir.into());
        self
    }

    /// Run the compiler on one YANG file and return the YIN document
    pub fn compile_to_yin(&self, file: &Path) -> Result<String> {
        let mut cmd = Command::new(&self.compiler);
        cmd.arg("-f").arg("yin");
        for dir in &self.search_dirs {
            cmd.arg("-p").arg(dir);
        }
        cmd.arg(file);

        debug!(compiler = %self.compiler, file = %file.display(), "compiling YANG module");
        let output = cmd.output().map_err(|e| match e.kind() {
            IoErrorKind::NotFound => CoreconfError::CompilerMissing(self.compiler.clone()),
            _ => CoreconfError::Io(e),
        })?;

        if !output.status.success() {
            return Err(CoreconfError::CompilerFailed {
                file: file.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Extract a single YANG file
    pub fn extract_file(&self, file: &Path) -> Result<Schema> {
        let yin = self.compile_to_yin(file)?;
        Self::from_yin_documents(&[yin])
    }

    /// Extract every `*.yang` file of a directory as one schema, so
    /// groupings and typedefs resolve across modules
    pub fn extract_dir(&self, dir: &Path) -> Result<Schema> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "yang"))
            .collect();
        files.sort();

        let extractor = self.clone().with_search_dir(dir);
        let documents = files
            .iter()
            .map(|f| extractor.compile_to_yin(f))
            .collect::<Result<Vec<_>>>()?;
        Self::from_yin_documents(&documents)
    }

    /// Build a schema from a YIN document without running the compiler
    pub fn from_yin_str(yin: &str) -> Result<Schema> {
        Self::from_yin_documents(&[yin])
    }

    pub fn from_yin_documents<S: AsRef<str>>(documents: &[S]) -> Result<Schema> {
        let roots = documents
            .iter()
            .map(|d| parse_yin(d.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let mut walker = Walker::default();
        for root in &roots {
            walker.collect_definitions(root)?;
        }
        for root in &roots {
            walker.visit_module(root)?;
        }
        walker.schema.types.resolve_leafrefs();
        debug!(
            modules = roots.len(),
            leaves = walker.schema.types.len(),
            nodes = walker.schema.info.len(),
            "schema extracted"
        );
        Ok(walker.schema)
    }
}

/// Minimal YIN element tree
#[derive(Debug, Clone, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// `value` attribute of the first child named `name`
    fn child_value(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|c| c.attr("value"))
    }
}

fn xml_error(e: impl std::fmt::Display) -> CoreconfError {
    CoreconfError::Schema(format!("YIN parse error: {e}"))
}

fn parse_yin(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    loop {
        let finished = match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                stack.push(element_from(&e)?);
                None
            }
            Event::Empty(e) => {
                let el = element_from(&e)?;
                match stack.last_mut() {
                    Some(parent) => {
                        parent.children.push(el);
                        None
                    }
                    None => Some(el),
                }
            }
            Event::End(_) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| xml_error("unbalanced end tag"))?;
                match stack.last_mut() {
                    Some(parent) => {
                        parent.children.push(el);
                        None
                    }
                    None => Some(el),
                }
            }
            Event::Eof => return Err(xml_error("unexpected end of document")),
            _ => None,
        };
        if let Some(root) = finished {
            return Ok(root);
        }
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<Element> {
    let mut el = Element {
        name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        ..Default::default()
    };
    for attr in start.attributes() {
        let attr = attr.map_err(xml_error)?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_error)?.into_owned();
        el.attrs.push((key, value));
    }
    Ok(el)
}

/// Prefix scope of one module
#[derive(Debug, Clone, Default)]
struct ModuleScope {
    name: String,
    prefix: String,
    /// Import prefix to module name
    imports: HashMap<String, String>,
}

impl ModuleScope {
    fn from_root(root: &Element) -> Result<Self> {
        let (name, prefix) = match root.name.as_str() {
            "module" => (
                root.attr("name").unwrap_or_default().to_string(),
                root.child_value("prefix").unwrap_or_default().to_string(),
            ),
            "submodule" => {
                let belongs = root
                    .child("belongs-to")
                    .ok_or_else(|| CoreconfError::Schema("submodule without belongs-to".into()))?;
                (
                    belongs.attr("module").unwrap_or_default().to_string(),
                    belongs.child_value("prefix").unwrap_or_default().to_string(),
                )
            }
            other => {
                return Err(CoreconfError::Schema(format!(
                    "expected a YIN module, found <{other}>"
                )));
            }
        };
        if name.is_empty() {
            return Err(CoreconfError::Schema("module without a name".into()));
        }

        let imports = root
            .children_named("import")
            .filter_map(|imp| {
                Some((
                    imp.child_value("prefix")?.to_string(),
                    imp.attr("module")?.to_string(),
                ))
            })
            .collect();

        Ok(Self {
            name,
            prefix,
            imports,
        })
    }

    /// Qualify a possibly-prefixed reference as `module:name`
    fn qualify(&self, reference: &str) -> String {
        match reference.split_once(':') {
            Some((prefix, local)) if prefix == self.prefix => format!("{}:{local}", self.name),
            Some((prefix, local)) => match self.imports.get(prefix) {
                Some(module) => format!("{module}:{local}"),
                None => reference.to_string(),
            },
            None => format!("{}:{reference}", self.name),
        }
    }
}

/// Definition found in phase one, with the scope it was declared in
#[derive(Debug, Clone)]
struct Definition {
    scope: ModuleScope,
    element: Element,
}

#[derive(Default)]
struct Walker {
    typedefs: HashMap<String, Definition>,
    groupings: HashMap<String, Definition>,
    schema: Schema,
}

impl Walker {
    fn collect_definitions(&mut self, root: &Element) -> Result<()> {
        let scope = ModuleScope::from_root(root)?;
        self.collect_in(root, &scope, 0)
    }

    fn collect_in(&mut self, el: &Element, scope: &ModuleScope, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(CoreconfError::Schema(format!(
                "definitions of module {} nested deeper than {MAX_DEPTH}",
                scope.name
            )));
        }
        for child in &el.children {
            let table = match child.name.as_str() {
                "typedef" => Some(&mut self.typedefs),
                "grouping" => Some(&mut self.groupings),
                _ => None,
            };
            if let (Some(table), Some(name)) = (table, child.attr("name")) {
                table.insert(
                    format!("{}:{name}", scope.name),
                    Definition {
                        scope: scope.clone(),
                        element: child.clone(),
                    },
                );
            }
            self.collect_in(child, scope, depth + 1)?;
        }
        Ok(())
    }

    fn visit_module(&mut self, root: &Element) -> Result<()> {
        let scope = ModuleScope::from_root(root)?;
        for child in &root.children {
            if child.name == "augment" {
                self.visit_augment(child, &scope, "", 0)?;
            } else {
                self.visit_node(child, &scope, "", 0)?;
            }
        }
        Ok(())
    }

    fn visit_children(&mut self, el: &Element, scope: &ModuleScope, path: &str, depth: usize) -> Result<()> {
        for child in &el.children {
            self.visit_node(child, scope, path, depth + 1)?;
        }
        Ok(())
    }

    fn visit_node(&mut self, el: &Element, scope: &ModuleScope, parent: &str, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(CoreconfError::Schema(format!(
                "schema nesting deeper than {MAX_DEPTH} at '{parent}'"
            )));
        }

        match el.name.as_str() {
            "container" | "rpc" | "action" | "notification" | "input" | "output" => {
                let name = el.attr("name").unwrap_or(el.name.as_str());
                let path = join(parent, name);
                self.schema.info.record(&path, name, NodeKind::Container);
                self.visit_children(el, scope, &path, depth)
            }
            "list" => {
                let name = el.attr("name").unwrap_or_default();
                let path = join(parent, name);
                self.schema.info.record(&path, name, NodeKind::List);
                if let Some(keys) = el.child_value("key") {
                    let keys = keys.split_whitespace().map(str::to_string).collect();
                    self.schema.info.set_list_keys(&path, keys);
                }
                self.visit_children(el, scope, &path, depth)
            }
            "leaf" | "leaf-list" => {
                let name = el.attr("name").unwrap_or_default();
                let path = join(parent, name);
                let kind = if el.name == "leaf" {
                    NodeKind::Leaf
                } else {
                    NodeKind::LeafList
                };
                self.schema.info.record(&path, name, kind);
                let type_el = el.child("type").ok_or_else(|| {
                    CoreconfError::Schema(format!("{} '{path}' has no type", el.name))
                })?;
                let ty = self.resolve_type(type_el, scope, &path, depth)?;
                trace!(path = %path, ty = ?ty.base, "leaf type resolved");
                self.schema.types.insert(path, ty);
                Ok(())
            }
            "choice" | "case" => self.visit_children(el, scope, parent, depth),
            "uses" => self.visit_uses(el, scope, parent, depth),
            "augment" => self.visit_augment(el, scope, parent, depth),
            _ => Ok(()),
        }
    }

    fn visit_uses(&mut self, el: &Element, scope: &ModuleScope, parent: &str, depth: usize) -> Result<()> {
        let reference = el.attr("name").unwrap_or_default();
        let key = scope.qualify(reference);
        let grouping = self.groupings.get(&key).cloned().ok_or_else(|| {
            CoreconfError::Schema(format!("unknown grouping '{reference}' used at '{parent}'"))
        })?;

        self.visit_children(&grouping.element, &grouping.scope, parent, depth)?;
        // uses-augment refines nodes the grouping just created
        for augment in el.children_named("augment") {
            self.visit_augment(augment, scope, parent, depth + 1)?;
        }
        Ok(())
    }

    fn visit_augment(&mut self, el: &Element, scope: &ModuleScope, parent: &str, depth: usize) -> Result<()> {
        let target = el.attr("target-node").unwrap_or_default();
        let stripped = strip_prefixes(target);
        let path = if target.starts_with('/') {
            stripped
        } else {
            join(parent, &stripped)
        };
        self.visit_children(el, scope, &path, depth)
    }

    fn resolve_type(&self, type_el: &Element, scope: &ModuleScope, path: &str, depth: usize) -> Result<LeafType> {
        if depth > MAX_DEPTH {
            return Err(CoreconfError::Schema(format!(
                "typedef chain deeper than {MAX_DEPTH} at '{path}'"
            )));
        }
        let name = type_el.attr("name").unwrap_or_default();

        let builtin = if name.contains(':') {
            None
        } else {
            YangType::builtin(name)
        };
        let mut ty = match builtin {
            Some(base) => LeafType::new(self.build_builtin(base, type_el, scope, path, depth)?),
            None => {
                let typedef = self.typedefs.get(&scope.qualify(name)).ok_or_else(|| {
                    CoreconfError::UnresolvedTypedef {
                        name: name.to_string(),
                        path: path.to_string(),
                    }
                })?;
                let inner = typedef.element.child("type").ok_or_else(|| {
                    CoreconfError::Schema(format!("typedef '{name}' has no type"))
                })?;
                let mut ty = self.resolve_type(inner, &typedef.scope, path, depth + 1)?;
                if let (YangType::Decimal64 { fraction_digits }, Some(fd)) =
                    (&mut ty.base, type_el.child_value("fraction-digits"))
                {
                    *fraction_digits = fd.parse().unwrap_or(*fraction_digits);
                }
                ty
            }
        };

        // Restrictions at this level narrow whatever the typedef declared
        if let Some(range) = type_el.child_value("range") {
            ty.range = Some(RangeSet::parse(range));
        }
        if let Some(length) = type_el.child_value("length") {
            ty.length = Some(RangeSet::parse(length));
        }
        ty.patterns.extend(
            type_el
                .children_named("pattern")
                .filter_map(|p| p.attr("value").map(str::to_string)),
        );
        Ok(ty)
    }

    fn build_builtin(
        &self,
        base: YangType,
        type_el: &Element,
        scope: &ModuleScope,
        path: &str,
        depth: usize,
    ) -> Result<YangType> {
        Ok(match base {
            YangType::Enumeration(mut enums) => {
                let mut next = 0i64;
                for member in type_el.children_named("enum") {
                    let value = member
                        .child_value("value")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(next);
                    enums.insert(member.attr("name").unwrap_or_default().to_string(), value);
                    next = value + 1;
                }
                YangType::Enumeration(enums)
            }
            YangType::Bits(mut bits) => {
                let mut next = 0u32;
                for member in type_el.children_named("bit") {
                    let position = member
                        .child_value("position")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(next);
                    bits.insert(member.attr("name").unwrap_or_default().to_string(), position);
                    next = position + 1;
                }
                YangType::Bits(bits)
            }
            YangType::Decimal64 { .. } => YangType::Decimal64 {
                fraction_digits: type_el
                    .child_value("fraction-digits")
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| {
                        CoreconfError::Schema(format!("decimal64 at '{path}' lacks fraction-digits"))
                    })?,
            },
            YangType::Identityref { .. } => YangType::Identityref {
                base: type_el
                    .child("base")
                    .and_then(|b| b.attr("name"))
                    .map(|b| scope.qualify(b)),
            },
            YangType::Leafref { .. } => YangType::Leafref {
                path: type_el
                    .child("path")
                    .and_then(|p| p.attr("value"))
                    .map(str::to_string),
            },
            YangType::Union(_) => YangType::Union(
                type_el
                    .children_named("type")
                    .map(|member| self.resolve_type(member, scope, path, depth + 1))
                    .collect::<Result<_>>()?,
            ),
            other => other,
        })
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Schema path a leafref `reference` at `leaf` points at.
///
/// Predicates are dropped; relative references start from the leaf itself.
fn leafref_target(leaf: &str, reference: &str) -> Option<String> {
    let mut plain = String::with_capacity(reference.len());
    let mut depth = 0usize;
    for c in reference.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.checked_sub(1)?,
            _ if depth == 0 => plain.push(c),
            _ => {}
        }
    }

    let plain = plain.trim();
    if plain.starts_with('/') {
        return Some(strip_prefixes(plain));
    }
    let mut segments: Vec<&str> = leaf.split('/').filter(|s| !s.is_empty()).collect();
    for step in plain.split('/').map(str::trim).filter(|s| !s.is_empty()) {
        match step {
            ".." => {
                segments.pop()?;
            }
            "." => {}
            name => segments.push(name.split_once(':').map_or(name, |(_, local)| local)),
        }
    }
    Some(segments.join("/"))
}

/// `/if:interfaces/if:interface` -> `interfaces/interface`
pub fn strip_prefixes(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.split_once(':').map_or(s, |(_, local)| local))
        .collect::<Vec<_>>()
        .join("/")
}
