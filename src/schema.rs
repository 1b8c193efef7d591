//! Conformance checking against data-model schemas.
//!
//! A [Validator] decides whether a tree matches one of its schemas and which.
//! On success the matched [FieldSchema]s are attached to the nodes they
//! describe, so callers can inspect them with [Node::schema].
//! Schemas are plain data; nodes never run validation themselves.

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{Error, Node, Result, Unit, node::NodeKind};

mod roman;

/// Kind of node a field must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedKind {
    Group,
    Array,
    Quantity,
    Time,
    Sequence,
    Scalar,
    String,
    Number,
}

/// Constraints for one node and, for groups, its children.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ExpectedKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ndim: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Arc<FieldSchema>>,
}

/// A named data-model schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaDescriptor {
    /// Short tag name of the model, e.g. `wfi_image`.
    pub name: String,
    /// Human-readable variant, e.g. "calibrated image".
    pub title: String,
    pub root: Arc<FieldSchema>,
}

/// Result of a successful validation.
#[derive(Debug, Clone)]
pub struct SchemaMatch {
    pub schema: Arc<SchemaDescriptor>,
    /// Dotted path of the model node within the tree; empty for the root.
    pub path: String,
}

/// The conformance collaborator.
pub trait Validator: Debug + Send + Sync {
    /// Check the tree, returning which schema it matches or [Error::Validation].
    fn validate(&self, root: &Node) -> Result<SchemaMatch>;
}

/// A schema compiled into the crate, as a JSON [SchemaDescriptor].
pub struct SchemaPlugin {
    pub name: &'static str,
    pub json: &'static str,
}

impl SchemaPlugin {
    pub const fn new(name: &'static str, json: &'static str) -> Self {
        Self { name, json }
    }
}

inventory::collect!(SchemaPlugin);

/// Validates trees against a set of schemas, picking one by the model's tag.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Arc<SchemaDescriptor>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of every schema submitted as a [SchemaPlugin].
    pub fn builtin() -> Result<Self> {
        let mut out = Self::new();
        for plugin in inventory::iter::<SchemaPlugin> {
            log::trace!("loading schema {}", plugin.name);
            out.register(serde_json::from_str(plugin.json)?);
        }
        Ok(out)
    }

    pub fn register(&mut self, schema: SchemaDescriptor) -> Option<Arc<SchemaDescriptor>> {
        self.schemas.insert(schema.name.clone(), Arc::new(schema))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<SchemaDescriptor>> {
        self.schemas.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Find the data-model node: `roman` under the root if present, else the root.
    fn model<'a>(root: &'a Node) -> (&'a Node, &'static str) {
        match root.child("roman") {
            Ok(node) if node.kind() == NodeKind::Group => (node, "roman"),
            _ => (root, ""),
        }
    }

    /// The schema for the tree's model tag, without checking it.
    pub fn identify(&self, root: &Node) -> Option<&Arc<SchemaDescriptor>> {
        let (model, _) = Self::model(root);
        self.get(model.tag()?.short_name())
    }
}

impl Validator for SchemaRegistry {
    fn validate(&self, root: &Node) -> Result<SchemaMatch> {
        let (model, path) = Self::model(root);
        let tag = model.tag().map(|t| t.short_name().to_owned());
        let schema = tag
            .as_deref()
            .and_then(|t| self.get(t))
            .ok_or_else(|| Error::Validation {
                schema: tag.clone().unwrap_or_else(|| "<untagged>".into()),
                failures: vec!["no schema for this model".into()],
            })?;
        let mut failures = Vec::new();
        check(model, &schema.root, path, &mut failures);
        if !failures.is_empty() {
            return Err(Error::Validation {
                schema: schema.name.clone(),
                failures,
            });
        }
        log::debug!("tree conforms to {} ({})", schema.name, schema.title);
        Ok(SchemaMatch {
            schema: schema.clone(),
            path: path.to_owned(),
        })
    }
}

fn check(node: &Node, schema: &FieldSchema, path: &str, failures: &mut Vec<String>) {
    let here = if path.is_empty() { "<root>" } else { path };
    if let Some(kind) = schema.kind {
        let ok = match kind {
            ExpectedKind::Group => node.kind() == NodeKind::Group,
            ExpectedKind::Array => node.array_block().is_ok(),
            ExpectedKind::Quantity => node.kind() == NodeKind::QuantityValue,
            ExpectedKind::Time => node.kind() == NodeKind::TimeValue,
            ExpectedKind::Sequence => node.kind() == NodeKind::Sequence,
            ExpectedKind::Scalar => node.kind() == NodeKind::Scalar,
            ExpectedKind::String => node.as_str().is_some(),
            ExpectedKind::Number => node.as_f64().is_some(),
        };
        if !ok {
            failures.push(format!("{here}: expected {kind:?}, found {:?}", node.kind()));
            return;
        }
    }
    if let Some(tag) = &schema.tag {
        if node.tag().map(|t| t.short_name()) != Some(tag.as_str()) {
            failures.push(format!("{here}: expected tag {tag}"));
        }
    }
    if let Some(dtype) = &schema.dtype {
        match node.dtype() {
            Some(found) if found.to_string() == *dtype => {}
            found => failures.push(format!(
                "{here}: expected dtype {dtype}, found {}",
                found.map_or_else(|| "none".to_owned(), ToString::to_string)
            )),
        }
    }
    if let Some(ndim) = schema.ndim {
        let found = node.shape().map(<[u64]>::len);
        if found != Some(ndim) {
            failures.push(format!("{here}: expected {ndim} dimensions, found {found:?}"));
        }
    }
    if let Some(unit) = &schema.unit {
        match (Unit::parse(unit), node.unit()) {
            (Ok(expected), Some(found)) if expected.is_compatible(found) => {}
            (Ok(_), found) => failures.push(format!(
                "{here}: expected unit {unit}, found {}",
                found.map_or_else(|| "none".to_owned(), ToString::to_string)
            )),
            (Err(e), _) => failures.push(format!("{here}: schema unit {unit}: {e}")),
        }
    }
    if schema.required.is_empty() && schema.properties.is_empty() {
        return;
    }
    let Ok(group) = node.as_group() else {
        failures.push(format!("{here}: expected a group with fields"));
        return;
    };
    for key in &schema.required {
        if !group.contains_key(key) {
            failures.push(format!("{here}: missing required field {key}"));
        }
    }
    for (key, child_schema) in &schema.properties {
        if let Some(child) = group.get(key) {
            let child_path = if path.is_empty() {
                key.clone()
            } else {
                format!("{path}.{key}")
            };
            check(child, child_schema, &child_path, failures);
        }
    }
}

/// Attach `schema` and its field schemas to `node` and its descendants.
pub(crate) fn attach(node: &mut Node, schema: &Arc<FieldSchema>) {
    node.set_schema(schema.clone());
    if let Ok(group) = node.as_group_mut() {
        for (key, child_schema) in &schema.properties {
            if let Some(child) = group.get_mut(key) {
                attach(child, child_schema);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NdArray, tag::Tag};

    #[test]
    fn builtin_registry_has_roman_models() {
        let registry = SchemaRegistry::builtin().unwrap();
        assert_eq!(registry.get("wfi_image").unwrap().title, "calibrated image");
        assert_eq!(registry.get("wfi_science_raw").unwrap().title, "raw science");
    }

    #[test]
    fn reports_every_failure() {
        let schema: FieldSchema = serde_json::from_str(
            r#"{
                "kind": "group",
                "required": ["data", "meta"],
                "properties": {
                    "data": {"kind": "array", "dtype": "float32", "ndim": 2},
                    "name": {"kind": "string"}
                }
            }"#,
        )
        .unwrap();
        let node = Node::group(
            Some(Tag::parse("!thing-1.0.0")),
            [
                ("data", Node::from_array(NdArray::from_vec(vec![3], vec![1u16, 2, 3]).unwrap())),
                ("name", Node::scalar(3i64)),
            ],
        );
        let mut failures = vec![];
        check(&node, &schema, "", &mut failures);
        assert_eq!(failures.len(), 4, "{failures:?}");
        assert!(failures.iter().any(|f| f.contains("missing required field meta")));
        assert!(failures.iter().any(|f| f.contains("expected dtype float32, found uint16")));
    }

    #[test]
    fn unknown_models_fail_validation() {
        let registry = SchemaRegistry::builtin().unwrap();
        let node = Node::group(Some(Tag::parse("!mystery-1.0.0")), Vec::<(String, Node)>::new());
        let err = registry.validate(&node).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
