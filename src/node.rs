use std::{collections::BTreeMap, fmt, ops::Index, sync::Arc};

use crate::{
    ArrayBlock, Error, NdArray, Result,
    dtype::DType,
    info::{InfoOptions, render},
    schema::FieldSchema,
    tag::Tag,
    time::TimeValue,
    unit::{Magnitude, Quantity, Unit},
};

/// What a node holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Group,
    ArrayBlock,
    Scalar,
    TimeValue,
    QuantityValue,
    Sequence,
}

/// A leaf value from the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// A bare `unit/unit` value.
    Unit(Unit),
    /// Any other tagged scalar, kept verbatim.
    Tagged(Tag, String),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("None"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
            Self::Unit(u) => write!(f, "{u}"),
            Self::Tagged(_, s) => f.write_str(s),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Named children of a mapping node, optionally tagged with the object type
/// (e.g. `wfi_image`, `gwcs/wcs`).
#[derive(Debug, Clone, Default)]
pub struct Group {
    tag: Option<Tag>,
    children: BTreeMap<String, Node>,
}

impl Group {
    pub fn new(tag: Option<Tag>) -> Self {
        Self {
            tag,
            children: BTreeMap::new(),
        }
    }

    pub fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    /// Child keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.children.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.children.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.children.contains_key(key)
    }

    /// Add or replace a child, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, mut node: Node) -> Option<Node> {
        let key = key.into();
        node.name.clone_from(&key);
        self.children.insert(key, node)
    }

    pub fn remove(&mut self, key: &str) -> Option<Node> {
        self.children.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Numeric part of a quantity node.
#[derive(Debug, Clone)]
pub enum QuantityPayload {
    Scalar(f64),
    Array(ArrayBlock),
}

/// A quantity in the tree; array values are lazy like any other array block.
#[derive(Debug, Clone)]
pub struct QuantityNode {
    pub value: QuantityPayload,
    pub unit: Unit,
}

impl QuantityNode {
    pub fn materialize(&self) -> Result<Quantity> {
        let value = match &self.value {
            QuantityPayload::Scalar(v) => Magnitude::Scalar(*v),
            QuantityPayload::Array(block) => Magnitude::Array(block.materialize()?),
        };
        Ok(Quantity::new(value, self.unit.clone()))
    }
}

#[derive(Debug, Clone)]
pub enum NodeValue {
    Group(Group),
    Array(ArrayBlock),
    Scalar(Scalar),
    Time(TimeValue),
    Quantity(QuantityNode),
    Sequence(Vec<Node>),
}

/// The result of indexing: structure by reference, array payloads materialised.
#[derive(Debug, Clone)]
pub enum Item<'a> {
    /// A group or sequence, still lazy.
    Node(&'a Node),
    Array(NdArray),
    Quantity(Quantity),
    Scalar(&'a Scalar),
    Time(&'a TimeValue),
}

impl Item<'_> {
    pub fn into_array(self) -> Option<NdArray> {
        match self {
            Self::Array(a) => Some(a),
            Self::Quantity(Quantity {
                value: Magnitude::Array(a),
                ..
            }) => Some(a),
            _ => None,
        }
    }
}

/// A named entry in the tree.
///
/// Cloning is deep: materialised payloads are duplicated, and the clone
/// never shares mutable state with the original.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    schema: Option<Arc<FieldSchema>>,
    value: NodeValue,
}

impl Node {
    pub fn new(name: impl Into<String>, value: NodeValue) -> Self {
        Self {
            name: name.into(),
            schema: None,
            value,
        }
    }

    /// A group node with the given children.
    pub fn group<K: Into<String>>(tag: Option<Tag>, children: impl IntoIterator<Item = (K, Node)>) -> Self {
        let mut group = Group::new(tag);
        for (k, v) in children {
            group.insert(k, v);
        }
        Self::new("", NodeValue::Group(group))
    }

    pub fn from_array(array: NdArray) -> Self {
        Self::new("", NodeValue::Array(ArrayBlock::new(array)))
    }

    pub fn scalar(value: impl Into<Scalar>) -> Self {
        Self::new("", NodeValue::Scalar(value.into()))
    }

    pub fn time(value: TimeValue) -> Self {
        Self::new("", NodeValue::Time(value))
    }

    pub fn quantity(quantity: Quantity) -> Self {
        let value = match quantity.value {
            Magnitude::Scalar(v) => QuantityPayload::Scalar(v),
            Magnitude::Array(a) => QuantityPayload::Array(ArrayBlock::new(a)),
        };
        Self::new(
            "",
            NodeValue::Quantity(QuantityNode {
                value,
                unit: quantity.unit,
            }),
        )
    }

    pub fn sequence(items: Vec<Node>) -> Self {
        Self::new("", NodeValue::Sequence(items))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        match &self.value {
            NodeValue::Group(_) => NodeKind::Group,
            NodeValue::Array(_) => NodeKind::ArrayBlock,
            NodeValue::Scalar(_) => NodeKind::Scalar,
            NodeValue::Time(_) => NodeKind::TimeValue,
            NodeValue::Quantity(_) => NodeKind::QuantityValue,
            NodeValue::Sequence(_) => NodeKind::Sequence,
        }
    }

    pub fn value(&self) -> &NodeValue {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut NodeValue {
        &mut self.value
    }

    /// The schema attached by a validator, if the tree was validated.
    pub fn schema(&self) -> Option<&Arc<FieldSchema>> {
        self.schema.as_ref()
    }

    pub(crate) fn set_schema(&mut self, schema: Arc<FieldSchema>) {
        self.schema = Some(schema);
    }

    /// Object tag of a group, e.g. `wfi_image`.
    pub fn tag(&self) -> Option<&Tag> {
        match &self.value {
            NodeValue::Group(g) => g.tag(),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Result<&Group> {
        match &self.value {
            NodeValue::Group(g) => Ok(g),
            _ => Err(self.not_a_group()),
        }
    }

    pub fn as_group_mut(&mut self) -> Result<&mut Group> {
        let kind = self.kind();
        match &mut self.value {
            NodeValue::Group(g) => Ok(g),
            _ => Err(Error::NotAGroup {
                path: self.name.clone(),
                kind,
            }),
        }
    }

    fn not_a_group(&self) -> Error {
        Error::NotAGroup {
            path: self.name.clone(),
            kind: self.kind(),
        }
    }

    fn wrong_kind(&self, expected: &'static str) -> Error {
        Error::WrongKind {
            path: self.name.clone(),
            expected,
            found: self.kind(),
        }
    }

    /// Immediate child keys of a group.
    pub fn keys(&self) -> Result<Vec<&str>> {
        Ok(self.as_group()?.keys().collect())
    }

    /// Navigate to a child without materialising anything.
    ///
    /// Sequences are indexed by decimal position. This is the single
    /// lookup that every other form of access goes through.
    pub fn child(&self, key: &str) -> Result<&Node> {
        match &self.value {
            NodeValue::Group(g) => g.get(key).ok_or_else(|| Error::KeyNotFound {
                key: key.to_owned(),
                path: self.name.clone(),
            }),
            NodeValue::Sequence(items) => {
                let index = self.position(key, items.len())?;
                Ok(&items[index])
            }
            _ => Err(self.not_a_group()),
        }
    }

    pub fn child_mut(&mut self, key: &str) -> Result<&mut Node> {
        let kind = self.kind();
        let name = self.name.clone();
        match &mut self.value {
            NodeValue::Group(g) => g.get_mut(key).ok_or(Error::KeyNotFound {
                key: key.to_owned(),
                path: name,
            }),
            NodeValue::Sequence(items) => {
                let len = items.len();
                let index = parse_position(key, len, &name)?;
                Ok(&mut items[index])
            }
            _ => Err(Error::NotAGroup { path: name, kind }),
        }
    }

    fn position(&self, key: &str, len: usize) -> Result<usize> {
        parse_position(key, len, &self.name)
    }

    /// Dotted-path navigation, e.g. `meta.exposure.start_time`.
    pub fn path(&self, dotted: &str) -> Result<&Node> {
        dotted
            .split('.')
            .filter(|k| !k.is_empty())
            .try_fold(self, |node, key| node.child(key))
    }

    pub fn path_mut(&mut self, dotted: &str) -> Result<&mut Node> {
        dotted
            .split('.')
            .filter(|k| !k.is_empty())
            .try_fold(self, |node, key| node.child_mut(key))
    }

    /// Index into a child, materialising array payloads.
    pub fn get(&self, key: &str) -> Result<Item<'_>> {
        self.child(key)?.load()
    }

    /// Like [Node::get] with a dotted path.
    pub fn get_path(&self, dotted: &str) -> Result<Item<'_>> {
        self.path(dotted)?.load()
    }

    /// This node's value, materialising array payloads.
    pub fn load(&self) -> Result<Item<'_>> {
        let item = match &self.value {
            NodeValue::Group(_) | NodeValue::Sequence(_) => Item::Node(self),
            NodeValue::Array(block) => Item::Array(block.materialize()?),
            NodeValue::Quantity(q) => Item::Quantity(q.materialize()?),
            NodeValue::Scalar(s) => Item::Scalar(s),
            NodeValue::Time(t) => Item::Time(t),
        };
        Ok(item)
    }

    /// The array payload of an array block or array quantity.
    pub fn array(&self) -> Result<NdArray> {
        self.array_block()?.materialize()
    }

    /// The lazy array block, without materialising it.
    pub fn array_block(&self) -> Result<&ArrayBlock> {
        match &self.value {
            NodeValue::Array(block) => Ok(block),
            NodeValue::Quantity(QuantityNode {
                value: QuantityPayload::Array(block),
                ..
            }) => Ok(block),
            _ => Err(self.wrong_kind("array")),
        }
    }

    pub fn array_block_mut(&mut self) -> Result<&mut ArrayBlock> {
        let found = self.kind();
        match &mut self.value {
            NodeValue::Array(block) => Ok(block),
            NodeValue::Quantity(QuantityNode {
                value: QuantityPayload::Array(block),
                ..
            }) => Ok(block),
            _ => Err(Error::WrongKind {
                path: self.name.clone(),
                expected: "array",
                found,
            }),
        }
    }

    pub fn quantity_node(&self) -> Result<&QuantityNode> {
        match &self.value {
            NodeValue::Quantity(q) => Ok(q),
            _ => Err(self.wrong_kind("quantity")),
        }
    }

    pub fn to_quantity(&self) -> Result<Quantity> {
        self.quantity_node()?.materialize()
    }

    /// The unit of a quantity node or bare unit scalar.
    pub fn unit(&self) -> Option<&Unit> {
        match &self.value {
            NodeValue::Quantity(q) => Some(&q.unit),
            NodeValue::Scalar(Scalar::Unit(u)) => Some(u),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Result<&TimeValue> {
        match &self.value {
            NodeValue::Time(t) => Ok(t),
            _ => Err(self.wrong_kind("time")),
        }
    }

    pub fn as_scalar(&self) -> Result<&Scalar> {
        match &self.value {
            NodeValue::Scalar(s) => Ok(s),
            _ => Err(self.wrong_kind("scalar")),
        }
    }

    pub fn as_sequence(&self) -> Result<&[Node]> {
        match &self.value {
            NodeValue::Sequence(items) => Ok(items),
            _ => Err(self.wrong_kind("sequence")),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_scalar().ok()?.as_str()
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            NodeValue::Scalar(s) => s.as_f64(),
            NodeValue::Quantity(QuantityNode {
                value: QuantityPayload::Scalar(v),
                ..
            }) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_scalar().ok()?.as_i64()
    }

    /// Shape of an array block, known without materialising.
    pub fn shape(&self) -> Option<&[u64]> {
        self.array_block().ok().map(ArrayBlock::shape)
    }

    pub fn dtype(&self) -> Option<&DType> {
        self.array_block().ok().map(ArrayBlock::dtype)
    }

    /// Whether this node's payload is in memory; always true for non-array nodes.
    pub fn is_materialized(&self) -> bool {
        self.array_block().map_or(true, ArrayBlock::is_materialized)
    }

    /// Visit this node and every descendant with its dotted path.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&str, &'a Node)) {
        walk_inner(self, String::new(), f);
    }

    /// Text rendering with default [InfoOptions].
    pub fn info(&self) -> String {
        self.info_with(&InfoOptions::default())
    }

    pub fn info_with(&self, options: &InfoOptions) -> String {
        render(self, options)
    }
}

fn walk_inner<'a>(node: &'a Node, path: String, f: &mut impl FnMut(&str, &'a Node)) {
    f(&path, node);
    let join = |key: &str| {
        if path.is_empty() {
            key.to_owned()
        } else {
            format!("{path}.{key}")
        }
    };
    match &node.value {
        NodeValue::Group(g) => {
            for (k, child) in g.iter() {
                walk_inner(child, join(k), f);
            }
        }
        NodeValue::Sequence(items) => {
            for (i, child) in items.iter().enumerate() {
                walk_inner(child, join(&i.to_string()), f);
            }
        }
        _ => {}
    }
}

fn parse_position(key: &str, len: usize, path: &str) -> Result<usize> {
    let index: usize = key.parse().map_err(|_| Error::KeyNotFound {
        key: key.to_owned(),
        path: path.to_owned(),
    })?;
    if index >= len {
        return Err(Error::IndexOutOfRange {
            index,
            len,
            path: path.to_owned(),
        });
    }
    Ok(index)
}

impl Index<&str> for Node {
    type Output = Node;

    /// # Panics
    ///
    /// If the key does not exist; use [Node::child] to handle that case.
    fn index(&self, key: &str) -> &Node {
        match self.child(key) {
            Ok(node) => node,
            Err(e) => panic!("{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Node {
        Node::group(
            None,
            [
                ("name", Node::scalar("WFI01")),
                (
                    "meta",
                    Node::group(
                        None,
                        [
                            ("aperture", Node::group(None, [("name", Node::scalar("WFI_CEN"))])),
                            ("groups", Node::sequence(vec![Node::scalar(1i64), Node::scalar(2i64)])),
                        ],
                    ),
                ),
                (
                    "data",
                    Node::from_array(NdArray::from_vec(vec![2], vec![1.0f32, 2.0]).unwrap()),
                ),
            ],
        )
    }

    #[test]
    fn navigation_styles_agree() {
        let t = tree();
        assert_eq!(t.keys().unwrap(), vec!["data", "meta", "name"]);
        let by_index = &t["meta"]["aperture"]["name"];
        let by_path = t.path("meta.aperture.name").unwrap();
        assert!(std::ptr::eq(by_index, by_path));
        assert_eq!(by_path.as_str(), Some("WFI_CEN"));
        assert_eq!(by_path.name(), "name");
        assert_eq!(t.path("meta.groups.1").unwrap().as_i64(), Some(2));
    }

    #[test]
    fn errors_have_kinds() {
        let t = tree();
        assert!(t.child("nope").unwrap_err().is_key_error());
        assert!(t.path("meta.groups.5").unwrap_err().is_key_error());
        let err = t["name"].keys().unwrap_err();
        assert!(err.is_type_error());
        assert!(matches!(err, Error::NotAGroup { kind: NodeKind::Scalar, .. }));
        assert!(t["meta"].array().unwrap_err().is_type_error());
    }

    #[test]
    fn get_materialises_arrays() {
        let t = tree();
        let Item::Array(arr) = t.get("data").unwrap() else {
            panic!("expected array");
        };
        assert_eq!(arr.to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
        assert!(matches!(t.get("meta").unwrap(), Item::Node(_)));
        assert!(matches!(t.get("name").unwrap(), Item::Scalar(Scalar::String(_))));
    }

    #[test]
    fn mutation_through_paths() {
        let mut t = tree();
        t.path_mut("meta.aperture")
            .unwrap()
            .as_group_mut()
            .unwrap()
            .insert("position_angle", Node::scalar(12.5));
        assert_eq!(t.path("meta.aperture.position_angle").unwrap().as_f64(), Some(12.5));
        assert_eq!(
            t.path("meta.aperture.position_angle").unwrap().name(),
            "position_angle"
        );
    }

    #[test]
    fn walk_visits_every_node() {
        let t = tree();
        let mut paths = Vec::new();
        t.walk(&mut |p, _| paths.push(p.to_owned()));
        assert_eq!(
            paths,
            vec![
                "",
                "data",
                "meta",
                "meta.aperture",
                "meta.aperture.name",
                "meta.groups",
                "meta.groups.0",
                "meta.groups.1",
                "name"
            ]
        );
    }
}
