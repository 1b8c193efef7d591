//! Opening ASDF files and working with whole trees.

use std::{
    ops::{Deref, DerefMut, Index},
    path::Path,
    sync::Arc,
};

use bytes::Bytes;
use serde_yaml::Value;
use zarrs::{
    filesystem::FilesystemStore,
    storage::{ReadableStorage, StoreKey},
};

use crate::{
    Error, Node, Result,
    array::{ArrayBlock, Blocks},
    block::{self, BLOCK_MAGIC},
    info::InfoOptions,
    node::{Group, Item, NodeValue, QuantityNode, QuantityPayload, Scalar},
    options::OpenOptions,
    schema::{self, SchemaMatch},
    storage::AsdfSource,
    tag::{self, Tag},
    time::TimeValue,
    unit::Unit,
};

const FILE_MAGIC: &[u8] = b"#ASDF ";
const STANDARD_COMMENT: &str = "#ASDF_STANDARD ";

/// A parsed ASDF tree, detached from any file.
///
/// Cloning is deep; see [Tree::copy].
#[derive(Debug, Clone)]
pub struct Tree {
    root: Node,
    file_version: String,
    standard_version: Option<String>,
    schema_match: Option<SchemaMatch>,
}

impl Tree {
    /// A tree with the given root, to be written with [Tree::write_to].
    pub fn new(root: Node) -> Self {
        Self {
            root,
            file_version: crate::write::FILE_VERSION.to_owned(),
            standard_version: Some(crate::write::STANDARD_VERSION.to_owned()),
            schema_match: None,
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }

    pub fn into_root(self) -> Node {
        self.root
    }

    /// Version from the `#ASDF` header line.
    pub fn file_version(&self) -> &str {
        &self.file_version
    }

    /// Version from the `#ASDF_STANDARD` comment, if present.
    pub fn standard_version(&self) -> Option<&str> {
        self.standard_version.as_deref()
    }

    /// The schema the tree was validated against when it was opened.
    pub fn schema_match(&self) -> Option<&SchemaMatch> {
        self.schema_match.as_ref()
    }

    pub fn keys(&self) -> Result<Vec<&str>> {
        self.root.keys()
    }

    pub fn child(&self, key: &str) -> Result<&Node> {
        self.root.child(key)
    }

    pub fn get(&self, key: &str) -> Result<Item<'_>> {
        self.root.get(key)
    }

    pub fn path(&self, dotted: &str) -> Result<&Node> {
        self.root.path(dotted)
    }

    pub fn get_path(&self, dotted: &str) -> Result<Item<'_>> {
        self.root.get_path(dotted)
    }

    /// An independent snapshot.
    ///
    /// Materialised payloads are duplicated. Arrays not yet materialised can
    /// still be fetched from the file the original was opened from.
    pub fn copy(&self) -> Tree {
        self.clone()
    }

    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&str, &'a Node)) {
        self.root.walk(f);
    }

    /// Dotted paths of every node whose own key contains `pattern`.
    pub fn search(&self, pattern: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.root.walk(&mut |path, _| {
            let key = path.rsplit('.').next().unwrap_or(path);
            if !path.is_empty() && key.contains(pattern) {
                out.push(path.to_owned());
            }
        });
        out
    }

    /// Roman metadata, at `roman.meta`.
    pub fn meta(&self) -> Result<&Node> {
        self.root.path("roman.meta")
    }

    /// The coordinate transform at `roman.meta.wcs`, as stored.
    pub fn wcs(&self) -> Result<&Node> {
        self.root.path("roman.meta.wcs")
    }

    pub fn info(&self, options: &InfoOptions) -> String {
        self.root.info_with(options)
    }
}

impl Index<&str> for Tree {
    type Output = Node;

    fn index(&self, key: &str) -> &Node {
        &self.root[key]
    }
}

/// An ASDF file opened from a store.
///
/// The store handle is held until the file is dropped; array payloads are
/// fetched through it on first access.
#[derive(Debug)]
pub struct AsdfFile {
    source: AsdfSource,
    tree: Tree,
}

impl AsdfFile {
    /// Open the file at `key` in `storage`.
    ///
    /// Reads the header, the YAML tree and the block headers. Array payloads
    /// are only read here if `options.lazy` is false.
    pub fn open(storage: ReadableStorage, key: &str, options: OpenOptions) -> Result<Self> {
        let key = StoreKey::new(key).map_err(Error::wrap)?;
        Self::open_source(AsdfSource::new(storage, key), options)
    }

    /// Open an in-memory buffer.
    pub fn from_bytes(bytes: impl Into<Bytes>, options: OpenOptions) -> Result<Self> {
        Self::open_source(AsdfSource::from_bytes(bytes)?, options)
    }

    /// Open a file on the local filesystem.
    pub fn open_path(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::general(format!("not a file path: {}", path.display())))?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let store = FilesystemStore::new(dir).map_err(Error::wrap)?;
        Self::open(Arc::new(store), name, options)
    }

    pub fn open_source(source: AsdfSource, options: OpenOptions) -> Result<Self> {
        log::debug!("opening {}", source.key().as_str());
        let scan = scan(&source, options.read_chunk)?;
        let headers = block::discover(&source, scan.tree_end, options.read_chunk)?;
        log::debug!("found {} blocks", headers.len());
        let blocks = Arc::new(Blocks {
            source: source.clone(),
            headers,
        });

        let root = match &scan.yaml {
            Some(yaml) => {
                let text = std::str::from_utf8(yaml)
                    .map_err(|e| Error::format(format!("tree is not UTF-8: {e}")))?;
                let value: Value = serde_yaml::from_str(&local_tags(text))?;
                Builder { blocks: &blocks }.node(&value)?
            }
            None => {
                log::warn!("file has no tree");
                Node::group(None, Vec::<(String, Node)>::new())
            }
        };
        let mut tree = Tree {
            root,
            file_version: scan.file_version,
            standard_version: scan.standard_version,
            schema_match: None,
        };

        if !options.lazy {
            let mut arrays = Vec::new();
            tree.root.walk(&mut |_, node| {
                if let Ok(block) = node.array_block() {
                    arrays.push(block);
                }
            });
            for block in &arrays {
                block.materialize()?;
            }
            log::debug!("materialised {} arrays", arrays.len());
        }

        if let Some(validator) = &options.validator {
            let found = validator.validate(&tree.root)?;
            let model = tree.root.path_mut(&found.path)?;
            schema::attach(model, &found.schema.root);
            tree.schema_match = Some(found);
        }
        Ok(Self { source, tree })
    }

    pub fn source(&self) -> &AsdfSource {
        &self.source
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    pub fn into_tree(self) -> Tree {
        self.tree
    }
}

impl Deref for AsdfFile {
    type Target = Tree;

    fn deref(&self) -> &Tree {
        &self.tree
    }
}

impl DerefMut for AsdfFile {
    fn deref_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }
}

impl Index<&str> for AsdfFile {
    type Output = Node;

    fn index(&self, key: &str) -> &Node {
        &self.tree[key]
    }
}

struct Scan {
    file_version: String,
    standard_version: Option<String>,
    yaml: Option<Bytes>,
    /// First byte after the tree.
    tree_end: u64,
}

/// Read the header comments and the YAML tree, a chunk at a time.
fn scan(source: &AsdfSource, chunk: usize) -> Result<Scan> {
    let mut reader = ChunkReader {
        source,
        chunk: chunk as u64,
        buf: Vec::new(),
    };
    reader.fill()?;
    if !reader.buf.starts_with(FILE_MAGIC) {
        return Err(Error::format("missing #ASDF header"));
    }

    let mut pos = 0;
    let mut comments = Vec::new();
    loop {
        match reader.buf.get(pos).copied() {
            Some(b'#') => match reader.buf[pos..].iter().position(|&b| b == b'\n') {
                Some(nl) => {
                    let line = String::from_utf8_lossy(&reader.buf[pos..pos + nl]);
                    comments.push(line.trim_end().to_owned());
                    pos += nl + 1;
                }
                None if reader.fill()? => {}
                None => return Err(Error::format("header line is not terminated")),
            },
            None if reader.fill()? => {}
            _ => break,
        }
    }
    let file_version = comments
        .first()
        .and_then(|c| c.get(FILE_MAGIC.len()..))
        .unwrap_or_default()
        .trim()
        .to_owned();
    let standard_version = comments
        .iter()
        .find_map(|c| c.strip_prefix(STANDARD_COMMENT))
        .map(|v| v.trim().to_owned());
    log::trace!("header comments {comments:?}");

    while reader.buf.len() < pos + 5 && reader.fill()? {}
    let rest = &reader.buf[pos..];
    if !(rest.starts_with(b"%YAML") || rest.starts_with(b"---")) {
        if !rest.is_empty() && !rest.starts_with(BLOCK_MAGIC) {
            return Err(Error::format(format!("unexpected content at offset {pos}")));
        }
        return Ok(Scan {
            file_version,
            standard_version,
            yaml: None,
            tree_end: pos as u64,
        });
    }

    let mut searched = pos;
    let end = loop {
        if let Some(end) = tree_end(&reader.buf, searched) {
            break end;
        }
        searched = reader.buf.len().saturating_sub(5).max(pos);
        if !reader.fill()? {
            if reader.buf.ends_with(b"\n...") {
                break reader.buf.len();
            }
            return Err(Error::format("tree is not terminated by '...'"));
        }
    };
    log::debug!("tree occupies bytes {pos}..{end}");
    Ok(Scan {
        file_version,
        standard_version,
        yaml: Some(Bytes::copy_from_slice(&reader.buf[pos..end])),
        tree_end: end as u64,
    })
}

/// Position just past the document end marker line, searching from `from`.
fn tree_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut start = from;
    while let Some(i) = block::find(&buf[start..], b"\n...") {
        let after = start + i + 4;
        match &buf[after..] {
            [b'\n', ..] => return Some(after + 1),
            [b'\r', b'\n', ..] => return Some(after + 2),
            _ => start = after,
        }
    }
    None
}

/// Rewrite `%TAG` handles and verbatim `!<...>` tags as local `!` tags.
///
/// The YAML parser only reports local tags; resolved URIs are dropped. The
/// primary handle's directive is removed since [Tag] strips the known
/// prefixes anyway.
fn local_tags(yaml: &str) -> String {
    let mut handles: Vec<(String, String)> = Vec::new();
    let mut body = String::with_capacity(yaml.len());
    for line in yaml.split_inclusive('\n') {
        if let Some(rest) = line.strip_prefix("%TAG") {
            let mut parts = rest.split_whitespace();
            if let (Some(handle), Some(prefix)) = (parts.next(), parts.next()) {
                if handle != "!" {
                    handles.push((handle.to_owned(), prefix.to_owned()));
                }
            }
            continue;
        }
        body.push_str(line);
    }
    map_tags(&body, |tag| {
        if let Some(uri) = tag.strip_prefix("!<").and_then(|t| t.strip_suffix('>')) {
            return Some(format!("!{uri}"));
        }
        handles
            .iter()
            .find(|(h, _)| tag.starts_with(h.as_str()))
            .map(|(h, prefix)| format!("!{prefix}{}", &tag[h.len()..]))
    })
}

/// Write tags holding a full URI as verbatim `!<...>` tags; the inverse of [local_tags].
pub(crate) fn verbatim_tags(yaml: &str) -> String {
    map_tags(yaml, |tag| {
        let uri = tag.strip_prefix('!')?;
        (uri.contains(':') && !uri.starts_with('<')).then(|| format!("!<{uri}>"))
    })
}

/// Replace tags in node position with `f(tag)`, where it returns a value.
///
/// Quoted, plain and block scalars and comments are copied untouched, so a
/// `!<...>` inside a string value survives.
fn map_tags(text: &str, mut f: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut node_start = true;
    let mut flow = 0usize;
    let mut line_start = true;
    let mut line_indent = 0;
    // Indentation of the line introducing a block scalar, and of its content once seen.
    let mut block: Option<(usize, Option<usize>)> = None;

    while let Some(c) = rest.chars().next() {
        if line_start {
            line_start = false;
            let body = rest.trim_start_matches(' ');
            let indent = rest.len() - body.len();
            let blank = body.is_empty() || body.starts_with('\n') || body.starts_with("\r\n");
            if let Some((parent, content)) = block {
                let inside = match content {
                    _ if blank => true,
                    Some(n) => indent >= n,
                    None => indent > parent,
                };
                if inside {
                    if !blank && content.is_none() {
                        block = Some((parent, Some(indent)));
                    }
                    let end = rest.find('\n').map_or(rest.len(), |i| i + 1);
                    out.push_str(&rest[..end]);
                    rest = &rest[end..];
                    line_start = true;
                    continue;
                }
                block = None;
            }
            line_indent = indent;
            if flow == 0 {
                node_start = true;
            }
            out.push_str(&rest[..indent]);
            rest = body;
            if indent == 0 && rest.starts_with("---") && rest[3..].chars().next().is_none_or(char::is_whitespace) {
                out.push_str("---");
                rest = &rest[3..];
                node_start = true;
            }
            continue;
        }

        let spaced = rest[c.len_utf8()..]
            .chars()
            .next()
            .is_none_or(char::is_whitespace);
        let len = match c {
            '\n' => {
                line_start = true;
                1
            }
            ' ' | '\t' | '\r' => 1,
            '#' => rest.find('\n').unwrap_or(rest.len()),
            '[' | '{' => {
                flow += 1;
                node_start = true;
                1
            }
            ']' | '}' => {
                flow = flow.saturating_sub(1);
                node_start = false;
                1
            }
            ',' if flow > 0 => {
                node_start = true;
                1
            }
            '-' | '?' | ':' if spaced || (c == ':' && flow > 0) => {
                node_start = true;
                1
            }
            '!' if node_start => {
                let len = match rest.strip_prefix("!<") {
                    Some(r) => r.find('>').map_or(token_end(rest, flow), |i| i + 3),
                    None => token_end(rest, flow),
                };
                let tag = &rest[..len];
                match f(tag) {
                    Some(mapped) => out.push_str(&mapped),
                    None => out.push_str(tag),
                }
                rest = &rest[len..];
                continue;
            }
            '&' if node_start => token_end(rest, flow),
            '"' | '\'' if node_start => {
                node_start = false;
                quoted_len(rest, c)
            }
            '|' | '>' if node_start && flow == 0 => {
                node_start = false;
                block = Some((line_indent, None));
                rest.find('\n').unwrap_or(rest.len())
            }
            _ if node_start => {
                node_start = false;
                plain_len(rest, flow)
            }
            _ => c.len_utf8(),
        };
        out.push_str(&rest[..len]);
        rest = &rest[len..];
    }
    out
}

/// End of a tag or anchor token.
fn token_end(rest: &str, flow: usize) -> usize {
    rest.char_indices()
        .skip(1)
        .find(|&(_, c)| c.is_whitespace() || (flow > 0 && ",[]{}".contains(c)))
        .map_or(rest.len(), |(i, _)| i)
}

/// Length of the quoted scalar at the start of `rest`, quotes included.
fn quoted_len(rest: &str, quote: char) -> usize {
    let mut chars = rest.char_indices().skip(1).peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\\' && quote == '"' {
            chars.next();
        } else if c == quote {
            if quote == '\'' && chars.peek().is_some_and(|&(_, n)| n == '\'') {
                chars.next();
            } else {
                return i + 1;
            }
        }
    }
    rest.len()
}

/// Length of the plain scalar at the start of `rest`.
fn plain_len(rest: &str, flow: usize) -> usize {
    let mut chars = rest.char_indices().peekable();
    let mut prev = chars.next().map_or(' ', |(_, c)| c);
    while let Some((i, c)) = chars.next() {
        let next = chars.peek().map(|&(_, n)| n);
        let ends = match c {
            '\n' | '\r' => true,
            '#' => prev.is_whitespace(),
            ':' => next.is_none_or(|n| n.is_whitespace() || (flow > 0 && ",[]{}".contains(n))),
            ',' | '[' | ']' | '{' | '}' => flow > 0,
            _ => false,
        };
        if ends {
            return if c == '#' { i - prev.len_utf8() } else { i };
        }
        prev = c;
    }
    rest.len()
}

struct ChunkReader<'a> {
    source: &'a AsdfSource,
    chunk: u64,
    buf: Vec<u8>,
}

impl ChunkReader<'_> {
    /// Append the next chunk; false at the end of the file.
    fn fill(&mut self) -> Result<bool> {
        let next = self
            .source
            .read_up_to(self.buf.len() as u64, self.chunk)?;
        self.buf.extend_from_slice(&next);
        Ok(!next.is_empty())
    }
}

/// Turns the YAML document into nodes.
struct Builder<'a> {
    blocks: &'a Arc<Blocks>,
}

impl Builder<'_> {
    fn node(&self, value: &Value) -> Result<Node> {
        let node = match value {
            Value::Tagged(tagged) => {
                return self.tagged(Tag::from_yaml(&tagged.tag), &tagged.value);
            }
            Value::Mapping(map) => self.group(None, map)?,
            Value::Sequence(items) => Node::sequence(
                items
                    .iter()
                    .map(|v| self.node(v))
                    .collect::<Result<_>>()?,
            ),
            other => Node::scalar(scalar(other)?),
        };
        Ok(node)
    }

    fn group(&self, tag: Option<Tag>, map: &serde_yaml::Mapping) -> Result<Node> {
        let mut group = Group::new(tag);
        for (k, v) in map {
            let key = key_string(k)?;
            let child = self.node(v)?;
            if group.insert(key.clone(), child).is_some() {
                return Err(Error::format(format!("duplicate key {key:?}")));
            }
        }
        Ok(Node::new("", NodeValue::Group(group)))
    }

    fn tagged(&self, tag: Tag, value: &Value) -> Result<Node> {
        let node = match tag.name() {
            tag::NDARRAY => Node::new(
                "",
                NodeValue::Array(ArrayBlock::from_yaml(value, self.blocks)?),
            ),
            tag::QUANTITY => Node::new("", NodeValue::Quantity(self.quantity(value)?)),
            tag::UNIT => Node::scalar(Scalar::Unit(unit(value)?)),
            tag::TIME => Node::time(TimeValue::from_yaml(value)?),
            _ => match value {
                Value::Mapping(map) => self.group(Some(tag), map)?,
                Value::Sequence(_) => {
                    log::debug!("dropping tag {tag} from a sequence");
                    self.node(value)?
                }
                other => Node::scalar(Scalar::Tagged(tag, scalar(other)?.to_string())),
            },
        };
        Ok(node)
    }

    fn quantity(&self, value: &Value) -> Result<QuantityNode> {
        let map = value
            .as_mapping()
            .ok_or_else(|| Error::format("quantity is not a mapping"))?;
        let unit = match map.get("unit") {
            Some(u) => unit(u)?,
            None => Unit::dimensionless(),
        };
        let payload = match map.get("value") {
            Some(Value::Number(n)) => QuantityPayload::Scalar(
                n.as_f64()
                    .ok_or_else(|| Error::format("quantity value is not a number"))?,
            ),
            Some(Value::Tagged(t)) if Tag::from_yaml(&t.tag).is(tag::NDARRAY) => {
                QuantityPayload::Array(ArrayBlock::from_yaml(&t.value, self.blocks)?)
            }
            Some(v @ (Value::Sequence(_) | Value::Mapping(_))) => {
                QuantityPayload::Array(ArrayBlock::from_yaml(v, self.blocks)?)
            }
            other => {
                return Err(Error::format(format!("invalid quantity value {other:?}")));
            }
        };
        Ok(QuantityNode {
            value: payload,
            unit,
        })
    }
}

fn unit(value: &Value) -> Result<Unit> {
    match value {
        Value::String(s) => Unit::parse(s),
        Value::Tagged(t) => unit(&t.value),
        other => Err(Error::format(format!("invalid unit {other:?}"))),
    }
}

fn scalar(value: &Value) -> Result<Scalar> {
    let out = match value {
        Value::Null => Scalar::Null,
        Value::Bool(b) => Scalar::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Scalar::Int(i),
            None => Scalar::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Scalar::String(s.clone()),
        other => return Err(Error::format(format!("expected a scalar, found {other:?}"))),
    };
    Ok(out)
}

fn key_string(key: &Value) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Tagged(t) => key_string(&t.value),
        other => Ok(scalar(other)?.to_string()),
    }
}
