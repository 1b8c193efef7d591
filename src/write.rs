//! Serialising trees back to ASDF.

use std::io::Write;

use serde_yaml::{
    Mapping, Value,
    value::TaggedValue,
};

use crate::{
    Error, NdArray, Node, Result,
    block::{self, BlockHeader, MIN_HEADER_SIZE},
    node::{NodeValue, QuantityPayload, Scalar},
    options::WriteOptions,
    tag::{self, Tag},
    tree::Tree,
    unit::Unit,
};

pub(crate) const FILE_VERSION: &str = "1.0.0";
pub(crate) const STANDARD_VERSION: &str = "1.5.0";

impl Tree {
    /// Write the tree and its arrays as an ASDF file.
    ///
    /// Every array is materialised, so a lazily opened tree reads all of its
    /// payloads from its source. Each array gets its own block, written
    /// contiguously in C order.
    pub fn write_to(&self, mut writer: impl Write, options: &WriteOptions) -> Result<()> {
        let mut serializer = Serializer { arrays: Vec::new() };
        let root = serializer.root(self.root())?;
        let body = crate::tree::verbatim_tags(&serde_yaml::to_string(&root)?);

        let mut prelude = format!(
            "#ASDF {FILE_VERSION}\n#ASDF_STANDARD {STANDARD_VERSION}\n%YAML 1.1\n%TAG ! tag:stsci.edu:asdf/\n---"
        );
        match body.strip_prefix("---") {
            Some(rest) => prelude.push_str(rest),
            None => {
                prelude.push('\n');
                prelude.push_str(&body);
            }
        }
        if !prelude.ends_with('\n') {
            prelude.push('\n');
        }
        prelude.push_str("...\n");
        writer.write_all(prelude.as_bytes())?;

        let mut pos = prelude.len() as u64;
        let mut offsets = Vec::with_capacity(serializer.arrays.len());
        for array in &serializer.arrays {
            let data = array.as_bytes();
            let used = options.compression.encode(data)?;
            let header = BlockHeader {
                offset: pos,
                header_size: MIN_HEADER_SIZE,
                flags: 0,
                compression: options.compression,
                allocated_size: used.len() as u64,
                used_size: used.len() as u64,
                data_size: data.len() as u64,
                checksum: [0; 16],
            };
            log::trace!("writing block {header:?}");
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&used)?;
            offsets.push(pos);
            pos = header.end()?;
        }
        if options.block_index && !offsets.is_empty() {
            writer.write_all(&block::index_bytes(&offsets))?;
        }
        log::debug!("wrote {} blocks after {} byte tree", offsets.len(), prelude.len());
        Ok(())
    }

    /// [Tree::write_to] into a new buffer.
    pub fn to_bytes(&self, options: &WriteOptions) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out, options)?;
        Ok(out)
    }
}

/// Collects array payloads in block order while converting nodes.
struct Serializer {
    arrays: Vec<NdArray>,
}

impl Serializer {
    fn root(&mut self, root: &Node) -> Result<Value> {
        let NodeValue::Group(group) = root.value() else {
            return Err(Error::WrongKind {
                path: root.name().to_owned(),
                expected: "group",
                found: root.kind(),
            });
        };
        let tag = group
            .tag()
            .cloned()
            .unwrap_or_else(|| Tag::new(tag::ASDF_ROOT, "1.1.0"));
        let mut map = Mapping::new();
        for (k, child) in group.iter() {
            map.insert(k.into(), self.value(child)?);
        }
        Ok(tagged(&tag, Value::Mapping(map)))
    }

    fn value(&mut self, node: &Node) -> Result<Value> {
        let out = match node.value() {
            NodeValue::Group(group) => {
                let mut map = Mapping::new();
                for (k, child) in group.iter() {
                    map.insert(k.into(), self.value(child)?);
                }
                match group.tag() {
                    Some(tag) => tagged(tag, Value::Mapping(map)),
                    None => Value::Mapping(map),
                }
            }
            NodeValue::Array(block) => {
                let array = block.materialize()?;
                let index = self.arrays.len();
                self.arrays.push(array);
                block.to_yaml(index)
            }
            NodeValue::Scalar(scalar) => match scalar {
                Scalar::Null => Value::Null,
                Scalar::Bool(b) => Value::Bool(*b),
                Scalar::Int(i) => (*i).into(),
                Scalar::Float(f) => (*f).into(),
                Scalar::String(s) => s.as_str().into(),
                Scalar::Unit(u) => unit(u),
                Scalar::Tagged(tag, s) => tagged(tag, s.as_str().into()),
            },
            NodeValue::Time(t) => tagged(&Tag::new(tag::TIME, "1.1.0"), t.to_yaml()),
            NodeValue::Quantity(q) => {
                let value = match &q.value {
                    QuantityPayload::Scalar(v) => (*v).into(),
                    QuantityPayload::Array(block) => {
                        let array = block.materialize()?;
                        let index = self.arrays.len();
                        self.arrays.push(array);
                        block.to_yaml(index)
                    }
                };
                let mut map = Mapping::new();
                map.insert("value".into(), value);
                map.insert("unit".into(), unit(&q.unit));
                tagged(&Tag::new(tag::QUANTITY, "1.1.0"), Value::Mapping(map))
            }
            NodeValue::Sequence(items) => Value::Sequence(
                items
                    .iter()
                    .map(|item| self.value(item))
                    .collect::<Result<_>>()?,
            ),
        };
        Ok(out)
    }
}

fn tagged(tag: &Tag, value: Value) -> Value {
    Value::Tagged(Box::new(TaggedValue {
        tag: tag.to_yaml(),
        value,
    }))
}

fn unit(unit: &Unit) -> Value {
    tagged(&Tag::new(tag::UNIT, "1.0.0"), unit.symbol().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AsdfFile, OpenOptions, codec::Compression, unit::Quantity};

    fn tree() -> Tree {
        Tree::new(Node::group(
            None,
            [
                (
                    "flux",
                    Node::quantity(Quantity::new(
                        crate::unit::Magnitude::Array(
                            NdArray::from_vec(vec![3], vec![1.5f64, 2.5, 3.5]).unwrap(),
                        ),
                        Unit::parse("MJy / sr").unwrap(),
                    )),
                ),
                (
                    "mask",
                    Node::from_array(NdArray::from_vec(vec![2, 2], vec![1u8, 0, 0, 1]).unwrap()),
                ),
                ("label", Node::scalar("target")),
            ],
        ))
    }

    #[test]
    fn output_starts_with_the_header() {
        let bytes = tree().to_bytes(&WriteOptions::default()).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("#ASDF 1.0.0\n#ASDF_STANDARD 1.5.0\n%YAML 1.1\n"));
        assert!(text.contains("!core/asdf-1.1.0"));
        assert!(text.contains("#ASDF BLOCK INDEX"));
    }

    #[test]
    fn compressed_blocks_read_back() {
        for compression in [Compression::None, Compression::Zlib, Compression::Bzp2] {
            for block_index in [true, false] {
                let options = WriteOptions::new()
                    .compression(compression)
                    .block_index(block_index);
                let bytes = tree().to_bytes(&options).unwrap();
                let f = AsdfFile::from_bytes(bytes, OpenOptions::default()).unwrap();
                assert_eq!(f.keys().unwrap(), vec!["flux", "label", "mask"]);
                let flux = f["flux"].to_quantity().unwrap();
                assert_eq!(flux.unit, Unit::parse("MJy/sr").unwrap());
                assert_eq!(
                    f["flux"].array().unwrap().to_vec::<f64>().unwrap(),
                    vec![1.5, 2.5, 3.5]
                );
                assert_eq!(
                    f["mask"].array().unwrap().to_vec::<u8>().unwrap(),
                    vec![1, 0, 0, 1]
                );
                assert_eq!(f["label"].as_str(), Some("target"));
            }
        }
    }

    #[test]
    fn extension_tags_are_written_verbatim() {
        let tree = Tree::new(Node::group(
            None,
            [(
                "roman",
                Node::group(
                    Some(Tag::parse("asdf://stsci.edu/datamodels/roman/tags/wfi_image-1.0.0")),
                    [
                        (
                            "wcs",
                            Node::group(Some(Tag::parse("tag:stsci.edu:gwcs/wcs-1.2.0")), [("name", Node::scalar(""))]),
                        ),
                        ("note", Node::scalar("!tag:not/a-tag")),
                        ("lines", Node::scalar("first\n!<kept>\n")),
                    ],
                ),
            )],
        ));
        let bytes = tree.to_bytes(&WriteOptions::default()).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("!<asdf://stsci.edu/datamodels/roman/tags/wfi_image-1.0.0>"), "{text}");
        assert!(text.contains("!<tag:stsci.edu:gwcs/wcs-1.2.0>"), "{text}");
        assert!(!text.contains("!gwcs/"), "{text}");

        let f = AsdfFile::from_bytes(bytes.clone(), OpenOptions::default()).unwrap();
        assert_eq!(f["roman"].tag().unwrap().name(), "wfi_image");
        assert_eq!(f.path("roman.wcs").unwrap().tag().unwrap().name(), "gwcs/wcs");
        assert_eq!(f.path("roman.note").unwrap().as_str(), Some("!tag:not/a-tag"));
        assert_eq!(f.path("roman.lines").unwrap().as_str(), Some("first\n!<kept>\n"));
        assert_eq!(f.tree().to_bytes(&WriteOptions::default()).unwrap(), bytes);
    }

    #[test]
    fn root_must_be_a_group() {
        let err = Tree::new(Node::scalar(1i64))
            .to_bytes(&WriteOptions::default())
            .unwrap_err();
        assert!(err.is_type_error());
    }
}
