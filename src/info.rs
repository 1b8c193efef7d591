//! Text rendering of a tree for humans.
//!
//! Rendering never materialises anything: array nodes report shape,
//! datatype and whether their payload has been loaded.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::{
    Node,
    node::{NodeValue, QuantityPayload},
};

/// Limits for [Node::info_with] and [crate::AsdfFile::info].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoOptions {
    /// Levels below the starting node to expand.
    pub max_depth: usize,
    /// Lines to print before eliding the rest.
    pub max_rows: usize,
    /// Print scalar, time and quantity values next to their keys.
    pub show_values: bool,
}

impl Default for InfoOptions {
    fn default() -> Self {
        Self {
            max_depth: 4,
            max_rows: 40,
            show_values: true,
        }
    }
}

impl InfoOptions {
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn with_show_values(mut self, show_values: bool) -> Self {
        self.show_values = show_values;
        self
    }
}

struct Renderer<'o> {
    options: &'o InfoOptions,
    out: String,
    rows: usize,
    hidden: usize,
}

/// Render `node` and its descendants as an indented tree.
pub(crate) fn render(node: &Node, options: &InfoOptions) -> String {
    let mut r = Renderer {
        options,
        out: String::new(),
        rows: 0,
        hidden: 0,
    };
    let name = if node.name().is_empty() { "root" } else { node.name() };
    r.line("", name, node);
    r.children(node, "", 1);
    if r.hidden > 0 {
        let _ = writeln!(r.out, "... {} more rows not shown", r.hidden);
    }
    r.out
}

impl Renderer<'_> {
    fn line(&mut self, prefix: &str, key: &str, node: &Node) {
        if self.rows >= self.options.max_rows {
            self.hidden += 1;
            return;
        }
        self.rows += 1;
        let _ = write!(self.out, "{prefix}{key} ({})", describe_kind(node));
        if let Some(detail) = self.detail(node) {
            let _ = write!(self.out, " {detail}");
        }
        self.out.push('\n');
    }

    fn children(&mut self, node: &Node, indent: &str, depth: usize) {
        let entries: Vec<(String, &Node)> = match node.value() {
            NodeValue::Group(g) => g.iter().map(|(k, v)| (k.to_owned(), v)).collect(),
            NodeValue::Sequence(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("[{i}]"), v))
                .collect(),
            _ => return,
        };
        if entries.is_empty() {
            return;
        }
        if depth > self.options.max_depth {
            if self.rows < self.options.max_rows {
                self.rows += 1;
                let _ = writeln!(self.out, "{indent}└─ ... ({} children)", entries.len());
            } else {
                self.hidden += 1;
            }
            return;
        }
        let last = entries.len() - 1;
        for (i, (key, child)) in entries.into_iter().enumerate() {
            let (branch, next) = if i == last {
                ("└─", "  ")
            } else {
                ("├─", "│ ")
            };
            self.line(&format!("{indent}{branch}"), &key, child);
            self.children(child, &format!("{indent}{next}"), depth + 1);
        }
    }

    fn detail(&self, node: &Node) -> Option<String> {
        match node.value() {
            NodeValue::Array(block) => Some(format!(
                "shape {:?}, {}{}",
                block.shape(),
                block.dtype(),
                loaded(block.is_materialized())
            )),
            NodeValue::Quantity(q) => match &q.value {
                QuantityPayload::Array(block) => Some(format!(
                    "shape {:?}, {}, unit {}{}",
                    block.shape(),
                    block.dtype(),
                    q.unit,
                    loaded(block.is_materialized())
                )),
                QuantityPayload::Scalar(v) if self.options.show_values => {
                    Some(format!("{v} {}", q.unit))
                }
                QuantityPayload::Scalar(_) => None,
            },
            NodeValue::Scalar(s) if self.options.show_values => Some(s.to_string()),
            NodeValue::Time(t) if self.options.show_values => Some(t.to_string()),
            NodeValue::Group(g) if g.is_empty() => Some("{}".into()),
            _ => None,
        }
    }
}

fn loaded(materialized: bool) -> &'static str {
    if materialized { " [loaded]" } else { " [lazy]" }
}

fn describe_kind(node: &Node) -> String {
    match node.value() {
        NodeValue::Group(g) => match g.tag() {
            Some(tag) => tag.short_name().to_owned(),
            None => "Group".into(),
        },
        NodeValue::Array(_) => "ArrayBlock".into(),
        NodeValue::Scalar(_) => "Scalar".into(),
        NodeValue::Time(_) => "Time".into(),
        NodeValue::Quantity(_) => "Quantity".into(),
        NodeValue::Sequence(items) => format!("Sequence[{}]", items.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NdArray, tag::Tag};

    fn tree() -> Node {
        Node::group(
            Some(Tag::parse("!core/asdf-1.1.0")),
            [
                (
                    "roman",
                    Node::group(
                        Some(Tag::parse("asdf://stsci.edu/datamodels/roman/tags/wfi_image-1.0.0")),
                        [
                            (
                                "data",
                                Node::from_array(NdArray::from_vec(vec![2, 2], vec![0f32; 4]).unwrap()),
                            ),
                            (
                                "meta",
                                Node::group(
                                    None,
                                    [(
                                        "aperture",
                                        Node::group(None, [("name", Node::scalar("WFI_CEN"))]),
                                    )],
                                ),
                            ),
                        ],
                    ),
                ),
                ("history", Node::sequence(vec![Node::scalar("made")])),
            ],
        )
    }

    #[test]
    fn renders_structure() {
        let text = tree().info();
        let expected = "\
root (asdf)
├─history (Sequence[1])
│ └─[0] (Scalar) made
└─roman (wfi_image)
  ├─data (ArrayBlock) shape [2, 2], float32 [loaded]
  └─meta (Group)
    └─aperture (Group)
      └─name (Scalar) WFI_CEN
";
        assert_eq!(text, expected);
    }

    #[test]
    fn respects_limits() {
        let t = tree();
        let shallow = t.info_with(&InfoOptions::default().with_max_depth(1));
        assert!(shallow.contains("└─ ... (2 children)"), "{shallow}");
        assert!(!shallow.contains("data"));

        let short = t.info_with(&InfoOptions::default().with_max_rows(3));
        assert_eq!(short.lines().count(), 4);
        assert!(short.ends_with("... 5 more rows not shown\n"), "{short}");

        let quiet = t.info_with(&InfoOptions::default().with_show_values(false));
        assert!(!quiet.contains("WFI_CEN"));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: InfoOptions = serde_json::from_str(r#"{"max_rows": 5}"#).unwrap();
        assert_eq!(options.max_rows, 5);
        assert_eq!(options.max_depth, 4);
        assert!(options.show_values);
    }
}
