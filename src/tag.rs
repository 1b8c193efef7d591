//! YAML tag handling.
//!
//! ASDF trees use tags such as `!core/ndarray-1.0.0`, which after `%TAG`
//! resolution may appear as `tag:stsci.edu:asdf/core/ndarray-1.0.0`.
//! Newer extensions use URIs like `asdf://stsci.edu/datamodels/roman/tags/wfi_image-1.0.0`.

use serde_yaml::value::Tag as YamlTag;

/// Prefix of the primary `!` handle in written files.
pub(crate) const PRIMARY_PREFIX: &str = "tag:stsci.edu:asdf/";

const PREFIXES: &[&str] = &[
    PRIMARY_PREFIX,
    "tag:stsci.edu:",
    "asdf://stsci.edu/datamodels/roman/tags/",
    "asdf://stsci.edu/asdf/tags/",
    "asdf://asdf-format.org/core/tags/",
    "asdf://asdf-format.org/astronomy/tags/",
    "asdf://asdf-format.org/unit/tags/",
    "asdf://asdf-format.org/time/tags/",
];

/// A normalised tag: name without prefix, and optional version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    raw: String,
    name: String,
    version: Option<String>,
}

impl Tag {
    pub fn parse(raw: &str) -> Self {
        let s = strip_wrapping(raw);
        let s = PREFIXES
            .iter()
            .find_map(|p| s.strip_prefix(p))
            .unwrap_or(s);
        let (name, version) = match s.rsplit_once('-') {
            Some((n, v)) if v.starts_with(|c: char| c.is_ascii_digit()) => {
                (n.to_owned(), Some(v.to_owned()))
            }
            _ => (s.to_owned(), None),
        };
        Self {
            raw: raw.to_owned(),
            name,
            version,
        }
    }

    pub(crate) fn from_yaml(tag: &YamlTag) -> Self {
        Self::parse(&tag.to_string())
    }

    /// Build a tag for writing, e.g. `Tag::new("core/ndarray", "1.0.0")`.
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            raw: format!("!{name}-{version}"),
            name: name.to_owned(),
            version: Some(version.to_owned()),
        }
    }

    /// Name without prefix or version, e.g. `core/ndarray`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last path component of the name, e.g. `wfi_image`.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// The tag as it appeared in the file.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// Tags under the primary prefix are written as local tags, other URIs
    /// whole; the writer turns those into verbatim tags.
    pub(crate) fn to_yaml(&self) -> YamlTag {
        let uri = strip_wrapping(&self.raw);
        if let Some(local) = uri.strip_prefix(PRIMARY_PREFIX) {
            return YamlTag::new(local);
        }
        if uri.contains(':') {
            return YamlTag::new(uri);
        }
        match &self.version {
            Some(v) => YamlTag::new(format!("{}-{v}", self.name)),
            None => YamlTag::new(self.name.clone()),
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if let Some(v) = &self.version {
            write!(f, "-{v}")?;
        }
        Ok(())
    }
}

/// `raw` without its `!` or `!<...>` wrapping.
fn strip_wrapping(raw: &str) -> &str {
    let s = raw.trim_start_matches('!');
    let s = s
        .strip_prefix('<')
        .and_then(|x| x.strip_suffix('>'))
        .unwrap_or(s);
    s.trim_start_matches('!')
}

pub(crate) const NDARRAY: &str = "core/ndarray";
pub(crate) const QUANTITY: &str = "unit/quantity";
pub(crate) const UNIT: &str = "unit/unit";
pub(crate) const TIME: &str = "time/time";
pub(crate) const ASDF_ROOT: &str = "core/asdf";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_prefixes_and_versions() {
        let t = Tag::parse("!core/ndarray-1.0.0");
        assert!(t.is(NDARRAY));
        assert_eq!(t.version(), Some("1.0.0"));

        let t = Tag::parse("tag:stsci.edu:asdf/unit/quantity-1.1.0");
        assert!(t.is(QUANTITY));

        let t = Tag::parse("!<asdf://stsci.edu/datamodels/roman/tags/wfi_image-1.0.0>");
        assert_eq!(t.name(), "wfi_image");
        assert_eq!(t.short_name(), "wfi_image");

        let t = Tag::parse("tag:stsci.edu:gwcs/wcs-1.2.0");
        assert_eq!(t.name(), "gwcs/wcs");
        assert_eq!(t.short_name(), "wcs");
    }

    #[test]
    fn written_form_keeps_the_uri() {
        assert_eq!(Tag::new(NDARRAY, "1.0.0").to_yaml().to_string(), "!core/ndarray-1.0.0");
        assert_eq!(
            Tag::parse("!<tag:stsci.edu:asdf/core/asdf-1.1.0>").to_yaml().to_string(),
            "!core/asdf-1.1.0"
        );
        assert_eq!(
            Tag::parse("tag:stsci.edu:gwcs/wcs-1.2.0").to_yaml().to_string(),
            "!tag:stsci.edu:gwcs/wcs-1.2.0"
        );
        assert_eq!(
            Tag::parse("!asdf://stsci.edu/datamodels/roman/tags/wfi_image-1.0.0")
                .to_yaml()
                .to_string(),
            "!asdf://stsci.edu/datamodels/roman/tags/wfi_image-1.0.0"
        );
    }

    #[test]
    fn unversioned_tags_keep_their_name() {
        let t = Tag::parse("!custom/thing-with-dashes");
        assert_eq!(t.name(), "custom/thing-with-dashes");
        assert_eq!(t.version(), None);
    }
}
