//! Attribute lexer for command tags.
//!
//! Pure functions over a tag's raw text (`<name k="v" ...>` or `.../>`).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<\s*(/?)\s*([A-Za-z][A-Za-z0-9_-]*)").unwrap());

/// Head of a tag: name, attributes and closing form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagHead {
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    /// `<name ... />`
    pub self_closing: bool,
    /// `</name>`
    pub end_tag: bool,
}

impl TagHead {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

/// Extract `key="value"` (or single-quoted) pairs. Later duplicates win.
pub fn lex_attributes(inner: &str) -> BTreeMap<String, String> {
    ATTR_RE
        .captures_iter(inner)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_string();
            let value = caps.get(2).or_else(|| caps.get(3))?.as_str().to_string();
            Some((key, value))
        })
        .collect()
}

/// Split a raw tag (`<` through `>`) into its head. `None` when the text has
/// no tag name, e.g. `< 5 >`.
pub fn parse_tag(raw: &str) -> Option<TagHead> {
    let caps = NAME_RE.captures(raw)?;
    let end_tag = !caps.get(1)?.as_str().is_empty();
    let name_match = caps.get(2)?;
    let body = raw
        .get(name_match.end()..)?
        .trim_end_matches('>')
        .trim_end();
    let self_closing = body.ends_with('/');
    let attr_text = body.strip_suffix('/').unwrap_or(body);
    Some(TagHead {
        name: name_match.as_str().to_string(),
        attrs: lex_attributes(attr_text),
        self_closing,
        end_tag,
    })
}

/// `true`, `1` or `yes`, case-insensitive.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}
