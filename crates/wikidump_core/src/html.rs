//! Minimal tag scanner for exported page markup.
//!
//! Only start tags that a caller chooses to modify are re-serialized; every
//! other byte of the input is copied through unchanged.

use std::sync::OnceLock;

use regex::Regex;

/// One parsed start tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    attrs: Vec<(String, Option<String>)>,
    self_closing: bool,
}

impl Tag {
    pub fn parse(raw: &str) -> Option<Self> {
        let inner = raw.strip_prefix('<')?.strip_suffix('>')?;
        let (inner, self_closing) = match inner.strip_suffix('/') {
            Some(rest) if closes_start_tag(rest) => (rest, true),
            _ => (inner, false),
        };
        let name_end = inner
            .find(|c: char| c.is_whitespace() || c == '/')
            .unwrap_or(inner.len());
        let name = inner[..name_end].to_ascii_lowercase();
        if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return None;
        }

        let attrs = attr_pattern()
            .captures_iter(&inner[name_end..])
            .map(|captures| {
                let key = captures[1].to_ascii_lowercase();
                let value = captures
                    .get(2)
                    .or_else(|| captures.get(3))
                    .or_else(|| captures.get(4))
                    .map(|value| decode_entities(value.as_str()));
                (key, value)
            })
            .collect();

        Some(Self {
            name,
            attrs,
            self_closing,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_deref().unwrap_or(""))
    }

    /// Replace the first attribute named `key`, or append it.
    pub fn set(&mut self, key: &str, value: &str) {
        match self
            .attrs
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
        {
            Some((_, slot)) => *slot = Some(value.to_string()),
            None => self.attrs.push((key.to_string(), Some(value.to_string()))),
        }
    }

    pub fn render(&self) -> String {
        let mut output = format!("<{}", self.name);
        for (key, value) in &self.attrs {
            output.push(' ');
            output.push_str(key);
            if let Some(value) = value {
                output.push_str("=\"");
                output.push_str(&escape_attr(value));
                output.push('"');
            }
        }
        if self.self_closing {
            output.push_str(" /");
        }
        output.push('>');
        output
    }
}

/// A trailing `/` closes the tag after whitespace, a quoted value or a bare
/// name; after an unquoted value it belongs to the value.
fn closes_start_tag(rest: &str) -> bool {
    rest.ends_with(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        || !rest.contains(char::is_whitespace)
}

/// Byte offsets of one element: `<name ...>` .. `</name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementSpan {
    pub open_start: usize,
    pub open_end: usize,
    pub close_start: usize,
    pub close_end: usize,
}

impl ElementSpan {
    pub fn inner<'a>(&self, html: &'a str) -> &'a str {
        &html[self.open_end..self.close_start]
    }
}

/// Rewrite every start tag named in `names`. `edit` returns `true` when it
/// changed the tag; untouched tags keep their original bytes.
pub fn rewrite_tags<F>(html: &str, names: &[&str], mut edit: F) -> String
where
    F: FnMut(&mut Tag) -> bool,
{
    let mut output = String::with_capacity(html.len());
    let mut cursor = 0usize;
    for found in tag_pattern().find_iter(html) {
        let Some(mut tag) = Tag::parse(found.as_str()) else {
            continue;
        };
        if !names.iter().any(|name| tag.name.eq_ignore_ascii_case(name)) {
            continue;
        }
        if edit(&mut tag) {
            output.push_str(&html[cursor..found.start()]);
            output.push_str(&tag.render());
            cursor = found.end();
        }
    }
    output.push_str(&html[cursor..]);
    output
}

/// Visit start tags without rewriting.
pub fn for_each_tag<F>(html: &str, name: &str, mut visit: F)
where
    F: FnMut(&Tag),
{
    for found in tag_pattern().find_iter(html) {
        if let Some(tag) = Tag::parse(found.as_str())
            && tag.name.eq_ignore_ascii_case(name)
        {
            visit(&tag);
        }
    }
}

/// First `name` element whose start tag satisfies `accept`. Nesting of the same
/// element name is not tracked.
pub fn find_element<F>(html: &str, name: &str, accept: F) -> Option<ElementSpan>
where
    F: Fn(&Tag) -> bool,
{
    let open = tag_pattern().find_iter(html).find(|found| {
        Tag::parse(found.as_str())
            .is_some_and(|tag| tag.name.eq_ignore_ascii_case(name) && accept(&tag))
    })?;
    let (close_start, close_end) = find_close_tag(html, open.end(), name)?;
    Some(ElementSpan {
        open_start: open.start(),
        open_end: open.end(),
        close_start,
        close_end,
    })
}

/// Matching close tag after `from`, skipping nested elements of the same name.
fn find_close_tag(html: &str, from: usize, name: &str) -> Option<(usize, usize)> {
    let lowered = html[from..].to_ascii_lowercase();
    let open_needle = format!("<{}", name.to_ascii_lowercase());
    let close_needle = format!("</{}", name.to_ascii_lowercase());
    let mut depth = 0usize;
    let mut search = 0usize;
    while let Some(offset) = lowered[search..].find('<') {
        let start = search + offset;
        let rest = &lowered[start..];
        if let Some(after) = rest.strip_prefix(close_needle.as_str()) {
            let trimmed = after.trim_start();
            if trimmed.starts_with('>') {
                if depth == 0 {
                    let end = start + close_needle.len() + (after.len() - trimmed.len()) + 1;
                    return Some((from + start, from + end));
                }
                depth -= 1;
            }
        } else if let Some(after) = rest.strip_prefix(open_needle.as_str())
            && after.starts_with(|c: char| c.is_whitespace() || c == '>')
        {
            depth += 1;
        }
        search = start + 1;
    }
    None
}

pub fn escape_text(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            _ => output.push(c),
        }
    }
    output
}

pub fn escape_attr(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}

pub fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    let mut output = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(amp) = rest.find('&') {
        output.push_str(&rest[..amp]);
        let candidate = &rest[amp..];
        match candidate.find(';').filter(|end| *end <= 10) {
            Some(end) => match decode_entity(&candidate[1..end]) {
                Some(decoded) => {
                    output.push(decoded);
                    rest = &candidate[end + 1..];
                }
                None => {
                    output.push('&');
                    rest = &candidate[1..];
                }
            },
            None => {
                output.push('&');
                rest = &candidate[1..];
            }
        }
    }
    output.push_str(rest);
    output
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let numeric = entity.strip_prefix('#')?;
            let code = match numeric.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => numeric.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Decode `%XX` sequences; malformed sequences are kept literally.
pub fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0usize;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && index + 2 < bytes.len()
            && let (Some(high), Some(low)) =
                (hex_value(bytes[index + 1]), hex_value(bytes[index + 2]))
        {
            decoded.push(high * 16 + low);
            index += 3;
            continue;
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"<[A-Za-z][A-Za-z0-9:-]*(?:[^>"']|"[^"]*"|'[^']*')*>"#)
            .expect("tag pattern compiles")
    })
}

fn attr_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
            .expect("attribute pattern compiles")
    })
}
