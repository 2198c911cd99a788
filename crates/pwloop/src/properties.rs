//! Ordered string-to-string property dictionaries.
//!
//! Every knob the daemon understands (target node, group, latency, media
//! class, channel layout) travels as a string under a well-known key, so the
//! whole configuration surface of a stream is one [`Properties`] bag.
//!
//! Keys are unique and keep the position of their first insertion, which makes
//! emission deterministic and lets [`Properties::update_from_string`] read back
//! exactly what `Display` wrote.

use std::fmt;
use std::sync::Arc;

use crate::error::{LoopbackError, Result};

/// Well-known property keys.
pub mod keys {
    pub const NODE_GROUP: &str = "node.group";
    pub const NODE_LATENCY: &str = "node.latency";
    pub const NODE_TARGET: &str = "node.target";
    pub const NODE_NAME: &str = "node.name";
    pub const NODE_DESCRIPTION: &str = "node.description";
    pub const MEDIA_TYPE: &str = "media.type";
    pub const AUDIO_CHANNELS: &str = "audio.channels";
    pub const AUDIO_POSITION: &str = "audio.position";
    pub const AUDIO_RATE: &str = "audio.rate";
    pub const REMOTE_NAME: &str = "remote.name";
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`; `None` removes it.
    pub fn set(&mut self, key: &str, value: Option<&str>) {
        match value {
            Some(value) => self.insert(key, value),
            None => {
                self.remove(key);
            }
        }
    }

    /// Insert or overwrite `key`, keeping its original position if present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Formatted set: `props.set_fmt(keys::NODE_LATENCY, format_args!("{}/{}", n, rate))`.
    pub fn set_fmt(&mut self, key: &str, args: fmt::Arguments<'_>) {
        self.insert(key, fmt::format(args));
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Current value of `key`, `None` when unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `other` into self; keys in `other` win.
    pub fn extend_from(&mut self, other: &Properties) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    /// Parse a `k=v k2="v with spaces"` bag and merge it into self.
    ///
    /// Also accepts the daemon's relaxed object form: an optional enclosing
    /// `{ }`, `:` instead of `=`, and commas between pairs. A backslash escapes
    /// the next character. A value opening with `[` or `{` runs to its
    /// balanced close and is stored verbatim, e.g. `audio.position=[ FL FR ]`.
    /// Nothing is merged if any part is malformed.
    pub fn update_from_string(&mut self, text: &str) -> Result<usize> {
        let pairs = parse_pairs(text)?;
        let count = pairs.len();
        for (k, v) in pairs {
            self.insert(k, v);
        }
        Ok(count)
    }

    /// Read-only snapshot for handing to the daemon.
    pub fn freeze(&self) -> FrozenProperties {
        FrozenProperties {
            entries: self.entries.clone().into(),
        }
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_pairs(f, self.iter())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.insert(k, v);
        }
        props
    }
}

/// Immutable, cheaply clonable snapshot of a [`Properties`] bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenProperties {
    entries: Arc<[(String, String)]>,
}

impl FrozenProperties {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_properties(&self) -> Properties {
        Properties {
            entries: self.entries.to_vec(),
        }
    }
}

impl fmt::Display for FrozenProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_pairs(f, self.iter())
    }
}

fn write_pairs<'a>(
    f: &mut fmt::Formatter<'_>,
    pairs: impl Iterator<Item = (&'a str, &'a str)>,
) -> fmt::Result {
    for (i, (k, v)) in pairs.enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write_token(f, k)?;
        f.write_str("=")?;
        write_token(f, v)?;
    }
    Ok(())
}

fn needs_quotes(token: &str) -> bool {
    token.is_empty()
        || token.chars().any(|c| {
            c.is_whitespace()
                || matches!(c, '=' | ':' | ',' | '"' | '\\' | '{' | '}' | '[' | ']')
        })
}

fn write_token(f: &mut fmt::Formatter<'_>, token: &str) -> fmt::Result {
    if !needs_quotes(token) {
        return f.write_str(token);
    }
    f.write_str("\"")?;
    for c in token.chars() {
        if c == '"' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl Scanner<'_> {
    fn skip_separators(&mut self) {
        while self
            .chars
            .next_if(|c| c.is_whitespace() || *c == ',')
            .is_some()
        {}
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    fn token(&mut self, is_key: bool) -> Result<String> {
        if !is_key && matches!(self.chars.peek(), Some('[') | Some('{')) {
            return self.container();
        }
        let mut out = String::new();
        if self.chars.next_if_eq(&'"').is_some() {
            loop {
                match self.chars.next() {
                    None => return Err(LoopbackError::invalid("unterminated quoted string")),
                    Some('"') => return Ok(out),
                    Some('\\') => out.push(self.escaped()?),
                    Some(c) => out.push(c),
                }
            }
        }

        while let Some(&c) = self.chars.peek() {
            let stop = c.is_whitespace() || c == '=' || c == ',' || (is_key && c == ':');
            if stop {
                break;
            }
            self.chars.next();
            if c == '\\' {
                out.push(self.escaped()?);
            } else {
                out.push(c);
            }
        }
        if out.is_empty() {
            let what = if is_key { "key" } else { "value" };
            return Err(LoopbackError::invalid(format!("missing {what}")));
        }
        Ok(out)
    }

    /// A `[...]` or `{...}` value, kept verbatim up to its balanced close.
    fn container(&mut self) -> Result<String> {
        let mut out = String::new();
        let mut depth = 0usize;
        let mut quoted = false;
        while let Some(c) = self.chars.next() {
            out.push(c);
            if quoted {
                match c {
                    '\\' => out.push(self.escaped()?),
                    '"' => quoted = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => quoted = true,
                '[' | '{' => depth += 1,
                ']' | '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(out);
                    }
                }
                _ => {}
            }
        }
        Err(LoopbackError::invalid(format!("unbalanced value {out:?}")))
    }

    fn escaped(&mut self) -> Result<char> {
        self.chars
            .next()
            .ok_or_else(|| LoopbackError::invalid("dangling escape at end of input"))
    }
}

fn parse_pairs(text: &str) -> Result<Vec<(String, String)>> {
    let trimmed = text.trim();
    let body = match trimmed.strip_prefix('{') {
        Some(rest) => rest
            .strip_suffix('}')
            .ok_or_else(|| LoopbackError::invalid("missing closing '}'"))?,
        None => trimmed,
    };

    let mut scanner = Scanner {
        chars: body.chars().peekable(),
    };
    let mut pairs = Vec::new();

    loop {
        scanner.skip_separators();
        if scanner.chars.peek().is_none() {
            break;
        }
        let key = scanner.token(true)?;
        scanner.skip_whitespace();
        match scanner.chars.next() {
            Some('=') | Some(':') => {}
            _ => {
                return Err(LoopbackError::invalid(format!(
                    "expected '=' after key {key:?}"
                )))
            }
        }
        scanner.skip_whitespace();
        let value = scanner.token(false)?;
        pairs.push((key, value));
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_set_get_remove() {
        let mut props = Properties::new();
        props.insert("a", "1");
        props.insert("b", "2");
        props.set("a", Some("3"));
        assert_eq!(props.get("a"), Some("3"));
        assert_eq!(props.iter().next(), Some(("a", "3")));

        props.set("a", None);
        assert_eq!(props.get("a"), None);
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn test_set_fmt() {
        let mut props = Properties::new();
        props.set_fmt(keys::NODE_LATENCY, format_args!("{}/{}", 960, 48000));
        assert_eq!(props.get(keys::NODE_LATENCY), Some("960/48000"));
    }

    #[test]
    fn test_update_from_string_bare_and_quoted() {
        let mut props = Properties::new();
        let n = props
            .update_from_string(r#"node.group=other media.name="My Loop" x=a\ b"#)
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(props.get("node.group"), Some("other"));
        assert_eq!(props.get("media.name"), Some("My Loop"));
        assert_eq!(props.get("x"), Some("a b"));
    }

    #[test]
    fn test_update_from_string_object_form() {
        let mut props = Properties::new();
        props
            .update_from_string(r#"{ node.target = "alsa:pcm:0", audio.rate: 44100 }"#)
            .unwrap();
        assert_eq!(props.get("node.target"), Some("alsa:pcm:0"));
        assert_eq!(props.get("audio.rate"), Some("44100"));
    }

    #[test]
    fn test_bracketed_values_are_one_token() {
        let mut props = Properties::new();
        let n = props
            .update_from_string(
                r#"audio.position=[ FL FR ] stream.props={ a = "x ]" } node.name=loop"#,
            )
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(props.get("audio.position"), Some("[ FL FR ]"));
        assert_eq!(props.get("stream.props"), Some(r#"{ a = "x ]" }"#));
        assert_eq!(props.get("node.name"), Some("loop"));

        let mut nested = Properties::new();
        nested
            .update_from_string("{ audio.position: [ FL, FR ], audio.rate: 48000 }")
            .unwrap();
        assert_eq!(nested.get("audio.position"), Some("[ FL, FR ]"));
        assert_eq!(nested.get("audio.rate"), Some("48000"));

        let text = props.to_string();
        let mut back = Properties::new();
        back.update_from_string(&text).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn test_update_overwrites_in_place() {
        let mut props = Properties::new();
        props.insert("a", "1");
        props.insert("b", "2");
        props.update_from_string("a=9").unwrap();
        let keys: Vec<_> = props.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(props.get("a"), Some("9"));
    }

    #[test]
    fn test_malformed_input_changes_nothing() {
        let mut props = Properties::new();
        props.insert("keep", "me");

        for bad in [
            "lonely",
            "a=",
            "a=\"open",
            "a=b\\",
            "=b",
            "{ a=b",
            "a=b=c",
            "a=[ FL FR",
            "a={ b=1",
        ] {
            let err = props.update_from_string(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "input {bad:?}");
        }
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn test_empty_input_is_fine() {
        let mut props = Properties::new();
        assert_eq!(props.update_from_string("   ").unwrap(), 0);
        assert_eq!(props.update_from_string("{}").unwrap(), 0);
    }

    #[test]
    fn test_display_round_trip_preserves_order() {
        let props: Properties = [
            ("node.group", "pw-loopback-42"),
            ("media.name", "two words"),
            ("quote", "say \"hi\""),
            ("empty", ""),
            ("path", "C:\\x"),
            ("node.latency", "960/48000"),
        ]
        .into_iter()
        .collect();

        let text = props.to_string();
        let mut back = Properties::new();
        back.update_from_string(&text).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn test_freeze_is_a_snapshot() {
        let mut props = Properties::new();
        props.insert("a", "1");
        let frozen = props.freeze();
        props.insert("a", "2");
        assert_eq!(frozen.get("a"), Some("1"));
        assert_eq!(frozen.to_properties().get("a"), Some("1"));
        assert_eq!(frozen.to_string(), "a=1");
    }
}
