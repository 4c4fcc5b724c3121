//! Rewrite and redirect rule tables.
//!
//! Rules come from one or more sources:
//! - Inline pattern/replacement pairs (from the TOML config file)
//! - JSON object literals passed on the command line
//! - Paths to JSON files containing a single object
//!
//! Sources are merged left to right into a [`RuleSet`], then compiled into a
//! [`RuleTable`] that stays read-only for the lifetime of the process.
//!
//! ## Ordering
//!
//! Rule order is declaration order. Within a JSON object that is key order.
//! When a later source repeats a pattern, the pattern keeps its original
//! position and takes the later replacement.

use regex::Regex;
use std::fmt;
use std::path::PathBuf;

/// Which rule list a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Silently replace the URL the proxy fetches.
    Rewrite,
    /// Send the client an HTTP redirect to the new URL.
    Redirect,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Rewrite => "rewrite",
            Category::Redirect => "redirect",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single place rules can be loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    /// Pattern/replacement pairs already in memory.
    Inline(Vec<(String, String)>),
    /// A JSON object literal.
    Json(String),
    /// Path to a file holding a JSON object.
    File(PathBuf),
}

impl RuleSource {
    /// Classify a command-line argument.
    ///
    /// Anything that looks like a JSON object (`{ ... }`) is taken literally,
    /// everything else is treated as a file path.
    pub fn from_arg(arg: &str) -> Self {
        let trimmed = arg.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            RuleSource::Json(trimmed.to_string())
        } else {
            RuleSource::File(PathBuf::from(arg))
        }
    }

    /// Load this source into an ordered rule set.
    pub fn resolve(&self) -> Result<RuleSet, RuleError> {
        match self {
            RuleSource::Inline(pairs) => {
                let mut set = RuleSet::new();
                for (pattern, replacement) in pairs {
                    set.insert(pattern.clone(), replacement.clone());
                }
                Ok(set)
            }
            RuleSource::Json(text) => parse_json(text, "inline JSON"),
            RuleSource::File(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| RuleError::FileRead(path.clone(), e))?;
                parse_json(&text, &path.display().to_string())
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            RuleSource::Inline(pairs) => format!("inline ({} rules)", pairs.len()),
            RuleSource::Json(_) => "inline JSON".to_string(),
            RuleSource::File(path) => path.display().to_string(),
        }
    }
}

fn parse_json(text: &str, origin: &str) -> Result<RuleSet, RuleError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| RuleError::JsonParse(origin.to_string(), e))?;

    let object = value
        .as_object()
        .ok_or_else(|| RuleError::NotAnObject(origin.to_string()))?;

    let mut set = RuleSet::new();
    for (pattern, replacement) in object {
        let replacement = replacement
            .as_str()
            .ok_or_else(|| RuleError::NonStringReplacement {
                origin: origin.to_string(),
                pattern: pattern.clone(),
            })?;
        set.insert(pattern.clone(), replacement.to_string());
    }
    Ok(set)
}

/// Ordered pattern -> replacement mapping, before compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    entries: Vec<(String, String)>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve and merge sources left to right.
    pub fn merge(sources: &[RuleSource]) -> Result<Self, RuleError> {
        let mut merged = RuleSet::new();
        for source in sources {
            let set = source.resolve()?;
            tracing::debug!(source = %source.describe(), rules = set.len(), "Loaded rule source");
            merged.extend(set);
        }
        Ok(merged)
    }

    /// Insert a rule. A repeated pattern keeps its slot and takes the new replacement.
    pub fn insert(&mut self, pattern: String, replacement: String) {
        match self.entries.iter_mut().find(|(p, _)| *p == pattern) {
            Some(entry) => entry.1 = replacement,
            None => self.entries.push((pattern, replacement)),
        }
    }

    pub fn extend(&mut self, other: RuleSet) {
        for (pattern, replacement) in other.entries {
            self.insert(pattern, replacement);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, r)| (p.as_str(), r.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A compiled rule: a search pattern and a group-aware replacement template.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    template: String,
}

impl Rule {
    pub fn new(category: Category, pattern: &str, template: &str) -> Result<Self, RuleError> {
        let regex = Regex::new(pattern).map_err(|e| RuleError::InvalidPattern {
            category,
            pattern: pattern.to_string(),
            source: e,
        })?;

        let invalid_template = |reason: String| RuleError::InvalidTemplate {
            category,
            pattern: pattern.to_string(),
            template: template.to_string(),
            reason,
        };

        let pieces = parse_template(template).map_err(invalid_template)?;
        for piece in &pieces {
            if let Piece::Group(group) = piece {
                if !group_exists(&regex, group) {
                    return Err(invalid_template(format!("unknown group {}", group)));
                }
            }
        }

        Ok(Rule {
            pattern: regex,
            template: render_template(&pieces),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Search the URL; on a hit, substitute every match using the template.
    pub fn apply(&self, url: &str) -> Option<String> {
        if !self.pattern.is_match(url) {
            return None;
        }
        Some(
            self.pattern
                .replace_all(url, self.template.as_str())
                .into_owned(),
        )
    }
}

/// Group reference inside a replacement template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GroupRef {
    Index(usize),
    Name(String),
}

impl fmt::Display for GroupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRef::Index(index) => write!(f, "{}", index),
            GroupRef::Name(name) => write!(f, "'{}'", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Group(GroupRef),
}

fn group_exists(regex: &Regex, group: &GroupRef) -> bool {
    match group {
        GroupRef::Index(index) => *index < regex.captures_len(),
        GroupRef::Name(name) => regex.capture_names().flatten().any(|n| n == name.as_str()),
    }
}

fn radix_value(digits: &[u8], radix: u32) -> u32 {
    digits
        .iter()
        .fold(0, |acc, d| acc * radix + u32::from(d - b'0'))
}

fn is_octal(b: u8) -> bool {
    (b'0'..=b'7').contains(&b)
}

/// Split a replacement template into literal text and group references.
///
/// Backslash syntax: `\1`..`\99` and `\g<name>` / `\g<1>` are group
/// references, `\0` and three-digit escapes like `\101` are octal character
/// escapes, `\\` is one backslash. Any other escape is kept as written.
/// `$` has no special meaning.
fn parse_template(template: &str) -> Result<Vec<Piece>, String> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find('\\') {
        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let bytes = after.as_bytes();

        let group = match bytes.first().copied() {
            None => return Err("trailing backslash".to_string()),
            Some(b'0') => {
                let len = 1 + bytes[1..]
                    .iter()
                    .take(2)
                    .take_while(|b| is_octal(**b))
                    .count();
                literal.push(char::from(radix_value(&bytes[..len], 8) as u8));
                rest = &after[len..];
                None
            }
            Some(d) if d.is_ascii_digit() => {
                if bytes.len() >= 3 && bytes[..3].iter().all(|b| is_octal(*b)) {
                    let value = radix_value(&bytes[..3], 8);
                    if value > 0o377 {
                        return Err(format!("octal escape \\{} out of range", &after[..3]));
                    }
                    literal.push(char::from(value as u8));
                    rest = &after[3..];
                    None
                } else {
                    let len = if bytes.len() >= 2 && bytes[1].is_ascii_digit() {
                        2
                    } else {
                        1
                    };
                    rest = &after[len..];
                    Some(GroupRef::Index(radix_value(&bytes[..len], 10) as usize))
                }
            }
            Some(b'g') => {
                let named = after[1..]
                    .strip_prefix('<')
                    .ok_or_else(|| "missing '<' after \\g".to_string())?;
                let end = named
                    .find('>')
                    .ok_or_else(|| "unterminated group name".to_string())?;
                let name = &named[..end];
                rest = &named[end + 1..];

                if name.is_empty() {
                    return Err("empty group name".to_string());
                }
                if name.bytes().all(|b| b.is_ascii_digit()) {
                    let index = name
                        .parse()
                        .map_err(|_| format!("bad group number {}", name))?;
                    Some(GroupRef::Index(index))
                } else {
                    Some(GroupRef::Name(name.to_string()))
                }
            }
            Some(b'\\') => {
                literal.push('\\');
                rest = &after[1..];
                None
            }
            Some(_) => {
                literal.push('\\');
                rest = after;
                None
            }
        };

        if let Some(group) = group {
            if !literal.is_empty() {
                pieces.push(Piece::Literal(std::mem::take(&mut literal)));
            }
            pieces.push(Piece::Group(group));
        }
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal));
    }
    Ok(pieces)
}

/// Render parsed pieces in the `regex` crate's replacement syntax.
fn render_template(pieces: &[Piece]) -> String {
    let mut out = String::new();
    for piece in pieces {
        match piece {
            Piece::Literal(text) => out.push_str(&text.replace('$', "$$")),
            Piece::Group(GroupRef::Index(index)) => {
                out.push_str(&format!("${{{}}}", index));
            }
            Piece::Group(GroupRef::Name(name)) => {
                out.push_str(&format!("${{{}}}", name));
            }
        }
    }
    out
}

/// The compiled, read-only rule table shared by every request.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rewrite: Vec<Rule>,
    redirect: Vec<Rule>,
}

impl RuleTable {
    /// Compile both rule sets. Any invalid pattern fails the whole table.
    pub fn new(rewrite: &RuleSet, redirect: &RuleSet) -> Result<Self, RuleError> {
        Ok(RuleTable {
            rewrite: compile(Category::Rewrite, rewrite)?,
            redirect: compile(Category::Redirect, redirect)?,
        })
    }

    /// Apply the first rule in `category` whose pattern matches `url`.
    pub fn first_match(&self, url: &str, category: Category) -> Option<String> {
        self.rules(category).iter().find_map(|rule| rule.apply(url))
    }

    pub fn rules(&self, category: Category) -> &[Rule] {
        match category {
            Category::Rewrite => &self.rewrite,
            Category::Redirect => &self.redirect,
        }
    }

    pub fn len(&self, category: Category) -> usize {
        self.rules(category).len()
    }
}

fn compile(category: Category, set: &RuleSet) -> Result<Vec<Rule>, RuleError> {
    set.iter()
        .map(|(pattern, template)| Rule::new(category, pattern, template))
        .collect()
}

/// Rule loading and compilation errors. All of them are fatal at startup.
#[derive(Debug)]
pub enum RuleError {
    FileRead(PathBuf, std::io::Error),
    JsonParse(String, serde_json::Error),
    NotAnObject(String),
    NonStringReplacement {
        origin: String,
        pattern: String,
    },
    InvalidPattern {
        category: Category,
        pattern: String,
        source: regex::Error,
    },
    InvalidTemplate {
        category: Category,
        pattern: String,
        template: String,
        reason: String,
    },
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::FileRead(path, e) => {
                write!(f, "Failed to read rule file '{}': {}", path.display(), e)
            }
            RuleError::JsonParse(origin, e) => {
                write!(f, "Failed to parse rules from {}: {}", origin, e)
            }
            RuleError::NotAnObject(origin) => {
                write!(f, "Rules from {} must be a JSON object", origin)
            }
            RuleError::NonStringReplacement { origin, pattern } => write!(
                f,
                "Replacement for pattern '{}' in {} must be a string",
                pattern, origin
            ),
            RuleError::InvalidPattern {
                category,
                pattern,
                source,
            } => write!(f, "Invalid {} pattern '{}': {}", category, pattern, source),
            RuleError::InvalidTemplate {
                category,
                pattern,
                template,
                reason,
            } => write!(
                f,
                "Invalid {} replacement '{}' for pattern '{}': {}",
                category, template, pattern, reason
            ),
        }
    }
}

impl std::error::Error for RuleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuleError::FileRead(_, e) => Some(e),
            RuleError::JsonParse(_, e) => Some(e),
            RuleError::InvalidPattern { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn set(pairs: &[(&str, &str)]) -> RuleSet {
        let mut set = RuleSet::new();
        for (p, r) in pairs {
            set.insert(p.to_string(), r.to_string());
        }
        set
    }

    #[test]
    fn test_source_from_arg() {
        assert_eq!(
            RuleSource::from_arg(r#"{"a": "b"}"#),
            RuleSource::Json(r#"{"a": "b"}"#.to_string())
        );
        assert_eq!(
            RuleSource::from_arg("/etc/squid/rules.json"),
            RuleSource::File(PathBuf::from("/etc/squid/rules.json"))
        );
        // Braces on only one side is a path
        assert!(matches!(RuleSource::from_arg("{rules.json"), RuleSource::File(_)));
    }

    #[test]
    fn test_json_preserves_key_order() {
        let source = RuleSource::Json(r#"{"zzz": "1", "aaa": "2", "mmm": "3"}"#.to_string());
        let set = source.resolve().unwrap();
        let patterns: Vec<&str> = set.iter().map(|(p, _)| p).collect();
        assert_eq!(patterns, vec!["zzz", "aaa", "mmm"]);
    }

    #[test]
    fn test_json_errors() {
        let err = RuleSource::Json("{not json}".to_string()).resolve().unwrap_err();
        assert!(matches!(err, RuleError::JsonParse(..)));

        let err = RuleSource::File(PathBuf::from("/nonexistent/rules.json"))
            .resolve()
            .unwrap_err();
        match err {
            RuleError::FileRead(path, _) => assert_eq!(path, Path::new("/nonexistent/rules.json")),
            other => panic!("unexpected: {:?}", other),
        }

        let err = RuleSource::Json(r#"{"a": 1}"#.to_string()).resolve().unwrap_err();
        match err {
            RuleError::NonStringReplacement { pattern, .. } => assert_eq!(pattern, "a"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_file_not_an_object() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"["www\\.a\\.com", "www.b.com"]"#).unwrap();

        let err = RuleSource::File(file.path().to_path_buf())
            .resolve()
            .unwrap_err();
        assert!(matches!(err, RuleError::NotAnObject(_)));
    }

    #[test]
    fn test_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"www\\.site\\.com": "www.test.com"}}"#).unwrap();

        let set = RuleSource::File(file.path().to_path_buf()).resolve().unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(r"www\.site\.com", "www.test.com")]);
    }

    #[test]
    fn test_merge_later_source_overrides() {
        let sources = vec![
            RuleSource::Inline(vec![
                ("a".to_string(), "first".to_string()),
                ("b".to_string(), "b".to_string()),
            ]),
            RuleSource::Json(r#"{"c": "c", "a": "second"}"#.to_string()),
        ];
        let merged = RuleSet::merge(&sources).unwrap();
        assert_eq!(
            merged.iter().collect::<Vec<_>>(),
            vec![("a", "second"), ("b", "b"), ("c", "c")]
        );
    }

    #[test]
    fn test_merge_empty() {
        let merged = RuleSet::merge(&[]).unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = RuleTable::new(&set(&[("www(", "x")]), &RuleSet::new()).unwrap_err();
        match err {
            RuleError::InvalidPattern {
                category, pattern, ..
            } => {
                assert_eq!(category, Category::Rewrite);
                assert_eq!(pattern, "www(");
            }
            other => panic!("unexpected: {:?}", other),
        }

        let err = RuleTable::new(&RuleSet::new(), &set(&[("[", "x")])).unwrap_err();
        assert!(err.to_string().starts_with("Invalid redirect pattern '['"));
    }

    #[test]
    fn test_first_match_is_search() {
        let table = RuleTable::new(&set(&[(r"www\.site\.com", "www.test.com")]), &RuleSet::new())
            .unwrap();
        assert_eq!(
            table.first_match("http://www.site.com/a", Category::Rewrite),
            Some("http://www.test.com/a".to_string())
        );
        assert_eq!(table.first_match("http://www.site.com/a", Category::Redirect), None);
        assert_eq!(table.first_match("http://example.com/", Category::Rewrite), None);
    }

    #[test]
    fn test_first_match_order_wins() {
        let forward =
            RuleTable::new(&set(&[("site", "one"), ("s.te", "two")]), &RuleSet::new()).unwrap();
        assert_eq!(forward.len(Category::Rewrite), 2);
        assert_eq!(
            forward.first_match("http://site/", Category::Rewrite),
            Some("http://one/".to_string())
        );

        let reversed =
            RuleTable::new(&set(&[("s.te", "two"), ("site", "one")]), &RuleSet::new()).unwrap();
        assert_eq!(
            reversed.first_match("http://site/", Category::Rewrite),
            Some("http://two/".to_string())
        );
    }

    #[test]
    fn test_replacement_uses_groups() {
        let table = RuleTable::new(
            &set(&[
                (r"^http://(\w+)\.old\.com/(.*)$", r"https://\1.new.com/\2"),
                (r"^http://(?P<host>[^/]+)/legacy/", r"http://\g<host>/v2/"),
            ]),
            &RuleSet::new(),
        )
        .unwrap();

        assert_eq!(
            table.first_match("http://api.old.com/x?y=1", Category::Rewrite),
            Some("https://api.new.com/x?y=1".to_string())
        );
        assert_eq!(
            table.first_match("http://host/legacy/page", Category::Rewrite),
            Some("http://host/v2/page".to_string())
        );
    }

    #[test]
    fn test_replacement_applies_to_every_match() {
        let table = RuleTable::new(&RuleSet::new(), &set(&[("a", "b")])).unwrap();
        assert_eq!(
            table.first_match("http://aaa/", Category::Redirect),
            Some("http://bbb/".to_string())
        );
    }

    #[test]
    fn test_dollar_is_literal() {
        let table = RuleTable::new(
            &set(&[
                (r"old\.com", "new.com/$session"),
                (r"^http://(\w+)\.shop/", r"http://shop/$1/\1/"),
            ]),
            &RuleSet::new(),
        )
        .unwrap();

        assert_eq!(
            table.first_match("http://old.com/", Category::Rewrite),
            Some("http://new.com/$session/".to_string())
        );
        assert_eq!(
            table.first_match("http://toys.shop/cart", Category::Rewrite),
            Some("http://shop/$1/toys/cart".to_string())
        );
    }

    #[test]
    fn test_backslash_zero_is_octal() {
        let table =
            RuleTable::new(&set(&[(r"old\.com/(\w+)", r"new.com/\0")]), &RuleSet::new()).unwrap();
        assert_eq!(
            table.first_match("http://old.com/abc", Category::Rewrite),
            Some("http://new.com/\0".to_string())
        );
    }

    #[test]
    fn test_unknown_group_rejected() {
        let err = RuleTable::new(&set(&[(r"old\.com/(\w+)", r"new.com/\3")]), &RuleSet::new())
            .unwrap_err();
        match err {
            RuleError::InvalidTemplate {
                category,
                template,
                reason,
                ..
            } => {
                assert_eq!(category, Category::Rewrite);
                assert_eq!(template, r"new.com/\3");
                assert_eq!(reason, "unknown group 3");
            }
            other => panic!("unexpected: {:?}", other),
        }

        let err = RuleTable::new(&RuleSet::new(), &set(&[(r"(?P<a>x)", r"\g<b>")])).unwrap_err();
        assert!(err.to_string().starts_with("Invalid redirect replacement"));

        // Whole match is always available
        assert!(RuleTable::new(&set(&[("x", r"\g<0>")]), &RuleSet::new()).is_ok());
    }

    #[test]
    fn test_parse_template() {
        let literal = |s: &str| Piece::Literal(s.to_string());
        let index = |i| Piece::Group(GroupRef::Index(i));

        assert_eq!(parse_template("plain").unwrap(), vec![literal("plain")]);
        assert_eq!(parse_template("").unwrap(), vec![]);
        assert_eq!(
            parse_template(r"\1/\2").unwrap(),
            vec![index(1), literal("/"), index(2)]
        );
        assert_eq!(parse_template(r"\12x").unwrap(), vec![index(12), literal("x")]);
        assert_eq!(
            parse_template(r"\g<host>.com").unwrap(),
            vec![Piece::Group(GroupRef::Name("host".to_string())), literal(".com")]
        );
        assert_eq!(parse_template(r"\g<1>0").unwrap(), vec![index(1), literal("0")]);
        assert_eq!(parse_template(r"\101").unwrap(), vec![literal("A")]);
        assert_eq!(parse_template(r"a\\b").unwrap(), vec![literal(r"a\b")]);
        assert_eq!(parse_template(r"a\qb").unwrap(), vec![literal(r"a\qb")]);

        assert!(parse_template("trailing\\").is_err());
        assert!(parse_template(r"\g<name").is_err());
        assert!(parse_template(r"\g<>").is_err());
        assert!(parse_template(r"\777").is_err());
    }

    #[test]
    fn test_render_escapes_dollar() {
        let pieces = parse_template(r"$x\1${y}").unwrap();
        assert_eq!(render_template(&pieces), "$$x${1}$${y}");
    }
}
