//! Loosely-structured version strings as used by vendor firmware images:
//! a mix of dot/dash/slash/underscore separated integers and opaque
//! strings, e.g. `"7.2.2.0 build 190"` or
//! `"SL-OPENTHREAD/2.2.2.0_GitHub-91fa1f455"`.

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;

/// A single component of a parsed [`Version`].
///
/// Integer components participate in ordering and compatibility checks;
/// string components (including the separators themselves) only
/// participate in equality.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Component {
    Int(u64),
    Str(String),
}

/// A parsed, comparable vendor version string.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    original: String,
    components: Vec<Component>,
}

fn separator_regex() -> Regex {
    // " build " must be tried before the single-character separators so
    // that it is matched as one token rather than three.
    Regex::new(r" build |[.\-/_]").expect("static regex is valid")
}

fn tokenize(s: &str) -> Vec<String> {
    let re = separator_regex();
    let mut tokens = Vec::new();
    let mut last = 0;

    for m in re.find_iter(s) {
        if m.start() > last {
            tokens.push(s[last..m.start()].to_string());
        }
        tokens.push(m.as_str().to_string());
        last = m.end();
    }

    if last < s.len() {
        tokens.push(s[last..].to_string());
    }

    tokens
}

impl Version {
    /// Parses a version string into its components.
    ///
    /// Splits on any of `.`, `-`, `/`, `_`, or the literal token
    /// `" build "`, keeping the separators themselves as non-comparable
    /// components interleaved with the integer/string components.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let components = tokenize(s)
            .into_iter()
            .map(|token| match token.parse::<u64>() {
                Ok(n) => Component::Int(n),
                Err(_) => Component::Str(token),
            })
            .collect();

        Self {
            original: s.to_string(),
            components,
        }
    }

    /// The original string this `Version` was parsed from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    fn comparable(&self) -> Vec<u64> {
        self.components
            .iter()
            .filter_map(|c| match c {
                Component::Int(n) => Some(*n),
                Component::Str(_) => None,
            })
            .collect()
    }

    /// Returns `true` if the shared prefix of comparable (integer)
    /// components is equal between `self` and `other`.
    ///
    /// A shorter `Version` is compatible with a longer one that shares
    /// its full comparable prefix.
    #[must_use]
    pub fn compatible_with(&self, other: &Version) -> bool {
        let a = self.comparable();
        let b = other.comparable();
        let len = a.len().min(b.len());

        a[..len] == b[..len]
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.comparable().cmp(&other.comparable()))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparable().cmp(&other.comparable())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Version::parse(s)
    }
}

impl From<String> for Version {
    fn from(s: String) -> Self {
        Version::parse(&s)
    }
}
