//! Row normalization into macro entries.
//!
//! An [`Entry`] is the canonical projection of one discovery row: a mapping
//! from discovery-macro name to string value, built from the rule's
//! configured macro paths plus every top-level row field that already looks
//! like a discovery macro. Entries are what filters, overrides and name
//! templates see; the raw JSON row is never consulted again after
//! normalization.
//!
//! An [`EntrySet`] is the whole poll normalized, compared against the
//! previous poll to skip reconciliation when nothing changed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::row::DiscoveryRow;

/// Checks whether a string is a well-formed discovery macro name.
///
/// The accepted form is `{#NAME}` where `NAME` consists of uppercase
/// letters, digits, dots and underscores.
///
/// # Examples
///
/// ```
/// use toposync::is_discovery_macro;
///
/// assert!(is_discovery_macro("{#FSNAME}"));
/// assert!(is_discovery_macro("{#IF.ALIAS_2}"));
/// assert!(!is_discovery_macro("{#fsname}"));
/// assert!(!is_discovery_macro("{FSNAME}"));
/// assert!(!is_discovery_macro("{#}"));
/// ```
#[must_use]
pub fn is_discovery_macro(name: &str) -> bool {
    let Some(inner) = name.strip_prefix("{#").and_then(|s| s.strip_suffix('}')) else {
        return false;
    };
    !inner.is_empty()
        && inner
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'.' || b == b'_')
}

/// Maps a discovery macro to a path expression inside the row.
///
/// Configured paths take precedence over a top-level row field with the
/// same macro name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroPath {
    /// Macro name in `{#NAME}` form.
    pub name: String,
    /// Dotted path resolved against the row (see [`DiscoveryRow::query`]).
    pub path: String,
}

impl MacroPath {
    /// Creates a macro path, validating the macro name syntax.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMacroName`] if `name` is not a
    /// well-formed discovery macro.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if !is_discovery_macro(&name) {
            return Err(ConfigError::InvalidMacroName { name });
        }
        Ok(Self {
            name,
            path: path.into(),
        })
    }
}

/// Canonical text for a JSON value placed into an entry.
///
/// Numbers keep their JSON rendering, booleans become `true`/`false`,
/// composite values serialize compactly, null means "no value".
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        composite => serde_json::to_string(composite).ok(),
    }
}

/// Normalized projection of one discovery row.
///
/// Equality and hashing are order-independent over the (name, value) pairs,
/// so two entries built from differently ordered JSON objects compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Entry {
    values: BTreeMap<String, String>,
}

impl Entry {
    /// Builds an entry from a row.
    ///
    /// Configured macro paths are resolved first; any top-level field whose
    /// name is a well-formed discovery macro and was not already set by a
    /// path is added afterwards. Paths or fields that resolve to JSON null
    /// (or nothing) contribute no value.
    #[must_use]
    pub fn build(row: &DiscoveryRow, paths: &[MacroPath]) -> Self {
        let mut values = BTreeMap::new();

        for mp in paths {
            if let Some(text) = row.query(&mp.path).and_then(value_text) {
                values.insert(mp.name.clone(), text);
            }
        }

        for (field, value) in row.fields() {
            if is_discovery_macro(field) && !values.contains_key(field) {
                if let Some(text) = value_text(value) {
                    values.insert(field.clone(), text);
                }
            }
        }

        Self { values }
    }

    /// Creates an entry directly from (macro, value) pairs. Test aid and
    /// embedding convenience; names are taken as-is.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns the value of a macro, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Iterates over (macro, value) pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of macros in the entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the entry carries no macros at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Stable content digest of this entry.
    fn digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        for (name, value) in &self.values {
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        hasher.finalize()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{name}=\"{value}\"")?;
            first = false;
        }
        Ok(())
    }
}

/// All entries of one poll, in row order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntrySet {
    entries: Vec<Entry>,
}

impl EntrySet {
    /// Wraps a list of entries.
    #[must_use]
    pub fn new(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    /// The entries in row order.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the poll produced no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Order-independent set comparison against another poll.
    ///
    /// True only when both sets have the same cardinality and every entry
    /// of `self` has a value-identical counterpart in `other`. Used to skip
    /// a reconciliation pass entirely when nothing changed.
    #[must_use]
    pub fn same_as(&self, other: &EntrySet) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        let index: std::collections::HashSet<&Entry> = other.entries.iter().collect();
        self.entries.iter().all(|e| index.contains(e))
    }

    /// Stable, order-independent fingerprint of the whole set.
    ///
    /// Row order does not affect the fingerprint; content does. Suitable
    /// for persisting next to the rule and comparing across restarts.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut digests: Vec<[u8; 32]> = self
            .entries
            .iter()
            .map(|e| *e.digest().as_bytes())
            .collect();
        digests.sort_unstable();

        let mut hasher = blake3::Hasher::new();
        for d in &digests {
            hasher.update(d);
        }
        hasher.finalize().to_hex().to_string()
    }
}
