//! Named expression sets and pattern matching.
//!
//! Filter and override patterns starting with `@` refer to a named set of
//! expressions maintained outside the rule (the shared "global regexp"
//! catalog). A value matches the set only when *every* expression in the
//! set matches; an empty pattern always matches. Five expression kinds are
//! supported, from plain substring containment to full regular expressions.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const REGEX_CACHE_MAX: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, regex::Regex>>> = OnceLock::new();

/// Compiles a pattern through the process-wide bounded cache.
pub(crate) fn cached_regex(pattern: &str, case_sensitive: bool) -> Result<regex::Regex, ConfigError> {
    let key = if case_sensitive {
        format!("s:{pattern}")
    } else {
        format!("i:{pattern}")
    };
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    {
        let guard = cache.read().map_err(|_| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "regex cache lock poisoned".to_string(),
        })?;
        if let Some(re) = guard.get(&key) {
            return Ok(re.clone());
        }
    }

    let compiled = regex::RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

    let mut guard = cache.write().map_err(|_| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: "regex cache lock poisoned".to_string(),
    })?;

    if guard.len() >= REGEX_CACHE_MAX {
        // Keep the cache bounded to avoid unbounded memory usage.
        guard.clear();
    }

    // Another thread may have inserted it while we compiled.
    guard.entry(key).or_insert_with(|| compiled.clone());
    Ok(compiled)
}

/// How one expression of a named set decides a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionKind {
    /// The value contains the pattern as a character string.
    Included,
    /// The value contains any of the delimiter-separated substrings.
    AnyIncluded,
    /// The value does not contain the pattern.
    NotIncluded,
    /// The pattern, as a regular expression, matches the value.
    ResultTrue,
    /// The pattern, as a regular expression, does not match the value.
    ResultFalse,
}

/// One expression of a named set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedExpression {
    /// Match kind.
    pub kind: ExpressionKind,
    /// Pattern text; an empty pattern matches everything.
    pub pattern: String,
    /// Substring delimiter for [`ExpressionKind::AnyIncluded`].
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Case-sensitive matching.
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
}

fn default_delimiter() -> char {
    ','
}

const fn default_case_sensitive() -> bool {
    true
}

impl NamedExpression {
    /// Creates an expression with the default delimiter and case-sensitive
    /// matching.
    #[must_use]
    pub fn new(kind: ExpressionKind, pattern: impl Into<String>) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
            delimiter: default_delimiter(),
            case_sensitive: default_case_sensitive(),
        }
    }

    /// Sets the substring delimiter.
    #[must_use]
    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Toggles case sensitivity.
    #[must_use]
    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Evaluates this expression against a value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] when a regular-expression
    /// kind carries an uncompilable pattern.
    pub fn matches(&self, value: &str) -> Result<bool, ConfigError> {
        if self.pattern.is_empty() {
            return Ok(true);
        }

        match self.kind {
            ExpressionKind::Included => Ok(self.contains(value, &self.pattern)),
            ExpressionKind::NotIncluded => Ok(!self.contains(value, &self.pattern)),
            ExpressionKind::AnyIncluded => Ok(self
                .pattern
                .split(self.delimiter)
                .filter(|s| !s.is_empty())
                .any(|s| self.contains(value, s))),
            ExpressionKind::ResultTrue => {
                Ok(cached_regex(&self.pattern, self.case_sensitive)?.is_match(value))
            }
            ExpressionKind::ResultFalse => {
                Ok(!cached_regex(&self.pattern, self.case_sensitive)?.is_match(value))
            }
        }
    }

    fn contains(&self, value: &str, needle: &str) -> bool {
        if self.case_sensitive {
            value.contains(needle)
        } else {
            value.to_lowercase().contains(&needle.to_lowercase())
        }
    }
}

/// Resolves `@name` patterns to named expression sets.
///
/// The catalog is externally owned and read-mostly; the engine only ever
/// resolves names.
pub trait NamedExpressionProvider: Send + Sync {
    /// Returns the expressions registered under `name`, or `None` when the
    /// name is unknown.
    fn resolve(&self, name: &str) -> Option<Vec<NamedExpression>>;
}

/// In-memory named expression catalog.
#[derive(Debug, Default)]
pub struct InMemoryExpressions {
    sets: RwLock<HashMap<String, Vec<NamedExpression>>>,
}

impl InMemoryExpressions {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one expression under a set name, creating the set on
    /// first use.
    pub fn register(&self, name: impl Into<String>, expression: NamedExpression) {
        if let Ok(mut sets) = self.sets.write() {
            sets.entry(name.into()).or_default().push(expression);
        }
    }
}

impl NamedExpressionProvider for InMemoryExpressions {
    fn resolve(&self, name: &str) -> Option<Vec<NamedExpression>> {
        self.sets.read().ok()?.get(name).cloned()
    }
}

/// Matches a value against a pattern that is either a literal regular
/// expression or an `@name` reference.
///
/// For named sets every expression must match. A missing name is a
/// configuration error, fatal to the rule run that uses it.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownNamedExpression`] for an unresolvable
/// `@name` and [`ConfigError::InvalidPattern`] for an uncompilable literal.
pub fn pattern_matches(
    value: &str,
    pattern: &str,
    provider: &dyn NamedExpressionProvider,
) -> Result<bool, ConfigError> {
    if let Some(name) = pattern.strip_prefix('@') {
        let Some(expressions) = provider.resolve(name) else {
            return Err(ConfigError::UnknownNamedExpression {
                name: name.to_string(),
            });
        };
        for expression in &expressions {
            if !expression.matches(value)? {
                return Ok(false);
            }
        }
        Ok(true)
    } else {
        Ok(cached_regex(pattern, true)?.is_match(value))
    }
}
