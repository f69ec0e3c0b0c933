//! Template expansion of discovery macros.
//!
//! Names, keys and interval fields on prototypes are templates containing
//! `{#MACRO}` tokens. Expansion replaces each token with the row's entry
//! value; tokens without a value stay in the text untouched, which makes
//! half-resolved names visible instead of silently collapsing them.

use crate::entry::{is_discovery_macro, Entry};

/// Substitutes discovery macros in templates.
///
/// The engine does not expand templates itself; embedders can supply an
/// expander that also knows user macros or function macros. The default
/// [`EntryExpander`] handles plain `{#MACRO}` substitution.
pub trait MacroExpander: Send + Sync {
    /// Expands all macro tokens in `template` using `entry`.
    fn expand(&self, template: &str, entry: &Entry) -> String;
}

/// Entry-backed `{#MACRO}` substitution.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntryExpander;

impl EntryExpander {
    /// Creates the expander.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl MacroExpander for EntryExpander {
    fn expand(&self, template: &str, entry: &Entry) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{#") {
            out.push_str(&rest[..start]);
            let token_start = &rest[start..];
            match token_start.find('}') {
                Some(close) => {
                    let token = &token_start[..=close];
                    if is_discovery_macro(token) {
                        if let Some(value) = entry.get(token) {
                            out.push_str(value);
                        } else {
                            out.push_str(token);
                        }
                        rest = &token_start[close + 1..];
                    } else {
                        // Not a well-formed macro; emit the opening brace
                        // and rescan from the next character.
                        out.push('{');
                        rest = &token_start[1..];
                    }
                }
                None => {
                    out.push_str(token_start);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pairs: &[(&str, &str)]) -> Entry {
        Entry::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_expand_simple() {
        let e = entry(&[("{#FSNAME}", "/var")]);
        let out = EntryExpander::new().expand("Free space on {#FSNAME}", &e);
        assert_eq!(out, "Free space on /var");
    }

    #[test]
    fn test_expand_multiple_tokens() {
        let e = entry(&[("{#DEV}", "sda"), ("{#PART}", "1")]);
        let out = EntryExpander::new().expand("disk[{#DEV},{#PART}]", &e);
        assert_eq!(out, "disk[sda,1]");
    }

    #[test]
    fn test_unknown_macro_stays_literal() {
        let e = entry(&[("{#A}", "a")]);
        let out = EntryExpander::new().expand("{#A} and {#MISSING}", &e);
        assert_eq!(out, "a and {#MISSING}");
    }

    #[test]
    fn test_malformed_tokens_pass_through() {
        let e = entry(&[("{#A}", "a")]);
        let expander = EntryExpander::new();
        assert_eq!(expander.expand("{#a} {#A}", &e), "{#a} a");
        assert_eq!(expander.expand("open {#A", &e), "open {#A");
        assert_eq!(expander.expand("{#", &e), "{#");
        assert_eq!(expander.expand("no macros", &e), "no macros");
    }

    #[test]
    fn test_adjacent_tokens() {
        let e = entry(&[("{#A}", "x"), ("{#B}", "y")]);
        assert_eq!(EntryExpander::new().expand("{#A}{#B}", &e), "xy");
    }
}
