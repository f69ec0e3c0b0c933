//! Lost-object retention lifetimes.
//!
//! A rule's lifetime controls how long an object survives after its row
//! stops appearing. The value is a suffixed duration string; an invalid
//! value is non-fatal and falls back to a 25-year retention so a typo never
//! deletes anything early.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Seconds in the 25-year fallback lifetime.
const FALLBACK_SECONDS: i64 = 25 * 365 * 24 * 3600;

/// How long a lost object is retained before deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifetime {
    /// Never delete; lost objects are kept indefinitely.
    Forever,
    /// Delete as soon as the row disappears.
    Immediately,
    /// Delete once this much time passed since the object was last seen.
    After(#[serde(with = "seconds")] Duration),
}

mod seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.num_seconds().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        i64::deserialize(d).map(Duration::seconds)
    }
}

impl Lifetime {
    /// Parses a lifetime string.
    ///
    /// Accepted forms: `never`/`0` (keep forever), `immediately` (delete on
    /// loss), a plain number of seconds, or a number with one of the
    /// suffixes `s m h d w`.
    ///
    /// # Examples
    ///
    /// ```
    /// use toposync::Lifetime;
    ///
    /// assert_eq!(Lifetime::parse("30d"), Some(Lifetime::days(30)));
    /// assert_eq!(Lifetime::parse("never"), Some(Lifetime::Forever));
    /// assert_eq!(Lifetime::parse("1x"), None);
    /// ```
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw {
            "never" | "0" => return Some(Self::Forever),
            "immediately" => return Some(Self::Immediately),
            "" => return None,
            _ => {}
        }

        let (digits, multiplier) = match raw.as_bytes()[raw.len() - 1] {
            b's' => (&raw[..raw.len() - 1], 1),
            b'm' => (&raw[..raw.len() - 1], 60),
            b'h' => (&raw[..raw.len() - 1], 3600),
            b'd' => (&raw[..raw.len() - 1], 86_400),
            b'w' => (&raw[..raw.len() - 1], 604_800),
            _ => (raw, 1),
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value: i64 = digits.parse().ok()?;
        if value == 0 {
            return Some(Self::Forever);
        }
        Some(Self::After(Duration::seconds(value.checked_mul(multiplier)?)))
    }

    /// Parses leniently: an invalid value yields the 25-year fallback and a
    /// warning message for the outcome buffer.
    pub fn parse_lenient(raw: &str, warnings: &mut Vec<String>) -> Self {
        match Self::parse(raw) {
            Some(lifetime) => lifetime,
            None => {
                warnings.push(format!(
                    "invalid lifetime \"{raw}\", using the 25 year fallback"
                ));
                Self::After(Duration::seconds(FALLBACK_SECONDS))
            }
        }
    }

    /// A lifetime of whole days. Convenience constructor.
    #[must_use]
    pub fn days(days: i64) -> Self {
        Self::After(Duration::days(days))
    }

    /// When a lost object becomes due for deletion, given the time it was
    /// last seen. `None` means it is kept forever.
    #[must_use]
    pub fn deadline(&self, last_seen: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Forever => None,
            Self::Immediately => Some(last_seen),
            Self::After(duration) => last_seen.checked_add_signed(*duration),
        }
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::days(30)
    }
}
