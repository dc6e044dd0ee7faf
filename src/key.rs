//! Structural query keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Text(String),
    Number(i64),
    /// An unset segment, e.g. the user id of a signed-out visitor.
    Absent,
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Text(s) => f.write_str(s),
            KeyPart::Number(n) => write!(f, "{}", n),
            KeyPart::Absent => f.write_str("-"),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Text(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Text(s)
    }
}

impl From<i64> for KeyPart {
    fn from(n: i64) -> Self {
        KeyPart::Number(n)
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(part: Option<T>) -> Self {
        part.map(Into::into).unwrap_or(KeyPart::Absent)
    }
}

/// Ordered tuple identifying one cache slot.
///
/// Equality is structural: two keys built from the same parts in the same
/// order address the same entry. `Display` renders `hackathons:user:u1`.
///
/// # Example
///
/// ```
/// use query_kit::QueryKey;
///
/// let key = QueryKey::from(["hackathons", "user"]).with("u1");
/// assert_eq!(key.to_string(), "hackathons:user:u1");
/// assert_eq!(key.prefix(), Some("hackathons"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    /// Build a key from any sequence of parts.
    pub fn new<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPart>,
    {
        QueryKey(parts.into_iter().map(Into::into).collect())
    }

    /// Append a part in place.
    pub fn push(&mut self, part: impl Into<KeyPart>) {
        self.0.push(part.into());
    }

    /// Append a part, builder style.
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.push(part);
        self
    }

    /// Append an optional text part; `None` becomes [`KeyPart::Absent`].
    pub fn with_opt(self, part: Option<&str>) -> Self {
        self.with(part)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// First segment, when it is text. Used to namespace staleness settings.
    pub fn prefix(&self) -> Option<&str> {
        match self.0.first() {
            Some(KeyPart::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(parts: [&str; N]) -> Self {
        QueryKey::new(parts)
    }
}

impl From<Vec<KeyPart>> for QueryKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        QueryKey(parts)
    }
}
