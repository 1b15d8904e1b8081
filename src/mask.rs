//! Wrapper for sensitive values.
//!
//! [`Masked`] never prints or serializes its content. The raw value is
//! reachable only through [`Masked::expose`], so every place that reads a
//! secret is visible in the source.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const MASK: &str = "***";

/// A value whose `Debug`, `Display` and `Serialize` output is masked.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Masked<T>(T);

impl<T> Masked<T> {
    /// Wrap a sensitive value.
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the raw value.
    pub fn expose(&self) -> &T {
        &self.0
    }

    /// Unwrap the raw value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl Masked<String> {
    /// Last four characters prefixed by the mask, for log correlation.
    pub fn hint(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return MASK.to_string();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{}", MASK, tail)
    }
}

impl<T> From<T> for Masked<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Masked({})", MASK)
    }
}

impl<T> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

impl<T> Serialize for Masked<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(MASK)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Masked<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Masked)
    }
}
