//! Index keys.
//!
//! The tree is generic over any [`IndexKey`]: a totally ordered value that
//! a [`KeySerializer`](crate::types::KeySerializer) can turn into bytes.
//! [`Key`] is the tagged variant used by real indexes. Its `Composite`
//! form holds an ordered list of sub-keys, and the two sentinel variants
//! sort below and above every other key so a short composite key can be
//! padded into a range boundary.

use std::fmt;

/// How a composite key shorter than the index arity is padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialSearchMode {
    /// Leave the key as it is.
    None,
    /// Pad with [`Key::AlwaysLess`], sorting before every full key with the same prefix.
    LowestBoundary,
    /// Pad with [`Key::AlwaysGreater`], sorting after every full key with the same prefix.
    HighestBoundary,
}

impl PartialSearchMode {
    /// Padding for the lower bound of a range.
    ///
    /// An inclusive lower bound must admit every key sharing its prefix, so
    /// it sorts lowest; an exclusive one must skip them all.
    #[must_use]
    pub const fn for_lower_bound(inclusive: bool) -> Self {
        if inclusive {
            Self::LowestBoundary
        } else {
            Self::HighestBoundary
        }
    }

    /// Padding for the upper bound of a range.
    #[must_use]
    pub const fn for_upper_bound(inclusive: bool) -> Self {
        if inclusive {
            Self::HighestBoundary
        } else {
            Self::LowestBoundary
        }
    }
}

/// Capability set the tree needs from a key type.
pub trait IndexKey: Ord + Clone + fmt::Debug + Send + Sync + 'static {
    /// Pad a partial composite key to `arity` components.
    ///
    /// Keys without components are returned unchanged.
    #[must_use]
    fn pad_to_arity(self, arity: usize, mode: PartialSearchMode) -> Self {
        let _ = (arity, mode);
        self
    }

    /// Whether the key is, or has a component that is, a range boundary
    /// sentinel. Such keys only bound searches and are never stored.
    fn holds_sentinel(&self) -> bool {
        false
    }
}

impl IndexKey for i64 {}

impl IndexKey for String {}

/// Declared type of a key component, used to coerce keys before storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Integer,
    String,
    Binary,
}

/// A key of a multi-value index.
///
/// Variant order defines the cross-type order: the derived `Ord` places
/// `AlwaysLess` first and `AlwaysGreater` last. Composite keys compare
/// component by component, and a strict prefix sorts first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    /// Sentinel below every other key. Only used for range boundaries.
    AlwaysLess,
    Integer(i64),
    String(String),
    Binary(Vec<u8>),
    Composite(Vec<Self>),
    /// Sentinel above every other key. Only used for range boundaries.
    AlwaysGreater,
}

impl Key {
    /// Build a composite key from its components.
    #[must_use]
    pub fn composite(parts: impl IntoIterator<Item = Self>) -> Self {
        Self::Composite(parts.into_iter().collect())
    }

    /// Whether this key is one of the boundary sentinels.
    #[must_use]
    pub const fn is_sentinel(&self) -> bool {
        matches!(self, Self::AlwaysLess | Self::AlwaysGreater)
    }
}

impl IndexKey for Key {
    fn pad_to_arity(self, arity: usize, mode: PartialSearchMode) -> Self {
        let filler = match mode {
            PartialSearchMode::None => return self,
            PartialSearchMode::LowestBoundary => Self::AlwaysLess,
            PartialSearchMode::HighestBoundary => Self::AlwaysGreater,
        };
        match self {
            Self::Composite(mut parts) if arity > 1 && parts.len() < arity => {
                parts.resize(arity, filler);
                Self::Composite(parts)
            }
            key => key,
        }
    }

    fn holds_sentinel(&self) -> bool {
        match self {
            Self::Composite(parts) => parts.iter().any(Self::holds_sentinel),
            key => key.is_sentinel(),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlwaysLess => write!(f, "<min>"),
            Self::AlwaysGreater => write!(f, "<max>"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Binary(bytes) => {
                write!(f, "0x")?;
                bytes.iter().try_for_each(|b| write!(f, "{b:02x}"))
            }
            Self::Composite(parts) => {
                write!(f, "[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_bound_every_key() {
        let keys = [
            Key::Integer(i64::MIN),
            Key::from("zzz"),
            Key::Binary(vec![0xFF; 4]),
            Key::composite([Key::Integer(1)]),
        ];
        for key in &keys {
            assert!(Key::AlwaysLess < *key);
            assert!(Key::AlwaysGreater > *key);
        }
    }

    #[test]
    fn test_holds_sentinel() {
        assert!(Key::AlwaysLess.holds_sentinel());
        assert!(Key::composite([Key::Integer(1), Key::AlwaysGreater]).holds_sentinel());
        assert!(
            Key::composite([Key::composite([Key::AlwaysLess]), Key::Integer(1)]).holds_sentinel()
        );
        assert!(!Key::composite([Key::Integer(1), Key::from("a")]).holds_sentinel());
        assert!(!Key::Integer(7).holds_sentinel());
        assert!(!7i64.holds_sentinel());
    }

    #[test]
    fn test_composite_ordering() {
        let a = Key::composite([Key::Integer(1), Key::from("a")]);
        let b = Key::composite([Key::Integer(1), Key::from("b")]);
        let c = Key::composite([Key::Integer(2), Key::from("a")]);
        assert!(a < b);
        assert!(b < c);

        let prefix = Key::composite([Key::Integer(1)]);
        assert!(prefix < a);
    }

    #[test]
    fn test_padding_brackets_the_prefix() {
        let low = Key::composite([Key::Integer(1)]).pad_to_arity(3, PartialSearchMode::LowestBoundary);
        let high =
            Key::composite([Key::Integer(1)]).pad_to_arity(3, PartialSearchMode::HighestBoundary);
        assert_eq!(
            low,
            Key::composite([Key::Integer(1), Key::AlwaysLess, Key::AlwaysLess])
        );

        let full = Key::composite([Key::Integer(1), Key::from("x"), Key::Integer(9)]);
        assert!(low < full);
        assert!(full < high);
    }

    #[test]
    fn test_padding_leaves_full_and_scalar_keys_alone() {
        let full = Key::composite([Key::Integer(1), Key::Integer(2)]);
        assert_eq!(
            full.clone()
                .pad_to_arity(2, PartialSearchMode::HighestBoundary),
            full
        );

        let partial = Key::composite([Key::Integer(1)]);
        assert_eq!(
            partial.clone().pad_to_arity(1, PartialSearchMode::HighestBoundary),
            partial
        );
        assert_eq!(
            partial.clone().pad_to_arity(3, PartialSearchMode::None),
            partial
        );
        assert_eq!(
            Key::Integer(4).pad_to_arity(3, PartialSearchMode::LowestBoundary),
            Key::Integer(4)
        );
    }

    #[test]
    fn test_bound_modes() {
        assert_eq!(
            PartialSearchMode::for_lower_bound(true),
            PartialSearchMode::LowestBoundary
        );
        assert_eq!(
            PartialSearchMode::for_lower_bound(false),
            PartialSearchMode::HighestBoundary
        );
        assert_eq!(
            PartialSearchMode::for_upper_bound(true),
            PartialSearchMode::HighestBoundary
        );
        assert_eq!(
            PartialSearchMode::for_upper_bound(false),
            PartialSearchMode::LowestBoundary
        );
    }

    #[test]
    fn test_display() {
        let key = Key::composite([Key::Integer(3), Key::from("x"), Key::Binary(vec![1, 171])]);
        assert_eq!(key.to_string(), "[3, \"x\", 0x01ab]");
    }
}
