//! Key serializers.
//!
//! The tree stores keys as opaque byte strings and compares them after
//! decoding, so every key type comes with a [`KeySerializer`]. The
//! serializer id is written into redo records so a replay can tell which
//! encoding a stored key uses.

use crate::types::key::{Key, KeyType};

/// Errors raised while encoding, decoding or coercing a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Input ended before the value was complete.
    Truncated { needed: usize, available: usize },
    /// Unknown type tag.
    InvalidTag(u8),
    /// String component is not valid UTF-8.
    InvalidUtf8,
    /// Bytes remained after the value was decoded.
    TrailingBytes(usize),
    /// A component cannot be converted to its declared type.
    Coercion { component: usize, message: String },
    /// A length does not fit the on-disk length field.
    TooLong(usize),
    /// A range boundary sentinel was offered for storage.
    BoundarySentinel,
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "truncated key: needed {needed} bytes, {available} available")
            }
            Self::InvalidTag(tag) => write!(f, "invalid key tag: 0x{tag:02x}"),
            Self::InvalidUtf8 => write!(f, "key string is not valid UTF-8"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after key"),
            Self::Coercion { component, message } => {
                write!(f, "cannot coerce key component {component}: {message}")
            }
            Self::TooLong(len) => write!(f, "key component too long: {len} bytes"),
            Self::BoundarySentinel => {
                write!(f, "range boundary sentinels cannot be stored as keys")
            }
        }
    }
}

impl std::error::Error for KeyError {}

/// Binary encoding of one key type.
pub trait KeySerializer<K>: Send + Sync {
    /// Identifier recorded alongside serialized keys.
    fn id(&self) -> u8;

    /// Normalize a key before it is stored or searched.
    ///
    /// `key_types` holds the declared type of each key component; an empty
    /// slice means "no hints".
    fn preprocess(&self, key: K, key_types: &[KeyType]) -> Result<K, KeyError> {
        let _ = key_types;
        Ok(key)
    }

    /// Encode a key.
    fn serialize(&self, key: &K) -> Result<Vec<u8>, KeyError>;

    /// Decode a key produced by [`serialize`](Self::serialize).
    fn deserialize(&self, bytes: &[u8]) -> Result<K, KeyError>;
}

/// Serializer for plain `i64` keys: 8 bytes little-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongSerializer;

impl LongSerializer {
    pub const ID: u8 = 10;
}

impl KeySerializer<i64> for LongSerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn serialize(&self, key: &i64) -> Result<Vec<u8>, KeyError> {
        Ok(key.to_le_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<i64, KeyError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| {
            if bytes.len() < 8 {
                KeyError::Truncated {
                    needed: 8,
                    available: bytes.len(),
                }
            } else {
                KeyError::TrailingBytes(bytes.len() - 8)
            }
        })?;
        Ok(i64::from_le_bytes(raw))
    }
}

const TAG_ALWAYS_LESS: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_BINARY: u8 = 3;
const TAG_COMPOSITE: u8 = 4;
const TAG_ALWAYS_GREATER: u8 = 5;

/// Serializer for [`Key`].
///
/// Each value is a tag byte followed by its payload:
/// - integer: `i64` little-endian
/// - string / binary: `u32` length, then the bytes
/// - composite: `u32` component count, then each component
/// - sentinels: tag only
#[derive(Debug, Clone, Copy, Default)]
pub struct CompositeKeySerializer;

impl CompositeKeySerializer {
    pub const ID: u8 = 14;

    fn encode(key: &Key, out: &mut Vec<u8>) -> Result<(), KeyError> {
        match key {
            Key::AlwaysLess => out.push(TAG_ALWAYS_LESS),
            Key::AlwaysGreater => out.push(TAG_ALWAYS_GREATER),
            Key::Integer(value) => {
                out.push(TAG_INTEGER);
                out.extend_from_slice(&value.to_le_bytes());
            }
            Key::String(value) => {
                out.push(TAG_STRING);
                encode_len(value.len(), out)?;
                out.extend_from_slice(value.as_bytes());
            }
            Key::Binary(bytes) => {
                out.push(TAG_BINARY);
                encode_len(bytes.len(), out)?;
                out.extend_from_slice(bytes);
            }
            Key::Composite(parts) => {
                out.push(TAG_COMPOSITE);
                encode_len(parts.len(), out)?;
                for part in parts {
                    Self::encode(part, out)?;
                }
            }
        }
        Ok(())
    }

    fn decode(input: &mut Reader<'_>) -> Result<Key, KeyError> {
        let tag = input.take(1)?[0];
        match tag {
            TAG_ALWAYS_LESS => Ok(Key::AlwaysLess),
            TAG_ALWAYS_GREATER => Ok(Key::AlwaysGreater),
            TAG_INTEGER => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(input.take(8)?);
                Ok(Key::Integer(i64::from_le_bytes(raw)))
            }
            TAG_STRING => {
                let len = input.read_len()?;
                let bytes = input.take(len)?;
                let value = std::str::from_utf8(bytes).map_err(|_| KeyError::InvalidUtf8)?;
                Ok(Key::String(value.to_string()))
            }
            TAG_BINARY => {
                let len = input.read_len()?;
                Ok(Key::Binary(input.take(len)?.to_vec()))
            }
            TAG_COMPOSITE => {
                let count = input.read_len()?;
                let mut parts = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    parts.push(Self::decode(input)?);
                }
                Ok(Key::Composite(parts))
            }
            other => Err(KeyError::InvalidTag(other)),
        }
    }

    fn coerce(key: Key, key_type: KeyType, component: usize) -> Result<Key, KeyError> {
        match (key, key_type) {
            (Key::String(value), KeyType::Integer) => {
                value
                    .trim()
                    .parse::<i64>()
                    .map(Key::Integer)
                    .map_err(|e| KeyError::Coercion {
                        component,
                        message: format!("{value:?} is not an integer: {e}"),
                    })
            }
            (Key::Integer(value), KeyType::String) => Ok(Key::String(value.to_string())),
            (Key::String(value), KeyType::Binary) => Ok(Key::Binary(value.into_bytes())),
            (key, _) => Ok(key),
        }
    }
}

impl KeySerializer<Key> for CompositeKeySerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn preprocess(&self, key: Key, key_types: &[KeyType]) -> Result<Key, KeyError> {
        match key {
            Key::Composite(parts) => parts
                .into_iter()
                .enumerate()
                .map(|(i, part)| match key_types.get(i) {
                    Some(key_type) => Self::coerce(part, *key_type, i),
                    None => Ok(part),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Key::Composite),
            key => match key_types.first() {
                Some(key_type) => Self::coerce(key, *key_type, 0),
                None => Ok(key),
            },
        }
    }

    fn serialize(&self, key: &Key) -> Result<Vec<u8>, KeyError> {
        let mut out = Vec::with_capacity(16);
        Self::encode(key, &mut out)?;
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Key, KeyError> {
        let mut reader = Reader { bytes, pos: 0 };
        let key = Self::decode(&mut reader)?;
        let rest = bytes.len() - reader.pos;
        if rest > 0 {
            return Err(KeyError::TrailingBytes(rest));
        }
        Ok(key)
    }
}

fn encode_len(len: usize, out: &mut Vec<u8>) -> Result<(), KeyError> {
    let len32 = u32::try_from(len).map_err(|_| KeyError::TooLong(len))?;
    out.extend_from_slice(&len32.to_le_bytes());
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], KeyError> {
        let available = self.bytes.len() - self.pos;
        if n > available {
            return Err(KeyError::Truncated {
                needed: n,
                available,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_len(&mut self) -> Result<usize, KeyError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_key_encoding() {
        let serializer = CompositeKeySerializer;
        let key = Key::composite([
            Key::Integer(-7),
            Key::from("héllo"),
            Key::Binary(vec![0, 1, 2]),
            Key::composite([Key::AlwaysLess, Key::AlwaysGreater]),
        ]);
        let bytes = serializer.serialize(&key).expect("serialize");
        assert_eq!(bytes[0], TAG_COMPOSITE);
        assert_eq!(serializer.deserialize(&bytes).expect("deserialize"), key);
    }

    #[test]
    fn test_decode_rejects_damaged_input() {
        let serializer = CompositeKeySerializer;
        let bytes = serializer.serialize(&Key::from("abcdef")).expect("serialize");

        assert!(matches!(
            serializer.deserialize(&bytes[..bytes.len() - 1]),
            Err(KeyError::Truncated { .. })
        ));
        assert_eq!(
            serializer.deserialize(&[9]),
            Err(KeyError::InvalidTag(9))
        );

        let mut padded = bytes;
        padded.push(0);
        assert_eq!(serializer.deserialize(&padded), Err(KeyError::TrailingBytes(1)));
    }

    #[test]
    fn test_preprocess_coerces_components() {
        let serializer = CompositeKeySerializer;
        let key = Key::composite([Key::from(" 42 "), Key::Integer(5), Key::from("x")]);
        let coerced = serializer
            .preprocess(key, &[KeyType::Integer, KeyType::String])
            .expect("preprocess");
        assert_eq!(
            coerced,
            Key::composite([Key::Integer(42), Key::from("5"), Key::from("x")])
        );

        let scalar = serializer
            .preprocess(Key::from("ab"), &[KeyType::Binary])
            .expect("preprocess");
        assert_eq!(scalar, Key::Binary(b"ab".to_vec()));

        let err = serializer
            .preprocess(Key::composite([Key::from("nope")]), &[KeyType::Integer])
            .expect_err("not an integer");
        assert!(matches!(err, KeyError::Coercion { component: 0, .. }));
    }

    #[test]
    fn test_preprocess_without_hints_is_identity() {
        let key = Key::composite([Key::from("1")]);
        assert_eq!(
            CompositeKeySerializer.preprocess(key.clone(), &[]).expect("preprocess"),
            key
        );
    }

    #[test]
    fn test_long_serializer() {
        let bytes = LongSerializer.serialize(&-99).expect("serialize");
        assert_eq!(bytes.len(), 8);
        assert_eq!(LongSerializer.deserialize(&bytes), Ok(-99));
        assert!(matches!(
            LongSerializer.deserialize(&bytes[..3]),
            Err(KeyError::Truncated { needed: 8, available: 3 })
        ));
        assert_eq!(LongSerializer.deserialize(&[0; 9]), Err(KeyError::TrailingBytes(1)));
    }
}
