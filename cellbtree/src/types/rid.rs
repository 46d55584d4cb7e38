//! Record identifiers.
//!
//! A `Rid` names one stored record: the cluster it lives in and its
//! position inside that cluster. It is the value type of every index
//! entry and has a fixed 10-byte encoding.

use std::fmt;

/// Encoded size of a [`Rid`] in bytes (2 + 8).
pub const RID_SIZE: usize = 10;

/// A record identifier.
///
/// Ordering is by cluster id, then position. The tree never relies on it
/// beyond equality; it exists so callers can sort value lists in tests and
/// reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Rid {
    pub cluster_id: i16,
    pub cluster_position: i64,
}

impl Rid {
    /// Create a record identifier.
    #[must_use]
    pub const fn new(cluster_id: i16, cluster_position: i64) -> Self {
        Self {
            cluster_id,
            cluster_position,
        }
    }

    /// Serialize to the fixed 10-byte little-endian form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; RID_SIZE] {
        let mut buf = [0u8; RID_SIZE];
        buf[..2].copy_from_slice(&self.cluster_id.to_le_bytes());
        buf[2..].copy_from_slice(&self.cluster_position.to_le_bytes());
        buf
    }

    /// Deserialize from the first [`RID_SIZE`] bytes of `bytes`.
    ///
    /// Returns `None` if fewer bytes are available.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..RID_SIZE)?;
        let cluster_id = i16::from_le_bytes([bytes[0], bytes[1]]);
        let mut position = [0u8; 8];
        position.copy_from_slice(&bytes[2..]);
        Some(Self {
            cluster_id,
            cluster_position: i64::from_le_bytes(position),
        })
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.cluster_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rid_bytes() {
        let rid = Rid::new(-3, 1 << 40);
        let bytes = rid.to_bytes();
        assert_eq!(Rid::from_bytes(&bytes), Some(rid));
        assert_eq!(Rid::from_bytes(&bytes[..9]), None);
    }

    #[test]
    fn test_rid_display() {
        assert_eq!(Rid::new(12, 34).to_string(), "#12:34");
    }
}
