pub mod encryption;
pub mod key;
pub mod rid;
pub mod serializer;

pub use encryption::{Encryption, EncryptionError};
pub use key::{IndexKey, Key, KeyType, PartialSearchMode};
pub use rid::{RID_SIZE, Rid};
pub use serializer::{CompositeKeySerializer, KeyError, KeySerializer, LongSerializer};
