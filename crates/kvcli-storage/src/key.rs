//! Bounded-length device keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Maximum key length accepted by the device, in bytes.
pub const MAX_KEY_LEN: usize = 16;

/// A device key of at most [`MAX_KEY_LEN`] bytes.
///
/// Keys used to address a value are never empty. A list prefix may be empty,
/// meaning "all keys"; build those with [`Key::prefix`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Creates a value key (1..=[`MAX_KEY_LEN`] bytes).
    pub fn new(bytes: impl Into<Vec<u8>>) -> StorageResult<Self> {
        Self::bounded(bytes.into(), 1)
    }

    /// Creates a list prefix (0..=[`MAX_KEY_LEN`] bytes).
    pub fn prefix(bytes: impl Into<Vec<u8>>) -> StorageResult<Self> {
        Self::bounded(bytes.into(), 0)
    }

    fn bounded(bytes: Vec<u8>, min: usize) -> StorageResult<Self> {
        if bytes.len() < min || bytes.len() > MAX_KEY_LEN {
            return Err(StorageError::InvalidKey {
                len: bytes.len(),
                min,
                max: MAX_KEY_LEN,
            });
        }
        Ok(Self(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty prefix.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Key {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::new(s.as_bytes())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_bounds() {
        assert!(Key::new("a").is_ok());
        assert!(Key::new("0123456789abcdef").is_ok());
        assert!(matches!(
            Key::new("0123456789abcdefg"),
            Err(StorageError::InvalidKey { len: 17, .. })
        ));
        assert!(matches!(
            Key::new(""),
            Err(StorageError::InvalidKey { len: 0, min: 1, .. })
        ));
    }

    #[test]
    fn test_empty_prefix_allowed() {
        let prefix = Key::prefix("").unwrap();
        assert!(prefix.is_empty());
        assert!(Key::prefix(vec![b'x'; MAX_KEY_LEN + 1]).is_err());
    }

    #[test]
    fn test_from_str_and_display() {
        let key: Key = "sales.csv".parse().unwrap();
        assert_eq!(key.as_bytes(), b"sales.csv");
        assert_eq!(key.len(), 9);
        assert_eq!(format!("{}", key), "sales.csv");
    }
}
