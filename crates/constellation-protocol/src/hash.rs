//! 16-byte name-derived identifiers for groups, hosts and service topics.

use std::fmt;

use md5::{Digest, Md5};

/// MD5 digest of a UTF-8 name. Used as `group_id` and `host_id` on the
/// CHIRP wire; equality is bytewise, ordering lexicographic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Md5Hash([u8; 16]);

impl Md5Hash {
    /// Hash a name. Identical names always produce identical identifiers.
    pub fn new(name: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(name.as_bytes());
        Md5Hash(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Md5Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Md5Hash {
    /// Lowercase hex rendering, two characters per byte.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<&str> for Md5Hash {
    fn from(name: &str) -> Self {
        Md5Hash::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // md5("") is the classic empty-input vector
        assert_eq!(
            Md5Hash::new("").to_string(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            Md5Hash::new("edda").to_string(),
            Md5Hash::new("edda").to_string()
        );
    }

    #[test]
    fn equal_names_equal_ids() {
        assert_eq!(Md5Hash::new("sat1"), Md5Hash::new("sat1"));
        assert_ne!(Md5Hash::new("sat1"), Md5Hash::new("sat2"));
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = Md5Hash::from_bytes([0; 16]);
        let mut high = [0u8; 16];
        high[0] = 1;
        let b = Md5Hash::from_bytes(high);
        assert!(a < b);
        assert!(!(a < a));
    }
}
