//! Group and host identities.
//!
//! A satellite is addressed by its canonical name `type.name`; discovery
//! filters on the MD5 hashes of the group name and the canonical name, so
//! identities are fixed 16-byte values independent of string length.

use std::fmt;

use md5::{Digest, Md5};
use thiserror::Error;

/// Length of an identity hash in bytes.
pub const MD5_HASH_LEN: usize = 16;

/// 16-byte identity derived from a string via MD5.
///
/// Used as the group id and host id in CHIRP datagrams. The hash is an opaque
/// identifier; it carries no security properties.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Md5Hash([u8; MD5_HASH_LEN]);

impl Md5Hash {
    /// Hash an arbitrary string into an identity.
    #[must_use]
    pub fn new(input: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(input.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Construct from raw bytes, e.g. when decoding a CHIRP frame.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; MD5_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw hash bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; MD5_HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for Md5Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Md5Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Md5Hash").field(&self.to_string()).finish()
    }
}

impl From<&str> for Md5Hash {
    fn from(input: &str) -> Self {
        Self::new(input)
    }
}

/// Check whether a satellite type, instance or group name is valid.
///
/// Names are non-empty and restricted to `[A-Za-z0-9_]` so they can appear in
/// canonical names and monitoring topics without quoting.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Error returned when constructing a [`SatelliteName`] from invalid parts.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid satellite name part {part:?}, expected [A-Za-z0-9_]+")]
pub struct InvalidName {
    /// The offending name part.
    pub part: String,
}

/// The two-part name of a satellite: type (class) and instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SatelliteName {
    type_name: String,
    instance: String,
}

impl SatelliteName {
    /// Build a validated satellite name.
    ///
    /// # Errors
    /// Returns [`InvalidName`] if either part is empty or contains characters
    /// outside `[A-Za-z0-9_]`.
    pub fn new(type_name: impl Into<String>, instance: impl Into<String>) -> Result<Self, InvalidName> {
        let type_name = type_name.into();
        let instance = instance.into();
        for part in [&type_name, &instance] {
            if !is_valid_name(part) {
                return Err(InvalidName { part: part.clone() });
            }
        }
        Ok(Self { type_name, instance })
    }

    /// The satellite type (class) name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The satellite instance name.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The canonical `type.name` identifier.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}.{}", self.type_name, self.instance)
    }

    /// The host identity used for CHIRP filtering.
    #[must_use]
    pub fn host_id(&self) -> Md5Hash {
        Md5Hash::new(&self.canonical())
    }
}

impl fmt::Display for SatelliteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hash_is_deterministic() {
        assert_eq!(Md5Hash::new("edda"), Md5Hash::new("edda"));
        assert_ne!(Md5Hash::new("edda"), Md5Hash::new("Edda"));
    }

    #[test]
    fn md5_hash_matches_reference_vector() {
        // RFC 1321 test vector: MD5("abc")
        assert_eq!(
            Md5Hash::new("abc").to_string(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn md5_hash_roundtrips_bytes() {
        let hash = Md5Hash::new("Sputnik.one");
        assert_eq!(Md5Hash::from_bytes(*hash.as_bytes()), hash);
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("Sputnik_1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("bad name"));
        assert!(!is_valid_name("dot.ted"));
    }

    #[test]
    fn canonical_name_joins_parts() {
        let name = SatelliteName::new("Sputnik", "one").unwrap();
        assert_eq!(name.canonical(), "Sputnik.one");
        assert_eq!(name.host_id(), Md5Hash::new("Sputnik.one"));
    }

    #[test]
    fn invalid_parts_are_rejected() {
        assert!(SatelliteName::new("Sputnik", "").is_err());
        assert!(SatelliteName::new("Spu tnik", "one").is_err());
    }
}
