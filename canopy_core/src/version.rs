use std::{fmt, str::FromStr};

use minicbor::{Decode, Encode};

use crate::keys::{DiscoveryKey, KeyError};

/// Identifies one version of a record: the core it was appended to and
/// its index within that core.
///
/// Ordering compares the discovery key first, then the index. It has no
/// causal meaning; it is only used as a final deterministic tie-break.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
#[cbor(array)]
pub struct VersionId {
    #[n(0)]
    pub core_discovery_key: DiscoveryKey,
    #[n(1)]
    pub index: u64,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum VersionIdParseError {
    #[error("missing '/' separator")]
    MissingSeparator,
    #[error("invalid discovery key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("invalid index")]
    InvalidIndex,
}

impl VersionId {
    pub fn new(core_discovery_key: DiscoveryKey, index: u64) -> Self {
        Self {
            core_discovery_key,
            index,
        }
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.core_discovery_key, self.index)
    }
}

impl FromStr for VersionId {
    type Err = VersionIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, index) = s
            .split_once('/')
            .ok_or(VersionIdParseError::MissingSeparator)?;
        Ok(Self {
            core_discovery_key: key.parse()?,
            index: index
                .parse()
                .map_err(|_| VersionIdParseError::InvalidIndex)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse_roundtrip() {
        let v = VersionId::new(DiscoveryKey::from_bytes([0xab; 32]), 17);
        let s = v.to_string();
        assert!(s.ends_with("/17"));
        assert_eq!(s.parse::<VersionId>().unwrap(), v);
        assert_eq!(
            "abc".parse::<VersionId>().unwrap_err(),
            VersionIdParseError::MissingSeparator
        );
    }

    #[test]
    fn test_ordering_is_key_then_index() {
        let a = VersionId::new(DiscoveryKey::from_bytes([1; 32]), 9);
        let b = VersionId::new(DiscoveryKey::from_bytes([2; 32]), 0);
        let c = VersionId::new(DiscoveryKey::from_bytes([2; 32]), 1);
        assert!(a < b);
        assert!(b < c);
    }
}
