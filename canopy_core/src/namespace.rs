//! The five fixed namespaces a project's cores are partitioned into.
//!
//! Every device owns exactly one writer core per namespace. Namespaces
//! double as the key-derivation salt for those writer cores and as the unit
//! of sync policy (a role allows or blocks syncing per namespace).

use std::{
    fmt,
    ops::{Index, IndexMut},
    str::FromStr,
};

use minicbor::{Decode, Decoder, Encode, Encoder, decode, encode};

/// A namespace tag. The declaration order is the canonical order used by
/// [`NamespaceMap`] and on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
#[cbor(index_only)]
pub enum Namespace {
    #[n(0)]
    Auth,
    #[n(1)]
    Config,
    #[n(2)]
    Data,
    #[n(3)]
    BlobIndex,
    #[n(4)]
    Blob,
}

/// Namespaces synced eagerly, before (and independent of) data sync.
pub const PRESYNC_NAMESPACES: [Namespace; 3] =
    [Namespace::Auth, Namespace::Config, Namespace::BlobIndex];

/// Namespaces only synced once data sync is enabled.
pub const DATA_NAMESPACES: [Namespace; 2] = [Namespace::Data, Namespace::Blob];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown namespace: {0}")]
pub struct UnknownNamespace(pub String);

impl Namespace {
    pub const COUNT: usize = 5;

    pub const ALL: [Namespace; Self::COUNT] = [
        Namespace::Auth,
        Namespace::Config,
        Namespace::Data,
        Namespace::BlobIndex,
        Namespace::Blob,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Namespace::Auth => "auth",
            Namespace::Config => "config",
            Namespace::Data => "data",
            Namespace::BlobIndex => "blobIndex",
            Namespace::Blob => "blob",
        }
    }

    /// Position of the namespace in [`Namespace::ALL`].
    pub const fn index(&self) -> usize {
        *self as usize
    }

    /// Wire value used by the have extension.
    pub const fn to_wire(&self) -> u32 {
        *self as u32
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn is_presync(&self) -> bool {
        PRESYNC_NAMESPACES.contains(self)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = UnknownNamespace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| UnknownNamespace(s.to_string()))
    }
}

/// A fixed-size map with exactly one value per [`Namespace`].
///
/// Lookups cannot miss, so code that needs "one X per namespace" (writer
/// cores, sync capabilities, per-namespace state) never has to handle an
/// absent entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NamespaceMap<T>([T; Namespace::COUNT]);

impl<T> NamespaceMap<T> {
    /// Values in [`Namespace::ALL`] order.
    pub const fn from_array(values: [T; Namespace::COUNT]) -> Self {
        Self(values)
    }

    pub fn from_fn(mut f: impl FnMut(Namespace) -> T) -> Self {
        Self(std::array::from_fn(|i| f(Namespace::ALL[i])))
    }

    pub fn try_from_fn<E>(mut f: impl FnMut(Namespace) -> Result<T, E>) -> Result<Self, E> {
        let mut values = Vec::with_capacity(Namespace::COUNT);
        for ns in Namespace::ALL {
            values.push(f(ns)?);
        }
        let Ok(values) = <[T; Namespace::COUNT]>::try_from(values) else {
            unreachable!("one value per namespace");
        };
        Ok(Self(values))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Namespace, &T)> {
        Namespace::ALL.into_iter().zip(self.0.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Namespace, &mut T)> {
        Namespace::ALL.into_iter().zip(self.0.iter_mut())
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    pub fn map<U>(&self, mut f: impl FnMut(Namespace, &T) -> U) -> NamespaceMap<U> {
        NamespaceMap::from_fn(|ns| f(ns, &self[ns]))
    }
}

impl<T> Index<Namespace> for NamespaceMap<T> {
    type Output = T;

    fn index(&self, ns: Namespace) -> &T {
        &self.0[ns.index()]
    }
}

impl<T> IndexMut<Namespace> for NamespaceMap<T> {
    fn index_mut(&mut self, ns: Namespace) -> &mut T {
        &mut self.0[ns.index()]
    }
}

impl<C, T: Encode<C>> Encode<C> for NamespaceMap<T> {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), encode::Error<W::Error>> {
        e.array(Namespace::COUNT as u64)?;
        for value in &self.0 {
            value.encode(e, ctx)?;
        }
        Ok(())
    }
}

impl<'b, C, T: Decode<'b, C>> Decode<'b, C> for NamespaceMap<T> {
    fn decode(d: &mut Decoder<'b>, ctx: &mut C) -> Result<Self, decode::Error> {
        if d.array()? != Some(Namespace::COUNT as u64) {
            return Err(decode::Error::message("expected one entry per namespace"));
        }
        let auth = T::decode(d, ctx)?;
        let config = T::decode(d, ctx)?;
        let data = T::decode(d, ctx)?;
        let blob_index = T::decode(d, ctx)?;
        let blob = T::decode(d, ctx)?;
        Ok(Self([auth, config, data, blob_index, blob]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_string_roundtrip() {
        for ns in Namespace::ALL {
            assert_eq!(ns.as_str().parse::<Namespace>().unwrap(), ns);
        }
        assert_eq!(
            "blobindex".parse::<Namespace>().unwrap_err(),
            UnknownNamespace("blobindex".to_string())
        );
    }

    #[test]
    fn test_wire_values_are_stable() {
        assert_eq!(Namespace::Auth.to_wire(), 0);
        assert_eq!(Namespace::Blob.to_wire(), 4);
        assert_eq!(Namespace::from_wire(3), Some(Namespace::BlobIndex));
        assert_eq!(Namespace::from_wire(5), None);
    }

    #[test]
    fn test_presync_partition() {
        let presync: Vec<_> = Namespace::ALL.into_iter().filter(|ns| ns.is_presync()).collect();
        assert_eq!(presync, PRESYNC_NAMESPACES);
        for ns in DATA_NAMESPACES {
            assert!(!ns.is_presync());
        }
    }

    #[test]
    fn test_namespace_map_indexing() {
        let mut map = NamespaceMap::from_fn(|ns| ns.index());
        assert_eq!(map[Namespace::Data], 2);
        map[Namespace::Data] = 42;
        assert_eq!(map[Namespace::Data], 42);
        let names: Vec<_> = map.iter().map(|(ns, _)| ns.as_str()).collect();
        assert_eq!(names, ["auth", "config", "data", "blobIndex", "blob"]);
    }

    #[test]
    fn test_namespace_map_cbor() {
        let map = NamespaceMap::from_fn(|ns| ns.to_wire() * 10);
        let bytes = minicbor::to_vec(&map).unwrap();
        let decoded: NamespaceMap<u32> = minicbor::decode(&bytes).unwrap();
        assert_eq!(decoded, map);

        let short = minicbor::to_vec([1u32, 2, 3]).unwrap();
        assert!(minicbor::decode::<NamespaceMap<u32>>(&short).is_err());
    }
}
