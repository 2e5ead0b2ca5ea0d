//! Messages exchanged over a replication session, next to the cores
//! themselves.
//!
//! Field numbers are part of the protocol and must never be reused.

use std::io;

use bytes::{Bytes, BytesMut};
use minicbor::{Decode, Decoder, Encode, Encoder};
use tokio_util::codec::{Decoder as _, Encoder as _, LengthDelimitedCodec};

use crate::{
    bitfield::{Bitfield, rle},
    keys::{CoreKey, DiscoveryKey},
    namespace::{Namespace, NamespaceMap},
};

/// Frames larger than this are rejected by [`ExtensionCodec`].
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum WireError {
    #[error("decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("encode: {0}")]
    Encode(String),
    #[error("bitfield: {0}")]
    Bitfield(#[from] rle::RleError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
#[cbor(flat)]
pub enum ExtensionMessage {
    #[n(0)]
    Project(#[n(0)] ProjectExtension),
    #[n(1)]
    Have(#[n(0)] HaveExtension),
}

/// Exchange of core keys. Sent once on connect with our auth keys, and
/// again whenever we need the key behind a discovery key we were told about.
#[derive(Encode, Decode, Clone, Debug, Default, PartialEq, Eq)]
#[cbor(map)]
pub struct ProjectExtension {
    #[n(0)]
    #[cbor(default)]
    pub want_core_keys: Vec<DiscoveryKey>,
    #[n(1)]
    #[cbor(default)]
    pub auth_core_keys: Vec<CoreKey>,
    #[n(2)]
    #[cbor(default)]
    pub config_core_keys: Vec<CoreKey>,
    #[n(3)]
    #[cbor(default)]
    pub data_core_keys: Vec<CoreKey>,
    #[n(4)]
    #[cbor(default)]
    pub blob_index_core_keys: Vec<CoreKey>,
    #[n(5)]
    #[cbor(default)]
    pub blob_core_keys: Vec<CoreKey>,
}

impl ProjectExtension {
    pub fn keys(&self, namespace: Namespace) -> &[CoreKey] {
        match namespace {
            Namespace::Auth => &self.auth_core_keys,
            Namespace::Config => &self.config_core_keys,
            Namespace::Data => &self.data_core_keys,
            Namespace::BlobIndex => &self.blob_index_core_keys,
            Namespace::Blob => &self.blob_core_keys,
        }
    }

    pub fn push_key(&mut self, namespace: Namespace, key: CoreKey) {
        let keys = match namespace {
            Namespace::Auth => &mut self.auth_core_keys,
            Namespace::Config => &mut self.config_core_keys,
            Namespace::Data => &mut self.data_core_keys,
            Namespace::BlobIndex => &mut self.blob_index_core_keys,
            Namespace::Blob => &mut self.blob_core_keys,
        };
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    /// All carried keys grouped by namespace.
    pub fn by_namespace(&self) -> NamespaceMap<&[CoreKey]> {
        NamespaceMap::from_fn(|ns| self.keys(ns))
    }

    pub fn is_empty(&self) -> bool {
        self.want_core_keys.is_empty() && Namespace::ALL.iter().all(|&ns| self.keys(ns).is_empty())
    }
}

/// Namespace tag as seen on the wire. Values added by newer peers decode as
/// [`WireNamespace::Unrecognized`] instead of failing the whole message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireNamespace {
    Known(Namespace),
    Unrecognized(u32),
}

impl From<Namespace> for WireNamespace {
    fn from(ns: Namespace) -> Self {
        WireNamespace::Known(ns)
    }
}

impl<C> Encode<C> for WireNamespace {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        let value = match self {
            WireNamespace::Known(ns) => ns.to_wire(),
            WireNamespace::Unrecognized(v) => *v,
        };
        e.u32(value)?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for WireNamespace {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        let value = d.u32()?;
        Ok(Namespace::from_wire(value)
            .map(WireNamespace::Known)
            .unwrap_or(WireNamespace::Unrecognized(value)))
    }
}

/// Announces which blocks of a core we have, within a window starting at
/// `start`.
#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct HaveExtension {
    #[n(0)]
    pub start: u32,
    #[n(1)]
    pub discovery_key: DiscoveryKey,
    #[n(2)]
    #[cbor(with = "minicbor::bytes")]
    pub encoded_bitfield: Vec<u8>,
    #[n(3)]
    pub namespace: WireNamespace,
}

impl HaveExtension {
    /// Builds a have message covering `[start, bitfield.len())`.
    pub fn new(
        namespace: Namespace,
        discovery_key: DiscoveryKey,
        start: u32,
        bitfield: &Bitfield,
    ) -> Self {
        let start64 = u64::from(start);
        let len = bitfield.len().saturating_sub(start64);
        Self {
            start,
            discovery_key,
            encoded_bitfield: rle::encode(bitfield, start64, len),
            namespace: namespace.into(),
        }
    }

    /// The announced bits, relative to `start`, and the window length.
    pub fn bitfield(&self) -> Result<(Bitfield, u64), rle::RleError> {
        rle::decode(&self.encoded_bitfield)
    }
}

/// Envelope of a project invitation.
#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct Invite {
    #[n(0)]
    pub project_key: CoreKey,
    #[n(1)]
    pub encryption_key: Option<minicbor::bytes::ByteVec>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InviteDecision {
    Reject,
    Accept,
    Unrecognized(u32),
}

impl<C> Encode<C> for InviteDecision {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        let value = match self {
            InviteDecision::Reject => 0,
            InviteDecision::Accept => 1,
            InviteDecision::Unrecognized(v) => *v,
        };
        e.u32(value)?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for InviteDecision {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(match d.u32()? {
            0 => InviteDecision::Reject,
            1 => InviteDecision::Accept,
            v => InviteDecision::Unrecognized(v),
        })
    }
}

#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct InviteResponse {
    #[n(0)]
    pub project_key: CoreKey,
    #[n(1)]
    pub decision: InviteDecision,
}

pub fn encode<T: Encode<()>>(value: &T) -> Result<Vec<u8>, WireError> {
    minicbor::to_vec(value).map_err(|e| WireError::Encode(e.to_string()))
}

pub fn decode<'b, T: Decode<'b, ()>>(bytes: &'b [u8]) -> Result<T, WireError> {
    Ok(minicbor::decode(bytes)?)
}

/// Length-delimited framing of [`ExtensionMessage`]s.
#[derive(Debug)]
pub struct ExtensionCodec {
    inner: LengthDelimitedCodec,
}

impl ExtensionCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for ExtensionCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl tokio_util::codec::Decoder for ExtensionCodec {
    type Item = ExtensionMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(decode(&frame)?)),
            None => Ok(None),
        }
    }
}

impl tokio_util::codec::Encoder<ExtensionMessage> for ExtensionCodec {
    type Error = WireError;

    fn encode(&mut self, item: ExtensionMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = encode(&item)?;
        self.inner.encode(Bytes::from(frame), dst)?;
        Ok(())
    }
}
