//! Keys, discovery keys, signatures and device identities.
//!
//! Core keys are Ed25519 public keys. A core's discovery key is a keyed
//! BLAKE3 hash of its public key: it can be shared freely to address a core
//! without revealing the key needed to verify (and therefore read) it.

use std::{fmt, str::FromStr};

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use minicbor::{Decode, Decoder, Encode, Encoder, decode, encode};

use crate::namespace::Namespace;

/// Size of an Ed25519 public key (and of every key-like id) in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Identity of a connected peer, as authenticated by the transport.
pub type PeerId = iroh::PublicKey;

const DISCOVERY_CONTEXT: &[u8] = b"canopy/discovery";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeyError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid hex encoding")]
    InvalidHex,

    #[error("not a valid ed25519 public key")]
    InvalidPublicKey,

    #[error("signature verification failed")]
    InvalidSignature,
}

macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name([u8; KEY_SIZE]);

        impl $name {
            pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// First five bytes as hex, for log output.
            pub fn fmt_short(&self) -> String {
                hex::encode(&self.0[..5])
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.fmt_short()).finish()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|_| KeyError::InvalidHex)?;
                Self::try_from(bytes.as_slice())
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = KeyError;

            fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
                let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
                    expected: KEY_SIZE,
                    actual: bytes.len(),
                })?;
                Ok(Self(arr))
            }
        }

        impl From<[u8; KEY_SIZE]> for $name {
            fn from(bytes: [u8; KEY_SIZE]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl<C> Encode<C> for $name {
            fn encode<W: encode::Write>(
                &self,
                e: &mut Encoder<W>,
                _ctx: &mut C,
            ) -> Result<(), encode::Error<W::Error>> {
                e.bytes(&self.0)?;
                Ok(())
            }
        }

        impl<'b, C> Decode<'b, C> for $name {
            fn decode(d: &mut Decoder<'b>, _ctx: &mut C) -> Result<Self, decode::Error> {
                let bytes = d.bytes()?;
                Self::try_from(bytes).map_err(|_| decode::Error::message("invalid key length"))
            }
        }
    };
}

key_type!(
    /// Public key of a core. Doubles as the core's id.
    CoreKey
);

key_type!(
    /// One-way, non-secret derivation of a [`CoreKey`].
    DiscoveryKey
);

key_type!(
    /// Identity of a device: the public half of its identity keypair.
    ///
    /// Rendered as lowercase hex, which is also the doc id of the device's
    /// core ownership and role records.
    DeviceId
);

impl CoreKey {
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey(*blake3::keyed_hash(&self.0, DISCOVERY_CONTEXT).as_bytes())
    }

    /// Verifies `signature` over `message` against this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), KeyError> {
        verify(&self.0, message, signature)
    }
}

impl DeviceId {
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), KeyError> {
        verify(&self.0, message, signature)
    }
}

impl From<&PeerId> for DeviceId {
    fn from(peer: &PeerId) -> Self {
        DeviceId(*peer.as_bytes())
    }
}

fn verify(key: &[u8; KEY_SIZE], message: &[u8], signature: &Signature) -> Result<(), KeyError> {
    let key = VerifyingKey::from_bytes(key).map_err(|_| KeyError::InvalidPublicKey)?;
    let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
    key.verify(message, &signature)
        .map_err(|_| KeyError::InvalidSignature)
}

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    pub const fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature")
            .field(&hex::encode(&self.0[..8]))
            .finish()
    }
}

impl<C> Encode<C> for Signature {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), encode::Error<W::Error>> {
        e.bytes(&self.0)?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for Signature {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut C) -> Result<Self, decode::Error> {
        let bytes = d.bytes()?;
        let arr: [u8; SIGNATURE_SIZE] = bytes
            .try_into()
            .map_err(|_| decode::Error::message("invalid signature length"))?;
        Ok(Self(arr))
    }
}

/// An Ed25519 keypair. Used both for writer cores and device identities.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn from_secret_bytes(secret: [u8; KEY_SIZE]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn secret_bytes(&self) -> [u8; KEY_SIZE] {
        self.signing_key.to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        *self.signing_key.verifying_key().as_bytes()
    }

    /// The public key, viewed as a core key.
    pub fn core_key(&self) -> CoreKey {
        CoreKey(self.public_bytes())
    }

    /// The public key, viewed as a device identity.
    pub fn device_id(&self) -> DeviceId {
        DeviceId(self.public_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.core_key())
            .finish_non_exhaustive()
    }
}

impl From<&iroh::SecretKey> for Keypair {
    fn from(secret: &iroh::SecretKey) -> Self {
        Self::from_secret_bytes(secret.to_bytes())
    }
}

/// Derives the writer keypair of `namespace` for the device owning
/// `root_key`, within the project identified by `project_key`.
///
/// The derivation is deterministic, so writer cores are re-created on every
/// start instead of being persisted.
pub fn derive_writer_keypair(
    root_key: &[u8; KEY_SIZE],
    project_key: &CoreKey,
    namespace: Namespace,
) -> Keypair {
    let context = match namespace {
        Namespace::Auth => "canopy/core/auth",
        Namespace::Config => "canopy/core/config",
        Namespace::Data => "canopy/core/data",
        Namespace::BlobIndex => "canopy/core/blobIndex",
        Namespace::Blob => "canopy/core/blob",
    };
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(project_key.as_bytes());
    hasher.update(root_key);
    Keypair::from_secret_bytes(*hasher.finalize().as_bytes())
}
