// Smolswarm
// Copyright (C) 2019-2022  Parity Technologies (UK) Ltd.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Swarm identity and content authentication primitives.
//!
//! A live swarm is identified by the public key of its source: every receiver that knows the
//! public key can verify that a chunk ultimately descends from a tree peak signed by the source.
//! A static (file) swarm is instead identified by the root hash of its Merkle tree. The
//! [`SwarmId`] type covers both cases.
//!
//! The content hashes themselves are SHA-1, as mandated by the peer protocol. Signatures are
//! ed25519; the rest of the crate is agnostic to the scheme and only manipulates the opaque
//! [`Signature`] type.

use crate::util;

use core::fmt;

/// 20-bytes SHA-1 hash of either a chunk of content or the concatenation of two child hashes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha1Hash(pub [u8; 20]);

impl Sha1Hash {
    /// Number of bytes of a hash.
    pub const SIZE: usize = 20;

    /// The distinguished all-zeroes hash, used as "no hash known" in tree nodes and as padding
    /// when deriving a root over an incomplete rightmost subtree.
    pub const ZERO: Sha1Hash = Sha1Hash([0; 20]);

    /// Hashes a chunk of content into a leaf hash.
    pub fn from_content(data: &[u8]) -> Sha1Hash {
        let mut hasher = <sha1::Sha1 as sha1::Digest>::new();
        sha1::Digest::update(&mut hasher, data);
        Sha1Hash(sha1::Digest::finalize(hasher).into())
    }

    /// Hashes the concatenation of two child hashes into their parent hash.
    pub fn from_children(left: &Sha1Hash, right: &Sha1Hash) -> Sha1Hash {
        let mut hasher = <sha1::Sha1 as sha1::Digest>::new();
        sha1::Digest::update(&mut hasher, left.0);
        sha1::Digest::update(&mut hasher, right.0);
        Sha1Hash(sha1::Digest::finalize(hasher).into())
    }

    /// Returns the bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns `true` if this is [`Sha1Hash::ZERO`].
    pub fn is_zero(&self) -> bool {
        *self == Sha1Hash::ZERO
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        util::write_hex(f, &self.0)
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        util::write_hex(f, &self.0)
    }
}

/// Opaque signature over a tree peak. The length is fixed by the key type; with ed25519 keys it
/// is always 64 bytes.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Number of bytes of a signature.
    pub const SIZE: usize = 64;

    /// Builds a signature from its raw bytes, without checking anything.
    pub fn from_bytes(bytes: [u8; 64]) -> Signature {
        Signature(bytes)
    }

    /// Returns the bytes of the signature.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        util::write_hex(f, &self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        util::write_hex(f, &self.0)
    }
}

/// Ed25519 key pair held by a live source.
///
/// This module doesn't give access to the secret key itself, only to signing capabilities.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: ed25519_zebra::SigningKey,
    public_key: PublicKey,
}

impl KeyPair {
    /// Deterministically builds a key pair from 32 bytes of entropy.
    pub fn from_seed(seed: [u8; 32]) -> KeyPair {
        let signing_key = ed25519_zebra::SigningKey::from(seed);
        let public_key = PublicKey(ed25519_zebra::VerificationKey::from(&signing_key).into());
        KeyPair {
            signing_key,
            public_key,
        }
    }

    /// Returns the public half of the key pair. This is the swarm identifier of the live streams
    /// this key pair is the source of.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Signs a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).into())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyPair").field(&self.public_key).finish()
    }
}

/// Ed25519 public key of a swarm source.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Verifies whether the given signature is valid for the given message using `self` as the
    /// public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureVerifyFailed> {
        let public_key = ed25519_zebra::VerificationKey::try_from(self.0)
            .map_err(|_| SignatureVerifyFailed())?;
        let signature = ed25519_zebra::Signature::from(signature.0);
        public_key
            .verify(&signature, message)
            .map_err(|_| SignatureVerifyFailed())?;
        Ok(())
    }

    /// Returns the bytes of the public key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        util::write_hex(f, &self.0)
    }
}

/// Call to [`PublicKey::verify`] has failed. No reason is provided for security reasons.
#[derive(Debug, derive_more::Display)]
pub struct SignatureVerifyFailed();

/// Identifier of the swarm a transfer belongs to.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum SwarmId {
    /// Static content swarm, identified by the root hash of its Merkle tree.
    RootHash(Sha1Hash),
    /// Live swarm, identified by the public key of its source.
    PublicKey(PublicKey),
}

impl SwarmId {
    /// Derives the 20-bytes infohash used when announcing this swarm to a BitTorrent tracker.
    ///
    /// For a static swarm this is the root hash itself. For a live swarm, whose identifier is
    /// longer than 20 bytes, the public key is hashed down.
    pub fn info_hash(&self) -> Sha1Hash {
        match self {
            SwarmId::RootHash(hash) => *hash,
            SwarmId::PublicKey(key) => Sha1Hash::from_content(&key.0),
        }
    }
}
