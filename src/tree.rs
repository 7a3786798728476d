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

//! Live Merkle hash tree.
//!
//! This module provides the [`LiveHashTree`] type, a dynamic append-only Merkle tree over the
//! chunks of a live stream.
//!
//! Contrary to the hash tree of a static file, whose dimensions and root are known before the
//! first byte is exchanged, the tree of a live stream grows while the stream is produced. The
//! tree therefore has no single root hash that could authenticate the content. Instead, the
//! stream source periodically signs the *peaks* of the tree (the roots of the maximal complete
//! subtrees covering the chunks produced so far). A signed peak is called a *munro*. Everything
//! below a munro can be authenticated against it with sibling hashes, and the munro itself is
//! authenticated by the source's signature.
//!
//! A [`LiveHashTree`] plays one of two roles:
//!
//! - At the source (see [`LiveHashTree::new_source`]), chunks are appended with
//!   [`LiveHashTree::add_data`] and batches of them are signed with
//!   [`LiveHashTree::add_signed_munro`]. The source holds the key pair of the swarm.
//! - At a client (see [`LiveHashTree::new_client`]), the tree starts empty and is reconstructed
//!   incrementally from hashes received from other peers, through
//!   [`LiveHashTree::offer_signed_peak_hash`], [`LiveHashTree::offer_hash`] and
//!   [`LiveHashTree::offer_data`]. The client only holds the public key of the swarm, and nothing
//!   enters its tree as *verified* unless it is covered by a correctly-signed munro.
//!
//! Old parts of the tree can be forgotten with [`LiveHashTree::prune_tree`] once they fall out
//! of the live discard window. Pruning frees the descendants of a subtree but keeps the hash of
//! its root, so that proofs for the remaining parts of the tree can still be served.
//!
//! Nodes are allocated in a slab and reference each other by index, with child-to-parent back
//! edges. Removal of a subtree always happens through its root, so an index stored in a node is
//! valid for as long as the node itself is alive.

use crate::bins::{self, binmap::Binmap, Bin};
use crate::identity::{KeyPair, PublicKey, Sha1Hash, Signature, SignatureVerifyFailed};

use arrayvec::ArrayVec;
use core::fmt;

pub mod checkpoint;

#[cfg(test)]
mod tests;

/// The authenticated unit a live source publishes: a tree peak, its hash, the signature of the
/// source over the two, and the time the signature was produced.
#[derive(Clone, PartialEq, Eq)]
pub struct MunroTuple {
    /// Bin of the signed peak.
    pub bin: Bin,
    /// Hash of the signed peak.
    pub hash: Sha1Hash,
    /// Signature of the source over [`signing_payload`]`(bin, hash)`.
    pub signature: Signature,
    /// Microseconds timestamp chosen by the source when signing. Opaque to this module.
    pub timestamp: i64,
}

impl fmt::Debug for MunroTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MunroTuple")
            .field("bin", &self.bin)
            .field("hash", &self.hash)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Returns the exact message whose signature makes `(bin, hash)` a munro.
pub fn signing_payload(bin: Bin, hash: &Sha1Hash) -> [u8; 28] {
    let mut out = [0; 28];
    out[..8].copy_from_slice(&bin.to_raw().to_be_bytes());
    out[8..].copy_from_slice(hash.as_bytes());
    out
}

/// Capability common to all the hash trees a content transfer can run over, whether the tree
/// belongs to a static file or a live stream. The channel layer is written against this
/// capability rather than against a concrete tree.
pub trait HashTree {
    /// Binmap of the chunks present and verified locally.
    fn ack_out(&self) -> &Binmap;
    /// Hash stored for the given bin, if any.
    fn hash(&self, bin: Bin) -> Option<&Sha1Hash>;
    /// Peak with the given index.
    ///
    /// # Panic
    ///
    /// Panics if `index` is out of range.
    ///
    fn peak(&self, index: usize) -> Bin;
    /// Number of peaks of the tree.
    fn peak_count(&self) -> usize;
    /// Size of the underlying content, in bytes.
    fn size(&self) -> u64;
    /// Size of a content chunk, in bytes.
    fn chunk_size(&self) -> u32;
    /// Injects a hash received from a remote. Returns `true` if the hash is known to be
    /// consistent with the tree.
    fn offer_hash(&mut self, bin: Bin, hash: Sha1Hash) -> bool;
    /// Injects a chunk of content received from a remote. Returns `true` if the chunk verified
    /// against a peak and has been accepted.
    fn offer_data(&mut self, bin: Bin, data: &[u8]) -> bool;
}

/// Error potentially returned by [`LiveHashTree::offer_signed_peak_hash`].
#[derive(Debug, derive_more::Display)]
pub enum OfferSignedPeakError {
    /// The tree is a source tree; only client trees accept peaks from the network.
    NotClient,
    /// No hash was previously offered for this bin, so there is nothing to check the signature
    /// against.
    NoCandidateHash,
    /// Signature verification failed.
    #[display(fmt = "Signature verification failed")]
    BadSignature(SignatureVerifyFailed),
    /// The tree already tracks the maximum number of disjoint peaks.
    TooManyPeaks,
}

/// Error potentially returned by [`LiveHashTree::offer_data`].
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq)]
pub enum OfferDataError {
    /// No signed peak has been received yet; chunks can't be verified.
    AwaitingSignedPeak,
    /// The given bin isn't at the base layer of the tree.
    NotBaseLayer,
    /// The chunk has a length that doesn't match the chunk size of the stream.
    BadLength,
    /// No signed peak covers the given bin.
    NoCoveringPeak,
    /// The chunk hash couldn't be verified up to the covering peak, either because sibling
    /// hashes are missing or because a hash along the way doesn't match.
    InvalidProof,
}

/// Error potentially returned by [`LiveHashTree::prune_tree`].
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq)]
pub enum PruneError {
    /// No node exists at the given bin.
    UnknownBin,
    /// The subtree contains a currently-signed peak and must stay serveable.
    ContainsSignedPeak,
    /// The subtree contains the leaf the source is appending at.
    ContainsAddCursor,
}

/// Node of the tree. Forward edges (`left`/`right`) own the children; `parent` is a back
/// reference that is valid for as long as the node itself is in the slab, because subtrees are
/// only ever freed from their root downwards.
struct Node {
    bin: Bin,
    hash: Sha1Hash,
    verified: bool,
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
}

impl Node {
    fn new(bin: Bin) -> Node {
        Node {
            bin,
            hash: Sha1Hash::ZERO,
            verified: false,
            parent: None,
            left: None,
            right: None,
        }
    }
}

/// A peak whose hash has been signed by the source.
struct SignedPeak {
    bin: Bin,
    signature: Signature,
}

enum RoleState {
    /// Tree of the stream source. Grows through [`LiveHashTree::add_data`].
    Source {
        key_pair: KeyPair,
    },
    /// Tree of a receiver. Grows through the `offer_*` family.
    Client {
        public_key: PublicKey,
        /// `true` until the first signed peak is accepted. While `true`, nothing can be
        /// verified.
        awaiting_peak: bool,
        /// Hash received for a bin no peak covers yet, kept around until the signed peak for
        /// that same bin arrives.
        candidate_peak: Option<(Bin, Sha1Hash)>,
    },
}

/// Dynamic Merkle tree over the chunks of a live stream. See the module-level documentation.
pub struct LiveHashTree {
    nodes: slab::Slab<Node>,
    root: Option<usize>,
    /// Most recently appended leaf. `None` if no leaf was ever appended. Source only.
    add_cursor: Option<usize>,
    role: RoleState,
    /// Roots of the maximal complete subtrees covering the content. At the source this is
    /// recomputed after every append; at a client it reflects the signed peaks received so far.
    peaks: ArrayVec<Bin, 64>,
    /// Peaks whose hash has been signed, with their signatures. Kept index-aligned with the
    /// prefix of [`LiveHashTree::peaks`] it mirrors.
    signed_peaks: ArrayVec<SignedPeak, 64>,
    /// Id of the leftmost chunk actually present in the tree. Always 0, except after a restart
    /// from a checkpoint, where the chunks left of the checkpoint munro don't exist.
    peak_anchor: u64,
    /// Number of chunks covered by the tree.
    size_in_chunks: u64,
    /// Number of bytes covered by the tree.
    size: u64,
    /// Number of bytes locally present and verified.
    complete: u64,
    /// Number of chunks locally present and verified.
    complete_chunks: u64,
    chunk_size: u32,
    /// Chunks locally present and verified.
    ack_out: Binmap,
}

impl LiveHashTree {
    /// Initializes the tree of a live source. `key_pair` is the identity of the swarm.
    pub fn new_source(key_pair: KeyPair, chunk_size: u32) -> LiveHashTree {
        LiveHashTree::new_inner(RoleState::Source { key_pair }, chunk_size)
    }

    /// Initializes the tree of a live client. `public_key` is the identifier of the swarm; no
    /// signed peak that doesn't verify against it will ever enter the tree.
    pub fn new_client(public_key: PublicKey, chunk_size: u32) -> LiveHashTree {
        LiveHashTree::new_inner(
            RoleState::Client {
                public_key,
                awaiting_peak: true,
                candidate_peak: None,
            },
            chunk_size,
        )
    }

    fn new_inner(role: RoleState, chunk_size: u32) -> LiveHashTree {
        assert!(chunk_size != 0);
        LiveHashTree {
            nodes: slab::Slab::new(),
            root: None,
            add_cursor: None,
            role,
            peaks: ArrayVec::new(),
            signed_peaks: ArrayVec::new(),
            peak_anchor: 0,
            size_in_chunks: 0,
            size: 0,
            complete: 0,
            complete_chunks: 0,
            chunk_size,
            ack_out: Binmap::new(),
        }
    }

    /// Size of a content chunk, in bytes.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Number of bytes covered by the tree.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of chunks covered by the tree.
    pub fn size_in_chunks(&self) -> u64 {
        self.size_in_chunks
    }

    /// Number of bytes locally present and verified.
    pub fn complete(&self) -> u64 {
        self.complete
    }

    /// Number of chunks locally present and verified.
    pub fn chunks_complete(&self) -> u64 {
        self.complete_chunks
    }

    /// Binmap of the chunks locally present and verified.
    pub fn ack_out(&self) -> &Binmap {
        &self.ack_out
    }

    /// Number of peaks of the tree.
    pub fn peak_count(&self) -> usize {
        self.peaks.len()
    }

    /// Peak with the given index.
    ///
    /// # Panic
    ///
    /// Panics if `index` is out of range.
    ///
    pub fn peak(&self, index: usize) -> Bin {
        self.peaks[index]
    }

    /// Hash of the peak with the given index, if materialized.
    pub fn peak_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.hash(self.peaks[index])
    }

    /// Peak covering the given bin, if any.
    pub fn peak_for(&self, bin: Bin) -> Option<Bin> {
        self.peaks.iter().find(|peak| peak.contains(bin)).copied()
    }

    /// Number of signed peaks of the tree.
    pub fn signed_peak_count(&self) -> usize {
        self.signed_peaks.len()
    }

    /// Signed peak with the given index.
    ///
    /// # Panic
    ///
    /// Panics if `index` is out of range.
    ///
    pub fn signed_peak(&self, index: usize) -> Bin {
        self.signed_peaks[index].bin
    }

    /// Signature of the signed peak with the given index.
    ///
    /// # Panic
    ///
    /// Panics if `index` is out of range.
    ///
    pub fn signed_peak_sig(&self, index: usize) -> &Signature {
        &self.signed_peaks[index].signature
    }

    /// Returns `true` if this is a client tree that hasn't accepted any signed peak yet.
    pub fn is_awaiting_signed_peak(&self) -> bool {
        matches!(
            self.role,
            RoleState::Client {
                awaiting_peak: true,
                ..
            }
        )
    }

    /// Hash stored for the given bin, if a node exists there.
    pub fn hash(&self, bin: Bin) -> Option<&Sha1Hash> {
        let node = self.find_node(bin)?;
        Some(&self.nodes[node].hash)
    }

    /// Canonical hash combining all current peaks, obtained by folding the peak hashes from
    /// right to left and padding missing right siblings with [`Sha1Hash::ZERO`]. Only meaningful
    /// for display and debugging; live swarms are identified by their public key, not by a root
    /// hash.
    pub fn derive_root(&self) -> Sha1Hash {
        let mut remaining = match self.peaks.len().checked_sub(1) {
            Some(r) => r,
            None => return Sha1Hash::ZERO,
        };
        let mut bin = self.peaks[remaining];
        let mut hash = self.hash(bin).copied().unwrap_or(Sha1Hash::ZERO);
        while remaining > 0 {
            if bin.is_left() {
                hash = Sha1Hash::from_children(&hash, &Sha1Hash::ZERO);
                bin = bin.parent();
            } else {
                let left = self.peaks[remaining - 1];
                if left != bin.sibling() {
                    return Sha1Hash::ZERO;
                }
                let left_hash = self.hash(left).copied().unwrap_or(Sha1Hash::ZERO);
                hash = Sha1Hash::from_children(&left_hash, &hash);
                bin = bin.parent();
                remaining -= 1;
            }
        }
        hash
    }

    /// Appends one chunk of content to a source tree and returns the bin of its new leaf.
    ///
    /// # Panic
    ///
    /// Panics if the tree is a client tree.
    ///
    pub fn add_data(&mut self, data: &[u8]) -> Bin {
        assert!(matches!(self.role, RoleState::Source { .. }));

        let hash = Sha1Hash::from_content(data);
        let node = self.create_next();
        self.nodes[node].hash = hash;
        self.nodes[node].verified = true;
        let bin = self.nodes[node].bin;

        self.ack_out.set(bin);
        self.size += u64::try_from(data.len()).unwrap();
        self.size_in_chunks += 1;
        self.complete += u64::try_from(data.len()).unwrap();
        self.complete_chunks += 1;
        self.peaks = bins::gen_peaks_range(self.peak_anchor, self.size_in_chunks);

        bin
    }

    /// Signs the peaks that changed since the last call, then returns the munro covering the
    /// most recent chunks. To be called by the transfer whenever `nchunks_per_sign` chunks have
    /// been appended since the last call, `nchunks_per_sign` being a power of two, so that the
    /// rightmost peak exactly covers a whole number of epochs.
    ///
    /// `timestamp` is attached to the returned tuple, for the checkpoint file.
    ///
    /// # Panic
    ///
    /// Panics if the tree is a client tree or if no chunk was ever appended.
    ///
    pub fn add_signed_munro(&mut self, timestamp: i64) -> MunroTuple {
        self.update_signed_peaks();

        let last = self.signed_peaks.last().unwrap();
        let bin = last.bin;
        let signature = last.signature;
        let hash = *self.hash(bin).unwrap();
        MunroTuple {
            bin,
            hash,
            signature,
            timestamp,
        }
    }

    /// Diffs the current peaks against the signed peaks, signs every peak that is new or
    /// changed, drops the signatures of peaks that no longer exist, and materializes the
    /// internal hashes below the newly signed peaks so that proofs can be served. Returns the
    /// index of the first changed peak, or `None` if the two sets were already identical.
    ///
    /// # Panic
    ///
    /// Panics if the tree is a client tree.
    ///
    pub fn update_signed_peaks(&mut self) -> Option<usize> {
        let mut first_changed = None;

        for index in 0..self.peaks.len() {
            let bin = self.peaks[index];
            if let Some(signed) = self.signed_peaks.get(index) {
                if signed.bin == bin {
                    continue;
                }
            }

            // The subtree below a peak is stable from now on; materialize its internal hashes
            // before signing its root.
            let node = self
                .find_node(bin)
                .unwrap_or_else(|| panic!("peak {} without node", bin));
            self.compute_tree(node);
            let hash = self.nodes[node].hash;

            let signature = match &self.role {
                RoleState::Source { key_pair } => key_pair.sign(&signing_payload(bin, &hash)),
                RoleState::Client { .. } => panic!("update_signed_peaks on client tree"),
            };

            if index < self.signed_peaks.len() {
                self.signed_peaks[index] = SignedPeak { bin, signature };
            } else {
                self.signed_peaks.push(SignedPeak { bin, signature });
            }
            if first_changed.is_none() {
                first_changed = Some(index);
            }
        }

        // Signatures of peaks subsumed by a larger peak are dropped. Their hashes stay in the
        // tree, so they remain serveable as uncles below the new peak.
        if self.signed_peaks.len() > self.peaks.len() {
            self.signed_peaks.truncate(self.peaks.len());
            if first_changed.is_none() {
                first_changed = Some(self.peaks.len());
            }
        }

        first_changed
    }

    /// Initializes an empty source tree from the last munro of a previous run. The munro becomes
    /// the sole signed peak; subsequent appends grow the tree above it, making it the left
    /// subtree under a new root.
    ///
    /// Returns `false`, leaving the tree untouched, if the tree isn't an empty source tree.
    pub fn init_from_checkpoint(&mut self, munro: &MunroTuple) -> bool {
        if self.root.is_some() || munro.bin.is_none() {
            return false;
        }
        if !matches!(self.role, RoleState::Source { .. }) {
            return false;
        }

        let node = self.nodes.insert(Node {
            bin: munro.bin,
            hash: munro.hash,
            verified: true,
            parent: None,
            left: None,
            right: None,
        });
        self.root = Some(node);
        self.add_cursor = Some(node);

        self.peak_anchor = munro.bin.base_offset();
        self.size_in_chunks = munro.bin.base_right().base_offset() + 1;
        self.size = self.size_in_chunks * u64::from(self.chunk_size);
        self.peaks.clear();
        self.peaks.push(munro.bin);
        self.signed_peaks.clear();
        self.signed_peaks.push(SignedPeak {
            bin: munro.bin,
            signature: munro.signature,
        });
        true
    }

    /// Frees the descendants of the subtree rooted at `bin` and turns its root into a childless
    /// stub. The hash of the stub remains readable through [`LiveHashTree::hash`], so proofs
    /// toward peaks above it keep working.
    pub fn prune_tree(&mut self, bin: Bin) -> Result<(), PruneError> {
        let node = self.find_node(bin).ok_or(PruneError::UnknownBin)?;
        if self
            .signed_peaks
            .iter()
            .any(|peak| bin.contains(peak.bin) && peak.bin != bin)
        {
            return Err(PruneError::ContainsSignedPeak);
        }
        if let Some(cursor) = self.add_cursor {
            let cursor_bin = self.nodes[cursor].bin;
            if bin.contains(cursor_bin) && bin != cursor_bin {
                return Err(PruneError::ContainsAddCursor);
            }
        }

        let (left, right) = (self.nodes[node].left, self.nodes[node].right);
        if let Some(left) = left {
            self.free_subtree(left);
        }
        if let Some(right) = right {
            self.free_subtree(right);
        }
        self.nodes[node].left = None;
        self.nodes[node].right = None;
        Ok(())
    }

    /// Injects a hash received from a remote.
    ///
    /// If no peak covers `bin` yet, the hash is cached as the candidate peak for a signed peak
    /// message expected to follow, and `false` is returned. Otherwise the hash is stored in the
    /// tree, and the return value reports whether it is known to be consistent with the
    /// already-verified parts of the tree.
    pub fn offer_hash(&mut self, bin: Bin, hash: Sha1Hash) -> bool {
        if bin.is_none() {
            return false;
        }
        if self.peak_for(bin).is_none() {
            if let RoleState::Client { candidate_peak, .. } = &mut self.role {
                *candidate_peak = Some((bin, hash));
            }
            return false;
        }
        self.create_and_verify_node(bin, hash, false)
    }

    /// Injects a signed peak received from a remote.
    ///
    /// The signature must cover the hash previously offered for the same bin through
    /// [`LiveHashTree::offer_hash`] (the candidate peak). On success the peak set is updated:
    /// peaks contained in the new peak are replaced by it, and the candidate hash enters the
    /// tree as verified.
    pub fn offer_signed_peak_hash(
        &mut self,
        bin: Bin,
        signature: Signature,
    ) -> Result<(), OfferSignedPeakError> {
        let (public_key, candidate) = match &self.role {
            RoleState::Client {
                public_key,
                candidate_peak,
                ..
            } => (*public_key, *candidate_peak),
            RoleState::Source { .. } => return Err(OfferSignedPeakError::NotClient),
        };

        let hash = match candidate {
            Some((candidate_bin, hash)) if candidate_bin == bin => hash,
            // A peak can be re-announced, typically by a second channel. There is no candidate
            // then; the signature is checked against the already-accepted peak hash.
            _ if self.peaks.iter().any(|peak| *peak == bin) => {
                *self.hash(bin).unwrap_or(&Sha1Hash::ZERO)
            }
            _ => return Err(OfferSignedPeakError::NoCandidateHash),
        };

        public_key
            .verify(&signing_payload(bin, &hash), &signature)
            .map_err(OfferSignedPeakError::BadSignature)?;

        // Insert the new peak, replacing every peak it subsumes.
        let mut stored = false;
        let mut index = 0;
        while index < self.peaks.len() {
            if bin.contains(self.peaks[index]) {
                if !stored {
                    self.peaks[index] = bin;
                    self.signed_peaks[index] = SignedPeak { bin, signature };
                    stored = true;
                    index += 1;
                } else {
                    self.peaks.remove(index);
                    self.signed_peaks.remove(index);
                }
            } else {
                index += 1;
            }
        }
        if !stored {
            if self.peaks.is_full() {
                return Err(OfferSignedPeakError::TooManyPeaks);
            }
            self.peaks.push(bin);
            self.signed_peaks.push(SignedPeak { bin, signature });
        }

        self.size_in_chunks = self
            .peaks
            .iter()
            .map(|peak| peak.base_right().base_offset() + 1)
            .max()
            .unwrap();
        self.size = self.size_in_chunks * u64::from(self.chunk_size);

        if let RoleState::Client {
            awaiting_peak,
            candidate_peak,
            ..
        } = &mut self.role
        {
            *awaiting_peak = false;
            *candidate_peak = None;
        }

        self.create_and_verify_node(bin, hash, true);
        Ok(())
    }

    /// Injects a chunk of content received from a remote. The chunk hash is verified up to the
    /// signed peak covering `bin`; on success the chunk is accounted as complete. Offering a
    /// chunk that is already present returns `Ok` without touching the tree.
    pub fn offer_data(&mut self, bin: Bin, data: &[u8]) -> Result<(), OfferDataError> {
        if self.is_awaiting_signed_peak() {
            return Err(OfferDataError::AwaitingSignedPeak);
        }
        if bin.is_none() || !bin.is_base() {
            return Err(OfferDataError::NotBaseLayer);
        }
        let is_last_chunk = bin == Bin::from_chunk(self.size_in_chunks.saturating_sub(1));
        if u64::try_from(data.len()).unwrap() > u64::from(self.chunk_size)
            || (data.len() < usize::try_from(self.chunk_size).unwrap() && !is_last_chunk)
        {
            return Err(OfferDataError::BadLength);
        }
        if self.ack_out.is_filled(bin) {
            return Ok(());
        }
        if self.peak_for(bin).is_none() {
            return Err(OfferDataError::NoCoveringPeak);
        }

        let hash = Sha1Hash::from_content(data);
        if !self.create_and_verify_node(bin, hash, false) {
            return Err(OfferDataError::InvalidProof);
        }

        self.ack_out.set(bin);
        self.complete += u64::try_from(data.len()).unwrap();
        self.complete_chunks += 1;
        Ok(())
    }

    /// Finds or creates the node at `pos`, extending the tree both upwards (splicing new roots
    /// while `pos` falls outside the subtree of the current root) and downwards (allocating the
    /// descent path), then stores `hash` there and tries to verify it against the covering peak.
    fn create_and_verify_node(&mut self, pos: Bin, hash: Sha1Hash, verified: bool) -> bool {
        // Find or create the node.
        let node = match self.root {
            None => {
                let node = self.nodes.insert(Node {
                    bin: pos,
                    hash,
                    verified,
                    parent: None,
                    left: None,
                    right: None,
                });
                self.root = Some(node);
                return false;
            }
            Some(mut root) => {
                // Splice new roots until the root subtree covers `pos`.
                while !self.nodes[root].bin.contains(pos) {
                    let old_bin = self.nodes[root].bin;
                    let new_root = self.nodes.insert(Node::new(old_bin.parent()));
                    if old_bin.is_left() {
                        self.nodes[new_root].left = Some(root);
                    } else {
                        self.nodes[new_root].right = Some(root);
                    }
                    self.nodes[root].parent = Some(new_root);
                    self.root = Some(new_root);
                    root = new_root;
                }

                // Descend, allocating missing nodes along the way.
                let mut iter = root;
                loop {
                    let iter_bin = self.nodes[iter].bin;
                    if iter_bin == pos {
                        break iter;
                    }
                    let go_left = pos < iter_bin;
                    let existing = if go_left {
                        self.nodes[iter].left
                    } else {
                        self.nodes[iter].right
                    };
                    iter = match existing {
                        Some(child) => child,
                        None => {
                            let child_bin = if go_left {
                                iter_bin.left()
                            } else {
                                iter_bin.right()
                            };
                            let child = self.nodes.insert(Node::new(child_bin));
                            self.nodes[child].parent = Some(iter);
                            if go_left {
                                self.nodes[iter].left = Some(child);
                            } else {
                                self.nodes[iter].right = Some(child);
                            }
                            child
                        }
                    };
                }
            }
        };

        if self.is_awaiting_signed_peak() {
            // No peak yet, nothing can be verified.
            return false;
        }

        let peak = match self.peak_for(pos) {
            Some(peak) => peak,
            None => return false,
        };

        if peak == pos {
            if verified {
                self.nodes[node].hash = hash;
                self.nodes[node].verified = true;
            }
            return hash == self.nodes[node].hash;
        }
        if !self.ack_out.is_empty(pos.parent()) {
            // Data covering this hash was already accepted.
            return hash == self.nodes[node].hash;
        }
        if self.nodes[node].verified {
            // Already verified against a peak; don't let a remote replace it.
            return hash == self.nodes[node].hash;
        }

        self.nodes[node].hash = hash;

        if !pos.is_base() {
            return false;
        }

        // Walk up towards the nearest proven hash, recomputing parent hashes from siblings.
        let mut cursor = node;
        let mut uphash = hash;
        loop {
            let cursor_bin = self.nodes[cursor].bin;
            if cursor_bin == peak
                || !self.ack_out.is_empty(cursor_bin)
                || self.nodes[cursor].verified
            {
                break;
            }
            self.nodes[cursor].hash = uphash;
            cursor = match self.nodes[cursor].parent {
                Some(parent) => parent,
                None => return false,
            };
            let (left, right) = match (self.nodes[cursor].left, self.nodes[cursor].right) {
                (Some(left), Some(right)) => (left, right),
                // Tree still incomplete; a sibling hash is missing.
                _ => return false,
            };
            if self.nodes[left].hash.is_zero() || self.nodes[right].hash.is_zero() {
                break;
            }
            uphash = Sha1Hash::from_children(&self.nodes[left].hash, &self.nodes[right].hash);
        }

        let success = uphash == self.nodes[cursor].hash;
        if success {
            // The hash checks out. Mark the node, its ancestors up to the peak and each
            // ancestor's other child as verified, so that later chunks whose paths share these
            // nodes don't have to walk higher than them.
            let mut cursor = node;
            loop {
                self.nodes[cursor].verified = true;
                if self.nodes[cursor].bin == peak {
                    break;
                }
                let parent = match self.nodes[cursor].parent {
                    Some(parent) => parent,
                    None => break,
                };
                let sibling = if self.nodes[parent].left == Some(cursor) {
                    self.nodes[parent].right
                } else {
                    self.nodes[parent].left
                };
                if let Some(sibling) = sibling {
                    self.nodes[sibling].verified = true;
                }
                cursor = parent;
            }
        }
        success
    }

    /// Creates the node for the next chunk to be appended at the source, upholding the
    /// invariant that the tree is exactly the set of present subtree spines of a complete
    /// binary tree over the appended chunks, fused up to a single root.
    fn create_next(&mut self) -> usize {
        let cursor = match self.add_cursor {
            None => {
                debug_assert!(self.root.is_none());
                let node = self.nodes.insert(Node::new(Bin::from_chunk(0)));
                self.root = Some(node);
                self.add_cursor = Some(node);
                return node;
            }
            Some(cursor) => cursor,
        };

        let cursor_bin = self.nodes[cursor].bin;
        if cursor_bin.is_base() && cursor_bin.is_left() {
            // The cursor is a left leaf: create its right sibling, under a new parent if the
            // cursor was the root.
            let sibling = self.nodes.insert(Node::new(cursor_bin.sibling()));
            let parent = match self.nodes[cursor].parent {
                Some(parent) => parent,
                None => {
                    let parent = self.nodes.insert(Node::new(cursor_bin.parent()));
                    self.root = Some(parent);
                    parent
                }
            };
            self.nodes[parent].left = Some(cursor);
            self.nodes[parent].right = Some(sibling);
            self.nodes[cursor].parent = Some(parent);
            self.nodes[sibling].parent = Some(parent);
            self.add_cursor = Some(sibling);
            return sibling;
        }

        // The cursor closes a full subtree: walk up to the first ancestor with a free right
        // slot, growing the root when the walk reaches it, then hang a fresh subtree there with
        // only its leftmost leaf chain created.
        let mut iter = cursor;
        loop {
            if Some(iter) == self.root {
                let old_bin = self.nodes[iter].bin;
                let new_root = self.nodes.insert(Node::new(old_bin.parent()));
                if old_bin.is_left() {
                    self.nodes[new_root].left = Some(iter);
                } else {
                    self.nodes[new_root].right = Some(iter);
                }
                self.nodes[iter].parent = Some(new_root);
                self.root = Some(new_root);
                iter = new_root;
            } else {
                iter = self.nodes[iter].parent.unwrap();
            }

            if self.nodes[iter].right.is_none() {
                let right_bin = self.nodes[iter].bin.right();
                let mut child = self.nodes.insert(Node::new(right_bin));
                self.nodes[child].parent = Some(iter);
                self.nodes[iter].right = Some(child);
                while !self.nodes[child].bin.is_base() {
                    let left_bin = self.nodes[child].bin.left();
                    let left = self.nodes.insert(Node::new(left_bin));
                    self.nodes[left].parent = Some(child);
                    self.nodes[child].left = Some(left);
                    child = left;
                }
                self.add_cursor = Some(child);
                return child;
            }
        }
    }

    /// Recursively materializes the hash of `node` from its children. All the leaves below
    /// `node` must be present, which is always true below a source peak.
    fn compute_tree(&mut self, node: usize) {
        if self.nodes[node].verified {
            return;
        }
        let (left, right) = (
            self.nodes[node].left.unwrap(),
            self.nodes[node].right.unwrap(),
        );
        self.compute_tree(left);
        self.compute_tree(right);
        let hash = Sha1Hash::from_children(&self.nodes[left].hash, &self.nodes[right].hash);
        let entry = &mut self.nodes[node];
        entry.hash = hash;
        entry.verified = true;
    }

    fn find_node(&self, bin: Bin) -> Option<usize> {
        let mut iter = self.root;
        loop {
            let node = iter?;
            let node_bin = self.nodes[node].bin;
            if node_bin == bin {
                return Some(node);
            }
            iter = if bin < node_bin {
                self.nodes[node].left
            } else {
                self.nodes[node].right
            };
        }
    }

    fn free_subtree(&mut self, node: usize) {
        if let Some(left) = self.nodes[node].left {
            self.free_subtree(left);
        }
        if let Some(right) = self.nodes[node].right {
            self.free_subtree(right);
        }
        self.nodes.remove(node);
    }

    /// Recursively checks the structural invariants of the tree. Test helper.
    #[cfg(test)]
    pub(crate) fn check_sanity(&self) {
        fn check(tree: &LiveHashTree, node: usize, expected_parent: Option<usize>) {
            assert_eq!(tree.nodes[node].parent, expected_parent);
            if let Some(left) = tree.nodes[node].left {
                assert_eq!(tree.nodes[left].bin, tree.nodes[node].bin.left());
                check(tree, left, Some(node));
            }
            if let Some(right) = tree.nodes[node].right {
                assert_eq!(tree.nodes[right].bin, tree.nodes[node].bin.right());
                check(tree, right, Some(node));
            }
        }
        if let Some(root) = self.root {
            check(self, root, None);
        }
    }

    /// Number of live nodes in the arena. Test helper.
    #[cfg(test)]
    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl HashTree for LiveHashTree {
    fn ack_out(&self) -> &Binmap {
        self.ack_out()
    }

    fn hash(&self, bin: Bin) -> Option<&Sha1Hash> {
        self.hash(bin)
    }

    fn peak(&self, index: usize) -> Bin {
        self.peak(index)
    }

    fn peak_count(&self) -> usize {
        self.peak_count()
    }

    fn size(&self) -> u64 {
        self.size()
    }

    fn chunk_size(&self) -> u32 {
        self.chunk_size()
    }

    fn offer_hash(&mut self, bin: Bin, hash: Sha1Hash) -> bool {
        self.offer_hash(bin, hash)
    }

    fn offer_data(&mut self, bin: Bin, data: &[u8]) -> bool {
        self.offer_data(bin, data).is_ok()
    }
}
