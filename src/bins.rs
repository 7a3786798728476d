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

//! Binary tree addressing.
//!
//! The content of a stream is cut into equally-sized chunks. Chunks, and the Merkle tree nodes
//! above them, are addressed with 64-bits labels called *bins*.
//!
//! A bin identifies the node of an infinite binary tree whose leaves (layer 0) are the chunks in
//! stream order. The labelling is an in-order traversal of that tree: chunk `c` has label `2 * c`,
//! and the node at layer `l` covering the `2^l` chunks starting at offset `o * 2^l` has label
//! `(o << (l + 1)) + 2^l - 1`. For example:
//!
//! ```text
//!          3
//!       /     \
//!      1       5
//!     / \     / \
//!    0   2   4   6
//! ```
//!
//! This encoding makes ancestry and sibling relationships pure bit arithmetic, and gives bins a
//! total order that matches the left-to-right order of the tree, which the rest of the crate
//! relies on when descending trees by comparing labels.

use arrayvec::ArrayVec;
use core::{cmp, fmt};

pub mod binmap;

/// Label of a node in the infinite binary tree over the chunks of a stream.
///
/// Most operations are meaningless on [`Bin::NONE`]; unless documented otherwise, methods must
/// not be called on it.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bin(u64);

impl Bin {
    /// Sentinel value meaning "no bin".
    pub const NONE: Bin = Bin(u64::MAX);

    /// Root of the whole infinite tree. Every valid bin is contained in it.
    pub const ALL: Bin = Bin(0x7fff_ffff_ffff_ffff);

    /// Builds the bin at the given layer and in-layer offset.
    ///
    /// # Panic
    ///
    /// Panics in debug mode if the bin doesn't fit in 64 bits.
    ///
    pub fn new(layer: u32, layer_offset: u64) -> Bin {
        debug_assert!(layer < 64);
        debug_assert!(layer == 63 || layer_offset < (1 << (63 - layer)));
        let base = layer_offset.checked_shl(layer + 1).unwrap_or(0);
        Bin(base | ((1 << layer) - 1))
    }

    /// Builds the base-layer bin of the chunk with the given id.
    pub fn from_chunk(chunk_id: u64) -> Bin {
        Bin::new(0, chunk_id)
    }

    /// Returns the raw 64-bits label.
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Returns `true` for [`Bin::NONE`].
    pub fn is_none(self) -> bool {
        self == Bin::NONE
    }

    /// Layer of the bin. Chunks are at layer 0.
    pub fn layer(self) -> u32 {
        debug_assert!(!self.is_none());
        self.0.trailing_ones()
    }

    /// In-layer offset of the bin: the root of the `n`-th subtree of this layer (starting from
    /// the left) has offset `n`.
    pub fn layer_offset(self) -> u64 {
        debug_assert!(!self.is_none());
        self.0 >> (self.layer() + 1)
    }

    /// Returns `true` if the bin is at the base layer, in other words if it designates a chunk.
    pub fn is_base(self) -> bool {
        debug_assert!(!self.is_none());
        self.0 & 1 == 0
    }

    /// Returns `true` if the bin is the left child of its parent.
    pub fn is_left(self) -> bool {
        debug_assert!(!self.is_none());
        self.0 & (1 << (self.layer() + 1)) == 0
    }

    /// Returns `true` if the bin is the right child of its parent.
    pub fn is_right(self) -> bool {
        !self.is_left()
    }

    /// Parent of the bin, one layer up.
    pub fn parent(self) -> Bin {
        let height = 1 << self.layer();
        if self.is_left() {
            Bin(self.0 + height)
        } else {
            Bin(self.0 - height)
        }
    }

    /// The other child of this bin's parent.
    pub fn sibling(self) -> Bin {
        let width = 1 << (self.layer() + 1);
        if self.is_left() {
            Bin(self.0 + width)
        } else {
            Bin(self.0 - width)
        }
    }

    /// Left child of the bin.
    ///
    /// # Panic
    ///
    /// Panics in debug mode if the bin is at the base layer.
    ///
    pub fn left(self) -> Bin {
        debug_assert!(!self.is_base());
        Bin(self.0 - (1 << (self.layer() - 1)))
    }

    /// Right child of the bin.
    ///
    /// # Panic
    ///
    /// Panics in debug mode if the bin is at the base layer.
    ///
    pub fn right(self) -> Bin {
        debug_assert!(!self.is_base());
        Bin(self.0 + (1 << (self.layer() - 1)))
    }

    /// Leftmost base-layer bin of the subtree rooted at this bin.
    pub fn base_left(self) -> Bin {
        debug_assert!(!self.is_none());
        Bin(self.0 & (self.0 + 1))
    }

    /// Rightmost base-layer bin of the subtree rooted at this bin.
    pub fn base_right(self) -> Bin {
        debug_assert!(!self.is_none());
        Bin::from_chunk(self.base_offset() + self.base_length() - 1)
    }

    /// Id of the leftmost chunk covered by this bin.
    pub fn base_offset(self) -> u64 {
        self.base_left().0 >> 1
    }

    /// Number of chunks covered by this bin, in other words `2.pow(layer)`.
    pub fn base_length(self) -> u64 {
        debug_assert!(!self.is_none());
        1 << self.layer()
    }

    /// Returns `true` if `other` is within the subtree rooted at `self`. A bin contains itself.
    pub fn contains(self, other: Bin) -> bool {
        if self.is_none() || other.is_none() {
            return false;
        }
        let left = self.base_left().0;
        let right = left + (self.base_length() - 1) * 2;
        left <= other.base_left().0 && other.base_left().0 + (other.base_length() - 1) * 2 <= right
    }
}

impl fmt::Debug for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "(NONE)")
        } else {
            write!(f, "({},{})", self.layer(), self.layer_offset())
        }
    }
}

/// Returns the peaks of a tree covering `size_in_chunks` chunks: the roots of the maximal
/// complete subtrees that tile the chunks from left to right.
///
/// There is exactly one peak per set bit of `size_in_chunks`, in decreasing order of layer.
pub fn gen_peaks(size_in_chunks: u64) -> ArrayVec<Bin, 64> {
    let mut peaks = ArrayVec::new();
    let mut covered = 0;
    for layer in (0..64).rev() {
        if size_in_chunks & (1 << layer) != 0 {
            peaks.push(Bin::new(layer, covered >> layer));
            covered += 1 << layer;
        }
    }
    peaks
}

/// Returns the maximal aligned complete subtrees tiling the chunk range `from..to`, from left to
/// right.
///
/// `gen_peaks_range(0, n)` is equivalent to [`gen_peaks`]`(n)`. A non-zero `from` is what a tree
/// restarted from a checkpoint has: its leftmost present subtree starts at the checkpoint munro,
/// not at chunk 0, and the peaks left of the munro don't exist.
pub fn gen_peaks_range(from: u64, to: u64) -> ArrayVec<Bin, 64> {
    let mut peaks = ArrayVec::new();
    let mut next = from;
    while next < to {
        // Largest power of two that both divides `next` and fits in the remaining range.
        let alignment = if next == 0 {
            u64::MAX
        } else {
            1 << next.trailing_zeros()
        };
        let remaining = to - next;
        let fit = 1 << (63 - remaining.leading_zeros());
        let len = cmp::min(alignment, fit);
        let layer = len.trailing_zeros();
        peaks.push(Bin::new(layer, next >> layer));
        next += len;
    }
    peaks
}
