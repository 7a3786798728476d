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

//! Set of bins with subtree roll-up.
//!
//! A [`Binmap`] tracks which chunks of a stream are in a certain state (generated, verified,
//! covered by a signed peak, ...). Marking a bin marks its entire subtree, and whenever the two
//! children of a bin are both entirely marked the set implicitly contains the parent bin as well.
//! Live streams mark an ever-growing contiguous run of chunks with few holes, which this rolled-up
//! representation stores in logarithmic space.
//!
//! Internally the set is a list of *maximal* filled subtrees, indexed by the id of their leftmost
//! chunk. Subtrees of the bin tree either nest or are disjoint, so the maximal filled subtrees
//! are pairwise disjoint and the list is a partition of the filled chunks.

use super::Bin;

use alloc::collections::BTreeMap;

/// Set of bins. Filling a bin fills its whole subtree.
#[derive(Clone, Default)]
pub struct Binmap {
    /// Maximal filled subtrees, keyed by [`Bin::base_offset`]. No entry contains another, and no
    /// entry is the sibling of another.
    filled: BTreeMap<u64, Bin>,
}

impl Binmap {
    /// Builds a new, empty set.
    pub fn new() -> Binmap {
        Binmap {
            filled: BTreeMap::new(),
        }
    }

    /// Removes every bin from the set.
    pub fn clear(&mut self) {
        self.filled.clear();
    }

    /// Fills the subtree rooted at `bin`. Filling [`Bin::NONE`] is a no-op.
    pub fn set(&mut self, bin: Bin) {
        if bin.is_none() || self.is_filled(bin) {
            return;
        }

        // Drop every existing entry the new bin swallows.
        let contained = self
            .filled
            .range(bin.base_offset()..=bin.base_right().base_offset())
            .map(|(k, _)| *k)
            .collect::<alloc::vec::Vec<_>>();
        for key in contained {
            self.filled.remove(&key);
        }

        // Insert, then merge with the sibling as long as the sibling is itself entirely filled.
        let mut current = bin;
        loop {
            let sibling = current.sibling();
            if self.filled.get(&sibling.base_offset()) == Some(&sibling) {
                self.filled.remove(&sibling.base_offset());
                current = current.parent();
            } else {
                break;
            }
        }
        self.filled.insert(current.base_offset(), current);
    }

    /// Empties the subtree rooted at `bin`. Resetting [`Bin::NONE`] is a no-op.
    pub fn reset(&mut self, bin: Bin) {
        if bin.is_none() || self.is_empty(bin) {
            return;
        }

        // Entries strictly inside `bin` are simply dropped.
        let contained = self
            .filled
            .range(bin.base_offset()..=bin.base_right().base_offset())
            .map(|(k, _)| *k)
            .collect::<alloc::vec::Vec<_>>();
        for key in contained {
            self.filled.remove(&key);
        }

        // An entry containing `bin` must instead be split: walk down from it, keeping the side
        // that doesn't contain `bin` at each step.
        if let Some((&key, &container)) = self.filled.range(..=bin.base_offset()).next_back() {
            if container.contains(bin) {
                self.filled.remove(&key);
                let mut current = container;
                while current != bin {
                    let (kept, descend) = if current.left().contains(bin) {
                        (current.right(), current.left())
                    } else {
                        (current.left(), current.right())
                    };
                    self.filled.insert(kept.base_offset(), kept);
                    current = descend;
                }
            }
        }
    }

    /// Returns `true` if the entire subtree rooted at `bin` is filled.
    pub fn is_filled(&self, bin: Bin) -> bool {
        if bin.is_none() {
            return false;
        }
        match self.filled.range(..=bin.base_offset()).next_back() {
            Some((_, container)) => container.contains(bin),
            None => false,
        }
    }

    /// Returns `true` if no chunk of the subtree rooted at `bin` is filled.
    pub fn is_empty(&self, bin: Bin) -> bool {
        if bin.is_none() {
            return true;
        }
        if let Some((_, before)) = self.filled.range(..=bin.base_offset()).next_back() {
            if before.base_right().base_offset() >= bin.base_offset() {
                return false;
            }
        }
        self.filled
            .range(bin.base_offset()..=bin.base_right().base_offset())
            .next()
            .is_none()
    }

    /// Returns the leftmost maximal filled subtree, if the set isn't empty.
    pub fn find_filled(&self) -> Option<Bin> {
        self.filled.iter().next().map(|(_, bin)| *bin)
    }

    /// Returns the base bin of the first chunk that isn't filled.
    pub fn find_empty(&self) -> Bin {
        self.find_empty_after(Bin::from_chunk(0))
    }

    /// Returns the base bin of the first chunk at or after `from` that isn't filled.
    pub fn find_empty_after(&self, from: Bin) -> Bin {
        let mut next = from.base_offset();
        if let Some((_, before)) = self.filled.range(..=next).next_back() {
            if before.base_right().base_offset() >= next {
                next = before.base_right().base_offset() + 1;
            }
        }
        for (key, entry) in self.filled.range(next..) {
            if *key > next {
                break;
            }
            next = entry.base_right().base_offset() + 1;
        }
        Bin::from_chunk(next)
    }
}
