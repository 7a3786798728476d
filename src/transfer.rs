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

//! Live content transfers.
//!
//! A live transfer ties together everything one swarm membership needs: the hash tree of the
//! stream, the storage holding the raw chunks, the set of channels towards other peers, and the
//! bookkeeping of which chunks can be advertised. The two roles are
//! [`source::LiveSource`], which produces the stream, and [`client::LiveClient`], which receives
//! it.
//!
//! Transfers are plain state machines: they never perform I/O themselves. Writing chunks to disk
//! goes through the [`Storage`] trait provided by the embedder, and everything network-facing is
//! exposed as methods to call when a message arrives and values to read when sending.
//!
//! The embedder typically owns all its transfers through a [`TransferRegistry`], which hands out
//! stable [`TransferId`]s and allows looking a transfer up by the swarm it belongs to.

use crate::identity::SwarmId;

use core::fmt;

pub mod client;
pub mod source;

/// How the integrity of the stream content is protected on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContentIntegrityProtection {
    /// No protection. Peers exchange bare chunks and trust each other.
    None,
    /// Every chunk is individually signed by the source.
    SignAll,
    /// Chunks are authenticated through a dynamic Merkle tree whose peaks the source signs.
    UnifiedMerkle,
}

/// Identifier of a channel towards another peer, within a single transfer. Attributed by
/// the transfer when the channel is registered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(pub(crate) usize);

/// Where the raw bytes of the stream live.
///
/// The storage is expected to behave like a sparse file or a ring buffer over a file: writes can
/// happen at any offset, and the storage is free to discard bytes that have fallen out of the
/// live discard window it was configured with. Wrapping and truncation are entirely the
/// storage's responsibility.
pub trait Storage {
    /// Writes `data` at the given byte offset of the stream.
    fn write(&mut self, data: &[u8], offset: u64) -> Result<(), StorageError>;
}

/// Error returned by [`Storage::write`]. A source that receives this error must stop accepting
/// input.
#[derive(Debug, derive_more::Display)]
#[display(fmt = "Failed to write to the content storage")]
pub struct StorageError();

/// Capability common to the two transfer roles, used by [`TransferRegistry`] lookups.
pub trait Transfer {
    /// Swarm this transfer belongs to.
    fn swarm_id(&self) -> &SwarmId;
}

/// Identifier of a transfer within a [`TransferRegistry`]. Stable for the lifetime of the
/// transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransferId(usize);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Collection of the transfers owned by a runtime.
///
/// There is intentionally no global registry of transfers; the embedder creates one (or several)
/// and owns it.
pub struct TransferRegistry<T> {
    transfers: slab::Slab<T>,
}

impl<T: Transfer> TransferRegistry<T> {
    /// Builds a new, empty registry.
    pub fn new() -> TransferRegistry<T> {
        TransferRegistry {
            transfers: slab::Slab::new(),
        }
    }

    /// Inserts a transfer and returns its newly attributed id.
    pub fn insert(&mut self, transfer: T) -> TransferId {
        TransferId(self.transfers.insert(transfer))
    }

    /// Removes and returns a transfer.
    ///
    /// # Panic
    ///
    /// Panics if the id isn't in the registry.
    ///
    pub fn remove(&mut self, id: TransferId) -> T {
        self.transfers.remove(id.0)
    }

    /// Returns the transfer with the given id.
    pub fn get(&self, id: TransferId) -> Option<&T> {
        self.transfers.get(id.0)
    }

    /// Returns the transfer with the given id.
    pub fn get_mut(&mut self, id: TransferId) -> Option<&mut T> {
        self.transfers.get_mut(id.0)
    }

    /// Returns the transfer belonging to the given swarm, if any.
    pub fn find_by_swarm_id(&self, swarm_id: &SwarmId) -> Option<TransferId> {
        self.transfers
            .iter()
            .find(|(_, transfer)| transfer.swarm_id() == swarm_id)
            .map(|(index, _)| TransferId(index))
    }

    /// Iterates over all the transfers of the registry.
    pub fn iter(&self) -> impl Iterator<Item = (TransferId, &T)> {
        self.transfers
            .iter()
            .map(|(index, transfer)| (TransferId(index), transfer))
    }

    /// Number of transfers in the registry.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Returns `true` if the registry holds no transfer.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

impl<T: Transfer> Default for TransferRegistry<T> {
    fn default() -> Self {
        TransferRegistry::new()
    }
}
