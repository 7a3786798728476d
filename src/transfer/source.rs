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

//! Source side of a live transfer.
//!
//! The embedder reads the live input (a capture device, a pipe, a chunked HTTP body, ...) and
//! feeds it to [`LiveSource::add_data`]. The source writes the bytes to storage, appends the
//! chunks to its hash tree, and every `nchunks_per_sign` chunks closes an *epoch*: it signs the
//! new rightmost peak (the munro), extends the set of advertisable chunks, and reports the munro
//! so that the embedder can persist it as a checkpoint. When an epoch completes, the embedder is
//! expected to send a HAVE tick on every established channel; chunks are never advertised before
//! the epoch they belong to is signed.
//!
//! When a live discard window is configured, each completed epoch also prunes the largest
//! subtree of the hash tree that has entirely fallen out of the window.

use super::{ChannelId, ContentIntegrityProtection, Storage, StorageError, Transfer};
use crate::bins::{binmap::Binmap, Bin};
use crate::identity::{KeyPair, SwarmId};
use crate::tree::{LiveHashTree, MunroTuple};

use alloc::vec::Vec;
use core::{cmp, num::NonZeroU64};

/// Configuration for a [`LiveSource`].
pub struct Config {
    /// Identity of the swarm. The public half is the swarm id clients tune into.
    pub key_pair: KeyPair,

    /// Size of a content chunk, in bytes.
    pub chunk_size: u32,

    /// Number of chunks per signed epoch. Must be a power of two when
    /// [`Config::integrity_protection`] is [`ContentIntegrityProtection::UnifiedMerkle`], so
    /// that every epoch is exactly covered by one peak.
    pub nchunks_per_sign: u32,

    /// Number of most recent chunks to keep, or `None` to keep everything. Also passed to the
    /// storage, multiplied by the chunk size, by the embedder constructing it.
    pub discard_window: Option<NonZeroU64>,

    /// How the content is protected on the wire.
    pub integrity_protection: ContentIntegrityProtection,

    /// Munro decoded from the checkpoint of a previous run of the same swarm, if any. See
    /// [`crate::tree::checkpoint`].
    pub checkpoint: Option<MunroTuple>,
}

/// Error potentially returned by [`LiveSource::new`].
#[derive(Debug, derive_more::Display)]
pub enum NewError {
    /// The number of chunks per signed epoch isn't a power of two.
    NChunksPerSignNotPowerOfTwo,
}

/// Error potentially returned by [`LiveSource::add_data`].
#[derive(Debug, derive_more::Display)]
pub enum AddDataError {
    /// The storage refused the bytes. The source must stop accepting input.
    #[display(fmt = "{}", _0)]
    Storage(StorageError),
}

/// Outcome of a successful call to [`LiveSource::add_data`].
#[derive(Debug)]
pub struct AddDataOutcome {
    /// `true` if at least one epoch completed. The embedder should then send a HAVE tick on
    /// every channel reported by [`LiveSource::established_channels`].
    pub new_epoch: bool,

    /// Munro signed for each epoch that completed during the call, oldest first. The embedder
    /// persists the last one to the checkpoint file, if one is configured.
    pub munros: Vec<MunroTuple>,
}

/// Source side of a live transfer. See the module-level documentation.
pub struct LiveSource<TStorage> {
    swarm_id: SwarmId,
    storage: TStorage,
    /// Hash tree of the stream. `None` unless the integrity protection is
    /// [`ContentIntegrityProtection::UnifiedMerkle`].
    tree: Option<LiveHashTree>,
    /// Chunks generated so far. With a tree, the tree's own `ack_out` is authoritative and this
    /// one is only used for the tree-less protection modes.
    ack_out: Binmap,
    /// Chunks covered by a signed peak, in other words the chunks that may be advertised.
    signed_ack_out: Binmap,
    chunk_size: u32,
    integrity_protection: ContentIntegrityProtection,
    /// Id of the next chunk to be generated.
    last_chunk_id: u64,
    /// Byte offset in storage where the next input byte lands. Always
    /// `last_chunk_id * chunk_size`.
    byte_offset: u64,
    nchunks_per_sign: u32,
    chunks_since_sign: u32,
    discard_window: Option<NonZeroU64>,
    /// Bin of the restored checkpoint munro, if the source was restarted. The chunks below it
    /// belong to the previous run and are never advertised.
    checkpoint_bin: Option<Bin>,
    /// Rightmost base bin ever passed to the prune logic. Pruning only runs when this advances.
    ack_out_right_basebin: Option<Bin>,
    /// Channels towards the peers of the swarm. The boolean is `true` once the channel is
    /// established.
    channels: slab::Slab<bool>,
}

impl<TStorage: Storage> LiveSource<TStorage> {
    /// Initializes a new live source writing its chunks to `storage`.
    pub fn new(config: Config, storage: TStorage) -> Result<LiveSource<TStorage>, NewError> {
        let unified_merkle =
            matches!(config.integrity_protection, ContentIntegrityProtection::UnifiedMerkle);
        if unified_merkle && !config.nchunks_per_sign.is_power_of_two() {
            return Err(NewError::NChunksPerSignNotPowerOfTwo);
        }

        let swarm_id = SwarmId::PublicKey(*config.key_pair.public_key());

        let mut source = LiveSource {
            swarm_id,
            storage,
            tree: if unified_merkle {
                Some(LiveHashTree::new_source(config.key_pair, config.chunk_size))
            } else {
                None
            },
            ack_out: Binmap::new(),
            signed_ack_out: Binmap::new(),
            chunk_size: config.chunk_size,
            integrity_protection: config.integrity_protection,
            last_chunk_id: 0,
            byte_offset: 0,
            nchunks_per_sign: config.nchunks_per_sign,
            chunks_since_sign: 0,
            discard_window: config.discard_window,
            checkpoint_bin: None,
            ack_out_right_basebin: None,
            channels: slab::Slab::new(),
        };

        // Resume the previous run, turning its last munro into the first munro of the new tree.
        // The old chunks aren't advertised; clients skip over them and download the chunks that
        // this run appends above the munro.
        if let (Some(checkpoint), Some(tree)) = (&config.checkpoint, &mut source.tree) {
            if tree.init_from_checkpoint(checkpoint) {
                source.checkpoint_bin = Some(checkpoint.bin);
                source.last_chunk_id = checkpoint.bin.base_right().base_offset() + 1;
                source.byte_offset = source.last_chunk_id * u64::from(source.chunk_size);
                source.update_signed_ack_out();
            }
        }

        Ok(source)
    }

    /// Swarm this source produces.
    pub fn swarm_id(&self) -> &SwarmId {
        &self.swarm_id
    }

    /// Size of a content chunk, in bytes.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// How the content is protected on the wire.
    pub fn integrity_protection(&self) -> ContentIntegrityProtection {
        self.integrity_protection
    }

    /// Id of the next chunk to be generated.
    pub fn last_chunk_id(&self) -> u64 {
        self.last_chunk_id
    }

    /// Byte offset in storage where the next input byte lands.
    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    /// Hash tree of the stream, for the channel layer to read hashes and signed peaks from.
    /// `None` unless the integrity protection is
    /// [`ContentIntegrityProtection::UnifiedMerkle`].
    pub fn tree(&self) -> Option<&LiveHashTree> {
        self.tree.as_ref()
    }

    /// Chunks generated so far.
    pub fn ack_out(&self) -> &Binmap {
        match &self.tree {
            Some(tree) => tree.ack_out(),
            None => &self.ack_out,
        }
    }

    /// Chunks that may be advertised to peers. With a hash tree, only chunks covered by a
    /// signed peak may be announced; without one, every generated chunk may.
    pub fn ack_out_signed(&self) -> &Binmap {
        if self.tree.is_some() {
            &self.signed_ack_out
        } else {
            self.ack_out()
        }
    }

    /// Number of contiguous bytes generated from the start of the stream.
    pub fn seq_complete(&self) -> u64 {
        self.ack_out().find_empty().base_offset() * u64::from(self.chunk_size)
    }

    /// Registers a new channel towards a peer.
    pub fn add_channel(&mut self) -> ChannelId {
        ChannelId(self.channels.insert(false))
    }

    /// Marks a channel as established. Only established channels receive HAVE ticks.
    pub fn set_channel_established(&mut self, channel: ChannelId) {
        if let Some(established) = self.channels.get_mut(channel.0) {
            *established = true;
        }
    }

    /// Unregisters a channel.
    pub fn remove_channel(&mut self, channel: ChannelId) {
        if self.channels.contains(channel.0) {
            self.channels.remove(channel.0);
        }
    }

    /// Iterates over the established channels, in a stable but unspecified order.
    pub fn established_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels
            .iter()
            .filter(|(_, established)| **established)
            .map(|(index, _)| ChannelId(index))
    }

    /// Feeds bytes read from the live input into the transfer.
    ///
    /// The bytes are written to storage, then cut into chunks that are appended to the hash
    /// tree. `now` is a microseconds timestamp attached to the munros signed during the call.
    ///
    /// An input shorter than the chunk size is treated as one final, shorter chunk; otherwise
    /// only whole chunks are consumed and the input length is expected to be a multiple of the
    /// chunk size.
    pub fn add_data(&mut self, data: &[u8], now: i64) -> Result<AddDataOutcome, AddDataError> {
        self.storage
            .write(data, self.byte_offset)
            .map_err(AddDataError::Storage)?;

        let chunk_size_usize = usize::try_from(self.chunk_size).unwrap();
        let num_chunks = cmp::max(1, u64::try_from(data.len()).unwrap() / u64::from(self.chunk_size));

        let mut outcome = AddDataOutcome {
            new_epoch: false,
            munros: Vec::new(),
        };

        for chunk_index in 0..num_chunks {
            self.ack_out.set(Bin::from_chunk(self.last_chunk_id));
            self.last_chunk_id += 1;
            self.byte_offset += u64::from(self.chunk_size);

            if self.tree.is_some() {
                let start = usize::try_from(chunk_index).unwrap() * chunk_size_usize;
                let end = cmp::min(start + chunk_size_usize, data.len());
                let tree = self.tree.as_mut().unwrap();
                tree.add_data(&data[start..end]);

                self.chunks_since_sign += 1;
                if self.chunks_since_sign == self.nchunks_per_sign {
                    let munro = tree.add_signed_munro(now);
                    self.chunks_since_sign = 0;
                    outcome.new_epoch = true;

                    // Only chunks covered by a signed peak may be advertised from now on.
                    self.update_signed_ack_out();

                    if self.discard_window.is_some() {
                        self.on_data_prune_tree(Bin::from_chunk(self.last_chunk_id));
                    }

                    outcome.munros.push(munro);
                }
            } else {
                // Without a tree every chunk is immediately advertisable.
                outcome.new_epoch = true;
            }
        }

        Ok(outcome)
    }

    /// Rebuilds [`LiveSource::signed_ack_out`] as the union of the signed peaks, minus the
    /// old-tree bins restored from a checkpoint.
    fn update_signed_ack_out(&mut self) {
        let tree = match &self.tree {
            Some(tree) => tree,
            None => return,
        };

        self.signed_ack_out.clear();
        for index in 0..tree.peak_count() {
            self.signed_ack_out.set(tree.peak(index));
        }

        if let Some(checkpoint_bin) = self.checkpoint_bin {
            for offset in 0..=checkpoint_bin.layer_offset() {
                self.signed_ack_out
                    .reset(Bin::new(checkpoint_bin.layer(), offset));
            }
        }
    }

    /// Forgets the largest subtree that has entirely fallen out of the discard window, if the
    /// right edge of the generated chunks advanced past `pos`.
    fn on_data_prune_tree(&mut self, pos: Bin) {
        let window = match self.discard_window {
            Some(window) => window.get(),
            None => return,
        };
        if self.nchunks_per_sign < 1 {
            return;
        }

        match self.ack_out_right_basebin {
            Some(right) if pos <= right => return,
            _ => self.ack_out_right_basebin = Some(pos),
        }
        let right = pos.layer_offset();

        let old = match right.checked_sub(window) {
            Some(old) if old > 0 => old,
            _ => return,
        };

        // Align to epoch boundaries, then take the epoch before: the subtree ending there is
        // entirely left of the window.
        let nchunks = u64::from(self.nchunks_per_sign);
        let start = old - (old % nchunks);
        let left_chunk = match start.checked_sub(nchunks) {
            Some(left_chunk) => left_chunk,
            None => return,
        };

        let mut bin = Bin::from_chunk(left_chunk);
        for _ in 0..nchunks.trailing_zeros() {
            bin = bin.parent();
        }
        while bin.is_right() {
            bin = bin.parent();
        }

        // The subtree may partially overlap regions pruned on earlier epochs; pruning again is
        // harmless, and a bin whose node is already gone is simply skipped.
        if let Some(tree) = &mut self.tree {
            let _ = tree.prune_tree(bin);
        }
    }
}

impl<TStorage> Transfer for LiveSource<TStorage> {
    fn swarm_id(&self) -> &SwarmId {
        &self.swarm_id
    }
}
