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

//! Client side of a live transfer.
//!
//! A client tunes into a stream that has been running for a while. It cannot start from chunk 0:
//! the source may have forgotten the beginning long ago. Instead, the first correctly-signed
//! munro received from a peer tells the piece picker what that peer can serve, and the picker
//! chooses a *hook-in* position inside that subtree. Sequential progress is measured from the
//! hook-in position, not from the start of the stream.
//!
//! Incoming peer messages are routed to [`LiveClient::offer_hash`],
//! [`LiveClient::offer_signed_munro`] and [`LiveClient::offer_data`]. Verified chunks are
//! written to storage at their stream offset; the storage is in charge of wrapping and
//! discarding chunks that fall out of the live discard window.

use super::{ChannelId, ContentIntegrityProtection, Storage, StorageError, Transfer};
use crate::bins::{binmap::Binmap, Bin};
use crate::identity::{PublicKey, Sha1Hash, Signature, SwarmId};
use crate::tree::{LiveHashTree, OfferDataError, OfferSignedPeakError};

use core::num::NonZeroU64;

/// Chooses which chunks to request from which peer. Provided by the embedder.
pub trait LivePiecePicker {
    /// Tells the picker that `channel` advertised every chunk below `munro`. Called once per
    /// channel, when the first correctly-signed munro arrives on it.
    fn start_add_peer_pos(&mut self, channel: ChannelId, munro: Bin, peer_is_source: bool);

    /// Position the picker hooked into the stream, if decided yet.
    fn hook_in_pos(&self) -> Option<Bin>;

    /// Base bin right after the last chunk sequentially downloaded from the hook-in position,
    /// if any.
    fn current_pos(&self) -> Option<Bin>;

    /// Seeds the randomized part of the picking strategy.
    fn randomize(&mut self, seed: u64);
}

/// Configuration for a [`LiveClient`].
pub struct Config {
    /// Public key identifying the swarm to tune into.
    pub swarm_public_key: PublicKey,

    /// Size of a content chunk, in bytes.
    pub chunk_size: u32,

    /// Number of most recent chunks to keep, or `None` to keep everything. Also passed to the
    /// storage, multiplied by the chunk size, by the embedder constructing it.
    pub discard_window: Option<NonZeroU64>,

    /// How the content is protected on the wire. Must match the source's setting.
    pub integrity_protection: ContentIntegrityProtection,

    /// Seed forwarded to [`LivePiecePicker::randomize`] at construction.
    pub picker_seed: u64,
}

/// Error potentially returned by [`LiveClient::offer_signed_munro`].
#[derive(Debug, derive_more::Display)]
pub enum OfferMunroError {
    /// The transfer doesn't verify content integrity; signed munros are unexpected.
    NoIntegrityProtection,
    /// The tree rejected the peak.
    #[display(fmt = "{}", _0)]
    Tree(OfferSignedPeakError),
}

/// Error potentially returned by [`LiveClient::offer_data`].
#[derive(Debug, derive_more::Display)]
pub enum ClientOfferDataError {
    /// The chunk couldn't be verified. The message is dropped but the channel survives.
    #[display(fmt = "{}", _0)]
    Verification(OfferDataError),
    /// The chunk verified but couldn't be written to storage.
    #[display(fmt = "{}", _0)]
    Storage(StorageError),
}

struct Channel {
    established: bool,
    peer_is_source: bool,
    /// `true` once the first correctly-signed munro arrived on this channel and the picker was
    /// told about the peer.
    hooked: bool,
}

/// Client side of a live transfer. See the module-level documentation.
pub struct LiveClient<TStorage, TPicker> {
    swarm_id: SwarmId,
    storage: TStorage,
    picker: TPicker,
    /// Hash tree of the stream. `None` unless the integrity protection is
    /// [`ContentIntegrityProtection::UnifiedMerkle`].
    tree: Option<LiveHashTree>,
    /// Chunks received, for the tree-less protection modes. With a tree, the tree's own
    /// `ack_out` is authoritative.
    ack_out: Binmap,
    chunk_size: u32,
    discard_window: Option<NonZeroU64>,
    /// Epoch length of the source, learned from the first munro (a munro exactly covers one or
    /// more whole epochs).
    nchunks_per_sign: Option<u64>,
    channels: slab::Slab<Channel>,
}

impl<TStorage: Storage, TPicker: LivePiecePicker> LiveClient<TStorage, TPicker> {
    /// Initializes a new live client writing verified chunks to `storage` and steering its
    /// requests with `picker`.
    pub fn new(config: Config, storage: TStorage, mut picker: TPicker) -> LiveClient<TStorage, TPicker> {
        picker.randomize(config.picker_seed);

        let tree = match config.integrity_protection {
            ContentIntegrityProtection::UnifiedMerkle => Some(LiveHashTree::new_client(
                config.swarm_public_key,
                config.chunk_size,
            )),
            ContentIntegrityProtection::None | ContentIntegrityProtection::SignAll => None,
        };

        LiveClient {
            swarm_id: SwarmId::PublicKey(config.swarm_public_key),
            storage,
            picker,
            tree,
            ack_out: Binmap::new(),
            chunk_size: config.chunk_size,
            discard_window: config.discard_window,
            nchunks_per_sign: None,
            channels: slab::Slab::new(),
        }
    }

    /// Swarm this client is tuned into.
    pub fn swarm_id(&self) -> &SwarmId {
        &self.swarm_id
    }

    /// Size of a content chunk, in bytes.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Number of most recent chunks kept, or `None` if everything is kept.
    pub fn discard_window(&self) -> Option<NonZeroU64> {
        self.discard_window
    }

    /// Hash tree of the stream, for the channel layer to read hashes and peaks from. `None`
    /// unless the integrity protection is [`ContentIntegrityProtection::UnifiedMerkle`].
    pub fn tree(&self) -> Option<&LiveHashTree> {
        self.tree.as_ref()
    }

    /// Piece picker steering this client.
    pub fn picker(&self) -> &TPicker {
        &self.picker
    }

    /// Chunks received and verified so far.
    pub fn ack_out(&self) -> &Binmap {
        match &self.tree {
            Some(tree) => tree.ack_out(),
            None => &self.ack_out,
        }
    }

    /// Epoch length of the source, learned from the first munro.
    pub fn nchunks_per_sign(&self) -> Option<u64> {
        self.nchunks_per_sign
    }

    /// Registers a new channel towards a peer. `peer_is_source` is `true` if the peer is known
    /// to be the stream source itself.
    pub fn add_channel(&mut self, peer_is_source: bool) -> ChannelId {
        ChannelId(self.channels.insert(Channel {
            established: false,
            peer_is_source,
            hooked: false,
        }))
    }

    /// Marks a channel as established.
    pub fn set_channel_established(&mut self, channel: ChannelId) {
        if let Some(channel) = self.channels.get_mut(channel.0) {
            channel.established = true;
        }
    }

    /// Unregisters a channel.
    pub fn remove_channel(&mut self, channel: ChannelId) {
        if self.channels.contains(channel.0) {
            self.channels.remove(channel.0);
        }
    }

    /// Returns `true` if the channel has been marked as established.
    pub fn channel_is_established(&self, channel: ChannelId) -> bool {
        self.channels
            .get(channel.0)
            .map_or(false, |channel| channel.established)
    }

    /// Injects a hash received on a channel. See [`LiveHashTree::offer_hash`].
    pub fn offer_hash(&mut self, bin: Bin, hash: Sha1Hash) -> bool {
        match &mut self.tree {
            Some(tree) => tree.offer_hash(bin, hash),
            None => false,
        }
    }

    /// Injects a signed munro received on a channel.
    ///
    /// The signature must cover the hash previously received for the same bin. On the first
    /// correctly-signed munro of each channel, the piece picker is told that the peer behind
    /// the channel can serve everything below the munro; on the very first one overall, this is
    /// what lets the picker choose a hook-in position.
    pub fn offer_signed_munro(
        &mut self,
        channel: ChannelId,
        bin: Bin,
        signature: Signature,
    ) -> Result<(), OfferMunroError> {
        let tree = match &mut self.tree {
            Some(tree) => tree,
            None => return Err(OfferMunroError::NoIntegrityProtection),
        };

        tree.offer_signed_peak_hash(bin, signature)
            .map_err(OfferMunroError::Tree)?;

        self.nchunks_per_sign = Some(bin.base_length());

        if let Some(state) = self.channels.get_mut(channel.0) {
            if !state.hooked {
                state.hooked = true;
                self.picker
                    .start_add_peer_pos(channel, bin, state.peer_is_source);
            }
        }

        Ok(())
    }

    /// Injects a chunk of content received on a channel. The chunk is verified against the tree
    /// (when one is in use), then written to storage at its stream offset.
    pub fn offer_data(&mut self, bin: Bin, data: &[u8]) -> Result<(), ClientOfferDataError> {
        match &mut self.tree {
            Some(tree) => {
                tree.offer_data(bin, data)
                    .map_err(ClientOfferDataError::Verification)?;
            }
            None => {
                if bin.is_none() || !bin.is_base() {
                    return Err(ClientOfferDataError::Verification(
                        OfferDataError::NotBaseLayer,
                    ));
                }
                self.ack_out.set(bin);
            }
        }

        self.storage
            .write(data, bin.base_offset() * u64::from(self.chunk_size))
            .map_err(ClientOfferDataError::Storage)?;
        Ok(())
    }

    /// Stream byte offset of the hook-in position, if the picker hooked in already.
    pub fn hook_in_offset(&self) -> Option<u64> {
        let pos = self.picker.hook_in_pos()?;
        Some(pos.layer_offset() * u64::from(self.chunk_size))
    }

    /// Number of contiguous bytes downloaded from the hook-in position. Returns 0 if the client
    /// hasn't hooked in yet; use [`LiveClient::hook_in_offset`] to distinguish "not hooked in"
    /// from "hooked in with no progress".
    pub fn seq_complete(&self) -> u64 {
        let (hook_in, current) = match (self.picker.hook_in_pos(), self.picker.current_pos()) {
            (Some(hook_in), Some(current)) => (hook_in, current),
            _ => return 0,
        };
        current
            .layer_offset()
            .saturating_sub(hook_in.layer_offset())
            * u64::from(self.chunk_size)
    }
}

impl<TStorage, TPicker> Transfer for LiveClient<TStorage, TPicker> {
    fn swarm_id(&self) -> &SwarmId {
        &self.swarm_id
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ChannelId, ContentIntegrityProtection, Storage, StorageError};
    use super::{Config, LiveClient, LivePiecePicker};
    use crate::bins::{gen_peaks, Bin};
    use crate::identity::{KeyPair, Sha1Hash};
    use crate::tree::signing_payload;

    use alloc::collections::BTreeMap;
    use alloc::{vec, vec::Vec};

    const CHUNK_SIZE: u32 = 1024;

    #[derive(Default)]
    struct VecStorage {
        bytes: Vec<u8>,
    }

    impl Storage for VecStorage {
        fn write(&mut self, data: &[u8], offset: u64) -> Result<(), StorageError> {
            let offset = usize::try_from(offset).unwrap();
            if self.bytes.len() < offset + data.len() {
                self.bytes.resize(offset + data.len(), 0);
            }
            self.bytes[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    /// Picker stub that hooks in at the base left of the first munro it sees.
    #[derive(Default)]
    struct RecordingPicker {
        peers: Vec<(ChannelId, Bin, bool)>,
        hook_in: Option<Bin>,
        current: Option<Bin>,
        seed: Option<u64>,
    }

    impl LivePiecePicker for RecordingPicker {
        fn start_add_peer_pos(&mut self, channel: ChannelId, munro: Bin, peer_is_source: bool) {
            self.peers.push((channel, munro, peer_is_source));
            if self.hook_in.is_none() {
                self.hook_in = Some(munro.base_left());
                self.current = Some(munro.base_left());
            }
        }

        fn hook_in_pos(&self) -> Option<Bin> {
            self.hook_in
        }

        fn current_pos(&self) -> Option<Bin> {
            self.current
        }

        fn randomize(&mut self, seed: u64) {
            self.seed = Some(seed);
        }
    }

    fn key_pair() -> KeyPair {
        KeyPair::from_seed([3; 32])
    }

    fn config() -> Config {
        Config {
            swarm_public_key: *key_pair().public_key(),
            chunk_size: CHUNK_SIZE,
            discard_window: None,
            integrity_protection: ContentIntegrityProtection::UnifiedMerkle,
            picker_seed: 9,
        }
    }

    fn chunk_bytes(chunk_id: u64) -> Vec<u8> {
        vec![u8::try_from(chunk_id % 255).unwrap(); usize::try_from(CHUNK_SIZE).unwrap()]
    }

    fn reference_hashes(num_chunks: u64) -> BTreeMap<Bin, Sha1Hash> {
        let mut hashes = BTreeMap::new();
        for chunk_id in 0..num_chunks {
            hashes.insert(
                Bin::from_chunk(chunk_id),
                Sha1Hash::from_content(&chunk_bytes(chunk_id)),
            );
        }
        for layer in 1..64 {
            for offset in 0..(num_chunks >> layer) {
                let bin = Bin::new(layer, offset);
                if let (Some(left), Some(right)) =
                    (hashes.get(&bin.left()), hashes.get(&bin.right()))
                {
                    let parent = Sha1Hash::from_children(left, right);
                    hashes.insert(bin, parent);
                }
            }
        }
        hashes
    }

    #[test]
    fn hook_in_on_first_munro() {
        let mut client = LiveClient::new(config(), VecStorage::default(), RecordingPicker::default());
        assert_eq!(client.picker().seed, Some(9));

        let channel = client.add_channel(true);
        client.set_channel_established(channel);

        let hashes = reference_hashes(8);
        let munro = Bin::new(3, 0);
        let signature = key_pair().sign(&signing_payload(munro, &hashes[&munro]));

        client.offer_hash(munro, hashes[&munro]);
        client.offer_signed_munro(channel, munro, signature).unwrap();

        assert_eq!(client.picker().peers, [(channel, munro, true)]);
        assert_eq!(client.hook_in_offset(), Some(0));
        assert_eq!(client.nchunks_per_sign(), Some(8));

        // A second munro on the same channel doesn't re-announce the peer.
        let munro2 = Bin::new(4, 0);
        let hashes = reference_hashes(16);
        let signature2 = key_pair().sign(&signing_payload(munro2, &hashes[&munro2]));
        client.offer_hash(munro2, hashes[&munro2]);
        client
            .offer_signed_munro(channel, munro2, signature2)
            .unwrap();
        assert_eq!(client.picker().peers.len(), 1);
    }

    #[test]
    fn second_channel_announcing_same_munro_is_registered() {
        let mut client = LiveClient::new(config(), VecStorage::default(), RecordingPicker::default());
        let first = client.add_channel(true);
        let second = client.add_channel(false);

        let hashes = reference_hashes(8);
        let munro = Bin::new(3, 0);
        let signature = key_pair().sign(&signing_payload(munro, &hashes[&munro]));

        client.offer_hash(munro, hashes[&munro]);
        client.offer_signed_munro(first, munro, signature).unwrap();
        // The second channel re-announces the same munro; no candidate hash is cached anymore.
        client.offer_hash(munro, hashes[&munro]);
        client.offer_signed_munro(second, munro, signature).unwrap();

        assert_eq!(
            client.picker().peers,
            [(first, munro, true), (second, munro, false)]
        );
    }

    #[test]
    fn verified_chunks_land_in_storage() {
        let mut client = LiveClient::new(config(), VecStorage::default(), RecordingPicker::default());
        let channel = client.add_channel(false);

        let num_chunks = 4u64;
        let hashes = reference_hashes(num_chunks);
        for peak in gen_peaks(num_chunks).iter() {
            let signature = key_pair().sign(&signing_payload(*peak, &hashes[peak]));
            client.offer_hash(*peak, hashes[peak]);
            client.offer_signed_munro(channel, *peak, signature).unwrap();
        }

        for chunk_id in 0..num_chunks {
            let bin = Bin::from_chunk(chunk_id);
            let peak = client.tree().unwrap().peak_for(bin).unwrap();
            let mut uncles = Vec::new();
            let mut pos = bin;
            while pos != peak {
                uncles.push(pos.sibling());
                pos = pos.parent();
            }
            for uncle in uncles.iter().rev() {
                client.offer_hash(*uncle, hashes[uncle]);
            }
            client.offer_data(bin, &chunk_bytes(chunk_id)).unwrap();
        }

        let chunk_size = usize::try_from(CHUNK_SIZE).unwrap();
        assert_eq!(client.storage.bytes.len(), 4 * chunk_size);
        for chunk_id in 0..num_chunks {
            let start = usize::try_from(chunk_id).unwrap() * chunk_size;
            assert_eq!(
                &client.storage.bytes[start..start + chunk_size],
                &chunk_bytes(chunk_id)[..]
            );
        }
        assert!(client.ack_out().is_filled(Bin::new(2, 0)));
    }

    #[test]
    fn unverified_chunk_never_reaches_storage() {
        let mut client = LiveClient::new(config(), VecStorage::default(), RecordingPicker::default());
        let channel = client.add_channel(false);

        let hashes = reference_hashes(8);
        let munro = Bin::new(3, 0);
        let signature = key_pair().sign(&signing_payload(munro, &hashes[&munro]));
        client.offer_hash(munro, hashes[&munro]);
        client.offer_signed_munro(channel, munro, signature).unwrap();

        // No uncles were sent: the chunk can't verify and must not be stored.
        assert!(client.offer_data(Bin::from_chunk(2), &chunk_bytes(2)).is_err());
        assert!(client.storage.bytes.is_empty());
    }

    #[test]
    fn seq_complete_measured_from_hook_in() {
        let mut client = LiveClient::new(config(), VecStorage::default(), RecordingPicker::default());
        assert_eq!(client.seq_complete(), 0);
        assert_eq!(client.hook_in_offset(), None);

        let channel = client.add_channel(true);
        let hashes = reference_hashes(16);
        // Tune in mid-stream: the peer's munro covers chunks 8..16.
        let munro = Bin::new(3, 1);
        let munro_hash = hashes[&Bin::new(3, 1)];
        let signature = key_pair().sign(&signing_payload(munro, &munro_hash));
        client.offer_hash(munro, munro_hash);
        client.offer_signed_munro(channel, munro, signature).unwrap();

        // Hooked in at chunk 8, no progress yet.
        assert_eq!(client.hook_in_offset(), Some(8 * u64::from(CHUNK_SIZE)));
        assert_eq!(client.seq_complete(), 0);

        client.picker.current = Some(Bin::from_chunk(11));
        assert_eq!(client.seq_complete(), 3 * u64::from(CHUNK_SIZE));
    }

    #[test]
    fn treeless_client_stores_blindly() {
        let mut client = LiveClient::new(
            Config {
                integrity_protection: ContentIntegrityProtection::None,
                ..config()
            },
            VecStorage::default(),
            RecordingPicker::default(),
        );
        client.offer_data(Bin::from_chunk(0), &chunk_bytes(0)).unwrap();
        assert!(client.ack_out().is_filled(Bin::from_chunk(0)));
        assert!(client
            .offer_data(Bin::new(1, 0), &chunk_bytes(0))
            .is_err());
    }

    #[test]
    fn munro_on_treeless_transfer_is_rejected() {
        let mut client = LiveClient::new(
            Config {
                integrity_protection: ContentIntegrityProtection::None,
                ..config()
            },
            VecStorage::default(),
            RecordingPicker::default(),
        );
        let channel = client.add_channel(false);
        let signature = key_pair().sign(b"anything");
        assert!(client
            .offer_signed_munro(channel, Bin::new(3, 0), signature)
            .is_err());
    }
}
