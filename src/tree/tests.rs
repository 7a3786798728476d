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

#![cfg(test)]

use super::{signing_payload, LiveHashTree, MunroTuple, OfferDataError};
use crate::bins::{gen_peaks, Bin};
use crate::identity::{KeyPair, Sha1Hash};

use alloc::collections::BTreeMap;
use alloc::{vec, vec::Vec};
use rand::seq::SliceRandom as _;

const CHUNK_SIZE: u32 = 1024;

fn key_pair() -> KeyPair {
    KeyPair::from_seed([7; 32])
}

fn chunk_bytes(chunk_id: u64) -> Vec<u8> {
    vec![u8::try_from(chunk_id % 255).unwrap(); usize::try_from(CHUNK_SIZE).unwrap()]
}

fn new_source() -> LiveHashTree {
    LiveHashTree::new_source(key_pair(), CHUNK_SIZE)
}

fn new_client() -> LiveHashTree {
    LiveHashTree::new_client(*key_pair().public_key(), CHUNK_SIZE)
}

fn source_with_chunks(num_chunks: u64) -> LiveHashTree {
    let mut tree = new_source();
    for chunk_id in 0..num_chunks {
        tree.add_data(&chunk_bytes(chunk_id));
        tree.check_sanity();
    }
    tree
}

/// Computes, outside of any tree, the hash of every node of the peak subtrees covering
/// `num_chunks` chunks of [`chunk_bytes`] content.
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
            let (left, right) = (hashes.get(&bin.left()), hashes.get(&bin.right()));
            if let (Some(left), Some(right)) = (left, right) {
                let parent = Sha1Hash::from_children(left, right);
                hashes.insert(bin, parent);
            }
        }
    }
    hashes
}

/// Sends the signed peaks of a `num_chunks` stream to a client tree, then every chunk in the
/// order given by `order`, each preceded by its uncle hashes from the peak down.
fn download(tree: &mut LiveHashTree, num_chunks: u64, order: &[u64]) {
    let hashes = reference_hashes(num_chunks);
    let peaks = gen_peaks(num_chunks);

    for peak in &peaks {
        let hash = hashes[peak];
        let signature = key_pair().sign(&signing_payload(*peak, &hash));
        tree.offer_hash(*peak, hash);
        tree.offer_signed_peak_hash(*peak, signature).unwrap();
        tree.check_sanity();
    }

    for chunk_id in order {
        let bin = Bin::from_chunk(*chunk_id);
        let peak = tree.peak_for(bin).unwrap();

        let mut uncles = Vec::new();
        let mut pos = bin;
        while pos != peak {
            uncles.push(pos.sibling());
            pos = pos.parent();
        }
        for uncle in uncles.iter().rev() {
            tree.offer_hash(*uncle, hashes[uncle]);
            tree.check_sanity();
        }

        tree.offer_data(bin, &chunk_bytes(*chunk_id)).unwrap();
        tree.check_sanity();
    }
}

/// Checks that every verified non-leaf node whose children are materialized carries the hash of
/// the concatenation of its children's hashes.
fn check_verified_parents(tree: &LiveHashTree) {
    for (_, node) in &tree.nodes {
        if !node.verified {
            continue;
        }
        if let (Some(left), Some(right)) = (node.left, node.right) {
            let (left, right) = (&tree.nodes[left], &tree.nodes[right]);
            if left.hash.is_zero() || right.hash.is_zero() {
                continue;
            }
            assert_eq!(node.hash, Sha1Hash::from_children(&left.hash, &right.hash));
        }
    }
}

#[test]
fn source_ten_chunks_two_peaks() {
    let tree = source_with_chunks(10);
    assert_eq!(tree.peak_count(), 2);
    assert_eq!(tree.peak(0), Bin::new(3, 0));
    assert_eq!(tree.peak(1), Bin::new(1, 4));
}

#[test]
fn source_peaks_follow_appends() {
    let mut tree = new_source();
    for num_chunks in 1..=64u64 {
        tree.add_data(&chunk_bytes(num_chunks - 1));
        tree.check_sanity();
        assert_eq!(tree.size_in_chunks(), num_chunks);
        assert_eq!(tree.chunks_complete(), num_chunks);
        let expected = gen_peaks(num_chunks);
        assert_eq!(tree.peak_count(), expected.len());
        for (index, peak) in expected.iter().enumerate() {
            assert_eq!(tree.peak(index), *peak);
        }
    }
}

#[test]
fn source_hashes_match_reference() {
    let mut tree = source_with_chunks(12);
    tree.update_signed_peaks();
    check_verified_parents(&tree);
    for (bin, hash) in reference_hashes(12) {
        assert_eq!(tree.hash(bin), Some(&hash), "bin {}", bin);
    }
}

#[test]
fn signed_peaks_track_peaks() {
    let mut tree = new_source();
    for chunk_id in 0..4u64 {
        tree.add_data(&chunk_bytes(chunk_id));
    }
    assert_eq!(tree.update_signed_peaks(), Some(0));
    assert_eq!(tree.signed_peak_count(), 1);
    assert_eq!(tree.signed_peak(0), Bin::new(2, 0));
    // Nothing changed: no re-signing.
    assert_eq!(tree.update_signed_peaks(), None);

    tree.add_data(&chunk_bytes(4));
    tree.add_data(&chunk_bytes(5));
    assert_eq!(tree.update_signed_peaks(), Some(1));
    assert_eq!(tree.signed_peak_count(), 2);
    assert_eq!(tree.signed_peak(1), Bin::new(1, 2));
}

#[test]
fn munro_covers_latest_epoch() {
    let mut tree = new_source();
    for chunk_id in 0..4u64 {
        tree.add_data(&chunk_bytes(chunk_id));
    }
    let munro = tree.add_signed_munro(77);
    assert_eq!(munro.bin, Bin::new(2, 0));
    assert_eq!(munro.timestamp, 77);
    assert_eq!(tree.hash(munro.bin), Some(&munro.hash));
    assert!(key_pair()
        .public_key()
        .verify(&signing_payload(munro.bin, &munro.hash), &munro.signature)
        .is_ok());
}

#[test]
fn download_eight_in_order() {
    let mut tree = new_client();
    let order = (0..8).collect::<Vec<_>>();
    download(&mut tree, 8, &order);
    assert_eq!(tree.peak_count(), 1);
    assert_eq!(tree.peak(0), Bin::new(3, 0));
    assert_eq!(tree.chunks_complete(), 8);
    check_verified_parents(&tree);
}

#[test]
fn download_ten_in_order() {
    let mut tree = new_client();
    let order = (0..10).collect::<Vec<_>>();
    download(&mut tree, 10, &order);
    assert_eq!(tree.peak_count(), 2);
    assert_eq!(tree.peak(0), Bin::new(3, 0));
    assert_eq!(tree.peak(1), Bin::new(1, 4));
    assert_eq!(tree.chunks_complete(), 10);
}

#[test]
fn download_eleven_reverse() {
    let mut tree = new_client();
    let order = (0..11).rev().collect::<Vec<_>>();
    download(&mut tree, 11, &order);
    assert_eq!(tree.peak_count(), 3);
    assert_eq!(tree.peak(0), Bin::new(3, 0));
    assert_eq!(tree.peak(1), Bin::new(1, 4));
    assert_eq!(tree.peak(2), Bin::new(0, 10));
    assert_eq!(tree.chunks_complete(), 11);
    check_verified_parents(&tree);
}

#[test]
fn download_random_permutations() {
    for num_chunks in 1..=16u64 {
        let mut order = (0..num_chunks).collect::<Vec<_>>();
        order.shuffle(&mut rand::thread_rng());

        let mut tree = new_client();
        download(&mut tree, num_chunks, &order);

        let expected = gen_peaks(num_chunks);
        assert_eq!(tree.peak_count(), expected.len(), "order {:?}", order);
        for (index, peak) in expected.iter().enumerate() {
            assert_eq!(tree.peak(index), *peak);
        }
        assert_eq!(tree.chunks_complete(), num_chunks);
        check_verified_parents(&tree);
    }
}

#[test]
fn download_order_invariant() {
    // Any two delivery orders of the same chunks produce trees with the same peaks, the same
    // peak hashes and the same completion count.
    let mut in_order = new_client();
    download(&mut in_order, 13, &(0..13).collect::<Vec<_>>());

    for _ in 0..8 {
        let mut order = (0..13).collect::<Vec<_>>();
        order.shuffle(&mut rand::thread_rng());
        let mut shuffled = new_client();
        download(&mut shuffled, 13, &order);

        assert_eq!(shuffled.peak_count(), in_order.peak_count());
        for index in 0..in_order.peak_count() {
            assert_eq!(shuffled.peak(index), in_order.peak(index));
            assert_eq!(
                shuffled.peak_hash(index).unwrap(),
                in_order.peak_hash(index).unwrap()
            );
        }
        assert_eq!(shuffled.chunks_complete(), in_order.chunks_complete());
    }
}

#[test]
fn source_and_client_agree_on_derived_root() {
    let mut source = source_with_chunks(11);
    source.update_signed_peaks();

    let mut client = new_client();
    download(&mut client, 11, &(0..11).collect::<Vec<_>>());

    assert_ne!(source.derive_root(), Sha1Hash::ZERO);
    assert_eq!(source.derive_root(), client.derive_root());
}

#[test]
fn offer_data_guards() {
    let mut tree = new_client();
    assert_eq!(
        tree.offer_data(Bin::from_chunk(0), &chunk_bytes(0)),
        Err(OfferDataError::AwaitingSignedPeak)
    );

    download(&mut tree, 8, &[0]);
    assert_eq!(
        tree.offer_data(Bin::new(1, 0), &chunk_bytes(1)),
        Err(OfferDataError::NotBaseLayer)
    );
    assert_eq!(
        tree.offer_data(Bin::from_chunk(1), &chunk_bytes(1)[..10]),
        Err(OfferDataError::BadLength)
    );
    assert_eq!(
        tree.offer_data(Bin::from_chunk(200), &chunk_bytes(200)),
        Err(OfferDataError::NoCoveringPeak)
    );

    // Delivering a chunk without its uncles fails, and doesn't mark anything complete.
    assert_eq!(
        tree.offer_data(Bin::from_chunk(5), &chunk_bytes(5)),
        Err(OfferDataError::InvalidProof)
    );
    assert_eq!(tree.chunks_complete(), 1);

    // Re-delivering an accepted chunk is a no-op.
    assert!(tree.offer_data(Bin::from_chunk(0), &chunk_bytes(0)).is_ok());
    assert_eq!(tree.chunks_complete(), 1);
}

#[test]
fn corrupted_chunk_is_rejected() {
    let mut tree = new_client();
    download(&mut tree, 4, &[0, 1]);

    // Correct uncles for chunk 2, then a chunk whose content doesn't match them.
    let hashes = reference_hashes(4);
    tree.offer_hash(Bin::from_chunk(3), hashes[&Bin::from_chunk(3)]);
    tree.offer_hash(Bin::new(1, 0), hashes[&Bin::new(1, 0)]);
    assert_eq!(
        tree.offer_data(Bin::from_chunk(2), &chunk_bytes(77)),
        Err(OfferDataError::InvalidProof)
    );
    assert_eq!(tree.chunks_complete(), 2);

    // The real chunk still goes through.
    assert!(tree.offer_data(Bin::from_chunk(2), &chunk_bytes(2)).is_ok());
    assert_eq!(tree.chunks_complete(), 3);
}

#[test]
fn bad_signature_is_rejected() {
    let mut tree = new_client();
    let hashes = reference_hashes(8);
    let peak = Bin::new(3, 0);
    let hash = hashes[&peak];

    // Signature from the wrong key.
    let impostor = KeyPair::from_seed([8; 32]);
    let signature = impostor.sign(&signing_payload(peak, &hash));
    tree.offer_hash(peak, hash);
    assert!(tree.offer_signed_peak_hash(peak, signature).is_err());
    assert!(tree.is_awaiting_signed_peak());
    assert_eq!(tree.peak_count(), 0);

    // Signature over a different bin.
    let signature = key_pair().sign(&signing_payload(Bin::new(2, 0), &hash));
    assert!(tree.offer_signed_peak_hash(peak, signature).is_err());

    // The correct signature still goes through afterwards.
    let signature = key_pair().sign(&signing_payload(peak, &hash));
    assert!(tree.offer_signed_peak_hash(peak, signature).is_ok());
    assert!(!tree.is_awaiting_signed_peak());
}

#[test]
fn reannounced_peak_verifies_against_stored_hash() {
    // A second channel re-announces a peak the client already accepted. There is no cached
    // candidate hash anymore; the signature must check out against the stored peak hash.
    let mut tree = new_client();
    let hashes = reference_hashes(8);
    let peak = Bin::new(3, 0);
    let hash = hashes[&peak];
    let signature = key_pair().sign(&signing_payload(peak, &hash));

    tree.offer_hash(peak, hash);
    tree.offer_signed_peak_hash(peak, signature).unwrap();
    assert!(tree.offer_signed_peak_hash(peak, signature).is_ok());
    assert_eq!(tree.peak_count(), 1);

    let impostor = KeyPair::from_seed([9; 32]).sign(&signing_payload(peak, &hash));
    assert!(tree.offer_signed_peak_hash(peak, impostor).is_err());
}

#[test]
fn signed_peak_without_candidate_is_rejected() {
    let mut tree = new_client();
    let hashes = reference_hashes(8);
    let peak = Bin::new(3, 0);
    let signature = key_pair().sign(&signing_payload(peak, &hashes[&peak]));
    assert!(tree.offer_signed_peak_hash(peak, signature).is_err());
}

#[test]
fn growing_peak_subsumes_older_ones() {
    // An 8-chunk peak followed by a 16-chunk peak covering it: the client must end up with a
    // single peak.
    let mut tree = new_client();
    let hashes = reference_hashes(16);

    for peak in [Bin::new(3, 0), Bin::new(4, 0)] {
        let hash = hashes[&peak];
        let signature = key_pair().sign(&signing_payload(peak, &hash));
        tree.offer_hash(peak, hash);
        tree.offer_signed_peak_hash(peak, signature).unwrap();
    }

    assert_eq!(tree.peak_count(), 1);
    assert_eq!(tree.peak(0), Bin::new(4, 0));
    assert_eq!(tree.signed_peak_count(), 1);
    assert_eq!(tree.size_in_chunks(), 16);
}

#[test]
fn prune_keeps_stub_hash() {
    let mut tree = source_with_chunks(16);
    tree.update_signed_peaks();

    let pruned = Bin::new(2, 0);
    let hash_before = *tree.hash(pruned).unwrap();
    let nodes_before = tree.node_count();

    tree.prune_tree(pruned).unwrap();
    tree.check_sanity();

    // The stub hash survives, the descendants don't.
    assert_eq!(tree.hash(pruned), Some(&hash_before));
    assert!(tree.hash(Bin::new(1, 0)).is_none());
    assert!(tree.hash(Bin::from_chunk(2)).is_none());
    assert_eq!(tree.node_count(), nodes_before - 6);

    // Proofs toward the peak above the pruned subtree still work.
    let expected = reference_hashes(16);
    assert_eq!(tree.hash(Bin::new(4, 0)), Some(&expected[&Bin::new(4, 0)]));
    assert_eq!(tree.hash(Bin::new(3, 0)), Some(&expected[&Bin::new(3, 0)]));
    assert_eq!(tree.hash(Bin::new(2, 1)), Some(&expected[&Bin::new(2, 1)]));
}

#[test]
fn prune_refuses_signed_peaks() {
    let mut tree = source_with_chunks(10);
    tree.update_signed_peaks();
    // (3,0) and (1,4) are signed peaks; an ancestor of (3,0) can't be pruned.
    assert!(tree.prune_tree(Bin::new(4, 0)).is_err());
    assert!(tree.prune_tree(Bin::new(3, 0)).is_ok());
}

#[test]
fn checkpoint_restart_matches_uninterrupted_source() {
    // A source signs 8 chunks, is restarted from its checkpoint, and produces 8 more chunks.
    // The resulting peak must be bit-identical to that of a source that never restarted.
    let mut first_run = new_source();
    for chunk_id in 0..8u64 {
        first_run.add_data(&chunk_bytes(chunk_id));
    }
    let checkpoint = first_run.add_signed_munro(1);
    assert_eq!(checkpoint.bin, Bin::new(3, 0));

    let mut restarted = new_source();
    assert!(restarted.init_from_checkpoint(&checkpoint));
    assert_eq!(restarted.size_in_chunks(), 8);
    for chunk_id in 8..16u64 {
        restarted.add_data(&chunk_bytes(chunk_id));
        restarted.check_sanity();
    }
    let munro = restarted.add_signed_munro(2);
    assert_eq!(munro.bin, Bin::new(4, 0));

    let mut uninterrupted = source_with_chunks(16);
    let expected = uninterrupted.add_signed_munro(2);
    assert_eq!(munro.bin, expected.bin);
    assert_eq!(munro.hash, expected.hash);
}

#[test]
fn checkpoint_restart_from_unaligned_munro() {
    // 56 chunks signed in epochs of 8 end on munro (3,6). A restart from there grows the tree
    // above the munro; 8 more chunks make (4,3) the new rightmost peak.
    let mut first_run = new_source();
    for chunk_id in 0..56u64 {
        first_run.add_data(&chunk_bytes(chunk_id));
    }
    let checkpoint = first_run.add_signed_munro(1);
    assert_eq!(checkpoint.bin, Bin::new(3, 6));

    let mut restarted = new_source();
    assert!(restarted.init_from_checkpoint(&checkpoint));
    assert_eq!(restarted.size_in_chunks(), 56);

    for chunk_id in 56..64u64 {
        let bin = restarted.add_data(&chunk_bytes(chunk_id));
        assert_eq!(bin, Bin::from_chunk(chunk_id));
        restarted.check_sanity();
    }
    assert_eq!(restarted.peak_count(), 1);
    assert_eq!(restarted.peak(0), Bin::new(4, 3));

    let munro = restarted.add_signed_munro(2);
    assert_eq!(munro.bin, Bin::new(4, 3));

    // The new munro hash folds the checkpoint hash with the hash of the new subtree.
    let expected = reference_hashes(64);
    let new_subtree = expected[&Bin::new(3, 7)];
    assert_eq!(
        munro.hash,
        Sha1Hash::from_children(&checkpoint.hash, &new_subtree)
    );
}

#[test]
fn checkpoint_rejected_on_non_empty_tree() {
    let mut tree = source_with_chunks(4);
    let munro = MunroTuple {
        bin: Bin::new(3, 0),
        hash: Sha1Hash::ZERO,
        signature: key_pair().sign(b""),
        timestamp: 0,
    };
    assert!(!tree.init_from_checkpoint(&munro));
}
