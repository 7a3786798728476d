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

//! Core of a peer-to-peer live-streaming transport, based on the Peer-to-Peer Streaming Peer
//! Protocol (PPSPP, [RFC 7574](https://datatracker.ietf.org/doc/html/rfc7574)).
//!
//! A live *source* cuts an unbounded stream of bytes into fixed-size chunks and distributes
//! them to a swarm of receivers, which re-distribute them to each other. Unlike a static file
//! swarm, where a single Merkle root hash authenticates everything, a live swarm is identified
//! by the public key of its source: the source maintains a dynamically growing Merkle tree over
//! the chunks and periodically signs its peaks, and receivers verify every chunk against those
//! signed peaks. See the [`tree`] module for the details.
//!
//! # Scope
//!
//! This crate contains the protocol logic only: state machines, codecs and arithmetic. It
//! performs no I/O whatsoever; sockets, timers, files and HTTP requests are the embedder's
//! business, which makes the crate usable in `no_std` environments (the `alloc` crate is
//! required).
//!
//! Because everything network-facing is driven by the embedder calling into plain `&mut self`
//! methods, a single-threaded embedder gets the PPSPP concurrency model (one cooperative event
//! loop, no re-entrancy) for free, and nothing here needs locks.
//!
//! # Layout
//!
//! - [`bins`]: addressing of chunks and Merkle nodes as 64-bits labels, plus sets of them.
//! - [`identity`]: hashes, signatures, key pairs and swarm identifiers.
//! - [`tree`]: the live Merkle hash tree, its signed peaks ("munros") and the checkpoint codec.
//! - [`transfer`]: the source and client transfer state machines.
//! - [`tracker`]: BitTorrent HTTP tracker announces, for peer discovery.

#![deny(unused_crate_dependencies)]
#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

// Used by the randomized test suites only.
#[cfg(test)]
use rand as _;

pub mod bins;
pub mod identity;
pub mod tracker;
pub mod transfer;
pub mod tree;

mod util;
