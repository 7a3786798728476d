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

//! Live checkpoint codec.
//!
//! A live source periodically saves its most recent munro to a small checkpoint file, so that a
//! restarted source can resume the same swarm without invalidating the chunks already delivered.
//! The checkpoint is a single `\n`-terminated ASCII line:
//!
//! ```text
//! (LAYER,OFFSET) HASH-IN-HEX DECIMAL-TIMESTAMP SIGNATURE-IN-HEX
//! ```
//!
//! This module only encodes and decodes the line. Reading and writing the file is the
//! embedder's job; since a partially-written checkpoint is undecodable, embedders should write
//! to a temporary file and rename it into place.
//!
//! A decode failure means "no usable checkpoint": the caller is expected to start a fresh
//! stream from chunk 0 rather than propagate the error.

use super::MunroTuple;
use crate::bins::Bin;
use crate::identity::{Sha1Hash, Signature};
use crate::util;

use alloc::{format, string::String, vec::Vec};
use nom::Finish as _;

/// Turns a munro into the checkpoint line that [`decode`] accepts.
pub fn encode(munro: &MunroTuple) -> Vec<u8> {
    let line: String = format!(
        "{} {} {} {}\n",
        munro.bin, munro.hash, munro.timestamp, munro.signature
    );
    line.into_bytes()
}

/// Decodes a checkpoint line previously produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<MunroTuple, DecodeError> {
    let result: Result<_, nom::error::Error<&[u8]>> = nom::combinator::all_consuming(
        nom::combinator::map(
            nom::sequence::tuple((
                bin_decode,
                nom::bytes::complete::tag(" "),
                hash_decode,
                nom::bytes::complete::tag(" "),
                nom::character::complete::i64,
                nom::bytes::complete::tag(" "),
                signature_decode,
                nom::combinator::opt(nom::bytes::complete::tag("\n")),
            )),
            |(bin, _, hash, _, timestamp, _, signature, _)| MunroTuple {
                bin,
                hash,
                signature,
                timestamp,
            },
        ),
    )(bytes)
    .finish();

    match result {
        Ok((_, munro)) => Ok(munro),
        Err(err) => Err(DecodeError(err.code)),
    }
}

/// Error potentially returned by [`decode`].
#[derive(Debug, derive_more::Display)]
#[display(fmt = "Failed to decode a checkpoint line")]
pub struct DecodeError(nom::error::ErrorKind);

fn bin_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], Bin, E> {
    nom::combinator::map_opt(
        nom::sequence::delimited(
            nom::bytes::complete::tag("("),
            nom::sequence::separated_pair(
                nom::character::complete::u32,
                nom::bytes::complete::tag(","),
                nom::character::complete::u64,
            ),
            nom::bytes::complete::tag(")"),
        ),
        |(layer, offset)| {
            if layer >= 64 || (layer != 63 && offset >= (1 << (63 - layer))) {
                return None;
            }
            Some(Bin::new(layer, offset))
        },
    )(bytes)
}

fn hash_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], Sha1Hash, E> {
    nom::combinator::map_opt(
        nom::bytes::complete::take_while_m_n(40, 40, |c: u8| c.is_ascii_hexdigit()),
        |digits| Some(Sha1Hash(util::hex_to_fixed::<20>(digits)?)),
    )(bytes)
}

fn signature_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], Signature, E> {
    nom::combinator::map_opt(
        nom::bytes::complete::take_while_m_n(128, 128, |c: u8| c.is_ascii_hexdigit()),
        |digits| Some(Signature::from_bytes(util::hex_to_fixed::<64>(digits)?)),
    )(bytes)
}
