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

//! Lookup of values in a bencoded dictionary.
//!
//! Trackers reply with a [bencoded](http://www.bittorrent.org/beps/bep_0003.html) dictionary.
//! Rather than decoding the whole document, this module extracts individual values: the key is
//! located with a plain substring search over the buffer, and the value that immediately
//! follows the match is then parsed strictly.
//!
//! The substring search is deliberately permissive: it doesn't understand the structure of the
//! document, and a byte pattern inside a *value* could shadow a key. Callers are expected to
//! search for the length-prefixed form of the key (e.g. `5:peers` rather than `peers`), which
//! is unambiguous in the flat dictionaries trackers actually produce.

use crate::util;

/// Error potentially returned by [`dict_int`] and [`dict_string`].
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq)]
pub enum Error {
    /// The key doesn't appear anywhere in the buffer.
    KeyNotFound,
    /// The key was found but the bytes that follow aren't a well-formed value of the requested
    /// kind.
    InvalidValue,
}

/// Finds `key` in `buffer` and parses the integer value (`i<decimal>e`) that follows it.
/// Returns the decimal ASCII digits of the value.
pub fn dict_int<'a>(buffer: &'a [u8], key: &str) -> Result<&'a [u8], Error> {
    let value = locate(buffer, key)?;
    let result: nom::IResult<_, _, nom::error::Error<&[u8]>> = nom::sequence::delimited(
        nom::bytes::complete::tag("i"),
        nom::combinator::recognize(nom::sequence::pair(
            nom::combinator::opt(nom::bytes::complete::tag("-")),
            nom::character::complete::digit1,
        )),
        nom::bytes::complete::tag("e"),
    )(value);
    match result {
        Ok((_, digits)) => Ok(digits),
        Err(_) => Err(Error::InvalidValue),
    }
}

/// Finds `key` in `buffer` and parses the byte string value (`<decimal>:<bytes>`) that follows
/// it. Returns the value bytes.
pub fn dict_string<'a>(buffer: &'a [u8], key: &str) -> Result<&'a [u8], Error> {
    let value = locate(buffer, key)?;
    let result: nom::IResult<_, _, nom::error::Error<&[u8]>> =
        nom::multi::length_data(nom::combinator::map_res(
            nom::sequence::terminated(
                nom::character::complete::u64,
                nom::bytes::complete::tag(":"),
            ),
            usize::try_from,
        ))(value);
    match result {
        Ok((_, bytes)) => Ok(bytes),
        Err(_) => Err(Error::InvalidValue),
    }
}

/// Returns the bytes right after the first occurrence of `key`.
fn locate<'a>(buffer: &'a [u8], key: &str) -> Result<&'a [u8], Error> {
    let position = util::find(buffer, key.as_bytes()).ok_or(Error::KeyNotFound)?;
    Ok(&buffer[position + key.len()..])
}
