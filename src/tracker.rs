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

//! BitTorrent HTTP tracker exchange.
//!
//! Peers of a swarm can be discovered through a plain
//! [BitTorrent tracker](https://wiki.theory.org/BitTorrent_Tracker_Protocol): the swarm id is
//! hashed down to a 20-bytes infohash, announced over an HTTP GET request, and the tracker
//! replies with a bencoded dictionary containing a compact list of peer addresses.
//!
//! This module builds the query string of the announce request
//! ([`build_announce_query`]) and decodes the response body
//! ([`decode_announce_response`]). Performing the HTTP request itself, with whatever timeout is
//! appropriate, is the embedder's job; on timeout the partial response must be discarded rather
//! than decoded.

use crate::identity::SwarmId;
use crate::util;

use alloc::{format, string::String, string::ToString as _, vec::Vec};
use core::str;
use no_std_net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use rand_chacha::rand_core::{RngCore as _, SeedableRng as _};

pub mod bencode;

/// Prefix identifying this client implementation, per the
/// [common conventions](https://wiki.theory.org/BitTorrentSpecification#peer_id).
const PEER_ID_PREFIX: &[u8; 8] = b"-SS1000-";

/// 20-bytes identifier this peer announces itself under.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates a peer id: the fixed client prefix followed by 12 random bytes derived from
    /// `randomness_seed`. The seed must differ between peers; its quality is the embedder's
    /// choice.
    pub fn random(randomness_seed: [u8; 32]) -> PeerId {
        let mut randomness = rand_chacha::ChaCha20Rng::from_seed(randomness_seed);
        let mut bytes = [0; 20];
        bytes[..8].copy_from_slice(PEER_ID_PREFIX);
        randomness.fill_bytes(&mut bytes[8..]);
        PeerId(bytes)
    }
}

/// Event optionally reported to the tracker with an announce.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// First announce of this download.
    Started,
    /// The download just completed.
    Completed,
    /// The peer is shutting down.
    Stopped,
}

impl AnnounceEvent {
    fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

/// Parameters of an announce request.
#[derive(Debug)]
pub struct AnnounceRequest<'a> {
    /// Swarm being announced. Hashed down to the `info_hash` parameter.
    pub swarm_id: &'a SwarmId,
    /// Identity of this peer.
    pub peer_id: &'a PeerId,
    /// UDP port this peer listens on.
    pub port: u16,
    /// Total bytes uploaded so far.
    pub uploaded: u64,
    /// Total bytes downloaded so far.
    pub downloaded: u64,
    /// Bytes left to download. Meaningless for a live stream; pass `u64::MAX` there.
    pub left: u64,
    /// Event to report, if any.
    pub event: Option<AnnounceEvent>,
}

/// Builds the query string of an announce. The request URL is `<tracker-url>?<query>`.
///
/// A compact peer list is always requested, as
/// [most trackers require it](http://www.bittorrent.org/beps/bep_0023.html).
pub fn build_announce_query(request: &AnnounceRequest) -> String {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        util::uri_encode(request.swarm_id.info_hash().as_bytes()),
        util::uri_encode(&request.peer_id.0),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
    );
    if let Some(event) = &request.event {
        query.push_str("&event=");
        query.push_str(event.as_str());
    }
    query
}

/// Successfully decoded announce response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Number of seconds the tracker asks this peer to wait before announcing again. 0 if the
    /// tracker didn't say.
    pub interval: u32,
    /// Addresses of other peers of the swarm.
    pub peers: Vec<SocketAddr>,
}

/// Error potentially returned by [`decode_announce_response`].
///
/// The `Display` implementation produces the message to report to whoever asked for the
/// announce; announcing is retried on the caller's own schedule regardless of the error.
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq)]
pub enum AnnounceError {
    /// The HTTP status of the response wasn't 200.
    #[display(fmt = "Invalid HTTP Response Code")]
    InvalidHttpResponseCode,
    /// The tracker reported an explicit failure.
    #[display(fmt = "Tracker responded: {}", _0)]
    Failure(String),
    /// A `failure reason` key is present but its value is unreadable.
    #[display(fmt = "Error parsing tracker response: failure reason")]
    FailureReasonParse,
    /// The `interval` value is unreadable.
    #[display(fmt = "Error parsing tracker response: interval")]
    IntervalParse,
    /// The peer list is absent or unreadable.
    #[display(fmt = "Error parsing tracker response: peerlist")]
    PeerListParse {
        /// Interval parsed before the failure, so the caller can still honor it.
        interval: u32,
    },
}

/// Decodes the body of a tracker announce HTTP response.
pub fn decode_announce_response(
    http_status_code: u16,
    body: &[u8],
) -> Result<AnnounceResponse, AnnounceError> {
    if http_status_code != 200 {
        return Err(AnnounceError::InvalidHttpResponseCode);
    }

    // An explicit failure short-circuits everything else.
    match bencode::dict_string(body, "14:failure reason") {
        Ok(reason) => {
            return Err(AnnounceError::Failure(
                String::from_utf8_lossy(reason).to_string(),
            ))
        }
        Err(bencode::Error::KeyNotFound) => {}
        Err(bencode::Error::InvalidValue) => return Err(AnnounceError::FailureReasonParse),
    }

    let interval = match bencode::dict_int(body, "8:interval") {
        Ok(digits) => str::from_utf8(digits)
            .ok()
            .and_then(|digits| digits.parse::<u32>().ok())
            .ok_or(AnnounceError::IntervalParse)?,
        Err(bencode::Error::KeyNotFound) => 0,
        Err(bencode::Error::InvalidValue) => return Err(AnnounceError::IntervalParse),
    };

    let mut peers = Vec::new();
    let mut found_list = false;

    match bencode::dict_string(body, "5:peers") {
        Ok(compact) => {
            decode_compact_peers_v4(compact, &mut peers)
                .map_err(|()| AnnounceError::PeerListParse { interval })?;
            found_list = true;
        }
        Err(bencode::Error::KeyNotFound) => {}
        Err(bencode::Error::InvalidValue) => {
            return Err(AnnounceError::PeerListParse { interval })
        }
    }

    match bencode::dict_string(body, "6:peers6") {
        Ok(compact) => {
            decode_compact_peers_v6(compact, &mut peers)
                .map_err(|()| AnnounceError::PeerListParse { interval })?;
            found_list = true;
        }
        Err(bencode::Error::KeyNotFound) => {}
        Err(bencode::Error::InvalidValue) => {
            return Err(AnnounceError::PeerListParse { interval })
        }
    }

    if !found_list {
        return Err(AnnounceError::PeerListParse { interval });
    }

    Ok(AnnounceResponse { interval, peers })
}

/// Decodes a sequence of 6-bytes records (`4B address ‖ 2B port`, big endian).
fn decode_compact_peers_v4(compact: &[u8], out: &mut Vec<SocketAddr>) -> Result<(), ()> {
    let result: nom::IResult<_, _, nom::error::Error<&[u8]>> =
        nom::combinator::all_consuming(nom::multi::many0(nom::combinator::map(
            nom::sequence::pair(
                nom::bytes::complete::take(4_usize),
                nom::number::complete::be_u16,
            ),
            |(address, port): (&[u8], u16)| {
                let address = <[u8; 4]>::try_from(address).unwrap();
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(address), port))
            },
        )))(compact);
    match result {
        Ok((_, addresses)) => {
            out.extend(addresses);
            Ok(())
        }
        Err(_) => Err(()),
    }
}

/// Decodes a sequence of 18-bytes records (`16B address ‖ 2B port`, big endian).
fn decode_compact_peers_v6(compact: &[u8], out: &mut Vec<SocketAddr>) -> Result<(), ()> {
    let result: nom::IResult<_, _, nom::error::Error<&[u8]>> =
        nom::combinator::all_consuming(nom::multi::many0(nom::combinator::map(
            nom::sequence::pair(
                nom::bytes::complete::take(16_usize),
                nom::number::complete::be_u16,
            ),
            |(address, port): (&[u8], u16)| {
                let address = <[u8; 16]>::try_from(address).unwrap();
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(address), port, 0, 0))
            },
        )))(compact);
    match result {
        Ok((_, addresses)) => {
            out.extend(addresses);
            Ok(())
        }
        Err(_) => Err(()),
    }
}
