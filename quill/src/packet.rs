/* QUIC packet header parsing and packet number reconstruction. */
use crate::cid::{ConnectionId, MAX_CID_LEN};
use crate::common::{Error, Result};
use crate::Config;

/// Largest datagram this endpoint will emit.
pub const MAX_PACKET_SIZE: usize = 1536;

/// A server refuses to act on an Initial carried in a smaller datagram.
pub const ENFORCED_INITIAL_MTU: usize = 1200;

pub const RESET_SECRET_SIZE: usize = 16;

/// One type byte, at least 20 random bytes, then the 16-byte reset token.
pub const RESET_PACKET_MIN_SIZE: usize = 1 + 20 + RESET_SECRET_SIZE;

const FORM_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

/// Initial-secret salt for the draft-29 wire format.
const INITIAL_SALT_DRAFT29: [u8; 20] = [
    0xaf, 0xbf, 0xec, 0x28, 0x99, 0x93, 0xd2, 0x4c, 0x9e, 0x97, 0x86, 0xf1, 0x9c, 0x61, 0x11,
    0xe0, 0x43, 0x90, 0xa8, 0x99,
];

/// Salt used by drafts 23 through 28.
const INITIAL_SALT_DRAFT23: [u8; 20] = [
    0xc3, 0xee, 0xf7, 0x12, 0xc7, 0x2e, 0xbb, 0x5a, 0x11, 0xa7, 0xd2, 0x43, 0x2b, 0xb4, 0x63,
    0x65, 0xbe, 0xf9, 0xf5, 0x02,
];

/// An entry in the supported-versions table.
///
/// The table is endpoint-scoped configuration, not a process-wide global:
/// it travels inside [`Config`] and is passed by reference into every
/// operation that needs it.
#[derive(Clone, Copy, Debug)]
pub struct Version {
    pub number: u32,
    pub initial_salt: &'static [u8],
}

/// Versions this endpoint speaks, most preferred first.
pub const SUPPORTED_VERSIONS: &[Version] = &[
    Version {
        number: 0xff00_001d,
        initial_salt: &INITIAL_SALT_DRAFT29,
    },
    Version {
        number: 0xff00_001c,
        initial_salt: &INITIAL_SALT_DRAFT23,
    },
    Version {
        number: 0xff00_001b,
        initial_salt: &INITIAL_SALT_DRAFT23,
    },
];

/// Packet number space: independent ACK and packet-number domains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Space {
    Initial = 0,
    Handshake = 1,
    Application = 2,
}

pub const SPACE_COUNT: usize = 3;

/// Key-schedule epoch. 0-RTT shares the application space but not its keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Epoch {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

pub const EPOCH_COUNT: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    OneRttPhase0,
    OneRttPhase1,
    VersionNegotiation,
    Error,
}

impl PacketType {
    pub fn is_one_rtt(&self) -> bool {
        matches!(self, PacketType::OneRttPhase0 | PacketType::OneRttPhase1)
    }
}

/// First-pass parse result for one coalesced segment.
///
/// `offset` walks forward as more of the header becomes readable: after
/// parsing it points at the protected packet number, after header
/// protection removal at the payload. `offset + payload_length` never
/// exceeds the segment length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub ptype: PacketType,
    pub version: u32,
    /// Index into the supported-versions table; `None` when unsupported.
    pub version_index: Option<usize>,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token_offset: usize,
    pub token_length: usize,
    pub offset: usize,
    pub pn_offset: usize,
    pub pn: u32,
    pub pn64: u64,
    pub pnmask: u64,
    pub payload_length: usize,
    pub epoch: Epoch,
    pub space: Space,
    pub has_spin_bit: bool,
    pub spin: u8,
}

impl PacketHeader {
    /// A header that consumes the whole segment and decodes to nothing.
    fn error(length: usize) -> Self {
        PacketHeader {
            ptype: PacketType::Error,
            version: 0,
            version_index: None,
            dcid: ConnectionId::null(),
            scid: ConnectionId::null(),
            token_offset: 0,
            token_length: 0,
            offset: length,
            pn_offset: 0,
            pn: 0,
            pn64: 0,
            pnmask: 0,
            payload_length: 0,
            epoch: Epoch::Initial,
            space: Space::Initial,
            has_spin_bit: false,
            spin: 0,
        }
    }
}

/// Version-aware first pass over a segment.
///
/// Hard failures (truncated fixed fields, impossible CID lengths) are
/// `Err(Malformed)` and drop the rest of the datagram. Recoverable oddities
/// (fixed-bit violation, unknown version, bad token length) come back as
/// `Ok` with `ptype == Error` so the dispatcher can still answer with a
/// version negotiation where that applies.
pub fn parse_header(config: &Config, bytes: &[u8]) -> Result<PacketHeader> {
    let length = bytes.len();
    if length == 0 {
        return Err(Error::Malformed);
    }

    let first = bytes[0];

    if first & FIXED_BIT != FIXED_BIT {
        return Ok(PacketHeader::error(length));
    }

    if first & FORM_BIT == FORM_BIT {
        parse_long_header(config, bytes, first)
    } else {
        parse_short_header(config, bytes, first)
    }
}

fn parse_long_header(config: &Config, bytes: &[u8], first: u8) -> Result<PacketHeader> {
    let length = bytes.len();
    if length < 7 {
        return Err(Error::Malformed);
    }

    let mut b = octets::Octets::with_slice(bytes);
    b.skip(1)?;
    let version = b.get_u32()?;

    let dcil = b.get_u8()? as usize;
    if dcil > MAX_CID_LEN || 6 + dcil + 1 > length {
        return Err(Error::Malformed);
    }
    let dcid = ConnectionId::parse(&mut b, dcil)?;
    let scil = b.get_u8()? as usize;
    let scid = ConnectionId::parse(&mut b, scil)?;

    let mut ph = PacketHeader {
        ptype: PacketType::Error,
        version,
        version_index: config.version_index(version),
        dcid,
        scid,
        token_offset: 0,
        token_length: 0,
        offset: b.off(),
        pn_offset: 0,
        pn: 0,
        pn64: 0,
        pnmask: 0,
        payload_length: 0,
        epoch: Epoch::Initial,
        space: Space::Initial,
        has_spin_bit: false,
        spin: 0,
    };

    if version == 0 {
        // A zero version identifies a version negotiation packet; the
        // remainder of the segment is the version list.
        ph.ptype = PacketType::VersionNegotiation;
        ph.payload_length = length - ph.offset;
        return Ok(ph);
    }

    if ph.version_index.is_some() {
        match (first >> 4) & 3 {
            0 => {
                // Initial packets carry a retry token between the header
                // and the protected payload.
                ph.ptype = PacketType::Initial;
                ph.space = Space::Initial;
                ph.epoch = Epoch::Initial;

                match b.get_varint() {
                    Ok(tok_len) if tok_len as usize <= b.cap() => {
                        ph.token_length = tok_len as usize;
                        ph.token_offset = b.off();
                        b.skip(tok_len as usize)?;
                        ph.offset = b.off();
                    }
                    _ => {
                        ph.ptype = PacketType::Error;
                        ph.offset = length;
                        return Ok(ph);
                    }
                }
            }
            1 => {
                ph.ptype = PacketType::ZeroRtt;
                ph.space = Space::Application;
                ph.epoch = Epoch::ZeroRtt;
            }
            2 => {
                ph.ptype = PacketType::Handshake;
                ph.space = Space::Handshake;
                ph.epoch = Epoch::Handshake;
            }
            _ => {
                ph.ptype = PacketType::Retry;
                ph.space = Space::Initial;
                ph.epoch = Epoch::Initial;
            }
        }
    }

    if ph.ptype == PacketType::Retry {
        // No length field and no packet number; the body runs to the end
        // of the datagram.
        if length > ph.offset {
            ph.payload_length = length - ph.offset;
        } else {
            ph.ptype = PacketType::Error;
        }
        return Ok(ph);
    }

    // Initial, 0-RTT and Handshake carry an explicit payload length. An
    // unsupported version falls through here with the remainder instead,
    // so the dispatcher can answer with a version negotiation.
    match b.get_varint() {
        Ok(len)
            if ph.version_index.is_some()
                && ph.ptype != PacketType::Error
                && b.off() + len as usize <= length =>
        {
            ph.payload_length = len as usize;
            ph.offset = b.off();
            ph.pn_offset = b.off();
        }
        _ => {
            ph.ptype = PacketType::Error;
            ph.payload_length = length - ph.offset;
        }
    }

    Ok(ph)
}

fn parse_short_header(config: &Config, bytes: &[u8], first: u8) -> Result<PacketHeader> {
    let length = bytes.len();

    // The DCID length is not on the wire; the endpoint's own CID length
    // is implied by local configuration.
    let cid_len = config.local_cid_len;
    if length < 1 + cid_len {
        return Ok(PacketHeader::error(length));
    }

    let mut b = octets::Octets::with_slice(bytes);
    b.skip(1)?;
    let dcid = ConnectionId::parse(&mut b, cid_len)?;
    let offset = b.off();

    Ok(PacketHeader {
        // provisional: the key-phase bit is only readable after header
        // protection removal
        ptype: PacketType::OneRttPhase0,
        version: 0,
        version_index: None,
        dcid,
        scid: ConnectionId::null(),
        token_offset: 0,
        token_length: 0,
        offset,
        pn_offset: offset,
        pn: 0,
        pn64: 0,
        pnmask: 0,
        payload_length: length - offset,
        epoch: Epoch::OneRtt,
        space: Space::Application,
        has_spin_bit: true,
        spin: (first >> 5) & 1,
    })
}

/// Rebuilds the 62-bit packet number from a truncated wire value.
///
/// `highest` is the largest packet number seen so far in the space, `mask`
/// has the high bits set down to the truncated width (as produced during
/// header protection removal), and the result is the value congruent to
/// `pn` that lies closest to `highest + 1`, ties broken toward the lower
/// candidate.
pub fn packet_number_64(highest: u64, mask: u64, pn: u32) -> u64 {
    let expected = highest.wrapping_add(1);
    let not_mask_plus_one = (!mask).wrapping_add(1);
    let mut pn64 = (expected & mask) | u64::from(pn);

    if pn64 < expected {
        let delta1 = expected - pn64;
        let delta2 = not_mask_plus_one.wrapping_sub(delta1);
        if delta2 < delta1 {
            pn64 = pn64.wrapping_add(not_mask_plus_one);
        }
    } else {
        let delta1 = pn64 - expected;
        let delta2 = not_mask_plus_one.wrapping_sub(delta1);
        if delta2 <= delta1 && (pn64 & mask) > 0 {
            // out of sequence packet from the previous roll
            pn64 = pn64.wrapping_sub(not_mask_plus_one);
        }
    }

    pn64
}

/// The high-bit mask matching an `n`-byte packet number encoding.
pub fn pn_mask(pn_len: usize) -> u64 {
    debug_assert!((1..=4).contains(&pn_len));
    u64::MAX << (8 * pn_len)
}

/// Nibble encoding of a CID length, as used by the Retry body to echo the
/// original destination CID length.
pub fn encode_cid_len(len: usize) -> u8 {
    if len == 0 {
        0
    } else {
        (len as u8) - 3
    }
}

pub fn decode_cid_len(code: u8) -> usize {
    if code == 0 {
        0
    } else {
        code as usize + 3
    }
}
