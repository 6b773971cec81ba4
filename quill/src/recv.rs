/* Segment dispatch: the path from a parsed datagram to per-type handling.
 *
 * - Finds the connection, from the destination CID or, failing that, the
 *   peer address.
 * - Removes header protection, rebuilds the sequence number from the
 *   truncated value and the receive window, and opens the payload.
 * - Runs version checks and per-type admission, creating server-side
 *   connections from acceptable Initials.
 */
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time;

use crate::cid::ConnectionId;
use crate::common::{Error, Result};
use crate::conn::{Connection, State};
use crate::crypto;
use crate::hooks::{Events, FrameProcessor, HandshakeDriver};
use crate::packet::{
    self, PacketHeader, PacketType, Space, ENFORCED_INITIAL_MTU, RESET_PACKET_MIN_SIZE,
    RESET_SECRET_SIZE,
};
use crate::registry::Registry;
use crate::{Config, StatelessPacket};

use log::{debug, info, trace};

use ring::rand::SecureRandom;

/// Stateless responses waiting to go out; beyond this the endpoint sheds.
const MAX_PENDING_STATELESS: usize = 32;

/// Everything a segment needs besides the registry, split out so the
/// borrow of a connection inside the registry stays independent.
pub(crate) struct DispatchCtx<'a> {
    pub config: &'a Config,
    pub pending: &'a mut VecDeque<StatelessPacket>,
    pub frames: &'a mut dyn FrameProcessor,
    pub tls: &'a mut dyn HandshakeDriver,
    pub events: &'a mut dyn Events,
    pub rng: &'a dyn SecureRandom,
}

/// Processes one coalesced segment. Returns how many bytes of the
/// datagram it covered; errors stay local to the segment.
pub(crate) fn incoming_segment(
    ctx: &mut DispatchCtx,
    registry: &mut Registry,
    bytes: &mut [u8],
    packet_length: usize,
    addr_from: SocketAddr,
    addr_to: SocketAddr,
    now: time::Instant,
    previous_dcid: &mut ConnectionId,
) -> (usize, Result<()>) {
    let length = bytes.len();

    let mut ph = match packet::parse_header(ctx.config, bytes) {
        Ok(ph) => ph,
        // a header that cannot be delimited poisons the rest of the datagram
        Err(e) => return (length, Err(e)),
    };

    // The wire footprint of this segment; decryption shrinks the payload
    // but never what was consumed from the datagram.
    let consumed = (ph.offset + ph.payload_length).min(length);

    trace!(
        "segment {:?} dcid {:?} len {} of {}",
        ph.ptype,
        ph.dcid,
        consumed,
        length
    );

    // Coalesced segments normally share a destination CID. Multipath
    // traffic legitimately mixes them, so the check is opt-in.
    if previous_dcid.is_null() {
        *previous_dcid = ph.dcid;
    } else if ctx.config.enforce_coalesced_cid && *previous_dcid != ph.dcid {
        return (consumed, Err(Error::CnxIdCheck));
    }

    let key = lookup_connection(ctx.config, registry, &ph, &addr_from);

    let mut fresh: Option<Connection> = None;

    if ph.ptype == PacketType::Initial {
        let server_bound = match key {
            Some(k) => registry.get(k).map_or(true, |c| !c.client_mode),
            None => true,
        };
        // An Initial is only acted on from a full-size datagram; anything
        // smaller is an amplification vector.
        if server_bound && packet_length < ENFORCED_INITIAL_MTU {
            return (consumed, Err(Error::InitialTooShort));
        }
        if key.is_none() {
            if let Some(version_index) = ph.version_index {
                match Connection::new_server(
                    ctx.config,
                    ctx.rng,
                    ph.dcid,
                    ph.scid,
                    addr_from,
                    addr_to,
                    version_index,
                    now,
                ) {
                    Ok(conn) => fresh = Some(conn),
                    Err(e) => return (consumed, Err(e)),
                }
            }
        }
    }

    let res = if key.is_none() && fresh.is_none() {
        handle_no_connection(ctx, registry, &ph, bytes, length, addr_from, addr_to)
    } else {
        let conn = match fresh.as_mut() {
            Some(c) => c,
            // the key came out of the registry a moment ago
            None => match registry.get_mut(key.unwrap()) {
                Some(c) => c,
                None => return (consumed, Err(Error::Detected)),
            },
        };
        process_segment(ctx, conn, &mut ph, bytes, addr_from, addr_to, now)
    };

    match res {
        Ok(()) => {
            // A fresh server connection is only committed once its first
            // packet fully survived; any error path above just drops it.
            if let Some(conn) = fresh.take() {
                registry.commit(conn, now);
            }
            (consumed, Ok(()))
        }
        Err(e) => (consumed, Err(e)),
    }
}

/// Connection lookup order: by destination CID, then by peer address,
/// with the address match admissible only where the packet type allows.
fn lookup_connection(
    config: &Config,
    registry: &Registry,
    ph: &PacketHeader,
    addr_from: &SocketAddr,
) -> Option<u64> {
    match ph.ptype {
        PacketType::VersionNegotiation => {
            if !ph.dcid.is_null() {
                registry.key_by_id(&ph.dcid)
            } else {
                // without an echoed CID, only an endpoint using zero-length
                // local CIDs may match by address
                registry
                    .key_by_addr(addr_from)
                    .filter(|&k| registry.get(k).is_some_and(|c| c.paths[0].local_cid.is_null()))
            }
        }

        PacketType::Initial
        | PacketType::ZeroRtt
        | PacketType::Handshake
        | PacketType::Retry => {
            if let Some(k) = registry.key_by_id(&ph.dcid) {
                return Some(k);
            }
            let k = registry.key_by_addr(addr_from)?;
            match ph.ptype {
                // address identification holds only while the peer still
                // uses the original client-chosen CID
                PacketType::Initial | PacketType::ZeroRtt => {
                    if registry.get(k)?.initial_cid == ph.dcid {
                        Some(k)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        }

        PacketType::OneRttPhase0 | PacketType::OneRttPhase1 => {
            if config.local_cid_len > 0 {
                registry.key_by_id(&ph.dcid)
            } else {
                registry.key_by_addr(addr_from)
            }
        }

        PacketType::Error => None,
    }
}

/// No connection claimed the segment. Either it is a stateless reset
/// aimed at a connection we do hold by address, or it deserves a
/// stateless answer of our own.
fn handle_no_connection(
    ctx: &mut DispatchCtx,
    registry: &mut Registry,
    ph: &PacketHeader,
    bytes: &[u8],
    length: usize,
    addr_from: SocketAddr,
    addr_to: SocketAddr,
) -> Result<()> {
    if ph.ptype.is_one_rtt() {
        // A short header for an unknown CID may still be traffic for a
        // pre-migration address: probe by address before concluding
        // "reset". The two steps stay separate on purpose.
        if let Some(k) = registry.key_by_addr(&addr_from) {
            if let Some(conn) = registry.get_mut(k) {
                if length >= RESET_PACKET_MIN_SIZE
                    && bytes[length - RESET_SECRET_SIZE..] == conn.paths[0].reset_secret
                {
                    info!("stateless reset matched, tearing down");
                    conn.set_state(State::Disconnected);
                    ctx.events.stateless_reset(conn);
                    return Err(Error::StatelessReset);
                }
            }
        }

        // Nobody home: tell the peer so it stops retransmitting.
        if !ph.dcid.is_null() {
            queue_stateless_reset(ctx, ph, length, addr_from, addr_to);
        }
        return Err(Error::Detected);
    }

    if ph.version_index.is_none() && ph.version != 0 {
        queue_version_negotiation(ctx, ph, addr_from, addr_to);
        return Err(Error::UnsupportedVersion);
    }

    debug!("segment for unknown connection dropped, dcid {:?}", ph.dcid);
    Err(Error::Detected)
}

/// Decrypts in place and hands the segment to its per-type handler.
fn process_segment(
    ctx: &mut DispatchCtx,
    conn: &mut Connection,
    ph: &mut PacketHeader,
    bytes: &mut [u8],
    addr_from: SocketAddr,
    addr_to: SocketAddr,
    now: time::Instant,
) -> Result<()> {
    if conn.is_disconnected() {
        return Err(Error::UnexpectedPacket);
    }

    if ph.ptype.is_one_rtt() {
        ph.version_index = Some(conn.version_index);
    }

    match ph.ptype {
        // neither carries protection nor a sequence number
        PacketType::VersionNegotiation => {}
        PacketType::Retry => {
            ph.pn = 0;
            ph.pn64 = 0;
            ph.pnmask = 0;
        }
        _ => {
            let highest = conn.pkt_ctx(ph.space).largest_received();
            let keys = match conn.crypto_ctx(ph.epoch).recv.as_ref() {
                Some(keys) => keys,
                None => {
                    debug!("no receive keys for epoch {:?}", ph.epoch);
                    return Err(Error::AeadCheck);
                }
            };
            crypto::decrypt_packet(keys, bytes, ph, highest)?;

            if conn.pkt_ctx(ph.space).is_already_received(ph.pn64) {
                // duplicates are not processed, but the lost ACK is
                conn.pkt_ctx_mut(ph.space).ack_needed = true;
                conn.touch(now);
                return Err(Error::Duplicate);
            }
        }
    }

    trace!(
        "rx {:?} pn {} epoch {:?} payload {}",
        ph.ptype,
        ph.pn64,
        ph.epoch,
        ph.payload_length
    );

    let res = match ph.ptype {
        PacketType::VersionNegotiation => {
            if conn.state == State::ClientInitSent {
                incoming_version_negotiation(ctx, conn, ph, bytes)
            } else {
                Err(Error::Detected)
            }
        }

        PacketType::Initial => {
            if ph.dcid == conn.initial_cid || ph.dcid == conn.paths[0].local_cid {
                if conn.paths[0].remote_cid.is_null() {
                    conn.paths[0].remote_cid = ph.scid;
                    conn.paths[0].local_addr = addr_to;
                } else if conn.paths[0].remote_cid != ph.scid {
                    debug!("initial with wrong source cid {:?}", ph.scid);
                    return Err(Error::UnexpectedPacket);
                }
                if conn.client_mode {
                    incoming_server_cleartext(ctx, conn, ph, bytes, addr_to, now)
                } else {
                    incoming_initial(ctx, conn, ph, bytes, addr_from, addr_to, now)
                }
            } else {
                Err(Error::Detected)
            }
        }

        PacketType::Retry => incoming_retry(ctx, conn, ph, bytes),

        PacketType::Handshake => {
            if conn.client_mode {
                incoming_server_cleartext(ctx, conn, ph, bytes, addr_to, now)
            } else {
                incoming_client_cleartext(ctx, conn, ph, bytes, now)
            }
        }

        PacketType::ZeroRtt => incoming_0rtt(ctx, conn, ph, bytes, now),

        PacketType::OneRttPhase0 | PacketType::OneRttPhase1 => {
            incoming_encrypted(ctx, conn, ph, bytes, addr_from, now)
        }

        PacketType::Error => Err(Error::Detected),
    };

    match res {
        Ok(()) => {
            if !conn.is_disconnected() && ph.ptype != PacketType::VersionNegotiation {
                conn.pkt_ctx_mut(ph.space).record_received(ph.pn64, now);
            }
            conn.touch(now);
            Ok(())
        }
        Err(Error::Retry) => {
            conn.touch(now);
            Err(Error::Retry)
        }
        Err(e) => Err(e),
    }
}

/// Version negotiation: pick another supported version or abandon.
fn incoming_version_negotiation(
    ctx: &mut DispatchCtx,
    conn: &mut Connection,
    ph: &PacketHeader,
    bytes: &[u8],
) -> Result<()> {
    if ph.dcid != conn.paths[0].local_cid || ph.version != 0 {
        // not a proper echo of what we sent; log and ignore
        debug!("version negotiation echo mismatch, ignored");
        return Ok(());
    }

    let mut offered = Vec::new();
    let mut b = octets::Octets::with_slice(&bytes[ph.offset..ph.offset + ph.payload_length]);
    while let Ok(v) = b.get_u32() {
        offered.push(v);
    }

    let current = ctx.config.versions[conn.version_index].number;
    if offered.contains(&current) {
        // the peer claims to support what we already offered
        debug!("spurious version negotiation, ignored");
        return Ok(());
    }

    for v in offered {
        if let Some(idx) = ctx.config.version_index(v) {
            return conn.reset_version(ctx.config, idx);
        }
    }

    info!("no mutually supported version, abandoning");
    conn.set_state(State::Disconnected);
    Ok(())
}

/// Server side of an Initial: enforce the retry token if configured,
/// then feed the handshake.
fn incoming_initial(
    ctx: &mut DispatchCtx,
    conn: &mut Connection,
    ph: &PacketHeader,
    bytes: &[u8],
    addr_from: SocketAddr,
    addr_to: SocketAddr,
    now: time::Instant,
) -> Result<()> {
    if ctx.config.check_token {
        let token = &bytes[ph.token_offset..ph.token_offset + ph.token_length];
        if !crypto::verify_retry_token(ctx.config.retry_secret(), &addr_from, token) {
            let fresh = crypto::retry_token(ctx.config.retry_secret(), &addr_from);
            queue_stateless_retry(ctx, conn, ph, addr_from, addr_to, &fresh);
            return Err(Error::Retry);
        }
    }

    let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
    ctx.frames.decode_frames(conn, payload, ph.epoch, now, 0)?;
    ctx.tls.process_crypto_stream(conn)?;

    if conn.state == State::ServerInit {
        conn.set_state(State::ServerHandshake);
    }
    if conn.state == State::ServerHandshake && conn.handshake_keys_ready() {
        // first flight is derivable; 0-RTT may now be admitted
        conn.set_state(State::ServerAlmostReady);
    }

    conn.paths[0].local_addr = addr_to;
    Ok(())
}

/// Client side of server clear text (Initial or Handshake).
fn incoming_server_cleartext(
    ctx: &mut DispatchCtx,
    conn: &mut Connection,
    ph: &PacketHeader,
    bytes: &[u8],
    addr_to: SocketAddr,
    now: time::Instant,
) -> Result<()> {
    if conn.state == State::ClientInitSent || conn.state == State::ClientInitResent {
        conn.set_state(State::ClientHandshakeStart);
    }

    let restricted = conn.state != State::ClientHandshakeStart
        && conn.state != State::ClientHandshakeProgress;

    if conn.paths[0].remote_cid.is_null() && !restricted {
        // first response from the server names its chosen CID
        conn.paths[0].remote_cid = ph.scid;
        conn.paths[0].local_addr = addr_to;
    } else if conn.paths[0].remote_cid != ph.scid {
        return Err(Error::CnxIdCheck);
    }

    let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
    ctx.frames.decode_frames(conn, payload, ph.epoch, now, 0)?;

    if !restricted {
        ctx.tls.process_crypto_stream(conn)?;

        if conn.handshake_keys_ready() {
            // the peer provably installed handshake keys, so nothing in
            // the Initial space needs retransmission anymore
            conn.implicit_ack(Space::Initial);
        }

        if ctx.tls.handshake_complete(conn) {
            conn.set_state(State::ClientAlmostReady);
        } else if conn.state == State::ClientHandshakeStart
            && ph.ptype == PacketType::Handshake
        {
            conn.set_state(State::ClientHandshakeProgress);
        }
    }

    Ok(())
}

/// Server side of client clear text (Handshake packets).
fn incoming_client_cleartext(
    ctx: &mut DispatchCtx,
    conn: &mut Connection,
    ph: &PacketHeader,
    bytes: &[u8],
    now: time::Instant,
) -> Result<()> {
    match conn.state {
        State::ServerInit
        | State::ServerHandshake
        | State::ServerAlmostReady
        | State::ServerReady => {}
        _ => return Err(Error::UnexpectedPacket),
    }

    if ph.scid != conn.paths[0].remote_cid {
        return Err(Error::CnxIdCheck);
    }

    let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
    ctx.frames.decode_frames(conn, payload, ph.epoch, now, 0)?;
    ctx.tls.process_crypto_stream(conn)?;

    // Once ClientFinished lands, the handshake spaces are history: the
    // peer cannot need retransmissions there.
    if !conn.handshake_done && ctx.tls.handshake_complete(conn) {
        conn.handshake_done = true;
        conn.implicit_ack(Space::Initial);
        conn.implicit_ack(Space::Handshake);
        conn.set_state(State::ServerReady);
        ctx.events.ready(conn);
    }

    Ok(())
}

/// Retry: restart the attempt against the server-chosen CID, with a token.
fn incoming_retry(
    ctx: &mut DispatchCtx,
    conn: &mut Connection,
    ph: &PacketHeader,
    bytes: &[u8],
) -> Result<()> {
    if conn.state != State::ClientInitSent && conn.state != State::ClientInitResent {
        return Err(Error::UnexpectedPacket);
    }

    // the retry must echo the version this attempt runs
    if ph.version != ctx.config.versions[conn.version_index].number {
        return Err(Error::UnexpectedPacket);
    }

    let body = &bytes[ph.offset..ph.offset + ph.payload_length];
    let mut b = octets::Octets::with_slice(body);

    let odcil = packet::decode_cid_len(b.get_u8().map_err(|_| Error::UnexpectedPacket)? & 0x0f);
    if odcil != conn.initial_cid.len() {
        return Err(Error::UnexpectedPacket);
    }
    let odcid = b.get_bytes(odcil).map_err(|_| Error::UnexpectedPacket)?;
    if odcid.as_ref() != conn.initial_cid.as_slice() {
        return Err(Error::UnexpectedPacket);
    }

    let token = b.get_bytes(b.cap()).map_err(|_| Error::UnexpectedPacket)?.to_vec();
    info!("retry accepted, token {} bytes", token.len());
    conn.retry_token = Some(token);

    // The handshake restarts against the server-chosen CID: fresh key
    // schedule, packet numbers back to zero.
    conn.reset_for_retry(ctx.config, ph.scid)?;
    conn.set_state(State::ClientInitResent);

    Err(Error::Retry)
}

/// 0-RTT data, decoded in the application space under 0-RTT keys.
fn incoming_0rtt(
    ctx: &mut DispatchCtx,
    conn: &mut Connection,
    ph: &PacketHeader,
    bytes: &[u8],
    now: time::Instant,
) -> Result<()> {
    if !(ph.dcid == conn.initial_cid || ph.dcid == conn.paths[0].local_cid)
        || ph.scid != conn.paths[0].remote_cid
    {
        return Err(Error::CnxIdCheck);
    }

    match conn.state {
        State::ServerAlmostReady | State::ServerReady => {
            if ph.version != ctx.config.versions[conn.version_index].number {
                return Err(Error::Detected);
            }
            let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
            ctx.frames.decode_frames(conn, payload, ph.epoch, now, 0)?;
            ctx.tls.process_crypto_stream(conn)
        }
        _ => Err(Error::UnexpectedPacket),
    }
}

/// 1-RTT, the steady state.
fn incoming_encrypted(
    ctx: &mut DispatchCtx,
    conn: &mut Connection,
    ph: &PacketHeader,
    bytes: &[u8],
    addr_from: SocketAddr,
    now: time::Instant,
) -> Result<()> {
    // the DCID names the incoming path
    if !(ph.dcid == conn.initial_cid || ph.dcid == conn.paths[0].local_cid) {
        return Err(Error::CnxIdCheck);
    }

    if conn.state < State::ClientAlmostReady {
        // 1-RTT before keys settled; drop
        return Err(Error::UnexpectedPacket);
    }

    if ph.has_spin_bit && ph.pn64 > conn.pkt_ctx(ph.space).largest_received() {
        conn.update_spin(ph.spin);
    }

    if conn.state >= State::ClosingReceived {
        if conn.state == State::Closing {
            // only closing frames are interpreted from here on
            let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
            let close_received = ctx.frames.decode_closing_frames(conn, payload)?;
            if close_received {
                let next = if conn.client_mode {
                    State::Disconnected
                } else {
                    State::Draining
                };
                conn.set_state(next);
            } else {
                conn.pkt_ctx_mut(ph.space).ack_needed = true;
            }
            return Ok(());
        }
        return Err(Error::UnexpectedPacket);
    }

    // A new peer address starts path validation. An unspecified source
    // address is a socket artifact, not a migration.
    if conn.paths[0].peer_addr != addr_from && !addr_from.ip().is_unspecified() {
        info!(
            "peer address changed {} -> {}",
            conn.paths[0].peer_addr, addr_from
        );
        conn.paths[0].peer_addr = addr_from;
        conn.paths[0].arm_challenge(ctx.rng, now);
    }

    conn.paths[0].update_receive_rate(
        ph.offset + ph.payload_length + crypto::AEAD_TAG_SIZE,
        now,
    );

    let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
    ctx.frames.decode_frames(conn, payload, ph.epoch, now, 0)?;
    ctx.tls.process_crypto_stream(conn)?;

    if conn.state == State::ClientAlmostReady {
        // 1-RTT data from the server implies it holds our Finished
        conn.set_state(State::ClientReady);
        if !conn.handshake_done {
            conn.handshake_done = true;
            conn.implicit_ack(Space::Initial);
            conn.implicit_ack(Space::Handshake);
            ctx.events.ready(conn);
        }
    }

    Ok(())
}

/// Answer to an unknown version: zero version, CIDs echoed in reverse,
/// then the supported-versions list.
fn queue_version_negotiation(
    ctx: &mut DispatchCtx,
    ph: &PacketHeader,
    addr_from: SocketAddr,
    addr_to: SocketAddr,
) {
    let mut first = [0u8; 1];
    let _ = ctx.rng.fill(&mut first);

    let mut bytes =
        Vec::with_capacity(7 + ph.dcid.len() + ph.scid.len() + 4 * ctx.config.versions.len());
    bytes.push(first[0] | 0x80);
    bytes.extend_from_slice(&0u32.to_be_bytes());
    // the reply swaps the roles of the incoming CIDs
    bytes.push(ph.scid.len() as u8);
    bytes.extend_from_slice(ph.scid.as_slice());
    bytes.push(ph.dcid.len() as u8);
    bytes.extend_from_slice(ph.dcid.as_slice());
    for v in &ctx.config.versions {
        bytes.extend_from_slice(&v.number.to_be_bytes());
    }

    push_stateless(ctx, addr_from, addr_to, bytes);
}

/// Stateless reset for a short-header packet nobody claims: random
/// padding, then the deterministic per-CID secret.
fn queue_stateless_reset(
    ctx: &mut DispatchCtx,
    ph: &PacketHeader,
    length: usize,
    addr_from: SocketAddr,
    addr_to: SocketAddr,
) {
    if length <= RESET_PACKET_MIN_SIZE {
        // too small to answer without becoming a reflection oracle
        return;
    }

    let room = length - 1 - RESET_SECRET_SIZE;
    let pad_size = if room > 20 {
        20 + crypto::uniform_random(ctx.rng, (room - 20) as u64) as usize
    } else {
        20
    };

    let mut bytes = vec![0u8; 1 + pad_size];
    bytes[0] = if ph.ptype == PacketType::OneRttPhase1 {
        0x70
    } else {
        0x30
    };
    let _ = ctx.rng.fill(&mut bytes[1..]);
    bytes.extend_from_slice(&crypto::reset_secret(ctx.config.reset_seed(), &ph.dcid));

    push_stateless(ctx, addr_from, addr_to, bytes);
}

/// Retry datagram carrying a freshly minted address token.
fn queue_stateless_retry(
    ctx: &mut DispatchCtx,
    conn: &mut Connection,
    ph: &PacketHeader,
    addr_from: SocketAddr,
    addr_to: SocketAddr,
    token: &[u8],
) {
    conn.paths[0].remote_cid = ph.scid;

    let local_cid = conn.paths[0].local_cid;
    let mut bytes = Vec::with_capacity(
        7 + ph.scid.len() + local_cid.len() + 1 + conn.initial_cid.len() + token.len(),
    );

    // long header, type retry
    bytes.push(0xf0);
    bytes.extend_from_slice(&ctx.config.versions[conn.version_index].number.to_be_bytes());
    bytes.push(ph.scid.len() as u8);
    bytes.extend_from_slice(ph.scid.as_slice());
    bytes.push(local_cid.len() as u8);
    bytes.extend_from_slice(local_cid.as_slice());

    // body: the original DCID echoed back, then the token
    let odcil_random = (crypto::uniform_random(ctx.rng, 256) as u8) & 0xf0;
    bytes.push(odcil_random | packet::encode_cid_len(conn.initial_cid.len()));
    bytes.extend_from_slice(conn.initial_cid.as_slice());
    bytes.extend_from_slice(token);

    push_stateless(ctx, addr_from, addr_to, bytes);
}

fn push_stateless(
    ctx: &mut DispatchCtx,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    bytes: Vec<u8>,
) {
    if ctx.pending.len() >= MAX_PENDING_STATELESS {
        debug!("stateless queue full, response dropped");
        return;
    }
    debug!("stateless response queued, {} bytes to {}", bytes.len(), peer_addr);
    ctx.pending.push_back(StatelessPacket {
        peer_addr,
        local_addr,
        bytes,
    });
}
