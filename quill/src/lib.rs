pub mod cid;
pub mod common;
pub mod conn;
pub mod crypto;
pub mod hooks;
pub mod packet;
pub mod ranges;
pub mod registry;
mod recv;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time;

use crate::cid::ConnectionId;
use crate::common::{Error, Result};
use crate::conn::Connection;
use crate::hooks::{Events, FrameProcessor, HandshakeDriver, LogEvents, NullFrameProcessor, NullHandshakeDriver};
use crate::packet::{Version, SUPPORTED_VERSIONS};
use crate::registry::Registry;

use log::{debug, trace};

use ring::hmac;
use ring::rand::SystemRandom;

/// The idle timeout for a connection.
pub const IDLE_TIMEOUT: time::Duration = time::Duration::from_secs(120); // 2 minutes

/// Endpoint-scoped configuration. Everything the reception path consults
/// lives here and is passed by reference; there is no process-wide state.
pub struct Config {
    /// Versions this endpoint accepts, most preferred first.
    pub versions: Vec<Version>,

    /// Length of every locally issued connection ID. Zero switches the
    /// endpoint to address-based lookup for short headers.
    pub local_cid_len: usize,

    /// Demand a valid address token on incoming Initials, answering a
    /// Retry otherwise.
    pub check_token: bool,

    /// Require all coalesced segments of a datagram to share a
    /// destination CID. Off by default: multipath traffic mixes them.
    pub enforce_coalesced_cid: bool,

    retry_secret: hmac::Key,
    reset_seed: hmac::Key,
}

impl Config {
    pub fn new(rng: &SystemRandom) -> Result<Self> {
        let retry_secret =
            hmac::Key::generate(hmac::HMAC_SHA256, rng).map_err(|_| Error::Memory)?;
        let reset_seed =
            hmac::Key::generate(hmac::HMAC_SHA256, rng).map_err(|_| Error::Memory)?;

        Ok(Config {
            versions: SUPPORTED_VERSIONS.to_vec(),
            local_cid_len: 8,
            check_token: false,
            enforce_coalesced_cid: false,
            retry_secret,
            reset_seed,
        })
    }

    /// Position of a version in the supported table.
    pub fn version_index(&self, version: u32) -> Option<usize> {
        self.versions.iter().position(|v| v.number == version)
    }

    pub(crate) fn retry_secret(&self) -> &hmac::Key {
        &self.retry_secret
    }

    pub(crate) fn reset_seed(&self) -> &hmac::Key {
        &self.reset_seed
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(&SystemRandom::new()).expect("endpoint secret generation")
    }
}

/// A fire-and-forget response (Version Negotiation, Retry, Stateless
/// Reset) waiting for the driver to put it on the wire.
pub struct StatelessPacket {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Reception counters.
#[derive(Default)]
pub struct Stats {
    /// Datagrams handed to the endpoint.
    pub datagrams: u64,

    /// Coalesced segments walked.
    pub segments: u64,

    /// Segments dropped, for any reason.
    pub dropped: u64,

    /// Duplicate packets among the dropped.
    pub duplicates: u64,

    /// Stateless responses handed back to the driver.
    pub stateless: u64,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "datagrams: {}, segments: {}, dropped: {}, duplicates: {}, stateless: {}",
            self.datagrams, self.segments, self.dropped, self.duplicates, self.stateless
        )
    }
}

/// One QUIC endpoint: the connection registry, the stateless response
/// queue and the collaborator hooks, driven datagram by datagram.
///
/// Processing is single-threaded and runs each datagram to completion;
/// payload buffers are borrowed from the caller and decrypted in place.
pub struct Endpoint {
    config: Config,
    registry: Registry,
    pending: VecDeque<StatelessPacket>,
    frames: Box<dyn FrameProcessor>,
    tls: Box<dyn HandshakeDriver>,
    events: Box<dyn Events>,
    rng: SystemRandom,
    stats: Stats,
}

impl Endpoint {
    pub fn new(config: Config) -> Self {
        Endpoint {
            config,
            registry: Registry::new(),
            pending: VecDeque::new(),
            frames: Box::new(NullFrameProcessor),
            tls: Box::new(NullHandshakeDriver),
            events: Box::new(LogEvents),
            rng: SystemRandom::new(),
            stats: Stats::default(),
        }
    }

    /// Replaces the frame decoder installed at construction.
    pub fn set_frame_processor(&mut self, frames: Box<dyn FrameProcessor>) {
        self.frames = frames;
    }

    /// Replaces the TLS engine installed at construction.
    pub fn set_handshake_driver(&mut self, tls: Box<dyn HandshakeDriver>) {
        self.tls = tls;
    }

    /// Replaces the event sink installed at construction.
    pub fn set_events(&mut self, events: Box<dyn Events>) {
        self.events = events;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Consumes one UDP datagram.
    ///
    /// Walks the coalesced segments in wire order; each is processed,
    /// dropped, or answered statelessly on its own, and one bad segment
    /// never takes the rest of the datagram with it. The buffer is
    /// mutable because decryption writes plaintext over ciphertext.
    pub fn incoming_packet(
        &mut self,
        bytes: &mut [u8],
        addr_from: SocketAddr,
        addr_to: SocketAddr,
        now: time::Instant,
    ) {
        self.stats.datagrams += 1;

        let len = bytes.len();
        let mut left = len;
        let mut previous_dcid = ConnectionId::null();

        while left > 0 {
            let Endpoint {
                config,
                registry,
                pending,
                frames,
                tls,
                events,
                rng,
                stats,
            } = self;

            let mut ctx = recv::DispatchCtx {
                config,
                pending,
                frames: frames.as_mut(),
                tls: tls.as_mut(),
                events: events.as_mut(),
                rng: &*rng,
            };

            let (consumed, res) = recv::incoming_segment(
                &mut ctx,
                registry,
                &mut bytes[len - left..],
                len,
                addr_from,
                addr_to,
                now,
                &mut previous_dcid,
            );

            stats.segments += 1;
            match res {
                Ok(()) => {}
                Err(Error::Retry) => {
                    // a retry is progress, not a failure
                    trace!("segment answered with retry state change");
                }
                Err(Error::Duplicate) => {
                    stats.duplicates += 1;
                    stats.dropped += 1;
                }
                Err(e) => {
                    stats.dropped += 1;
                    debug!("segment dropped: {e}");
                }
            }

            if consumed == 0 {
                break;
            }
            left -= consumed;
            trace!("processed {consumed} bytes, {left} bytes left");
        }

        self.registry.sweep_idle(now);
    }

    /// Creates a client-side connection toward `peer_addr` and returns
    /// its registry key. The caller's send path takes it from here.
    pub fn connect(
        &mut self,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        now: time::Instant,
    ) -> Result<u64> {
        let conn = Connection::new_client(&self.config, &self.rng, peer_addr, local_addr, now)?;
        Ok(self.registry.commit(conn, now))
    }

    /// Next queued stateless response, if any.
    pub fn next_stateless_packet(&mut self) -> Option<StatelessPacket> {
        let sp = self.pending.pop_front()?;
        self.stats.stateless += 1;
        Some(sp)
    }

    pub fn has_pending_stateless(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn connection(&self, key: u64) -> Option<&Connection> {
        self.registry.get(key)
    }

    pub fn connection_mut(&mut self, key: u64) -> Option<&mut Connection> {
        self.registry.get_mut(key)
    }

    pub fn connection_by_id(&self, cid: &ConnectionId) -> Option<&Connection> {
        self.registry.key_by_id(cid).and_then(|k| self.registry.get(k))
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn print_stats(&self) {
        debug!("-----stats: {}", self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::State;
    use crate::crypto::{self, DirectionalKeys, AEAD_TAG_SIZE, RETRY_TOKEN_SIZE};
    use crate::packet::{self, Epoch, PacketType, Space, ENFORCED_INITIAL_MTU};

    use std::cell::Cell;
    use std::net::{IpAddr, Ipv4Addr};
    use std::rc::Rc;
    use std::time::Instant;

    const CLIENT_DCID: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
    const CLIENT_SCID: [u8; 8] = [0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18];

    fn peer_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 50000)
    }

    fn local_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)), 4433)
    }

    fn put_varint(buf: &mut Vec<u8>, v: u64) {
        if v < 64 {
            buf.push(v as u8);
        } else {
            assert!(v < 16384);
            buf.push(0x40 | (v >> 8) as u8);
            buf.push((v & 0xff) as u8);
        }
    }

    /// Long header with the truncated packet number appended.
    fn long_header(
        ty: u8,
        version: u32,
        dcid: &[u8],
        scid: &[u8],
        token: &[u8],
        pn: u32,
        pn_len: usize,
        payload_len: usize,
    ) -> Vec<u8> {
        let mut h = vec![0xc0 | (ty << 4) | (pn_len as u8 - 1)];
        h.extend_from_slice(&version.to_be_bytes());
        h.push(dcid.len() as u8);
        h.extend_from_slice(dcid);
        h.push(scid.len() as u8);
        h.extend_from_slice(scid);
        if ty == 0 {
            put_varint(&mut h, token.len() as u64);
            h.extend_from_slice(token);
        }
        put_varint(&mut h, (pn_len + payload_len + AEAD_TAG_SIZE) as u64);
        h.extend_from_slice(&pn.to_be_bytes()[4 - pn_len..]);
        h
    }

    fn short_header(dcid: &[u8], key_phase: bool, pn: u32, pn_len: usize) -> Vec<u8> {
        let mut h = vec![0x40 | (u8::from(key_phase) << 2) | (pn_len as u8 - 1)];
        h.extend_from_slice(dcid);
        h.extend_from_slice(&pn.to_be_bytes()[4 - pn_len..]);
        h
    }

    fn client_initial_keys(dcid: &[u8]) -> DirectionalKeys {
        crypto::initial_crypto_context(
            SUPPORTED_VERSIONS[0].initial_salt,
            &ConnectionId::from_slice(dcid),
            true,
        )
        .unwrap()
        .send
        .unwrap()
    }

    fn server_initial_keys(dcid: &ConnectionId) -> DirectionalKeys {
        crypto::initial_crypto_context(SUPPORTED_VERSIONS[0].initial_salt, dcid, false)
            .unwrap()
            .send
            .unwrap()
    }

    /// A client Initial padded out to `target` bytes on the wire.
    fn initial_datagram(dcid: &[u8], scid: &[u8], token: &[u8], pn: u32, target: usize) -> Vec<u8> {
        let overhead = 1 + 4 + 1 + dcid.len() + 1 + scid.len()
            + if token.len() < 64 { 1 } else { 2 }
            + token.len()
            + 2 // payload length varint
            + 1 // packet number
            + AEAD_TAG_SIZE;
        let payload = vec![0u8; target - overhead];
        let header = long_header(
            0,
            SUPPORTED_VERSIONS[0].number,
            dcid,
            scid,
            token,
            pn,
            1,
            payload.len(),
        );
        let keys = client_initial_keys(dcid);
        let out = crypto::seal_packet(&keys, u64::from(pn), 1, &header, &payload).unwrap();
        assert_eq!(out.len(), target);
        out
    }

    #[derive(Clone, Default)]
    struct FrameLog {
        calls: Rc<std::cell::RefCell<Vec<(Epoch, usize)>>>,
    }

    impl FrameProcessor for FrameLog {
        fn decode_frames(
            &mut self,
            _conn: &mut Connection,
            payload: &[u8],
            epoch: Epoch,
            _now: Instant,
            _path_id: usize,
        ) -> crate::common::Result<()> {
            self.calls.borrow_mut().push((epoch, payload.len()));
            Ok(())
        }
    }

    /// Handshake driver for tests: installs queued secrets on first call
    /// and reports completion from a shared flag.
    #[derive(Default)]
    struct TestTls {
        complete: Rc<Cell<bool>>,
        handshake_secrets: Option<([u8; 32], [u8; 32])>,
        one_rtt_secrets: Option<([u8; 32], [u8; 32])>,
    }

    impl HandshakeDriver for TestTls {
        fn process_crypto_stream(&mut self, conn: &mut Connection) -> crate::common::Result<()> {
            if let Some((recv, send)) = self.handshake_secrets.take() {
                conn.install_keys(Epoch::Handshake, &recv, &send)?;
            }
            if let Some((recv, send)) = self.one_rtt_secrets.take() {
                conn.install_keys(Epoch::OneRtt, &recv, &send)?;
            }
            Ok(())
        }

        fn handshake_complete(&self, _conn: &Connection) -> bool {
            self.complete.get()
        }
    }

    #[derive(Clone, Default)]
    struct EventLog {
        ready: Rc<Cell<u32>>,
        resets: Rc<Cell<u32>>,
    }

    impl Events for EventLog {
        fn ready(&mut self, _conn: &Connection) {
            self.ready.set(self.ready.get() + 1);
        }

        fn stateless_reset(&mut self, _conn: &Connection) {
            self.resets.set(self.resets.get() + 1);
        }
    }

    /// Frame hook for teardown tests: counts full decodes and reports a
    /// CONNECTION_CLOSE from a shared flag.
    #[derive(Clone, Default)]
    struct ClosingFrames {
        close: Rc<Cell<bool>>,
        decodes: Rc<Cell<u32>>,
    }

    impl FrameProcessor for ClosingFrames {
        fn decode_frames(
            &mut self,
            _conn: &mut Connection,
            _payload: &[u8],
            _epoch: Epoch,
            _now: Instant,
            _path_id: usize,
        ) -> crate::common::Result<()> {
            self.decodes.set(self.decodes.get() + 1);
            Ok(())
        }

        fn decode_closing_frames(
            &mut self,
            _conn: &mut Connection,
            _payload: &[u8],
        ) -> crate::common::Result<bool> {
            Ok(self.close.get())
        }
    }

    fn server_endpoint() -> (Endpoint, FrameLog, EventLog) {
        let mut endpoint = Endpoint::new(Config::default());
        let frames = FrameLog::default();
        let events = EventLog::default();
        endpoint.set_frame_processor(Box::new(frames.clone()));
        endpoint.set_events(Box::new(events.clone()));
        (endpoint, frames, events)
    }

    /// Feeds a padded Initial so the endpoint holds one server-side
    /// connection, and returns its registry key.
    fn establish_server_conn(endpoint: &mut Endpoint, now: Instant) -> u64 {
        let mut dgram = initial_datagram(&CLIENT_DCID, &CLIENT_SCID, &[], 0, ENFORCED_INITIAL_MTU);
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);
        assert_eq!(endpoint.connection_count(), 1);
        endpoint
            .registry
            .key_by_id(&ConnectionId::from_slice(&CLIENT_DCID))
            .unwrap()
    }

    #[test]
    fn server_accepts_initial_and_creates_connection() {
        let (mut endpoint, frames, _) = server_endpoint();
        let now = Instant::now();

        let key = establish_server_conn(&mut endpoint, now);
        let conn = endpoint.connection(key).unwrap();

        assert_eq!(conn.state, State::ServerHandshake);
        assert_eq!(conn.initial_cid.as_slice(), &CLIENT_DCID);
        assert_eq!(conn.paths[0].remote_cid.as_slice(), &CLIENT_SCID);
        assert_eq!(conn.pkt_ctx(Space::Initial).largest_received(), 0);
        assert!(conn.pkt_ctx(Space::Initial).is_already_received(0));

        let calls = frames.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, Epoch::Initial);
    }

    #[test]
    fn initial_below_enforced_mtu_is_rejected() {
        let (mut endpoint, frames, _) = server_endpoint();
        let now = Instant::now();

        let mut dgram = initial_datagram(&CLIENT_DCID, &CLIENT_SCID, &[], 0, 1100);
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        assert_eq!(endpoint.connection_count(), 0);
        assert!(frames.calls.borrow().is_empty());
        assert_eq!(endpoint.stats().dropped, 1);
    }

    #[test]
    fn unknown_version_gets_version_negotiation() {
        let (mut endpoint, _, _) = server_endpoint();
        let now = Instant::now();

        // long header, unsupported version, full-size datagram
        let mut dgram = vec![0xc0];
        dgram.extend_from_slice(&0x0a0a_0a0au32.to_be_bytes());
        dgram.push(8);
        dgram.extend_from_slice(&CLIENT_DCID);
        dgram.push(8);
        dgram.extend_from_slice(&CLIENT_SCID);
        dgram.resize(1200, 0);

        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        assert_eq!(endpoint.connection_count(), 0);
        let sp = endpoint.next_stateless_packet().unwrap();
        assert_eq!(sp.peer_addr, peer_addr());

        // random first byte with the long-header bit, then version zero
        assert_eq!(sp.bytes[0] & 0x80, 0x80);
        assert_eq!(&sp.bytes[1..5], &[0, 0, 0, 0]);
        // CIDs echoed in reverse
        assert_eq!(sp.bytes[5] as usize, CLIENT_SCID.len());
        assert_eq!(&sp.bytes[6..14], &CLIENT_SCID);
        assert_eq!(sp.bytes[14] as usize, CLIENT_DCID.len());
        assert_eq!(&sp.bytes[15..23], &CLIENT_DCID);
        // then the supported-versions list
        let body = &sp.bytes[23..];
        assert_eq!(body.len(), 4 * SUPPORTED_VERSIONS.len());
        assert_eq!(&body[..4], &SUPPORTED_VERSIONS[0].number.to_be_bytes());
    }

    #[test]
    fn retry_token_enforcement_round_trip() {
        let mut config = Config::default();
        config.check_token = true;
        let mut endpoint = Endpoint::new(config);
        let frames = FrameLog::default();
        endpoint.set_frame_processor(Box::new(frames.clone()));
        let now = Instant::now();

        // 1. an Initial without a token is answered with a Retry and no
        //    connection survives
        let mut dgram = initial_datagram(&CLIENT_DCID, &CLIENT_SCID, &[], 0, ENFORCED_INITIAL_MTU);
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        assert_eq!(endpoint.connection_count(), 0);
        assert!(frames.calls.borrow().is_empty());

        let retry = endpoint.next_stateless_packet().unwrap();
        let ph = packet::parse_header(endpoint.config(), &retry.bytes).unwrap();
        assert_eq!(ph.ptype, PacketType::Retry);
        assert_eq!(ph.dcid.as_slice(), &CLIENT_SCID);

        // body: odcil nibble, the echoed original DCID, then the token
        let body = &retry.bytes[ph.offset..];
        let odcil = packet::decode_cid_len(body[0] & 0x0f);
        assert_eq!(odcil, CLIENT_DCID.len());
        assert_eq!(&body[1..1 + odcil], &CLIENT_DCID);
        let token = &body[1 + odcil..];
        assert_eq!(token.len(), RETRY_TOKEN_SIZE);

        // 2. the next Initial echoing the token goes through
        let mut dgram =
            initial_datagram(&CLIENT_DCID, &CLIENT_SCID, token, 1, ENFORCED_INITIAL_MTU);
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        assert_eq!(endpoint.connection_count(), 1);
        assert_eq!(frames.calls.borrow().len(), 1);
    }

    fn install_one_rtt(endpoint: &mut Endpoint, key: u64) -> DirectionalKeys {
        let recv_secret = [0x42u8; 32];
        let send_secret = [0x43u8; 32];
        endpoint
            .connection_mut(key)
            .unwrap()
            .install_keys(Epoch::OneRtt, &recv_secret, &send_secret)
            .unwrap();
        DirectionalKeys::from_secret(&recv_secret).unwrap()
    }

    #[test]
    fn duplicate_one_rtt_sets_ack_needed_only() {
        let (mut endpoint, frames, _) = server_endpoint();
        let now = Instant::now();
        let key = establish_server_conn(&mut endpoint, now);

        let peer_keys = install_one_rtt(&mut endpoint, key);
        endpoint.connection_mut(key).unwrap().set_state(State::ServerReady);

        let local_cid = endpoint.connection(key).unwrap().paths[0].local_cid;
        let header = short_header(local_cid.as_slice(), false, 5, 1);
        let sealed = crypto::seal_packet(&peer_keys, 5, 1, &header, &[0x42; 32]).unwrap();

        let baseline = frames.calls.borrow().len();

        let mut first = sealed.clone();
        endpoint.incoming_packet(&mut first, peer_addr(), local_addr(), now);
        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.pkt_ctx(Space::Application).largest_received(), 5);
        assert_eq!(frames.calls.borrow().len(), baseline + 1);

        // the exact same packet again: no frame processing, ACK re-armed
        let mut second = sealed.clone();
        endpoint.incoming_packet(&mut second, peer_addr(), local_addr(), now);
        let conn = endpoint.connection(key).unwrap();
        assert_eq!(frames.calls.borrow().len(), baseline + 1);
        assert!(conn.pkt_ctx(Space::Application).ack_needed);
        assert_eq!(endpoint.stats().duplicates, 1);
    }

    #[test]
    fn stateless_reset_detection_by_address() {
        let (mut endpoint, _, events) = server_endpoint();
        let now = Instant::now();
        let key = establish_server_conn(&mut endpoint, now);

        let secret = endpoint.connection(key).unwrap().paths[0].reset_secret;

        // short header to a CID we never issued, from the connection's
        // address, with the right trailing token
        let mut dgram = vec![0x40];
        dgram.extend_from_slice(&[0xee; 8]);
        dgram.resize(40 - 16, 0xab);
        dgram.extend_from_slice(&secret);

        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        assert_eq!(endpoint.connection(key).unwrap().state, State::Disconnected);
        assert_eq!(events.resets.get(), 1);
    }

    #[test]
    fn reset_masquerade_does_not_disconnect() {
        let (mut endpoint, _, events) = server_endpoint();
        let now = Instant::now();
        let key = establish_server_conn(&mut endpoint, now);
        let state_before = endpoint.connection(key).unwrap().state;

        let mut dgram = vec![0x40];
        dgram.extend_from_slice(&[0xee; 8]);
        dgram.resize(40 - 16, 0xab);
        dgram.extend_from_slice(&[0x5a; 16]); // wrong token

        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        assert_eq!(endpoint.connection(key).unwrap().state, state_before);
        assert_eq!(events.resets.get(), 0);
        // the unknown CID still earns a stateless reset of our own
        let sp = endpoint.next_stateless_packet().unwrap();
        assert!(sp.bytes.len() >= packet::RESET_PACKET_MIN_SIZE);
        assert!(sp.bytes.len() <= dgram.len());
        let expected =
            crypto::reset_secret(endpoint.config().reset_seed(), &ConnectionId::from_slice(&[0xee; 8]));
        assert_eq!(&sp.bytes[sp.bytes.len() - 16..], &expected);
    }

    fn handshake_segment(
        endpoint: &Endpoint,
        key: u64,
        peer_keys: &DirectionalKeys,
        pn: u32,
    ) -> Vec<u8> {
        let conn = endpoint.connection(key).unwrap();
        let header = long_header(
            2,
            SUPPORTED_VERSIONS[0].number,
            conn.initial_cid.as_slice(),
            conn.paths[0].remote_cid.as_slice(),
            &[],
            pn,
            1,
            32,
        );
        crypto::seal_packet(peer_keys, u64::from(pn), 1, &header, &[0x17; 32]).unwrap()
    }

    fn install_handshake(endpoint: &mut Endpoint, key: u64) -> DirectionalKeys {
        let recv_secret = [0x51u8; 32];
        let send_secret = [0x52u8; 32];
        endpoint
            .connection_mut(key)
            .unwrap()
            .install_keys(Epoch::Handshake, &recv_secret, &send_secret)
            .unwrap();
        DirectionalKeys::from_secret(&recv_secret).unwrap()
    }

    #[test]
    fn coalesced_segments_match_split_delivery() {
        let now = Instant::now();

        let mut states = Vec::new();
        for split in [false, true] {
            let (mut endpoint, frames, _) = server_endpoint();
            let key = establish_server_conn(&mut endpoint, now);
            let peer_keys = install_handshake(&mut endpoint, key);

            let seg1 = handshake_segment(&endpoint, key, &peer_keys, 1);
            let seg2 = handshake_segment(&endpoint, key, &peer_keys, 2);

            if split {
                let mut a = seg1.clone();
                endpoint.incoming_packet(&mut a, peer_addr(), local_addr(), now);
                let mut b = seg2.clone();
                endpoint.incoming_packet(&mut b, peer_addr(), local_addr(), now);
            } else {
                let mut dgram = seg1.clone();
                dgram.extend_from_slice(&seg2);
                endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);
            }

            let conn = endpoint.connection(key).unwrap();
            let hs = conn.pkt_ctx(Space::Handshake);
            states.push((
                hs.largest_received(),
                hs.is_already_received(1),
                hs.is_already_received(2),
                frames.calls.borrow().clone(),
                conn.state,
            ));
        }

        assert_eq!(states[0], states[1]);
        assert_eq!(states[0].0, 2);
    }

    #[test]
    fn coalesced_cid_check_is_opt_in() {
        let now = Instant::now();

        for (enforce, expect_second) in [(false, true), (true, false)] {
            let mut config = Config::default();
            config.enforce_coalesced_cid = enforce;
            let mut endpoint = Endpoint::new(config);
            let frames = FrameLog::default();
            endpoint.set_frame_processor(Box::new(frames.clone()));

            let key = establish_server_conn(&mut endpoint, now);
            let peer_keys = install_handshake(&mut endpoint, key);

            // second segment addressed to the connection's other CID
            let seg1 = handshake_segment(&endpoint, key, &peer_keys, 1);
            let conn = endpoint.connection(key).unwrap();
            let header = long_header(
                2,
                SUPPORTED_VERSIONS[0].number,
                conn.paths[0].local_cid.as_slice(),
                conn.paths[0].remote_cid.as_slice(),
                &[],
                2,
                1,
                32,
            );
            let seg2 = crypto::seal_packet(&peer_keys, 2, 1, &header, &[0x17; 32]).unwrap();

            let mut dgram = seg1.clone();
            dgram.extend_from_slice(&seg2);
            endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

            let conn = endpoint.connection(key).unwrap();
            assert_eq!(
                conn.pkt_ctx(Space::Handshake).is_already_received(2),
                expect_second,
                "enforce={enforce}"
            );
        }
    }

    #[test]
    fn server_ready_fires_once_with_implicit_acks() {
        let (mut endpoint, _, events) = server_endpoint();
        let now = Instant::now();
        let key = establish_server_conn(&mut endpoint, now);
        let peer_keys = install_handshake(&mut endpoint, key);

        let complete = Rc::new(Cell::new(true));
        endpoint.set_handshake_driver(Box::new(TestTls {
            complete: complete.clone(),
            ..TestTls::default()
        }));

        let mut dgram = handshake_segment(&endpoint, key, &peer_keys, 1);
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.state, State::ServerReady);
        assert!(conn.handshake_done);
        assert!(conn.pkt_ctx(Space::Initial).implicitly_acked);
        assert!(conn.pkt_ctx(Space::Handshake).implicitly_acked);
        assert_eq!(events.ready.get(), 1);

        // a second handshake packet does not re-fire the callback
        let mut dgram = handshake_segment(&endpoint, key, &peer_keys, 2);
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);
        assert_eq!(events.ready.get(), 1);
    }

    #[test]
    fn client_processes_server_initial_and_handshake() {
        let mut endpoint = Endpoint::new(Config::default());
        let frames = FrameLog::default();
        let events = EventLog::default();
        endpoint.set_frame_processor(Box::new(frames.clone()));
        endpoint.set_events(Box::new(events.clone()));

        let complete = Rc::new(Cell::new(false));
        endpoint.set_handshake_driver(Box::new(TestTls {
            complete: complete.clone(),
            handshake_secrets: Some(([0x61; 32], [0x62; 32])),
            one_rtt_secrets: Some(([0x71; 32], [0x72; 32])),
        }));

        let now = Instant::now();
        let key = endpoint.connect(peer_addr(), local_addr(), now).unwrap();
        endpoint.connection_mut(key).unwrap().set_state(State::ClientInitSent);

        let initial_cid = endpoint.connection(key).unwrap().initial_cid;
        let local_cid = endpoint.connection(key).unwrap().paths[0].local_cid;
        let server_scid = [0x99u8; 8];

        // server Initial: dcid is the client's own CID, scid is new
        let header = long_header(
            0,
            SUPPORTED_VERSIONS[0].number,
            local_cid.as_slice(),
            &server_scid,
            &[],
            0,
            1,
            48,
        );
        let server_keys = server_initial_keys(&initial_cid);
        let mut dgram = crypto::seal_packet(&server_keys, 0, 1, &header, &[0x33; 48]).unwrap();
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.state, State::ClientHandshakeStart);
        assert_eq!(conn.paths[0].remote_cid.as_slice(), &server_scid);
        // handshake keys landed, so the Initial space is implicitly done
        assert!(conn.pkt_ctx(Space::Initial).implicitly_acked);

        // a server Handshake packet, TLS still in flight
        let hs_keys = DirectionalKeys::from_secret(&[0x61; 32]).unwrap();
        let header = long_header(
            2,
            SUPPORTED_VERSIONS[0].number,
            local_cid.as_slice(),
            &server_scid,
            &[],
            0,
            1,
            32,
        );
        let mut dgram = crypto::seal_packet(&hs_keys, 0, 1, &header, &[0x34; 32]).unwrap();
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);
        assert_eq!(
            endpoint.connection(key).unwrap().state,
            State::ClientHandshakeProgress
        );

        // TLS completes on the next handshake packet
        complete.set(true);
        let header = long_header(
            2,
            SUPPORTED_VERSIONS[0].number,
            local_cid.as_slice(),
            &server_scid,
            &[],
            1,
            1,
            32,
        );
        let mut dgram = crypto::seal_packet(&hs_keys, 1, 1, &header, &[0x35; 32]).unwrap();
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);
        assert_eq!(endpoint.connection(key).unwrap().state, State::ClientAlmostReady);
        assert_eq!(events.ready.get(), 0);

        // first 1-RTT from the server makes the client Ready
        let one_rtt_keys = DirectionalKeys::from_secret(&[0x71; 32]).unwrap();
        let header = short_header(local_cid.as_slice(), false, 0, 1);
        let mut dgram = crypto::seal_packet(&one_rtt_keys, 0, 1, &header, &[0x36; 32]).unwrap();
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.state, State::ClientReady);
        assert_eq!(events.ready.get(), 1);
    }

    #[test]
    fn client_handles_retry() {
        let mut endpoint = Endpoint::new(Config::default());
        let now = Instant::now();
        let key = endpoint.connect(peer_addr(), local_addr(), now).unwrap();
        endpoint.connection_mut(key).unwrap().set_state(State::ClientInitSent);

        let old_initial_cid = endpoint.connection(key).unwrap().initial_cid;
        let local_cid = endpoint.connection(key).unwrap().paths[0].local_cid;
        let server_cid = [0x9a; 8];
        let token = [0xabu8; 16];

        let mut dgram = vec![0xf0];
        dgram.extend_from_slice(&SUPPORTED_VERSIONS[0].number.to_be_bytes());
        dgram.push(local_cid.len() as u8);
        dgram.extend_from_slice(local_cid.as_slice());
        dgram.push(server_cid.len() as u8);
        dgram.extend_from_slice(&server_cid);
        dgram.push(0x30 | packet::encode_cid_len(old_initial_cid.len()));
        dgram.extend_from_slice(old_initial_cid.as_slice());
        dgram.extend_from_slice(&token);

        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.state, State::ClientInitResent);
        assert_eq!(conn.initial_cid.as_slice(), &server_cid);
        assert_eq!(conn.retry_token.as_deref(), Some(&token[..]));
        // packet numbers restarted
        assert!(conn.pkt_ctx(Space::Initial).received.is_empty());

        // a second retry in this state is not accepted twice with a
        // mismatching original CID echo
        let mut replay = dgram.clone();
        endpoint.incoming_packet(&mut replay, peer_addr(), local_addr(), now);
        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.initial_cid.as_slice(), &server_cid);
    }

    #[test]
    fn client_version_negotiation_reselects() {
        let mut endpoint = Endpoint::new(Config::default());
        let now = Instant::now();
        let key = endpoint.connect(peer_addr(), local_addr(), now).unwrap();
        endpoint.connection_mut(key).unwrap().set_state(State::ClientInitSent);

        let local_cid = endpoint.connection(key).unwrap().paths[0].local_cid;

        let mut dgram = vec![0xc0];
        dgram.extend_from_slice(&0u32.to_be_bytes());
        dgram.push(local_cid.len() as u8);
        dgram.extend_from_slice(local_cid.as_slice());
        dgram.push(8);
        dgram.extend_from_slice(&[0x44; 8]);
        // the offer: something unknown, then our second choice
        dgram.extend_from_slice(&0x0a0a_0a0au32.to_be_bytes());
        dgram.extend_from_slice(&SUPPORTED_VERSIONS[1].number.to_be_bytes());

        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.version_index, 1);
        assert_eq!(conn.state, State::ClientInit);
    }

    #[test]
    fn version_negotiation_ignored_outside_init_sent() {
        let mut endpoint = Endpoint::new(Config::default());
        let now = Instant::now();
        let key = endpoint.connect(peer_addr(), local_addr(), now).unwrap();
        endpoint.connection_mut(key).unwrap().set_state(State::ClientReady);

        let local_cid = endpoint.connection(key).unwrap().paths[0].local_cid;

        let mut dgram = vec![0xc0];
        dgram.extend_from_slice(&0u32.to_be_bytes());
        dgram.push(local_cid.len() as u8);
        dgram.extend_from_slice(local_cid.as_slice());
        dgram.push(0);
        dgram.extend_from_slice(&SUPPORTED_VERSIONS[1].number.to_be_bytes());

        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.version_index, 0);
        assert_eq!(conn.state, State::ClientReady);
    }

    #[test]
    fn peer_address_change_arms_challenge() {
        let (mut endpoint, _, _) = server_endpoint();
        let now = Instant::now();
        let key = establish_server_conn(&mut endpoint, now);
        let peer_keys = install_one_rtt(&mut endpoint, key);
        endpoint.connection_mut(key).unwrap().set_state(State::ServerReady);

        let local_cid = endpoint.connection(key).unwrap().paths[0].local_cid;
        let header = short_header(local_cid.as_slice(), false, 1, 1);
        let mut dgram = crypto::seal_packet(&peer_keys, 1, 1, &header, &[0x42; 32]).unwrap();

        let migrated = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), 50001);
        endpoint.incoming_packet(&mut dgram, migrated, local_addr(), now);

        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.paths[0].peer_addr, migrated);
        assert!(!conn.paths[0].challenge_verified);
        assert!(conn.paths[0].challenge_time.is_some());
        assert!(conn.pkt_ctx(Space::Application).is_already_received(1));
    }

    #[test]
    fn one_rtt_before_ready_state_is_dropped() {
        let (mut endpoint, frames, _) = server_endpoint();
        let now = Instant::now();
        let key = establish_server_conn(&mut endpoint, now);
        let peer_keys = install_one_rtt(&mut endpoint, key);
        // state stays ServerHandshake: 1-RTT is premature

        let baseline = frames.calls.borrow().len();
        let local_cid = endpoint.connection(key).unwrap().paths[0].local_cid;
        let header = short_header(local_cid.as_slice(), false, 0, 1);
        let mut dgram = crypto::seal_packet(&peer_keys, 0, 1, &header, &[0x42; 32]).unwrap();
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        assert_eq!(frames.calls.borrow().len(), baseline);
        assert!(!endpoint
            .connection(key)
            .unwrap()
            .pkt_ctx(Space::Application)
            .is_already_received(0));
        assert_eq!(endpoint.stats().dropped, 1);
    }

    #[test]
    fn key_phase_bit_retags_packet_type() {
        let (mut endpoint, _, _) = server_endpoint();
        let now = Instant::now();
        let key = establish_server_conn(&mut endpoint, now);
        let peer_keys = install_one_rtt(&mut endpoint, key);
        endpoint.connection_mut(key).unwrap().set_state(State::ServerReady);

        // phase-1 packets still decrypt under the same epoch-3 context
        let local_cid = endpoint.connection(key).unwrap().paths[0].local_cid;
        let header = short_header(local_cid.as_slice(), true, 3, 1);
        let mut dgram = crypto::seal_packet(&peer_keys, 3, 1, &header, &[0x42; 32]).unwrap();
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        let conn = endpoint.connection(key).unwrap();
        assert!(conn.pkt_ctx(Space::Application).is_already_received(3));
    }

    #[test]
    fn closing_state_only_interprets_close_frames() {
        let (mut endpoint, _, _) = server_endpoint();
        let now = Instant::now();
        let key = establish_server_conn(&mut endpoint, now);
        let peer_keys = install_one_rtt(&mut endpoint, key);

        let hook = ClosingFrames::default();
        endpoint.set_frame_processor(Box::new(hook.clone()));

        let local_cid = endpoint.connection(key).unwrap().paths[0].local_cid;
        let seal = |pn: u32| {
            let header = short_header(local_cid.as_slice(), false, pn, 1);
            crypto::seal_packet(&peer_keys, u64::from(pn), 1, &header, &[0x42; 32]).unwrap()
        };

        // anything received in ClosingReceived is dropped outright
        endpoint
            .connection_mut(key)
            .unwrap()
            .set_state(State::ClosingReceived);
        let mut dgram = seal(1);
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);
        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.state, State::ClosingReceived);
        assert!(!conn.pkt_ctx(Space::Application).is_already_received(1));
        assert_eq!(endpoint.stats().dropped, 1);

        // while Closing, a packet without CONNECTION_CLOSE only re-arms
        // the ACK
        endpoint.connection_mut(key).unwrap().set_state(State::Closing);
        let mut dgram = seal(1);
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);
        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.state, State::Closing);
        assert!(conn.pkt_ctx(Space::Application).ack_needed);
        assert!(conn.pkt_ctx(Space::Application).is_already_received(1));

        // a CONNECTION_CLOSE moves the server to Draining
        hook.close.set(true);
        let mut dgram = seal(2);
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);
        assert_eq!(endpoint.connection(key).unwrap().state, State::Draining);

        // and nothing past that point is processed
        let mut dgram = seal(3);
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);
        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.state, State::Draining);
        assert!(!conn.pkt_ctx(Space::Application).is_already_received(3));

        // the full frame decoder never ran while tearing down
        assert_eq!(hook.decodes.get(), 0);
    }

    #[test]
    fn client_in_closing_disconnects_on_close_frame() {
        let mut endpoint = Endpoint::new(Config::default());
        let hook = ClosingFrames::default();
        hook.close.set(true);
        endpoint.set_frame_processor(Box::new(hook.clone()));

        let now = Instant::now();
        let key = endpoint.connect(peer_addr(), local_addr(), now).unwrap();
        {
            let conn = endpoint.connection_mut(key).unwrap();
            conn.install_keys(Epoch::OneRtt, &[0x71; 32], &[0x72; 32])
                .unwrap();
            conn.set_state(State::Closing);
        }

        let local_cid = endpoint.connection(key).unwrap().paths[0].local_cid;
        let peer_keys = DirectionalKeys::from_secret(&[0x71; 32]).unwrap();
        let header = short_header(local_cid.as_slice(), false, 0, 1);
        let mut dgram = crypto::seal_packet(&peer_keys, 0, 1, &header, &[0x36; 32]).unwrap();
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        assert_eq!(endpoint.connection(key).unwrap().state, State::Disconnected);
    }

    #[test]
    fn corrupted_initial_does_not_create_connection() {
        let (mut endpoint, _, _) = server_endpoint();
        let now = Instant::now();

        let mut dgram = initial_datagram(&CLIENT_DCID, &CLIENT_SCID, &[], 0, ENFORCED_INITIAL_MTU);
        // flip a ciphertext byte
        let idx = dgram.len() - 20;
        dgram[idx] ^= 0xff;
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        assert_eq!(endpoint.connection_count(), 0);
        assert_eq!(endpoint.stats().dropped, 1);
    }

    #[test]
    fn long_header_for_unknown_connection_is_silent() {
        let (mut endpoint, _, _) = server_endpoint();
        let now = Instant::now();

        // a handshake packet for a connection we never created
        let header = long_header(
            2,
            SUPPORTED_VERSIONS[0].number,
            &[0x77; 8],
            &[0x78; 8],
            &[],
            0,
            1,
            32,
        );
        let keys = DirectionalKeys::from_secret(&[0x11; 32]).unwrap();
        let mut dgram = crypto::seal_packet(&keys, 0, 1, &header, &[0; 32]).unwrap();
        endpoint.incoming_packet(&mut dgram, peer_addr(), local_addr(), now);

        assert_eq!(endpoint.connection_count(), 0);
        assert!(!endpoint.has_pending_stateless());
        assert_eq!(endpoint.stats().dropped, 1);
    }
}
