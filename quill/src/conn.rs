use std::net::SocketAddr;
use std::time;

use crate::cid::ConnectionId;
use crate::common::Result;
use crate::crypto::{self, CryptoContext, DirectionalKeys};
use crate::packet::{Epoch, Space, EPOCH_COUNT, RESET_SECRET_SIZE, SPACE_COUNT};
use crate::ranges::RangeSet;
use crate::Config;

use log::{debug, info};

use ring::rand::SecureRandom;

/// Round-trip estimate before any measurement.
const INITIAL_RTT: time::Duration = time::Duration::from_millis(250);

/// Shortest window over which the receive rate is re-estimated.
const BANDWIDTH_TIME_INTERVAL_MIN: time::Duration = time::Duration::from_millis(100);

/// Handshake and teardown state machine.
///
/// The discriminant order matters: everything from `ClientAlmostReady`
/// onward may legitimately see 1-RTT packets, and everything from
/// `ClosingReceived` onward is tearing down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    ClientInit,
    ClientInitSent,
    ClientInitResent,
    ClientHandshakeStart,
    ClientHandshakeProgress,
    ServerInit,
    ServerHandshake,
    ClientAlmostReady,
    ClientReady,
    ServerAlmostReady,
    ServerReady,
    ClosingReceived,
    Closing,
    Draining,
    Disconnected,
}

/// Per-packet-number-space bookkeeping.
#[derive(Default)]
pub struct PktContext {
    /// Next packet number the send side would use.
    pub send_sequence: u64,

    /// Packet numbers seen so far, for duplicate detection.
    pub received: RangeSet,

    /// An acknowledgment should be scheduled for this space.
    pub ack_needed: bool,

    /// The whole space was acknowledged implicitly (the peer demonstrably
    /// moved past it), so nothing outstanding needs retransmission.
    pub implicitly_acked: bool,

    pub latest_receive_time: Option<time::Instant>,
}

impl PktContext {
    /// Largest packet number received in this space, zero when empty.
    pub fn largest_received(&self) -> u64 {
        self.received.largest().unwrap_or(0)
    }

    pub fn is_already_received(&self, pn64: u64) -> bool {
        self.received.contains(pn64)
    }

    pub fn record_received(&mut self, pn64: u64, now: time::Instant) {
        self.received.insert(pn64);
        self.latest_receive_time = Some(now);
    }

    fn reset(&mut self) {
        *self = PktContext::default();
    }
}

/// One network path of a connection. Path 0 is the handshake path.
pub struct Path {
    pub local_cid: ConnectionId,
    pub remote_cid: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,

    /// Token that identifies a stateless reset from this peer.
    pub reset_secret: [u8; RESET_SECRET_SIZE],

    /// Path validation state, armed when the peer address moves.
    pub challenge: u64,
    pub challenge_verified: bool,
    pub challenge_time: Option<time::Instant>,
    pub challenge_repeat_count: u32,

    pub rtt: time::Duration,

    /// Receive-rate moving estimate.
    pub received: u64,
    pub received_prior: u64,
    pub receive_rate_epoch: Option<time::Instant>,
    pub receive_rate_estimate: u64,
    pub receive_rate_max: u64,
}

impl Path {
    fn new(
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        reset_secret: [u8; RESET_SECRET_SIZE],
    ) -> Self {
        Path {
            local_cid,
            remote_cid,
            peer_addr,
            local_addr,
            reset_secret,
            challenge: 0,
            challenge_verified: false,
            challenge_time: None,
            challenge_repeat_count: 0,
            rtt: INITIAL_RTT,
            received: 0,
            received_prior: 0,
            receive_rate_epoch: None,
            receive_rate_estimate: 0,
            receive_rate_max: 0,
        }
    }

    /// Arms a fresh path challenge after the peer address moved.
    pub fn arm_challenge(&mut self, rng: &dyn SecureRandom, now: time::Instant) {
        self.challenge = crypto::random_u64(rng);
        self.challenge_verified = false;
        self.challenge_time = Some(now + self.rtt);
        self.challenge_repeat_count = 0;
    }

    /// Folds a received packet into the windowed receive-rate estimate.
    pub fn update_receive_rate(&mut self, bytes: usize, now: time::Instant) {
        self.received += bytes as u64;
        match self.receive_rate_epoch {
            None => {
                self.received_prior = self.received;
                self.receive_rate_epoch = Some(now);
            }
            Some(epoch) => {
                let delta = now.duration_since(epoch);
                if delta > self.rtt && delta > BANDWIDTH_TIME_INTERVAL_MIN {
                    let micros = delta.as_micros().max(1) as u64;
                    self.receive_rate_estimate =
                        (self.received - self.received_prior) * 1_000_000 / micros;
                    self.received_prior = self.received;
                    self.receive_rate_epoch = Some(now);
                    if self.receive_rate_estimate > self.receive_rate_max {
                        self.receive_rate_max = self.receive_rate_estimate;
                    }
                }
            }
        }
    }
}

/// Per-peer connection state, owned by the registry.
pub struct Connection {
    pub client_mode: bool,
    pub state: State,

    /// Index into the endpoint's supported-versions table.
    pub version_index: usize,

    /// The destination CID the peer first addressed us with. Replaced by
    /// the server's SCID after a Retry.
    pub initial_cid: ConnectionId,

    pub paths: Vec<Path>,

    /// Key schedule, one context per epoch.
    pub crypto: [CryptoContext; EPOCH_COUNT],

    pkt_ctx: [PktContext; SPACE_COUNT],

    /// Token saved from a Retry, echoed in the next Initial.
    pub retry_token: Option<Vec<u8>>,

    /// Latched once: the Ready callback fired and the handshake spaces
    /// were implicitly acknowledged.
    pub handshake_done: bool,

    pub current_spin: u8,
    pub prev_spin: u8,
    pub spin_edge: bool,

    pub start_time: time::Instant,
    last_access: time::Instant,
}

impl Connection {
    /// Server-side creation from an incoming Initial with an unknown DCID.
    ///
    /// The caller commits the value to the registry only after the packet
    /// survives decryption and admission; dropping it on the error path is
    /// the whole cleanup.
    pub fn new_server(
        config: &Config,
        rng: &dyn SecureRandom,
        initial_cid: ConnectionId,
        remote_cid: ConnectionId,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        version_index: usize,
        now: time::Instant,
    ) -> Result<Self> {
        let local_cid = ConnectionId::random(rng, config.local_cid_len);
        let reset_secret = crypto::reset_secret(config.reset_seed(), &local_cid);

        let mut conn = Connection {
            client_mode: false,
            state: State::ServerInit,
            version_index,
            initial_cid,
            paths: vec![Path::new(
                local_cid,
                remote_cid,
                peer_addr,
                local_addr,
                reset_secret,
            )],
            crypto: std::array::from_fn(|_| CryptoContext::default()),
            pkt_ctx: std::array::from_fn(|_| PktContext::default()),
            retry_token: None,
            handshake_done: false,
            current_spin: 0,
            prev_spin: 0,
            spin_edge: false,
            start_time: now,
            last_access: now,
        };
        conn.derive_initial_keys(config)?;
        Ok(conn)
    }

    /// Client-side creation for an outbound connection attempt.
    pub fn new_client(
        config: &Config,
        rng: &dyn SecureRandom,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        now: time::Instant,
    ) -> Result<Self> {
        // The client invents the first destination CID; the initial key
        // schedule hangs off it.
        let initial_cid = ConnectionId::random(rng, 8);
        let local_cid = ConnectionId::random(rng, config.local_cid_len);
        let reset_secret = crypto::reset_secret(config.reset_seed(), &local_cid);

        let mut conn = Connection {
            client_mode: true,
            state: State::ClientInit,
            version_index: 0,
            initial_cid,
            paths: vec![Path::new(
                local_cid,
                ConnectionId::null(),
                peer_addr,
                local_addr,
                reset_secret,
            )],
            crypto: std::array::from_fn(|_| CryptoContext::default()),
            pkt_ctx: std::array::from_fn(|_| PktContext::default()),
            retry_token: None,
            handshake_done: false,
            current_spin: 0,
            prev_spin: 0,
            spin_edge: false,
            start_time: now,
            last_access: now,
        };
        conn.derive_initial_keys(config)?;
        Ok(conn)
    }

    fn derive_initial_keys(&mut self, config: &Config) -> Result<()> {
        let salt = config.versions[self.version_index].initial_salt;
        self.crypto[Epoch::Initial as usize] =
            crypto::initial_crypto_context(salt, &self.initial_cid, self.client_mode)?;
        Ok(())
    }

    /// Installs traffic keys for an epoch; called by the TLS engine as
    /// secrets become available, and by tests.
    pub fn install_keys(
        &mut self,
        epoch: Epoch,
        recv_secret: &[u8],
        send_secret: &[u8],
    ) -> Result<()> {
        self.crypto[epoch as usize] = CryptoContext {
            recv: Some(DirectionalKeys::from_secret(recv_secret)?),
            send: Some(DirectionalKeys::from_secret(send_secret)?),
        };
        Ok(())
    }

    #[inline]
    pub fn pkt_ctx(&self, space: Space) -> &PktContext {
        &self.pkt_ctx[space as usize]
    }

    #[inline]
    pub fn pkt_ctx_mut(&mut self, space: Space) -> &mut PktContext {
        &mut self.pkt_ctx[space as usize]
    }

    #[inline]
    pub fn crypto_ctx(&self, epoch: Epoch) -> &CryptoContext {
        &self.crypto[epoch as usize]
    }

    pub fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!("state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Restart after a Retry: the key schedule re-derives from the new
    /// initial CID and packet numbers restart from zero.
    pub fn reset_for_retry(&mut self, config: &Config, new_initial_cid: ConnectionId) -> Result<()> {
        self.initial_cid = new_initial_cid;
        self.paths[0].remote_cid = new_initial_cid;
        for ctx in self.pkt_ctx.iter_mut() {
            ctx.reset();
        }
        self.derive_initial_keys(config)?;
        info!("connection reset after retry, new initial cid {:?}", self.initial_cid);
        Ok(())
    }

    /// Version reselect after a Version Negotiation packet.
    pub fn reset_version(&mut self, config: &Config, version_index: usize) -> Result<()> {
        self.version_index = version_index;
        for ctx in self.pkt_ctx.iter_mut() {
            ctx.reset();
        }
        self.derive_initial_keys(config)?;
        self.set_state(State::ClientInit);
        info!(
            "version renegotiated to {:#x}",
            config.versions[version_index].number
        );
        Ok(())
    }

    /// The peer demonstrably installed keys past this space; everything
    /// outstanding in it counts as acknowledged.
    pub fn implicit_ack(&mut self, space: Space) {
        if !self.pkt_ctx[space as usize].implicitly_acked {
            debug!("implicit ack of {:?} space", space);
            self.pkt_ctx[space as usize].implicitly_acked = true;
        }
    }

    pub fn handshake_keys_ready(&self) -> bool {
        self.crypto[Epoch::Handshake as usize].is_ready()
    }

    /// Latches the observed spin value; edges are what an on-path RTT
    /// observer would time.
    pub fn update_spin(&mut self, spin: u8) {
        self.current_spin = spin ^ u8::from(self.client_mode);
        if self.current_spin != self.prev_spin {
            self.prev_spin = self.current_spin;
            self.spin_edge = true;
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == State::Disconnected
    }

    pub fn touch(&mut self, now: time::Instant) {
        self.last_access = now;
    }

    pub fn is_idle(&self, now: time::Instant) -> bool {
        now.duration_since(self.last_access) >= crate::IDLE_TIMEOUT
    }
}
