/* Packet protection: initial key schedule, header protection, AEAD. */
use crate::cid::ConnectionId;
use crate::common::{Error, Result};
use crate::packet::{self, PacketHeader, PacketType, RESET_SECRET_SIZE};

use ring::aead;
use ring::aead::quic;
use ring::hkdf;
use ring::hmac;
use ring::rand::SecureRandom;

pub const AEAD_TAG_SIZE: usize = 16;
pub const HP_SAMPLE_SIZE: usize = 16;
pub const RETRY_TOKEN_SIZE: usize = 16;

const AEAD_KEY_SIZE: usize = 16;
const AEAD_IV_SIZE: usize = 12;
const SECRET_SIZE: usize = 32;

/// Keys for one direction of one epoch: the payload AEAD plus the header
/// protection key, both derived from the same traffic secret.
pub struct DirectionalKeys {
    aead: aead::LessSafeKey,
    iv: [u8; AEAD_IV_SIZE],
    hp: quic::HeaderProtectionKey,
}

/// Send and receive keys for one key-schedule epoch.
///
/// The Initial epoch is filled in at connection creation; the TLS engine
/// installs the others as the handshake produces secrets.
#[derive(Default)]
pub struct CryptoContext {
    pub recv: Option<DirectionalKeys>,
    pub send: Option<DirectionalKeys>,
}

impl CryptoContext {
    /// Both directions have keys installed.
    pub fn is_ready(&self) -> bool {
        self.recv.is_some() && self.send.is_some()
    }
}

struct OutLen(usize);

impl hkdf::KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label from TLS 1.3, with the `tls13` prefix.
fn hkdf_expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) -> Result<()> {
    const LABEL_PREFIX: &[u8] = b"tls13 ";

    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = (LABEL_PREFIX.len() + label.len()) as u8;

    let info = [
        &out_len[..],
        &[label_len][..],
        LABEL_PREFIX,
        label,
        &[0][..],
    ];

    prk.expand(&info, OutLen(out.len()))
        .and_then(|okm| okm.fill(out))
        .map_err(|_| Error::AeadCheck)
}

impl DirectionalKeys {
    /// Derives the AEAD key, IV and header-protection key from a traffic
    /// secret.
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);

        let mut key = [0u8; AEAD_KEY_SIZE];
        hkdf_expand_label(&prk, b"quic key", &mut key)?;

        let mut iv = [0u8; AEAD_IV_SIZE];
        hkdf_expand_label(&prk, b"quic iv", &mut iv)?;

        let mut hp_key = [0u8; AEAD_KEY_SIZE];
        hkdf_expand_label(&prk, b"quic hp", &mut hp_key)?;

        let aead = aead::UnboundKey::new(&aead::AES_128_GCM, &key)
            .map(aead::LessSafeKey::new)
            .map_err(|_| Error::AeadCheck)?;
        let hp = quic::HeaderProtectionKey::new(&quic::AES_128, &hp_key)
            .map_err(|_| Error::AeadCheck)?;

        Ok(DirectionalKeys { aead, iv, hp })
    }

    fn nonce(&self, pn64: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (b, pn) in nonce[AEAD_IV_SIZE - 8..]
            .iter_mut()
            .zip(pn64.to_be_bytes())
        {
            *b ^= pn;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

/// Derives the Initial-epoch contexts from the client's destination CID
/// and the version's salt.
pub fn initial_crypto_context(
    salt: &[u8],
    cid: &ConnectionId,
    client_mode: bool,
) -> Result<CryptoContext> {
    let initial_secret = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(cid.as_slice());

    let mut client_secret = [0u8; SECRET_SIZE];
    hkdf_expand_label(&initial_secret, b"client in", &mut client_secret)?;
    let mut server_secret = [0u8; SECRET_SIZE];
    hkdf_expand_label(&initial_secret, b"server in", &mut server_secret)?;

    let client_keys = DirectionalKeys::from_secret(&client_secret)?;
    let server_keys = DirectionalKeys::from_secret(&server_secret)?;

    let (send, recv) = if client_mode {
        (client_keys, server_keys)
    } else {
        (server_keys, client_keys)
    };

    Ok(CryptoContext {
        recv: Some(recv),
        send: Some(send),
    })
}

/// Removes header protection, reconstructs the packet number and opens the
/// payload in place.
///
/// `bytes` must be mutable: the first byte and packet number bytes are
/// unmasked in place and the plaintext is written over the ciphertext.
/// `highest` is the largest packet number received so far in the packet's
/// space. On success the header's `offset`/`payload_length` delimit the
/// plaintext and the plaintext length is returned.
pub fn decrypt_packet(
    keys: &DirectionalKeys,
    bytes: &mut [u8],
    ph: &mut PacketHeader,
    highest: u64,
) -> Result<usize> {
    let length = ph.offset + ph.payload_length;
    let sample_offset = ph.pn_offset + 4;

    if sample_offset + HP_SAMPLE_SIZE > length {
        // Not enough ciphertext to sample. Keep going with poisoned
        // values so the AEAD check below rejects the packet.
        ph.pn = 0xffff_ffff;
        ph.pnmask = 0xffff_ffff_0000_0000;
        ph.offset = ph.pn_offset;
        log::debug!(
            "invalid packet format, type {:?}, epoch {:?}, pc {:?}",
            ph.ptype,
            ph.epoch,
            ph.space
        );
    } else {
        let sample = &bytes[sample_offset..sample_offset + HP_SAMPLE_SIZE];
        let mask = keys.hp.new_mask(sample).map_err(|_| Error::AeadCheck)?;

        // Long headers expose the low four bits of the first byte, short
        // headers five (the key-phase bit is protected).
        let first_mask = if bytes[0] & 0x80 == 0x80 { 0x0f } else { 0x1f };
        let first = bytes[0] ^ (mask[0] & first_mask);
        bytes[0] = first;

        let pn_len = (first & 3) as usize + 1;
        let mut pn_val: u32 = 0;
        ph.pnmask = u64::MAX;

        for &m in &mask[1..=pn_len] {
            bytes[ph.offset] ^= m;
            pn_val = (pn_val << 8) | u32::from(bytes[ph.offset]);
            ph.offset += 1;
            ph.pnmask <<= 8;
        }

        ph.pn = pn_val;
        ph.payload_length -= pn_len;

        // Only the short header carries a key phase.
        if ph.ptype == PacketType::OneRttPhase0 && (first >> 2) & 1 == 1 {
            ph.ptype = PacketType::OneRttPhase1;
        }
    }

    ph.pn64 = packet::packet_number_64(highest, ph.pnmask, ph.pn);

    let (header, rest) = bytes.split_at_mut(ph.offset);
    let ciphertext = &mut rest[..ph.payload_length];

    match keys
        .aead
        .open_in_place(keys.nonce(ph.pn64), aead::Aad::from(&header[..]), ciphertext)
    {
        Ok(plain) => {
            let plain_len = plain.len();
            ph.payload_length = plain_len;
            Ok(plain_len)
        }
        Err(_) => Err(Error::AeadCheck),
    }
}

/// Seals a packet: AEAD over the payload with the header as additional
/// data, then header protection over the first byte and the packet number.
///
/// `header` must already contain the truncated packet number as its last
/// `pn_len` bytes. Returns the full wire image.
pub fn seal_packet(
    keys: &DirectionalKeys,
    pn64: u64,
    pn_len: usize,
    header: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>> {
    debug_assert!((1..=4).contains(&pn_len));
    debug_assert!(payload.len() + AEAD_TAG_SIZE >= 4 - pn_len + HP_SAMPLE_SIZE);

    let mut out = Vec::with_capacity(header.len() + payload.len() + AEAD_TAG_SIZE);
    out.extend_from_slice(header);
    out.extend_from_slice(payload);

    let tag = keys
        .aead
        .seal_in_place_separate_tag(
            keys.nonce(pn64),
            aead::Aad::from(header),
            &mut out[header.len()..],
        )
        .map_err(|_| Error::AeadCheck)?;
    out.extend_from_slice(tag.as_ref());

    let pn_offset = header.len() - pn_len;
    let sample_offset = pn_offset + 4;
    let sample = &out[sample_offset..sample_offset + HP_SAMPLE_SIZE];
    let mask = keys.hp.new_mask(sample).map_err(|_| Error::AeadCheck)?;

    let first_mask = if out[0] & 0x80 == 0x80 { 0x0f } else { 0x1f };
    out[0] ^= mask[0] & first_mask;
    for i in 0..pn_len {
        out[pn_offset + i] ^= mask[1 + i];
    }

    Ok(out)
}

/// Retry token: a truncated HMAC over the peer's IP under a server-wide
/// secret. Proves nothing beyond address reachability.
pub fn retry_token(secret: &hmac::Key, peer_addr: &std::net::SocketAddr) -> [u8; RETRY_TOKEN_SIZE] {
    let tag = match peer_addr.ip() {
        std::net::IpAddr::V4(ip) => hmac::sign(secret, &ip.octets()),
        std::net::IpAddr::V6(ip) => hmac::sign(secret, &ip.octets()),
    };

    let mut token = [0u8; RETRY_TOKEN_SIZE];
    token.copy_from_slice(&tag.as_ref()[..RETRY_TOKEN_SIZE]);
    token
}

/// Constant-time check of an echoed retry token.
pub fn verify_retry_token(
    secret: &hmac::Key,
    peer_addr: &std::net::SocketAddr,
    token: &[u8],
) -> bool {
    if token.len() != RETRY_TOKEN_SIZE {
        return false;
    }
    let expected = retry_token(secret, peer_addr);
    ring::constant_time::verify_slices_are_equal(&expected, token).is_ok()
}

/// Deterministic per-CID stateless reset secret under the endpoint seed.
pub fn reset_secret(seed: &hmac::Key, cid: &ConnectionId) -> [u8; RESET_SECRET_SIZE] {
    let tag = hmac::sign(seed, cid.as_slice());
    let mut secret = [0u8; RESET_SECRET_SIZE];
    secret.copy_from_slice(&tag.as_ref()[..RESET_SECRET_SIZE]);
    secret
}

/// A random value in `[0, max)`.
pub fn uniform_random(rng: &dyn SecureRandom, max: u64) -> u64 {
    debug_assert!(max > 0);
    let mut buf = [0u8; 8];
    if rng.fill(&mut buf).is_err() {
        return 0;
    }
    u64::from_be_bytes(buf) % max
}

/// A random 64-bit value, for path challenges.
pub fn random_u64(rng: &dyn SecureRandom) -> u64 {
    let mut buf = [0u8; 8];
    let _ = rng.fill(&mut buf);
    u64::from_be_bytes(buf)
}
