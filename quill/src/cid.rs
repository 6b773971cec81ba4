use crate::common::{Error, Result};

use ring::rand::SecureRandom;

/// Longest connection ID allowed on the wire.
pub const MAX_CID_LEN: usize = 20;

/// A QUIC connection ID.
///
/// Stored inline as a length plus a fixed array so that headers and
/// connections never heap-allocate on the receive path. The zero-length
/// value is the *null* ID and means "identify the connection by address".
#[derive(Clone, Copy, Eq)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_LEN],
}

impl ConnectionId {
    pub const fn null() -> Self {
        ConnectionId {
            len: 0,
            bytes: [0; MAX_CID_LEN],
        }
    }

    /// Copies a slice into a new connection ID.
    ///
    /// The caller is expected to have validated the length against
    /// [`MAX_CID_LEN`]; wire-facing code goes through [`ConnectionId::parse`].
    pub fn from_slice(id: &[u8]) -> Self {
        debug_assert!(id.len() <= MAX_CID_LEN);
        let mut bytes = [0; MAX_CID_LEN];
        bytes[..id.len()].copy_from_slice(id);
        ConnectionId {
            len: id.len() as u8,
            bytes,
        }
    }

    /// Reads an `len`-byte connection ID off the buffer.
    pub fn parse(b: &mut octets::Octets, len: usize) -> Result<Self> {
        if len > MAX_CID_LEN {
            return Err(Error::Malformed);
        }
        let id = b.get_bytes(len)?;
        Ok(ConnectionId::from_slice(id.as_ref()))
    }

    /// Generates a random ID of the given length.
    pub fn random(rng: &dyn SecureRandom, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_LEN);
        let mut bytes = [0; MAX_CID_LEN];
        // SystemRandom does not fail in practice; fall back to the null ID
        // rather than panicking in a constructor.
        if rng.fill(&mut bytes[..len]).is_err() {
            return ConnectionId::null();
        }
        ConnectionId {
            len: len as u8,
            bytes,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl Default for ConnectionId {
    #[inline]
    fn default() -> Self {
        ConnectionId::null()
    }
}

impl PartialEq for ConnectionId {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl std::hash::Hash for ConnectionId {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

impl AsRef<[u8]> for ConnectionId {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "-");
        }
        for c in self.as_slice() {
            write!(f, "{c:02x}")?;
        }
        Ok(())
    }
}
