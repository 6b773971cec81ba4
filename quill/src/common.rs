/// Errors raised by the packet reception path.
///
/// These are kinds, not carriers of detail: the dispatcher decides per kind
/// whether to drop the segment, answer with a stateless packet, or tear the
/// connection down. Detail goes to the log at the point of detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Header bounds violation, varint truncation, impossible CID length.
    Malformed,

    /// Long header with a version we do not speak.
    UnsupportedVersion,

    /// Header protection or AEAD authentication failed.
    AeadCheck,

    /// Packet number already present in the receive set.
    Duplicate,

    /// Correct crypto but wrong connection state for this packet type.
    UnexpectedPacket,

    /// SCID echo mismatch, or DCID matches no known identifier.
    CnxIdCheck,

    /// A legitimate Retry was processed; the attempt restarts with a token.
    Retry,

    /// Trailing reset token matched; the peer lost its state.
    StatelessReset,

    /// Server-bound Initial arrived in a datagram under the enforced MTU.
    InitialTooShort,

    /// Catch-all protocol violation.
    Detected,

    /// Allocation or resource failure.
    Memory,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::convert::From<octets::BufferTooShortError> for Error {
    fn from(_err: octets::BufferTooShortError) -> Self {
        Error::Malformed
    }
}

// support conversion to String
impl std::convert::From<Error> for String {
    fn from(err: Error) -> Self {
        format!("{}", err)
    }
}
