/* Collaborator seams of the reception core. */
use std::time;

use crate::common::Result;
use crate::conn::Connection;
use crate::packet::Epoch;

use log::{debug, info};

/// Consumes decrypted payloads.
///
/// The payload slice is exactly the plaintext of one segment and `epoch`
/// matches the key context that opened it. Frames arrive in wire order.
pub trait FrameProcessor {
    fn decode_frames(
        &mut self,
        conn: &mut Connection,
        payload: &[u8],
        epoch: Epoch,
        now: time::Instant,
        path_id: usize,
    ) -> Result<()>;

    /// Scans a payload for closing frames only, as allowed while the
    /// connection itself is closing. Returns whether a CONNECTION_CLOSE
    /// was seen.
    fn decode_closing_frames(&mut self, conn: &mut Connection, payload: &[u8]) -> Result<bool> {
        let _ = (conn, payload);
        Ok(false)
    }
}

/// The TLS handshake engine, driven off CRYPTO stream bytes the frame
/// processor has buffered on the connection.
pub trait HandshakeDriver {
    fn process_crypto_stream(&mut self, conn: &mut Connection) -> Result<()>;

    fn handshake_complete(&self, conn: &Connection) -> bool;
}

/// Up-calls toward the application.
pub trait Events {
    fn ready(&mut self, conn: &Connection) {
        info!("connection ready, initial cid {:?}", conn.initial_cid);
    }

    fn stateless_reset(&mut self, conn: &Connection) {
        info!("stateless reset, initial cid {:?}", conn.initial_cid);
    }
}

/// Accepts every payload without interpreting it. Stands in until a real
/// frame decoder is plugged at endpoint construction.
#[derive(Default)]
pub struct NullFrameProcessor;

impl FrameProcessor for NullFrameProcessor {
    fn decode_frames(
        &mut self,
        _conn: &mut Connection,
        payload: &[u8],
        epoch: Epoch,
        _now: time::Instant,
        path_id: usize,
    ) -> Result<()> {
        debug!(
            "frames accepted unparsed: {} bytes, epoch {:?}, path {}",
            payload.len(),
            epoch,
            path_id
        );
        Ok(())
    }
}

/// A handshake driver that never completes; real deployments install a
/// TLS engine here.
#[derive(Default)]
pub struct NullHandshakeDriver;

impl HandshakeDriver for NullHandshakeDriver {
    fn process_crypto_stream(&mut self, _conn: &mut Connection) -> Result<()> {
        Ok(())
    }

    fn handshake_complete(&self, _conn: &Connection) -> bool {
        false
    }
}

/// Logs the up-calls and nothing else.
#[derive(Default)]
pub struct LogEvents;

impl Events for LogEvents {}
