use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::time;

use crate::cid::ConnectionId;
use crate::conn::Connection;

use log::{debug, info};

/// Heap entry so the oldest connection sits on top.
#[derive(Debug, Eq, PartialEq)]
struct AccessTime(time::Instant, u64);

impl Ord for AccessTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.cmp(&self.0).then_with(|| other.1.cmp(&self.1))
    }
}

impl PartialOrd for AccessTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Owner of every connection on the endpoint.
///
/// Lookup goes by destination CID first and by peer address second; the
/// dispatcher decides which of the two is admissible for a given packet
/// type. Values enter through [`Registry::commit`] once their first packet
/// survived admission, and leave on teardown or the idle sweep.
#[derive(Default)]
pub struct Registry {
    conns: HashMap<u64, Connection>,
    by_cid: HashMap<ConnectionId, u64>,
    by_addr: HashMap<SocketAddr, u64>,
    access_times: BinaryHeap<AccessTime>,
    next_key: u64,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Takes ownership of a connection and indexes it.
    pub fn commit(&mut self, conn: Connection, now: time::Instant) -> u64 {
        let key = self.next_key;
        self.next_key += 1;

        let local_cid = conn.paths[0].local_cid;
        if !local_cid.is_null() {
            self.by_cid.insert(local_cid, key);
        }
        // The peer keeps addressing the server with the client-chosen CID
        // until it learns ours.
        if !conn.client_mode && !conn.initial_cid.is_null() {
            self.by_cid.insert(conn.initial_cid, key);
        }
        self.by_addr.insert(conn.paths[0].peer_addr, key);

        info!(
            "conn committed: key {key}, local cid {:?}, peer {}",
            local_cid, conn.paths[0].peer_addr
        );
        self.conns.insert(key, conn);
        self.access_times.push(AccessTime(now, key));
        key
    }

    pub fn key_by_id(&self, cid: &ConnectionId) -> Option<u64> {
        if cid.is_null() {
            return None;
        }
        self.by_cid.get(cid).copied()
    }

    pub fn key_by_addr(&self, addr: &SocketAddr) -> Option<u64> {
        self.by_addr.get(addr).copied()
    }

    pub fn get(&self, key: u64) -> Option<&Connection> {
        self.conns.get(&key)
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut Connection> {
        self.conns.get_mut(&key)
    }

    /// Removes a connection and all its index entries.
    pub fn remove(&mut self, key: u64) -> Option<Connection> {
        let conn = self.conns.remove(&key)?;

        self.by_cid.retain(|_, k| *k != key);
        self.by_addr.retain(|_, k| *k != key);

        info!("conn removed: key {key}, {} conns left", self.conns.len());
        Some(conn)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Evicts connections whose last access is older than the idle
    /// timeout. Access times are refreshed lazily: a stale heap top whose
    /// connection turns out to be live is re-pushed with the current time.
    pub fn sweep_idle(&mut self, now: time::Instant) {
        loop {
            let (oldest_time, key) = match self.access_times.peek() {
                None => break,
                Some(AccessTime(t, k)) => (*t, *k),
            };

            if now.duration_since(oldest_time) < crate::IDLE_TIMEOUT {
                // even the oldest entry is fresh enough
                break;
            }

            self.access_times.pop();
            match self.conns.get(&key) {
                None => {
                    // the connection was torn down earlier; drop the entry
                    debug!("stale idle entry for key {key}");
                }
                Some(c) if c.is_idle(now) => {
                    self.remove(key);
                }
                Some(_) => {
                    self.access_times.push(AccessTime(now, key));
                }
            }
        }
    }
}
