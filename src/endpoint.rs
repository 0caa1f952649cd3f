//! Endpoint variants and the endpoint registry.
//!
//! Every participant in the event loop is an `Endpoint`: the serial device,
//! the TCP listeners, accepted clients, and the operator's stdin. The
//! registry hands out stable identities (`EndpointRef`) that double as weak
//! references: a ref whose sequence number no longer matches its slot
//! refers to an endpoint that has since been destroyed, and lookups on it
//! simply fail.

use crate::ring::RingBuffer;
use slab::Slab;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// Stable, non-owning endpoint identity.
///
/// The slot index alone would be ambiguous once the slab reuses it for a
/// later connection; the sequence number makes a stale ref detectably
/// stale instead of silently pointing at a stranger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRef {
    slot: usize,
    seq: u64,
}

/// The serial device endpoint: the singleton resource every submitter
/// shares, guarded by the flow-control token counter.
pub struct Device {
    pub fd: OwnedFd,
    pub rx: RingBuffer,
    pub tx: RingBuffer,
    /// Remaining permission to write lines; the device is writable only
    /// while `tokens > 0`.
    pub tokens: u32,
    pub maxtoken: u32,
    /// Weak reference to whichever endpoint handed the device its most
    /// recent line. Response lines route back through this.
    pub last_submitter: Option<EndpointRef>,
}

impl Device {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            rx: RingBuffer::new(),
            tx: RingBuffer::new(),
            tokens: 1,
            maxtoken: 1,
            last_submitter: None,
        }
    }

    /// Queue a complete (`\n`-terminated) line for transmission and record
    /// its submitter. Returns the bytes accepted by the tx ring.
    pub fn submit(&mut self, line: &[u8], from: EndpointRef) -> usize {
        let n = self.tx.write(line);
        self.last_submitter = Some(from);
        n
    }

    /// One acknowledgement line returns one unit of write credit.
    pub fn grant_token(&mut self) {
        if self.tokens < self.maxtoken {
            self.tokens += 1;
        }
    }

    /// Writing one line to the device consumes one unit of credit.
    pub fn take_token(&mut self) {
        debug_assert!(self.tokens > 0);
        self.tokens -= 1;
    }

    /// Whether the device belongs in the write-interest set: credit
    /// available and a complete line queued.
    pub fn can_transmit(&self) -> bool {
        self.tokens > 0 && self.tx.newlines() > 0
    }
}

/// An accepted TCP client connection.
pub struct Client {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub rx: RingBuffer,
    pub tx: RingBuffer,
}

impl Client {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            rx: RingBuffer::new(),
            tx: RingBuffer::new(),
        }
    }
}

/// A participant in the event loop.
pub enum Endpoint {
    Device(Device),
    Client(Client),
    Listener {
        socket: TcpListener,
        local: SocketAddr,
    },
    /// Operator input. Polls a dup of the process stdin so destroying the
    /// endpoint never closes the real fd 0. Read-only: it has no buffers of
    /// its own and never carries write interest.
    Stdin { fd: OwnedFd },
}

impl Endpoint {
    pub fn fd(&self) -> BorrowedFd<'_> {
        match self {
            Endpoint::Device(d) => d.fd.as_fd(),
            Endpoint::Client(c) => c.stream.as_fd(),
            Endpoint::Listener { socket, .. } => socket.as_fd(),
            Endpoint::Stdin { fd } => fd.as_fd(),
        }
    }

    /// Whether this endpoint belongs in the write-interest set this
    /// iteration. Listeners and stdin never do.
    pub fn wants_write(&self) -> bool {
        match self {
            Endpoint::Device(d) => d.can_transmit(),
            Endpoint::Client(c) => c.tx.readable() > 0,
            Endpoint::Listener { .. } | Endpoint::Stdin { .. } => false,
        }
    }
}

struct Entry {
    seq: u64,
    ep: Endpoint,
}

/// Registry of active endpoints with O(1) insert, lookup, and remove.
///
/// Iteration visits slots in index order; arbitration between endpoints
/// competing for the device follows that order. Removal during a dispatch
/// pass is tolerated because dispatch holds `EndpointRef`s, not borrows,
/// and a removed endpoint's ref stops resolving.
pub struct Registry {
    slots: Slab<Entry>,
    next_seq: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, ep: Endpoint) -> EndpointRef {
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = self.slots.insert(Entry { seq, ep });
        EndpointRef { slot, seq }
    }

    pub fn get(&self, r: EndpointRef) -> Option<&Endpoint> {
        self.slots
            .get(r.slot)
            .filter(|entry| entry.seq == r.seq)
            .map(|entry| &entry.ep)
    }

    pub fn get_mut(&mut self, r: EndpointRef) -> Option<&mut Endpoint> {
        self.slots
            .get_mut(r.slot)
            .filter(|entry| entry.seq == r.seq)
            .map(|entry| &mut entry.ep)
    }

    pub fn remove(&mut self, r: EndpointRef) -> Option<Endpoint> {
        match self.slots.get(r.slot) {
            Some(entry) if entry.seq == r.seq => Some(self.slots.remove(r.slot).ep),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (EndpointRef, &Endpoint)> {
        self.slots
            .iter()
            .map(|(slot, entry)| (EndpointRef { slot, seq: entry.seq }, &entry.ep))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn fake_fd() -> OwnedFd {
        let (a, _b) = UnixStream::pair().unwrap();
        // Leak the other half; tests only need a live fd.
        std::mem::forget(_b);
        a.into()
    }

    #[test]
    fn test_refs_go_stale_on_removal() {
        let mut reg = Registry::new();
        let r1 = reg.insert(Endpoint::Stdin { fd: fake_fd() });
        assert!(reg.get(r1).is_some());

        reg.remove(r1);
        assert!(reg.get(r1).is_none());

        // The slot is reused but the sequence differs, so the old ref
        // still resolves to nothing.
        let r2 = reg.insert(Endpoint::Stdin { fd: fake_fd() });
        assert!(reg.get(r1).is_none());
        assert!(reg.get(r2).is_some());
        assert_ne!(r1, r2);
    }

    #[test]
    fn test_remove_with_stale_ref_is_noop() {
        let mut reg = Registry::new();
        let r1 = reg.insert(Endpoint::Stdin { fd: fake_fd() });
        reg.remove(r1);
        let r2 = reg.insert(Endpoint::Stdin { fd: fake_fd() });

        assert!(reg.remove(r1).is_none());
        assert_eq!(reg.len(), 1);
        assert!(reg.get(r2).is_some());
    }

    #[test]
    fn test_device_token_accounting() {
        let mut dev = Device::new(fake_fd());
        assert_eq!(dev.tokens, 1);
        assert_eq!(dev.maxtoken, 1);
        assert!(!dev.can_transmit());

        let mut reg = Registry::new();
        let submitter = reg.insert(Endpoint::Stdin { fd: fake_fd() });

        assert_eq!(dev.submit(b"G28\n", submitter), 4);
        assert_eq!(dev.last_submitter, Some(submitter));
        assert!(dev.can_transmit());

        dev.take_token();
        assert_eq!(dev.tokens, 0);
        assert!(!dev.can_transmit());

        // Credit is capped at maxtoken.
        dev.grant_token();
        dev.grant_token();
        assert_eq!(dev.tokens, 1);
    }

    #[test]
    fn test_iteration_order_is_slot_order() {
        let mut reg = Registry::new();
        let a = reg.insert(Endpoint::Stdin { fd: fake_fd() });
        let b = reg.insert(Endpoint::Stdin { fd: fake_fd() });
        let c = reg.insert(Endpoint::Stdin { fd: fake_fd() });

        let order: Vec<EndpointRef> = reg.iter().map(|(r, _)| r).collect();
        assert_eq!(order, vec![a, b, c]);
    }
}
