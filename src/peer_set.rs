use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::peer::{Client, PeerAddr};

/// Addresses of the peers currently being worked, plus the channel that
/// hands freshly connected links to the worker spawner.
///
/// The lock only guards the address index and is never held across I/O.
pub struct PeerSet<S = TcpStream> {
    index: Arc<Mutex<HashSet<PeerAddr>>>,
    dispatch: UnboundedSender<Client<S>>,
}

impl<S> Clone for PeerSet<S> {
    fn clone(&self) -> Self {
        PeerSet {
            index: self.index.clone(),
            dispatch: self.dispatch.clone(),
        }
    }
}

impl<S> PeerSet<S> {
    pub fn new() -> (Self, UnboundedReceiver<Client<S>>) {
        let (dispatch, incoming) = unbounded_channel();
        let set = PeerSet {
            index: Arc::new(Mutex::new(HashSet::new())),
            dispatch,
        };
        (set, incoming)
    }

    /// Registers `addr` and dispatches `link`, unless `addr` is already present.
    pub fn try_add(&self, addr: PeerAddr, link: Client<S>) -> bool {
        let mut index = self.index.lock();
        if index.contains(&addr) {
            return false;
        }
        // sending on an unbounded channel never blocks, so both updates
        // happen under the same lock
        if self.dispatch.send(link).is_err() {
            return false;
        }
        index.insert(addr);
        true
    }

    pub fn remove(&self, addr: &PeerAddr) -> bool {
        self.index.lock().remove(addr)
    }

    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.index.lock().contains(addr)
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    fn link(addr: PeerAddr) -> Client<DuplexStream> {
        let (ours, _theirs) = duplex(64);
        Client::new(addr, ours, 1, Duration::from_secs(1))
    }

    #[test]
    fn test_dedup() {
        let (peers, mut incoming) = PeerSet::<DuplexStream>::new();
        let addr: PeerAddr = "10.0.0.1:6881".parse().unwrap();

        assert!(peers.try_add(addr, link(addr)));
        assert!(!peers.try_add(addr, link(addr)));
        assert!(peers.contains(&addr));
        assert_eq!(peers.len(), 1);

        assert_eq!(incoming.try_recv().map(|l| l.addr()).ok(), Some(addr));
        assert!(incoming.try_recv().is_err());
    }

    #[test]
    fn test_same_ip_other_port_is_distinct() {
        let (peers, mut incoming) = PeerSet::<DuplexStream>::new();
        let a: PeerAddr = "10.0.0.1:6881".parse().unwrap();
        let b: PeerAddr = "10.0.0.1:6882".parse().unwrap();

        assert!(peers.try_add(a, link(a)));
        assert!(peers.try_add(b, link(b)));
        assert_eq!(peers.len(), 2);
        assert!(incoming.try_recv().is_ok());
        assert!(incoming.try_recv().is_ok());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (peers, _incoming) = PeerSet::<DuplexStream>::new();
        let addr: PeerAddr = "10.0.0.2:51413".parse().unwrap();

        assert!(!peers.remove(&addr));
        assert!(peers.try_add(addr, link(addr)));
        assert!(peers.remove(&addr));
        assert!(!peers.remove(&addr));
        assert!(!peers.contains(&addr));
        assert!(peers.is_empty());

        // a removed address may come back later
        assert!(peers.try_add(addr, link(addr)));
    }

    #[test]
    fn test_closed_dispatch_rejects() {
        let (peers, incoming) = PeerSet::<DuplexStream>::new();
        drop(incoming);
        let addr: PeerAddr = "10.0.0.3:6881".parse().unwrap();

        assert!(!peers.try_add(addr, link(addr)));
        assert!(!peers.contains(&addr));
    }
}
