//! Poll-driven endpoint that owns the UDP listener(s), the TCP listener,
//! and the single handoff slot between the main thread and the server
//! thread.
//!
//! Structural template: `neutronium::net::endpoint::Endpoint`'s separate
//! poll instances for listen/handshake/live phases and its `mio::Token`
//! routing, adapted from TCP-game-channels to the UDP-discovery +
//! single-slot-TCP-session shape spec §4.5/§4.6 requires. Grounded on
//! `original_source/daemon.h`'s `Daemon` main-thread poll loop and the
//! handoff-slot-guarded-by-an-atomic-busy-flag description in spec §5.

use mio::net::{TcpListener, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const TOKEN_CONTROL_SOCKET: Token = Token(0);
pub const TOKEN_QUERY_SOCKET: Token = Token(1);
pub const TOKEN_TCP_LISTENER: Token = Token(2);
const TOKEN_UDP_BASE: usize = 100;

/// A single in-flight TCP connection handed from the main thread to the
/// server thread once its non-blocking handshake is ready to be driven to
/// completion blockingly. Ownership transfer is guarded by `busy`
/// (spec §5 "Per-session TCP descriptor ownership passes ... via a slot
/// guarded by an atomic server-busy flag").
pub struct HandoffSlot<T> {
    busy: AtomicBool,
    slot: Mutex<Option<T>>,
}

impl<T> Default for HandoffSlot<T> {
    fn default() -> Self {
        HandoffSlot { busy: AtomicBool::new(false), slot: Mutex::new(None) }
    }
}

impl<T> HandoffSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Attempts to hand off `item`. Fails (returning `item` back) if the
    /// slot is already occupied, at which point the caller closes the
    /// extra connection (spec §4.5 "If the server is already busy it
    /// closes the accepted connection").
    pub fn try_offer(&self, item: T) -> Result<(), T> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.slot.lock() = Some(item);
            Ok(())
        } else {
            Err(item)
        }
    }

    /// Takes the item if present, freeing the slot for the next handoff.
    pub fn take(&self) -> Option<T> {
        let mut guard = self.slot.lock();
        let item = guard.take();
        if item.is_some() {
            self.busy.store(false, Ordering::Release);
        }
        item
    }
}

/// Owns the main thread's poll loop registrations: the control/query Unix
/// sockets (registered by the daemon crate, not here), the TCP listener,
/// and one UDP socket per configured interface.
pub struct GossipEndpoint {
    poll: Poll,
    tcp_listener: TcpListener,
    udp_sockets: Vec<UdpSocket>,
}

impl GossipEndpoint {
    pub fn bind(tcp_addr: SocketAddr, udp_addrs: &[SocketAddr]) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let mut tcp_listener = TcpListener::bind(tcp_addr)?;
        poll.registry()
            .register(&mut tcp_listener, TOKEN_TCP_LISTENER, Interest::READABLE)?;

        let mut udp_sockets = Vec::with_capacity(udp_addrs.len());
        for (i, addr) in udp_addrs.iter().enumerate() {
            let mut sock = UdpSocket::bind(*addr)?;
            poll.registry()
                .register(&mut sock, Token(TOKEN_UDP_BASE + i), Interest::READABLE)?;
            udp_sockets.push(sock);
        }

        Ok(GossipEndpoint { poll, tcp_listener, udp_sockets })
    }

    pub fn tcp_listener(&self) -> &TcpListener {
        &self.tcp_listener
    }

    pub fn udp_sockets(&self) -> &[UdpSocket] {
        &self.udp_sockets
    }

    /// Blocks for at most `timeout_ms` milliseconds, returning the tokens
    /// that became readable. The caller dispatches by token: the TCP
    /// listener accepts and drives a non-blocking handshake, a UDP token
    /// reads and processes one announcement, and external tokens
    /// (registered by the daemon crate for the Unix sockets) are passed
    /// through untouched.
    pub fn poll(&mut self, timeout_ms: u64) -> std::io::Result<Vec<Token>> {
        let mut events = Events::with_capacity(64);
        self.poll
            .poll(&mut events, Some(std::time::Duration::from_millis(timeout_ms)))?;
        Ok(events.iter().map(|e| e.token()).collect())
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handoff_slot_rejects_second_offer_while_busy() {
        let slot: HandoffSlot<u32> = HandoffSlot::new();
        assert!(slot.try_offer(1).is_ok());
        assert!(slot.is_busy());
        assert_eq!(slot.try_offer(2), Err(2));

        assert_eq!(slot.take(), Some(1));
        assert!(!slot.is_busy());
        assert!(slot.try_offer(3).is_ok());
    }

    #[test]
    fn endpoint_binds_loopback_tcp_and_udp() {
        let tcp_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let udp_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let endpoint = GossipEndpoint::bind(tcp_addr, &[udp_addr]).unwrap();
        assert_eq!(endpoint.udp_sockets().len(), 1);
    }
}
