//! A concrete `Radio` over UDP broadcast, standing in for whatever radio
//! hardware the host runtime actually exposes (this fabric assumes
//! a broadcast-capable radio network and treats its driver as a given
//! collaborator).
use std::io;
use std::net::{SocketAddr, UdpSocket};

use shelfos::scheduler::Radio;

const MAX_FRAME: usize = 2048;

pub struct UdpRadio {
    socket: UdpSocket,
    broadcast_addr: SocketAddr,
    buf: [u8; MAX_FRAME],
}

impl UdpRadio {
    pub fn bind(bind_addr: SocketAddr, broadcast_addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            broadcast_addr,
            buf: [0u8; MAX_FRAME],
        })
    }
}

impl Radio for UdpRadio {
    fn broadcast(&mut self, bytes: &[u8]) {
        if let Err(e) = self.socket.send_to(bytes, self.broadcast_addr) {
            log::warn!(target: "radio", "failed to broadcast {} bytes: {e}", bytes.len());
        }
    }

    fn try_recv(&mut self) -> Option<Vec<u8>> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((n, _from)) => Some(self.buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                log::warn!(target: "radio", "recv failed: {e}");
                None
            }
        }
    }
}
