//! UDP datagram senders.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use pixelbridge_core::io::DatagramSender;

/// The largest UDP payload size.
pub const MAX_UDP_SIZE: usize = 65507;

/// A [`DatagramSender`] over a connected UDP socket.
///
/// Sends are blocking std-socket calls; UDP sends do not block
/// meaningfully, which keeps the sender usable from both sync and async
/// callers.
#[derive(Debug)]
pub struct UdpDatagramSender {
    socket: Option<UdpSocket>,
}

impl UdpDatagramSender {
    /// Opens a socket connected to `addr`.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(addr)?;
        Ok(UdpDatagramSender {
            socket: Some(socket),
        })
    }

    /// Wraps an already-connected socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        UdpDatagramSender {
            socket: Some(socket),
        }
    }
}

impl DatagramSender for UdpDatagramSender {
    fn send_datagram(&mut self, data: &[u8]) -> io::Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "sender is closed"))?;
        socket.send(data).map(|_| ())
    }

    fn max_datagram_size(&self) -> usize {
        MAX_UDP_SIZE
    }

    fn close(&mut self) -> io::Result<()> {
        self.socket = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelbridge_core::io::DatagramSender as _;

    #[test]
    fn sends_to_a_local_receiver() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = receiver.local_addr().unwrap();

        let mut sender = UdpDatagramSender::connect(addr).unwrap();
        sender.send_datagram(b"hello").unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn send_after_close_fails() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut sender = UdpDatagramSender::connect(receiver.local_addr().unwrap()).unwrap();

        sender.close().unwrap();
        assert!(sender.send_datagram(b"x").is_err());
    }
}
