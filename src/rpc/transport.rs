use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::rpc::message::Envelope;

/// Maximum on-wire message size; mirrors the teacher crate's fixed message
/// buffer, generalized to a length-prefixed stream instead of a single
/// fixed-size UDP datagram.
pub const MAX_MESSAGE_LENGTH: usize = 1 << 20;

/// The reliable, message-oriented transport the core depends on. A concrete
/// implementation must offer connection establishment, size-prefixed
/// framing, and exposure of the observed peer address (used by the
/// correlator's Bootstrap rewrite, see `RpcCorrelator`). A "rendezvous ping"
/// keep-alive is a thin send of a `PingRequest` through a third party and is
/// implemented in terms of `send` by callers, not part of this trait.
pub trait Transport: Send + Sync {
    /// Sends a framed, already-serialized envelope to `addr`.
    fn send(&self, addr: &str, bytes: &[u8]) -> io::Result<()>;

    /// The local bound address of this transport.
    fn local_addr(&self) -> SocketAddr;

    /// Keep-alive probe through `rendezvous_addr` on behalf of a node whose
    /// traffic this one relays for a NAT-restricted peer. True NAT-traversal
    /// semantics are transport-specific and out of this crate's scope; a
    /// reliable transport may implement this as nothing more than `send` to
    /// the rendezvous peer itself, which is what the default does.
    fn rendezvous_ping(&self, rendezvous_addr: &str) -> io::Result<()> {
        self.send(rendezvous_addr, &[])
    }
}

/// A TCP-based `Transport`: one persistent accept loop, one short-lived
/// outbound connection per send (simple and sufficient for a DHT's
/// request/response cadence), framed with a 4-byte big-endian length
/// prefix.
pub struct TcpTransport {
    listener_addr: SocketAddr,
    connections: Mutex<()>,
}

impl TcpTransport {
    /// Binds `addr`, spawns the accept loop, and forwards every decoded
    /// envelope (tagged with the observed peer address) to `tx`.
    pub fn new(addr: &str, tx: Sender<(Envelope, SocketAddr)>) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)?;
        let listener_addr = listener.local_addr()?;
        let transport = Arc::new(TcpTransport {
            listener_addr,
            connections: Mutex::new(()),
        });

        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(e) = Self::handle_connection(stream, tx) {
                                warn!("transport: connection error: {}", e);
                            }
                        });
                    },
                    Err(e) => warn!("transport: accept failed: {}", e),
                }
            }
        });

        Ok(transport)
    }

    fn handle_connection(
        mut stream: TcpStream,
        tx: Sender<(Envelope, SocketAddr)>,
    ) -> io::Result<()> {
        let peer_addr = stream.peer_addr()?;
        loop {
            let mut len_buf = [0u8; 4];
            if stream.read_exact(&mut len_buf).is_err() {
                return Ok(());
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_MESSAGE_LENGTH {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
            }
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload)?;
            match bincode::deserialize::<Envelope>(&payload) {
                Ok(envelope) => {
                    if tx.send((envelope, peer_addr)).is_err() {
                        return Ok(());
                    }
                },
                Err(e) => warn!("transport: malformed envelope from {}: {}", peer_addr, e),
            }
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, addr: &str, bytes: &[u8]) -> io::Result<()> {
        let _guard = self.connections.lock().unwrap();
        let mut stream = TcpStream::connect(addr)?;
        let len = (bytes.len() as u32).to_be_bytes();
        stream.write_all(&len)?;
        stream.write_all(bytes)?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.listener_addr
    }
}
