//! SIP transport layer - UDP socket plus an in-memory transport

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
}

impl OutgoingMessage {
    pub fn new(data: Bytes, destination: SocketAddr) -> Self {
        Self { data, destination }
    }
}

/// Transport layer trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Address advertised in Via and Contact
    fn local_addr(&self) -> SocketAddr;

    /// Stop receiving; further sends fail
    async fn close(&self);
}

/// UDP transport implementation
pub struct UdpTransport {
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind the socket and start delivering parsed messages into `inbound`.
    /// Failing to bind is fatal for the caller.
    pub async fn bind(
        bind_addr: SocketAddr,
        inbound: mpsc::Sender<IncomingMessage>,
    ) -> Result<Self, SipError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket {}: {}", bind_addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(format!("Failed to get local address: {}", e)))?;

        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        let handle = tokio::spawn(Self::receive_loop(socket.clone(), inbound));

        Ok(Self {
            local_addr,
            socket,
            receiver: Mutex::new(Some(handle)),
        })
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    // Keep-alive CRLFs carry no message
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            if tx.send(IncomingMessage { message, source }).await.is_err() {
                                debug!("Inbound channel closed, stopping UDP receiver");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    warn!("Failed to receive UDP packet: {}", e);
                }
            }
        }
    }

    /// Override the address advertised to peers (e.g. a configured LOCAL_IP)
    pub fn with_advertised_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = addr;
        self
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        if self.receiver.lock().await.is_none() {
            return Err(SipError::TransportError("Transport closed".to_string()));
        }

        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        self.socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) {
        if let Some(handle) = self.receiver.lock().await.take() {
            info!("Stopping UDP transport on {}", self.local_addr);
            handle.abort();
        }
    }
}

/// Transport that hands every outgoing message to a channel. Inbound
/// messages are injected by whoever owns the engine's inbound sender.
pub struct MemoryTransport {
    local_addr: SocketAddr,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutgoingMessage>>>,
}

impl MemoryTransport {
    pub fn new(local_addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                local_addr,
                outbound: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        let guard = self.outbound.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| SipError::TransportError("Transport closed".to_string()))?;
        tx.send(message).map_err(|_| {
            error!("Memory transport peer dropped");
            SipError::TransportError("Peer dropped".to_string())
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) {
        self.outbound.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTIONS: &[u8] = b"OPTIONS sip:100@127.0.0.1 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bKping\r\n\
        From: <sip:pbx@127.0.0.1>;tag=1\r\n\
        To: <sip:100@127.0.0.1>\r\n\
        Call-ID: ping@127.0.0.1\r\n\
        CSeq: 1 OPTIONS\r\n\
        Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn test_udp_transport_delivers_parsed_messages() {
        let (tx, mut rx) = mpsc::channel(8);
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), tx)
            .await
            .unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"\r\n\r\n", transport.local_addr()).await.unwrap();
        peer.send_to(b"garbage", transport.local_addr()).await.unwrap();
        peer.send_to(OPTIONS, transport.local_addr()).await.unwrap();

        let incoming = rx.recv().await.unwrap();
        assert!(incoming.message.is_request());
        assert_eq!(incoming.source, peer.local_addr().unwrap());

        transport.close().await;
        let result = transport
            .send(OutgoingMessage::new(Bytes::from_static(OPTIONS), peer.local_addr().unwrap()))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_memory_transport() {
        let (transport, mut sent) = MemoryTransport::new("10.0.0.5:5060".parse().unwrap());
        let dest: SocketAddr = "10.0.0.1:5060".parse().unwrap();

        transport
            .send(OutgoingMessage::new(Bytes::from_static(OPTIONS), dest))
            .await
            .unwrap();
        assert_eq!(sent.recv().await.unwrap().destination, dest);

        transport.close().await;
        assert!(transport
            .send(OutgoingMessage::new(Bytes::from_static(OPTIONS), dest))
            .await
            .is_err());
    }
}
