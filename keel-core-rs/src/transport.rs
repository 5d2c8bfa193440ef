//! UDP datagram transport for keel messages.
//!
//! Carries both consensus and client traffic as JSON datagrams. The receive
//! loop runs in a background task feeding a channel; the send half is a
//! cheap clone over the shared socket. Delivery is best-effort: consensus
//! retries through its timers, clients through the proxy's retry strategy.

use crate::message::Message;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Maximum datagram size (64KB covers batched appends and install chunks)
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Send half of a bound UDP transport
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
}

impl Transport {
    /// Bind to `addr` and start the receive loop; the returned receiver
    /// yields every decodable datagram with its source address
    pub async fn bind(addr: SocketAddr) -> io::Result<(Self, mpsc::Receiver<(Message, SocketAddr)>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (incoming_tx, incoming_rx) = mpsc::channel(256);

        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    received = recv_socket.recv_from(&mut buf) => match received {
                        Ok((len, src)) => match Message::from_bytes(&buf[..len]) {
                            Ok(msg) => {
                                if incoming_tx.send((msg, src)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Transport: Undecodable datagram from {}: {}", src, e);
                            }
                        },
                        Err(e) => {
                            error!("Transport: Receive error: {}", e);
                            break;
                        }
                    },
                    // Release the socket as soon as the consumer goes away
                    _ = incoming_tx.closed() => break,
                }
            }
        });

        Ok((Self { socket }, incoming_rx))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send a message to a specific address
    pub async fn send(&self, msg: &Message, addr: SocketAddr) -> io::Result<()> {
        let bytes = msg
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        debug!("Transport: Sending {} bytes to {}", bytes.len(), addr);
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    /// Send a message to several addresses, logging individual failures
    pub async fn broadcast(&self, msg: &Message, addrs: &[SocketAddr]) {
        let bytes = match msg.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                warn!("Transport: Cannot encode broadcast: {}", e);
                return;
            }
        };
        for addr in addrs {
            if let Err(e) = self.socket.send_to(&bytes, *addr).await {
                warn!("Transport: Failed to send to {}: {}", addr, e);
            }
        }
    }
}
