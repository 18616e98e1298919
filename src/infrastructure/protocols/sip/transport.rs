//! SIP transport layer - UDP datagrams in and out

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }

    pub fn default_port(&self) -> u16 {
        5060
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportProtocol::Tcp)
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// UDP transport
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    receive_task: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Binds the socket and starts feeding parsed messages into `tx`
    pub async fn bind(
        bind_addr: SocketAddr,
        tx: mpsc::Sender<IncomingMessage>,
    ) -> Result<Self, SipError> {
        info!("Starting UDP transport on {}", bind_addr);

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let socket = Arc::new(socket);

        if let Ok(addr) = socket.local_addr() {
            info!("UDP transport listening on {}", addr);
        }

        let receive_task = tokio::spawn(Self::receive_loop(socket.clone(), tx));

        Ok(Self {
            socket,
            receive_task: Some(receive_task),
        })
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    let data = &buf[..size];
                    // CRLF keep-alives carry no message
                    if data.iter().all(|b| b.is_ascii_whitespace()) {
                        trace!("Keep-alive from {}", source);
                        continue;
                    }

                    debug!("Received {} bytes from {} via UDP", size, source);

                    match SipMessage::parse(data) {
                        Ok(message) => {
                            if let Err(e) = tx.send(IncomingMessage { message, source }).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SipError> {
        self.socket
            .local_addr()
            .map_err(|e| SipError::TransportUnavailable(e.to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.receive_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub async fn send_to(&self, data: &Bytes, destination: SocketAddr) -> Result<(), SipError> {
        if !self.is_running() {
            return Err(SipError::TransportUnavailable(
                "UDP transport stopped".to_string(),
            ));
        }

        debug!("Sending {} bytes to {} via UDP", data.len(), destination);

        self.socket
            .send_to(data, destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.receive_task.take() {
            task.abort();
            info!("UDP transport stopped");
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
