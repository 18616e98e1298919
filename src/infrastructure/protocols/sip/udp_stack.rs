//! `MessageStack` over a UDP socket and the RFC 3261 transaction layer

use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::stack::{
    LocalEndpoint, MessageStack, RequestEvent, ResponseEvent, StackEvent, TerminatedEvent,
    TransactionKey,
};
use super::transaction::{SipTimers, TransactionLayer};
use super::transport::{IncomingMessage, UdpTransport};
use crate::config::SipConfig;
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const EVENT_QUEUE: usize = 1024;
const KEEP_ALIVE: &[u8] = b"\r\n\r\n";

pub struct UdpMessageStack {
    transport: Arc<UdpTransport>,
    layer: Arc<TransactionLayer>,
    endpoint: LocalEndpoint,
    proxy: SocketAddr,
    events: mpsc::Sender<StackEvent>,
    inbound_task: JoinHandle<()>,
}

impl UdpMessageStack {
    /// Binds the configured address and starts the transaction timers.
    /// Stack events arrive on the returned receiver.
    pub async fn bind(config: &SipConfig) -> Result<(Self, mpsc::Receiver<StackEvent>), SipError> {
        let bind_addr = resolve(&config.local_address, config.local_port).await?;
        let proxy = resolve(&config.proxy_address, config.proxy_port).await?;

        let (incoming_tx, incoming_rx) = mpsc::channel(EVENT_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        let transport = Arc::new(UdpTransport::bind(bind_addr, incoming_tx).await?);
        let bound = transport.local_addr()?;

        let host = match &config.public_address {
            Some(address) => address.clone(),
            None if !bind_addr.ip().is_unspecified() => bind_addr.ip().to_string(),
            None => bound.ip().to_string(),
        };
        let endpoint = LocalEndpoint {
            host,
            port: bound.port(),
            transport: config.transport,
        };

        let timers = SipTimers {
            t1: config.t1(),
            ..SipTimers::default()
        };
        let mut layer = TransactionLayer::new(timers).with_max_forwards(config.max_forwards);
        layer.start(transport.clone(), events_tx.clone());
        let layer = Arc::new(layer);

        let inbound_task = tokio::spawn(Self::inbound_loop(
            incoming_rx,
            layer.clone(),
            transport.clone(),
            events_tx.clone(),
            config.transport.is_reliable(),
        ));

        info!(
            "SIP stack on {} advertising {} via proxy {}",
            bound,
            endpoint.sent_by(),
            proxy
        );

        Ok((
            Self {
                transport,
                layer,
                endpoint,
                proxy,
                events: events_tx,
                inbound_task,
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SipError> {
        self.transport.local_addr()
    }

    pub fn proxy(&self) -> SocketAddr {
        self.proxy
    }

    pub async fn transaction_count(&self) -> usize {
        self.layer.transaction_count().await
    }

    async fn inbound_loop(
        mut incoming: mpsc::Receiver<IncomingMessage>,
        layer: Arc<TransactionLayer>,
        transport: Arc<UdpTransport>,
        events: mpsc::Sender<StackEvent>,
        reliable: bool,
    ) {
        while let Some(IncomingMessage { message, source }) = incoming.recv().await {
            let event = match message {
                SipMessage::Request(request) => {
                    Self::on_request(&layer, &transport, request, source, reliable).await
                }
                SipMessage::Response(response) => {
                    Self::on_response(&layer, &transport, response).await
                }
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    info!("Stack event receiver dropped, stopping inbound processing");
                    return;
                }
            }
        }
    }

    async fn on_request(
        layer: &TransactionLayer,
        transport: &UdpTransport,
        request: SipRequest,
        source: SocketAddr,
        reliable: bool,
    ) -> Option<StackEvent> {
        let key = match TransactionKey::from_request(&request) {
            Ok(key) => key,
            Err(e) => {
                warn!("Dropping request from {}: {}", source, e);
                return None;
            }
        };

        if key.method == SipMethod::Ack {
            // ACK for a non-2xx belongs to the INVITE server transaction
            if layer.process_ack(&key.branch).await {
                trace!("ACK {} absorbed by its INVITE transaction", key);
                return None;
            }
            if let (Some(call_id), Some(seq)) = (request.call_id(), request.cseq()) {
                layer.process_2xx_ack(&call_id, seq).await;
            }
        } else if !layer
            .create_server_transaction(key.clone(), request.clone(), source, reliable)
            .await
        {
            if let Some((response, destination)) = layer.get_last_response(&key).await {
                debug!("Retransmitted {}, resending {}", key, response.status_code());
                if let Err(e) = transport.send_to(&response.to_bytes(), destination).await {
                    warn!("Resending response for {} failed: {}", key, e);
                }
            }
            return None;
        }

        Some(StackEvent::Request(RequestEvent {
            key,
            request,
            source: Some(source),
        }))
    }

    async fn on_response(
        layer: &TransactionLayer,
        transport: &UdpTransport,
        response: SipResponse,
    ) -> Option<StackEvent> {
        let key = match TransactionKey::from_response(&response) {
            Ok(key) if layer.has_transaction(&key).await => key,
            _ => {
                return Some(StackEvent::Response(ResponseEvent {
                    key: None,
                    response,
                }))
            }
        };

        match layer.process_response(&key, &response).await {
            Ok((disposition, destination)) => {
                if let Some(ack) = disposition.ack {
                    if let Err(e) = transport.send_to(&ack.to_bytes(), destination).await {
                        warn!("ACK for {} not sent: {}", key, e);
                    }
                }
                disposition.deliver.then(|| {
                    StackEvent::Response(ResponseEvent {
                        key: Some(key),
                        response,
                    })
                })
            }
            Err(e) => {
                warn!("Response for {} rejected: {}", key, e);
                None
            }
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, SipError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    lookup_host((host, port))
        .await
        .map_err(|e| SipError::TransportUnavailable(format!("cannot resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| SipError::TransportUnavailable(format!("no address for {}", host)))
}

#[async_trait::async_trait]
impl MessageStack for UdpMessageStack {
    fn local_endpoint(&self) -> Option<LocalEndpoint> {
        self.transport.is_running().then(|| self.endpoint.clone())
    }

    async fn send_request(&self, request: SipRequest) -> Result<TransactionKey, SipError> {
        let key = TransactionKey::from_request(&request)?;
        let data = request.to_bytes();

        if key.method == SipMethod::Ack {
            self.transport.send_to(&data, self.proxy).await?;
            return Ok(key);
        }

        self.layer
            .create_client_transaction(
                key.clone(),
                request,
                self.proxy,
                self.endpoint.transport.is_reliable(),
            )
            .await?;
        let sent = self.transport.send_to(&data, self.proxy).await;
        self.layer.release(&key).await;

        if let Err(e) = sent {
            if let Err(cleanup) = self.layer.terminate(&key).await {
                warn!("Dropping unsent transaction {} failed: {}", key, cleanup);
            }
            return Err(e);
        }
        Ok(key)
    }

    async fn send_response(&self, key: &TransactionKey, response: SipResponse) -> Result<(), SipError> {
        let data = response.to_bytes();
        let destination = self.layer.send_response(key, response).await?;
        let sent = self.transport.send_to(&data, destination).await;
        self.layer.release(key).await;
        sent
    }

    async fn terminate(&self, key: &TransactionKey) -> Result<(), SipError> {
        if let Some(transaction) = self.layer.terminate(key).await? {
            let event = StackEvent::TransactionTerminated(TerminatedEvent {
                transaction: transaction.transaction_ref(),
                call_id: transaction.request.call_id(),
            });
            // Posted from a task: the caller may be the one draining the queue
            let events = self.events.clone();
            tokio::spawn(async move {
                let _ = events.send(event).await;
            });
        }
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), SipError> {
        trace!("Keep-alive to {}", self.proxy);
        self.transport
            .send_to(&Bytes::from_static(KEEP_ALIVE), self.proxy)
            .await
    }
}

impl Drop for UdpMessageStack {
    fn drop(&mut self) {
        self.inbound_task.abort();
    }
}
