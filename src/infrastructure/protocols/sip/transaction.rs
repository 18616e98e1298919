//! SIP wire transaction layer
//!
//! Implements client and server transactions as per RFC 3261 Section 17,
//! with the RFC 6026 "Accepted" state for INVITE 2xx handling.
//!
//! ## Transaction Types
//! - INVITE Client Transaction (ICT) - Section 17.1.1
//! - INVITE Server Transaction (IST) - Section 17.2.1
//! - Non-INVITE Client Transaction (NICT) - Section 17.1.2
//! - Non-INVITE Server Transaction (NIST) - Section 17.2.2

use super::builder::RequestBuilder;
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::stack::{StackEvent, TerminatedEvent, TimeoutEvent, TransactionKey, TransactionRef};
use super::transport::UdpTransport;
use bytes::Bytes;
use rsip::Header;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Max-Forwards when the stack is not told otherwise
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timer types for SIP transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Timer A: INVITE request retransmit interval (default: T1)
    TimerA,
    /// Timer B: INVITE transaction timeout (default: 64*T1)
    TimerB,
    /// Timer D: Wait time for response retransmits (default: >32s for UDP, 0s for TCP)
    TimerD,
    /// Timer E: Non-INVITE request retransmit (default: T1)
    TimerE,
    /// Timer F: Non-INVITE transaction timeout (default: 64*T1)
    TimerF,
    /// Timer G: INVITE response retransmit (default: T1)
    TimerG,
    /// Timer H: Wait time for ACK receipt (default: 64*T1)
    TimerH,
    /// Timer I: Wait time for ACK retransmits (default: T4 for UDP, 0s for TCP)
    TimerI,
    /// Timer J: Wait time for retransmits of non-INVITE requests (default: 64*T1 for UDP, 0s for TCP)
    TimerJ,
    /// Timer K: Wait time for response retransmits (default: T4 for UDP, 0s for TCP)
    TimerK,
    /// Timer L: Wait time for the ACK of a 2xx (default: 64*T1)
    TimerL,
    /// Timer M: Wait time for 2xx retransmits (default: 64*T1)
    TimerM,
}

impl TimerType {
    /// Get default duration for this timer
    pub fn default_duration(&self, timers: &SipTimers, is_reliable: bool) -> Duration {
        let unreliable_only = |d: Duration| if is_reliable { Duration::ZERO } else { d };

        match self {
            TimerType::TimerA | TimerType::TimerE | TimerType::TimerG => timers.t1,
            TimerType::TimerB
            | TimerType::TimerF
            | TimerType::TimerH
            | TimerType::TimerL
            | TimerType::TimerM => timers.t1 * 64,
            TimerType::TimerD => unreliable_only(Duration::from_secs(32)),
            TimerType::TimerI | TimerType::TimerK => unreliable_only(timers.t4),
            TimerType::TimerJ => unreliable_only(timers.t1 * 64),
        }
    }
}

/// INVITE Client Transaction States (RFC 3261 Section 17.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteClientState {
    /// Initial state - request sent
    Calling,
    /// Received provisional response (1xx)
    Proceeding,
    /// Received 2xx, absorbing retransmissions
    Accepted,
    /// Received non-2xx final response
    Completed,
    Terminated,
}

/// INVITE Server Transaction States (RFC 3261 Section 17.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteServerState {
    /// Request received, provisional response sent
    Proceeding,
    /// 2xx sent, waiting for the ACK of the dialog
    Accepted,
    /// Non-2xx final response sent
    Completed,
    /// ACK received
    Confirmed,
    Terminated,
}

/// Non-INVITE Client Transaction States (RFC 3261 Section 17.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteClientState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Non-INVITE Server Transaction States (RFC 3261 Section 17.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteServerState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Transaction type and state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    InviteClient(InviteClientState),
    InviteServer(InviteServerState),
    NonInviteClient(NonInviteClientState),
    NonInviteServer(NonInviteServerState),
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(InviteClientState::Terminated)
                | TransactionState::InviteServer(InviteServerState::Terminated)
                | TransactionState::NonInviteClient(NonInviteClientState::Terminated)
                | TransactionState::NonInviteServer(NonInviteServerState::Terminated)
        )
    }

    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(_) | TransactionState::NonInviteClient(_)
        )
    }

    /// Get state name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::InviteClient(s) => match s {
                InviteClientState::Calling => "ICT-Calling",
                InviteClientState::Proceeding => "ICT-Proceeding",
                InviteClientState::Accepted => "ICT-Accepted",
                InviteClientState::Completed => "ICT-Completed",
                InviteClientState::Terminated => "ICT-Terminated",
            },
            TransactionState::InviteServer(s) => match s {
                InviteServerState::Proceeding => "IST-Proceeding",
                InviteServerState::Accepted => "IST-Accepted",
                InviteServerState::Completed => "IST-Completed",
                InviteServerState::Confirmed => "IST-Confirmed",
                InviteServerState::Terminated => "IST-Terminated",
            },
            TransactionState::NonInviteClient(s) => match s {
                NonInviteClientState::Trying => "NICT-Trying",
                NonInviteClientState::Proceeding => "NICT-Proceeding",
                NonInviteClientState::Completed => "NICT-Completed",
                NonInviteClientState::Terminated => "NICT-Terminated",
            },
            TransactionState::NonInviteServer(s) => match s {
                NonInviteServerState::Trying => "NIST-Trying",
                NonInviteServerState::Proceeding => "NIST-Proceeding",
                NonInviteServerState::Completed => "NIST-Completed",
                NonInviteServerState::Terminated => "NIST-Terminated",
            },
        }
    }
}

/// Active timer in a transaction
#[derive(Debug, Clone)]
pub struct ActiveTimer {
    pub timer_type: TimerType,
    pub expires_at: Instant,
    pub interval: Duration,
}

/// What the layer should do with a received response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDisposition {
    /// Hand the response to the user agent
    pub deliver: bool,
    /// ACK the transaction generated for a non-2xx final response
    pub ack: Option<SipRequest>,
}

/// SIP wire transaction
#[derive(Debug, Clone)]
pub struct Transaction {
    pub key: TransactionKey,
    pub state: TransactionState,
    /// Original request
    pub request: SipRequest,
    /// Where requests (client) or responses (server) are sent
    pub destination: SocketAddr,
    /// Is transport reliable (TCP vs UDP)
    pub is_reliable: bool,
    pub timers: Vec<ActiveTimer>,
    /// Last response, sent or received (for retransmission)
    pub last_response: Option<SipResponse>,
    /// ACK generated for a non-2xx final response
    pub ack: Option<SipRequest>,
    /// ACK for a 2xx seen (IST Accepted)
    pub acknowledged: bool,
    /// Set while a send is in flight; terminate is refused meanwhile
    pub in_use: bool,
    pub created_at: Instant,
    pub sip_timers: SipTimers,
    /// Max-Forwards of requests the transaction builds itself (non-2xx ACK)
    pub max_forwards: u32,
}

impl Transaction {
    fn new(
        key: TransactionKey,
        state: TransactionState,
        request: SipRequest,
        destination: SocketAddr,
        is_reliable: bool,
        sip_timers: SipTimers,
    ) -> Self {
        Self {
            key,
            state,
            request,
            destination,
            is_reliable,
            timers: Vec::new(),
            last_response: None,
            ack: None,
            acknowledged: false,
            in_use: false,
            created_at: Instant::now(),
            sip_timers,
            max_forwards: DEFAULT_MAX_FORWARDS,
        }
    }

    /// Create a client transaction, INVITE or non-INVITE from the key's method
    pub fn new_client(
        key: TransactionKey,
        request: SipRequest,
        destination: SocketAddr,
        is_reliable: bool,
        sip_timers: SipTimers,
    ) -> Self {
        if key.method == SipMethod::Invite {
            let state = TransactionState::InviteClient(InviteClientState::Calling);
            let mut txn = Self::new(key, state, request, destination, is_reliable, sip_timers);
            // Start Timer A (request retransmit) and Timer B (timeout)
            if !is_reliable {
                txn.start_timer(TimerType::TimerA);
            }
            txn.start_timer(TimerType::TimerB);
            txn
        } else {
            let state = TransactionState::NonInviteClient(NonInviteClientState::Trying);
            let mut txn = Self::new(key, state, request, destination, is_reliable, sip_timers);
            // Start Timer E (request retransmit) and Timer F (timeout)
            if !is_reliable {
                txn.start_timer(TimerType::TimerE);
            }
            txn.start_timer(TimerType::TimerF);
            txn
        }
    }

    /// Create a server transaction, INVITE or non-INVITE from the key's method
    pub fn new_server(
        key: TransactionKey,
        request: SipRequest,
        source: SocketAddr,
        is_reliable: bool,
        sip_timers: SipTimers,
    ) -> Self {
        let state = if key.method == SipMethod::Invite {
            TransactionState::InviteServer(InviteServerState::Proceeding)
        } else {
            TransactionState::NonInviteServer(NonInviteServerState::Trying)
        };
        Self::new(key, state, request, source, is_reliable, sip_timers)
    }

    fn start_timer(&mut self, timer_type: TimerType) {
        let duration = timer_type.default_duration(&self.sip_timers, self.is_reliable);
        if duration.as_millis() > 0 {
            self.timers.push(ActiveTimer {
                timer_type,
                expires_at: Instant::now() + duration,
                interval: duration,
            });
            debug!(
                "Started {:?} for transaction {} (expires in {:?})",
                timer_type, self.key, duration
            );
        } else if matches!(
            timer_type,
            TimerType::TimerD | TimerType::TimerI | TimerType::TimerJ | TimerType::TimerK
        ) {
            // Zero wait on reliable transports
            self.state = self.terminated_state();
        }
    }

    fn stop_timer(&mut self, timer_type: TimerType) {
        self.timers.retain(|t| t.timer_type != timer_type);
    }

    fn stop_all_timers(&mut self) {
        self.timers.clear();
    }

    fn terminated_state(&self) -> TransactionState {
        match self.state {
            TransactionState::InviteClient(_) => {
                TransactionState::InviteClient(InviteClientState::Terminated)
            }
            TransactionState::InviteServer(_) => {
                TransactionState::InviteServer(InviteServerState::Terminated)
            }
            TransactionState::NonInviteClient(_) => {
                TransactionState::NonInviteClient(NonInviteClientState::Terminated)
            }
            TransactionState::NonInviteServer(_) => {
                TransactionState::NonInviteServer(NonInviteServerState::Terminated)
            }
        }
    }

    fn terminate(&mut self) {
        self.state = self.terminated_state();
        self.stop_all_timers();
    }

    /// Process received response (for client transactions)
    pub fn process_response(
        &mut self,
        response: &SipResponse,
    ) -> Result<ResponseDisposition, SipError> {
        let status = response.status_code();
        let deliver = |ack| ResponseDisposition { deliver: true, ack };
        let absorb = |ack| ResponseDisposition {
            deliver: false,
            ack,
        };

        match self.state {
            TransactionState::InviteClient(state) => match state {
                InviteClientState::Calling | InviteClientState::Proceeding => {
                    self.stop_timer(TimerType::TimerA);
                    if status < 200 {
                        self.state = TransactionState::InviteClient(InviteClientState::Proceeding);
                        Ok(deliver(None))
                    } else if status < 300 {
                        self.state = TransactionState::InviteClient(InviteClientState::Accepted);
                        self.stop_timer(TimerType::TimerB);
                        self.start_timer(TimerType::TimerM);
                        self.last_response = Some(response.clone());
                        Ok(deliver(None))
                    } else {
                        self.state = TransactionState::InviteClient(InviteClientState::Completed);
                        self.stop_timer(TimerType::TimerB);
                        let ack = build_non2xx_ack(&self.request, response, self.max_forwards)?;
                        self.ack = Some(ack.clone());
                        self.last_response = Some(response.clone());
                        self.start_timer(TimerType::TimerD);
                        Ok(deliver(Some(ack)))
                    }
                }
                // 2xx retransmissions go up so the dialog can re-ACK them
                InviteClientState::Accepted if (200..300).contains(&status) => Ok(deliver(None)),
                InviteClientState::Accepted => Ok(absorb(None)),
                InviteClientState::Completed => Ok(absorb(self.ack.clone())),
                InviteClientState::Terminated => Err(SipError::TransactionError(format!(
                    "transaction {} already terminated",
                    self.key
                ))),
            },

            TransactionState::NonInviteClient(state) => match state {
                NonInviteClientState::Trying | NonInviteClientState::Proceeding => {
                    if status < 200 {
                        self.state =
                            TransactionState::NonInviteClient(NonInviteClientState::Proceeding);
                    } else {
                        self.state =
                            TransactionState::NonInviteClient(NonInviteClientState::Completed);
                        self.stop_timer(TimerType::TimerE);
                        self.stop_timer(TimerType::TimerF);
                        self.last_response = Some(response.clone());
                        self.start_timer(TimerType::TimerK);
                    }
                    Ok(deliver(None))
                }
                NonInviteClientState::Completed => Ok(absorb(None)),
                NonInviteClientState::Terminated => Err(SipError::TransactionError(format!(
                    "transaction {} already terminated",
                    self.key
                ))),
            },

            _ => Err(SipError::TransactionError(format!(
                "{} is not a client transaction",
                self.key
            ))),
        }
    }

    /// Process an ACK for a non-2xx final response (IST Completed)
    pub fn process_ack(&mut self) -> Result<(), SipError> {
        match self.state {
            TransactionState::InviteServer(InviteServerState::Completed) => {
                self.state = TransactionState::InviteServer(InviteServerState::Confirmed);
                self.stop_timer(TimerType::TimerG);
                self.stop_timer(TimerType::TimerH);
                self.start_timer(TimerType::TimerI);
                Ok(())
            }
            // Retransmitted ACKs
            TransactionState::InviteServer(InviteServerState::Confirmed) => Ok(()),
            _ => Err(SipError::TransactionError(format!(
                "invalid state {} for ACK",
                self.state.name()
            ))),
        }
    }

    /// Marks the 2xx as acknowledged (IST Accepted)
    pub fn process_2xx_ack(&mut self) {
        if self.state == TransactionState::InviteServer(InviteServerState::Accepted) {
            self.acknowledged = true;
            self.stop_timer(TimerType::TimerG);
        }
    }

    /// Record a response sent by a server transaction
    pub fn send_response(&mut self, response: SipResponse) -> Result<(), SipError> {
        let status = response.status_code();

        match self.state {
            TransactionState::InviteServer(state) => match state {
                InviteServerState::Proceeding => {
                    if (200..300).contains(&status) {
                        self.state = TransactionState::InviteServer(InviteServerState::Accepted);
                        if !self.is_reliable {
                            self.start_timer(TimerType::TimerG);
                        }
                        self.start_timer(TimerType::TimerL);
                    } else if status >= 300 {
                        self.state = TransactionState::InviteServer(InviteServerState::Completed);
                        if !self.is_reliable {
                            self.start_timer(TimerType::TimerG);
                        }
                        self.start_timer(TimerType::TimerH);
                    }
                }
                // The user agent may repeat its 2xx
                InviteServerState::Accepted if (200..300).contains(&status) => {}
                _ => {
                    return Err(SipError::TransactionError(format!(
                        "invalid state {} for sending {}",
                        self.state.name(),
                        status
                    )))
                }
            },

            TransactionState::NonInviteServer(state) => match state {
                NonInviteServerState::Trying | NonInviteServerState::Proceeding => {
                    if status < 200 {
                        self.state =
                            TransactionState::NonInviteServer(NonInviteServerState::Proceeding);
                    } else {
                        self.state =
                            TransactionState::NonInviteServer(NonInviteServerState::Completed);
                        self.start_timer(TimerType::TimerJ);
                    }
                }
                _ => {
                    return Err(SipError::TransactionError(format!(
                        "invalid state {} for sending {}",
                        self.state.name(),
                        status
                    )))
                }
            },

            _ => {
                return Err(SipError::TransactionError(format!(
                    "{} is not a server transaction",
                    self.key
                )))
            }
        }

        self.last_response = Some(response);
        Ok(())
    }

    fn backoff(&mut self, timer_type: TimerType) {
        let t2 = self.sip_timers.t2;
        if let Some(timer) = self.timers.iter_mut().find(|t| t.timer_type == timer_type) {
            timer.interval = std::cmp::min(timer.interval * 2, t2);
            timer.expires_at = Instant::now() + timer.interval;
        }
    }

    /// Handle timer expiration
    pub fn handle_timer_fired(&mut self, timer_type: TimerType) -> TransactionTimerAction {
        debug!(
            "Timer {:?} fired for transaction {} in state {}",
            timer_type,
            self.key,
            self.state.name()
        );

        match timer_type {
            TimerType::TimerA => {
                if self.state == TransactionState::InviteClient(InviteClientState::Calling) {
                    self.backoff(TimerType::TimerA);
                    TransactionTimerAction::RetransmitRequest
                } else {
                    self.stop_timer(TimerType::TimerA);
                    TransactionTimerAction::None
                }
            }

            TimerType::TimerE => {
                if matches!(
                    self.state,
                    TransactionState::NonInviteClient(
                        NonInviteClientState::Trying | NonInviteClientState::Proceeding
                    )
                ) {
                    self.backoff(TimerType::TimerE);
                    TransactionTimerAction::RetransmitRequest
                } else {
                    self.stop_timer(TimerType::TimerE);
                    TransactionTimerAction::None
                }
            }

            TimerType::TimerG => {
                if matches!(
                    self.state,
                    TransactionState::InviteServer(
                        InviteServerState::Completed | InviteServerState::Accepted
                    )
                ) {
                    self.backoff(TimerType::TimerG);
                    TransactionTimerAction::RetransmitResponse
                } else {
                    self.stop_timer(TimerType::TimerG);
                    TransactionTimerAction::None
                }
            }

            // Transaction timeouts
            TimerType::TimerB | TimerType::TimerF | TimerType::TimerH => {
                self.terminate();
                TransactionTimerAction::Timeout
            }

            TimerType::TimerL => {
                let acknowledged = self.acknowledged;
                self.terminate();
                if acknowledged {
                    TransactionTimerAction::Terminate
                } else {
                    TransactionTimerAction::Timeout
                }
            }

            TimerType::TimerD
            | TimerType::TimerI
            | TimerType::TimerJ
            | TimerType::TimerK
            | TimerType::TimerM => {
                self.terminate();
                TransactionTimerAction::Terminate
            }
        }
    }

    /// Check for expired timers and return actions
    pub fn check_timers(&mut self) -> Vec<(TimerType, TransactionTimerAction)> {
        let now = Instant::now();

        let expired: Vec<TimerType> = self
            .timers
            .iter()
            .filter(|t| t.expires_at <= now)
            .map(|t| t.timer_type)
            .collect();

        let mut actions = Vec::new();
        for timer_type in expired {
            if self.state.is_terminated() {
                break;
            }
            let action = self.handle_timer_fired(timer_type);
            if action != TransactionTimerAction::None {
                actions.push((timer_type, action));
            }
        }

        actions
    }

    pub fn transaction_ref(&self) -> TransactionRef {
        if self.state.is_client() {
            TransactionRef::Client(self.key.clone())
        } else {
            TransactionRef::Server(self.key.clone())
        }
    }
}

/// ACK for a non-2xx final response (RFC 3261 Section 17.1.1.3):
/// same branch, Call-ID, From, Request-URI and Route as the INVITE,
/// To from the response, CSeq number of the INVITE.
pub fn build_non2xx_ack(
    invite: &SipRequest,
    response: &SipResponse,
    max_forwards: u32,
) -> Result<SipRequest, SipError> {
    let seq = invite
        .cseq()
        .ok_or_else(|| SipError::InvalidMessage("INVITE without CSeq".to_string()))?;

    let mut builder = RequestBuilder::new(SipMethod::Ack, invite.uri().clone());
    for header in invite.headers().iter() {
        match header {
            Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::Route(_) => {
                builder = builder.header(header.clone());
            }
            _ => {}
        }
    }
    if let Some(to) = response.headers().iter().find(|h| matches!(h, Header::To(_))) {
        builder = builder.header(to.clone());
    }

    Ok(builder.cseq(seq, SipMethod::Ack).max_forwards(max_forwards).build())
}

/// Actions that should be taken when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionTimerAction {
    None,
    RetransmitRequest,
    RetransmitResponse,
    /// Transaction timed out
    Timeout,
    /// Terminate the transaction
    Terminate,
}

/// Transaction layer manager
/// Manages all active transactions and handles timer processing
pub struct TransactionLayer {
    transactions: Arc<RwLock<HashMap<TransactionKey, Transaction>>>,
    sip_timers: SipTimers,
    max_forwards: u32,
    timer_task: Option<JoinHandle<()>>,
}

impl TransactionLayer {
    pub fn new(sip_timers: SipTimers) -> Self {
        Self {
            transactions: Arc::new(RwLock::new(HashMap::new())),
            sip_timers,
            max_forwards: DEFAULT_MAX_FORWARDS,
            timer_task: None,
        }
    }

    pub fn with_max_forwards(mut self, hops: u32) -> Self {
        self.max_forwards = hops;
        self
    }

    /// Start timer processing: retransmissions go out on `transport`,
    /// timeouts and terminations are reported on `events`
    pub fn start(&mut self, transport: Arc<UdpTransport>, events: mpsc::Sender<StackEvent>) {
        let transactions = self.transactions.clone();

        let handle = tokio::spawn(async move {
            info!("Transaction layer timer task started");

            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;

                let mut outgoing: Vec<(Bytes, SocketAddr)> = Vec::new();
                let mut reports: Vec<StackEvent> = Vec::new();

                {
                    let mut txns = transactions.write().await;

                    for txn in txns.values_mut() {
                        for (timer_type, action) in txn.check_timers() {
                            match action {
                                TransactionTimerAction::RetransmitRequest => {
                                    debug!("Transaction {} {:?}: retransmit request", txn.key, timer_type);
                                    outgoing.push((txn.request.to_bytes(), txn.destination));
                                }
                                TransactionTimerAction::RetransmitResponse => {
                                    if let Some(response) = &txn.last_response {
                                        debug!("Transaction {} {:?}: retransmit response", txn.key, timer_type);
                                        outgoing.push((response.to_bytes(), txn.destination));
                                    }
                                }
                                TransactionTimerAction::Timeout => {
                                    warn!("Transaction {} {:?}: timeout", txn.key, timer_type);
                                    reports.push(StackEvent::Timeout(TimeoutEvent {
                                        transaction: txn.transaction_ref(),
                                        call_id: txn.request.call_id(),
                                    }));
                                }
                                TransactionTimerAction::Terminate | TransactionTimerAction::None => {}
                            }
                        }
                    }

                    // Cleanup terminated transactions
                    let terminated: Vec<TransactionKey> = txns
                        .iter()
                        .filter(|(_, txn)| txn.state.is_terminated() && !txn.in_use)
                        .map(|(key, _)| key.clone())
                        .collect();

                    for key in terminated {
                        if let Some(txn) = txns.remove(&key) {
                            debug!("Removing terminated transaction {}", key);
                            reports.push(StackEvent::TransactionTerminated(TerminatedEvent {
                                transaction: txn.transaction_ref(),
                                call_id: txn.request.call_id(),
                            }));
                        }
                    }
                }

                for (data, destination) in outgoing {
                    if let Err(e) = transport.send_to(&data, destination).await {
                        warn!("Retransmission to {} failed: {}", destination, e);
                    }
                }

                for report in reports {
                    if events.send(report).await.is_err() {
                        info!("Event receiver dropped, stopping transaction timers");
                        return;
                    }
                }
            }
        });

        self.timer_task = Some(handle);
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.timer_task.take() {
            handle.abort();
            info!("Transaction layer timer task stopped");
        }
    }

    /// Create a new client transaction for an outgoing request.
    /// The transaction starts marked in use; call `release` after sending.
    pub async fn create_client_transaction(
        &self,
        key: TransactionKey,
        request: SipRequest,
        destination: SocketAddr,
        is_reliable: bool,
    ) -> Result<(), SipError> {
        let mut txns = self.transactions.write().await;
        if txns.contains_key(&key) {
            return Err(SipError::TransactionError(format!(
                "transaction {} already exists",
                key
            )));
        }

        let mut transaction =
            Transaction::new_client(key.clone(), request, destination, is_reliable, self.sip_timers);
        transaction.in_use = true;
        transaction.max_forwards = self.max_forwards;
        info!("Created client transaction {} to {}", key, destination);
        txns.insert(key, transaction);
        Ok(())
    }

    /// Create a new server transaction for an incoming request.
    /// Returns `false` when the request is a retransmission of a known one.
    pub async fn create_server_transaction(
        &self,
        key: TransactionKey,
        request: SipRequest,
        source: SocketAddr,
        is_reliable: bool,
    ) -> bool {
        let mut txns = self.transactions.write().await;
        if txns.contains_key(&key) {
            return false;
        }

        info!("Created server transaction {} from {}", key, source);
        let transaction =
            Transaction::new_server(key.clone(), request, source, is_reliable, self.sip_timers);
        txns.insert(key, transaction);
        true
    }

    /// Process an incoming response for the client transaction `key`
    pub async fn process_response(
        &self,
        key: &TransactionKey,
        response: &SipResponse,
    ) -> Result<(ResponseDisposition, SocketAddr), SipError> {
        let mut txns = self.transactions.write().await;
        let txn = txns.get_mut(key).ok_or_else(|| {
            SipError::TransactionError(format!("no transaction found for {}", key))
        })?;

        let old_state = txn.state;
        let disposition = txn.process_response(response)?;
        debug!(
            "Transaction {} processed response {}: {} -> {}",
            key,
            response.status_code(),
            old_state.name(),
            txn.state.name()
        );
        Ok((disposition, txn.destination))
    }

    /// ACK with the branch of an INVITE server transaction. Returns `false`
    /// when there is no such transaction (ACK for a 2xx).
    pub async fn process_ack(&self, branch: &str) -> bool {
        let key = TransactionKey::new(branch, SipMethod::Invite);
        let mut txns = self.transactions.write().await;
        match txns.get_mut(&key) {
            Some(txn) => {
                if let Err(e) = txn.process_ack() {
                    debug!("ACK for {} ignored: {}", key, e);
                }
                true
            }
            None => false,
        }
    }

    /// Match an ACK for a 2xx to the accepted INVITE server transaction
    pub async fn process_2xx_ack(&self, call_id: &str, seq: u32) {
        let mut txns = self.transactions.write().await;
        for txn in txns.values_mut() {
            if txn.state == TransactionState::InviteServer(InviteServerState::Accepted)
                && txn.request.call_id().as_deref() == Some(call_id)
                && txn.request.cseq() == Some(seq)
            {
                txn.process_2xx_ack();
            }
        }
    }

    /// Record a response from a server transaction; returns where to send it
    pub async fn send_response(
        &self,
        key: &TransactionKey,
        response: SipResponse,
    ) -> Result<SocketAddr, SipError> {
        let mut txns = self.transactions.write().await;
        let txn = txns
            .get_mut(key)
            .ok_or_else(|| SipError::TransactionError(format!("transaction not found: {}", key)))?;

        let old_state = txn.state;
        let status = response.status_code();
        txn.send_response(response)?;
        debug!(
            "Transaction {} sent response {}: {} -> {}",
            key,
            status,
            old_state.name(),
            txn.state.name()
        );
        txn.in_use = true;
        Ok(txn.destination)
    }

    /// Clear the in-use mark set while sending
    pub async fn release(&self, key: &TransactionKey) {
        if let Some(txn) = self.transactions.write().await.get_mut(key) {
            txn.in_use = false;
        }
    }

    /// Remove a transaction. Refused while a send is in flight;
    /// `Ok(None)` when the transaction is already gone.
    pub async fn terminate(&self, key: &TransactionKey) -> Result<Option<Transaction>, SipError> {
        let mut txns = self.transactions.write().await;
        match txns.get(key).map(|txn| txn.in_use) {
            Some(true) => Err(SipError::TransactionInUse(key.to_string())),
            Some(false) => {
                let mut txn = txns.remove(key);
                if let Some(txn) = txn.as_mut() {
                    txn.terminate();
                }
                Ok(txn)
            }
            None => Ok(None),
        }
    }

    /// Last response of a transaction, for answering retransmitted requests
    pub async fn get_last_response(&self, key: &TransactionKey) -> Option<(SipResponse, SocketAddr)> {
        let txns = self.transactions.read().await;
        txns.get(key)
            .and_then(|txn| txn.last_response.clone().map(|r| (r, txn.destination)))
    }

    pub async fn has_transaction(&self, key: &TransactionKey) -> bool {
        self.transactions.read().await.contains_key(key)
    }

    pub async fn transaction_count(&self) -> usize {
        self.transactions.read().await.len()
    }
}

impl Drop for TransactionLayer {
    fn drop(&mut self) {
        self.stop();
    }
}
