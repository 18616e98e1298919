//! SIP dialogs (RFC 3261 Section 12)

use super::builder::RequestBuilder;
use super::message::{SipMethod, SipRequest, SipResponse};
use super::stack::LocalEndpoint;
use crate::domain::shared::error::UaError;
use crate::domain::shared::result::Result;
use rsip::Uri;
use std::fmt;
use tracing::debug;

/// Dialog identity: Call-ID plus both tags, seen from the local side
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={};remote={}", self.call_id, self.local_tag, self.remote_tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Dialog {
    id: DialogId,
    state: DialogState,
    /// Last CSeq used for a locally originated request
    local_seq: u32,
    /// Last CSeq seen on a remote request
    remote_seq: Option<u32>,
    local_uri: String,
    remote_uri: String,
    remote_target: Uri,
    route_set: Vec<String>,
    max_forwards: u32,
}

fn missing(what: &str) -> UaError {
    UaError::ProtocolBuild(format!("dialog-forming message without {}", what))
}

impl Dialog {
    /// Caller side: our INVITE and a response that carries a To tag
    pub fn from_uac(invite: &SipRequest, response: &SipResponse, max_forwards: u32) -> Result<Self> {
        let id = DialogId {
            call_id: invite.call_id().ok_or_else(|| missing("Call-ID"))?,
            local_tag: invite.from_tag().ok_or_else(|| missing("From tag"))?,
            remote_tag: response.to_tag().ok_or_else(|| missing("To tag"))?,
        };

        // Record-Route arrives in proxy order; the caller walks it backwards
        let mut route_set = response.record_routes();
        route_set.reverse();

        let dialog = Self {
            state: if response.is_success() {
                DialogState::Confirmed
            } else {
                DialogState::Early
            },
            local_seq: invite.cseq().ok_or_else(|| missing("CSeq"))?,
            remote_seq: None,
            local_uri: invite.from_uri().ok_or_else(|| missing("From"))?.to_string(),
            remote_uri: invite.to_uri().ok_or_else(|| missing("To"))?.to_string(),
            remote_target: response
                .contact_uri()
                .unwrap_or_else(|| invite.uri().clone()),
            route_set,
            max_forwards,
            id,
        };
        debug!("Created UAC dialog {} ({:?})", dialog.id, dialog.state);
        Ok(dialog)
    }

    /// Callee side: the INVITE received and the tag we answer with
    pub fn from_uas(invite: &SipRequest, local_tag: &str, max_forwards: u32) -> Result<Self> {
        let id = DialogId {
            call_id: invite.call_id().ok_or_else(|| missing("Call-ID"))?,
            local_tag: local_tag.to_string(),
            remote_tag: invite.from_tag().ok_or_else(|| missing("From tag"))?,
        };

        let dialog = Self {
            state: DialogState::Early,
            local_seq: 0,
            remote_seq: invite.cseq(),
            local_uri: invite.to_uri().ok_or_else(|| missing("To"))?.to_string(),
            remote_uri: invite.from_uri().ok_or_else(|| missing("From"))?.to_string(),
            remote_target: invite.contact_uri().ok_or_else(|| missing("Contact"))?,
            route_set: invite.record_routes(),
            max_forwards,
            id,
        };
        debug!("Created UAS dialog {}", dialog.id);
        Ok(dialog)
    }

    /// 2xx to the dialog-forming request; refreshes target and route set on the caller side
    pub fn confirm(&mut self, response: Option<&SipResponse>) {
        if self.state == DialogState::Terminated {
            return;
        }
        if let Some(response) = response {
            if let Some(target) = response.contact_uri() {
                self.remote_target = target;
            }
            let mut route_set = response.record_routes();
            route_set.reverse();
            self.route_set = route_set;
        }
        self.state = DialogState::Confirmed;
        debug!("Dialog {} confirmed", self.id);
    }

    pub fn terminate(&mut self) {
        if self.state != DialogState::Terminated {
            self.state = DialogState::Terminated;
            debug!("Dialog {} terminated", self.id);
        }
    }

    /// Can carry in-dialog requests
    pub fn is_usable(&self) -> bool {
        self.state != DialogState::Terminated && !self.id.remote_tag.is_empty()
    }

    /// Next CSeq for a locally originated request; strictly increasing
    pub fn next_local_seq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    /// Records the CSeq of a remote request. `false` when it went backwards.
    pub fn accept_remote_seq(&mut self, seq: u32) -> bool {
        match self.remote_seq {
            Some(last) if seq < last => false,
            _ => {
                self.remote_seq = Some(seq);
                true
            }
        }
    }

    /// Builds an in-dialog request. ACK and CANCEL reuse a CSeq number, so
    /// the caller picks `seq` (usually from `next_local_seq`).
    pub fn create_request(
        &self,
        method: SipMethod,
        seq: u32,
        branch: &str,
        endpoint: &LocalEndpoint,
    ) -> Result<SipRequest> {
        if !self.is_usable() {
            return Err(UaError::InvalidStateTransition(format!(
                "dialog {} cannot carry {}",
                self.id, method
            )));
        }

        let mut builder = RequestBuilder::new(method, self.remote_target.clone())
            .via(endpoint.transport.as_str(), &endpoint.sent_by(), branch)
            .max_forwards(self.max_forwards)
            .from(&self.local_uri, &self.id.local_tag)
            .to(&self.remote_uri, Some(&self.id.remote_tag))
            .call_id(&self.id.call_id)
            .cseq(seq, method);

        for route in &self.route_set {
            builder = builder.route(route);
        }

        Ok(builder.build())
    }

    // Getters
    pub fn id(&self) -> &DialogId {
        &self.id
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    pub fn remote_target(&self) -> &Uri {
        &self.remote_target
    }

    pub fn route_set(&self) -> &[String] {
        &self.route_set
    }
}
