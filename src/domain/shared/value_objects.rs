//! Shared value objects

use super::error::UaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Call identifier, local to this process (not the SIP Call-ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIP address reduced to scheme, user, host and port.
///
/// Parameters, headers and display names are dropped, so two spellings of the
/// same address compare equal. Used as the key of the local-address registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    scheme: String,
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn new(user: Option<String>, host: String, port: Option<u16>) -> Self {
        Self {
            scheme: "sip".to_string(),
            user,
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    pub fn parse(uri: &str) -> Result<Self, UaError> {
        let trimmed = uri.trim();
        // Name-addr form: "Alice <sip:alice@example.com>;tag=1"
        let addr = match (trimmed.find('<'), trimmed.find('>')) {
            (Some(start), Some(end)) if start < end => &trimmed[start + 1..end],
            _ => trimmed,
        };

        let (scheme, rest) = addr
            .split_once(':')
            .ok_or_else(|| UaError::ProtocolBuild(format!("missing scheme in '{}'", uri)))?;
        let scheme = scheme.to_ascii_lowercase();
        if scheme != "sip" && scheme != "sips" {
            return Err(UaError::ProtocolBuild(format!(
                "unsupported scheme '{}' in '{}'",
                scheme, uri
            )));
        }

        let rest = rest.split([';', '?']).next().unwrap_or_default();
        let (user, host_port) = match rest.rsplit_once('@') {
            Some((user_info, host_port)) => {
                // Drop an embedded password
                let user = user_info.split(':').next().unwrap_or_default();
                (Some(user.to_string()), host_port)
            }
            None => (None, rest),
        };

        let (host, port) = split_host_port(host_port)
            .ok_or_else(|| UaError::ProtocolBuild(format!("invalid host in '{}'", uri)))?;

        Ok(Self {
            scheme,
            user: user.filter(|u| !u.is_empty()),
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Same address with the port removed.
    pub fn without_port(&self) -> Self {
        Self {
            port: None,
            ..self.clone()
        }
    }
}

fn split_host_port(host_port: &str) -> Option<(&str, Option<u16>)> {
    if host_port.is_empty() {
        return None;
    }

    // IPv6 reference: "[::1]:5060"
    if let Some(stripped) = host_port.strip_prefix('[') {
        let (host, tail) = stripped.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port.parse().ok()?),
            None => None,
        };
        return Some((host, port));
    }

    match host_port.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((host_port, None)),
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}
