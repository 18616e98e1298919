//! Configuration management

use crate::domain::shared::error::UaError;
use crate::infrastructure::protocols::sip::transport::TransportProtocol;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Prefix of environment overrides, e.g. `SIPUA_SIP__LOCAL_PORT=5080`
pub const ENV_PREFIX: &str = "SIPUA";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub keep_alive: KeepAliveConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    /// Address the socket binds to
    pub local_address: String,
    pub local_port: u16,
    /// Address advertised in Via/Contact; derived from the socket when unset
    pub public_address: Option<String>,
    /// Outbound proxy every request is sent to
    pub proxy_address: String,
    pub proxy_port: u16,
    pub transport: TransportProtocol,
    pub max_forwards: u32,
    /// Registration expiry in seconds
    pub expires: u32,
    pub user_agent: String,
    /// Registrar Request-URI; REGISTER is only sent when set
    pub registrar: Option<String>,
    /// Address of record served by the binary
    pub local_uri: Option<String>,
    /// Dispatcher workers; events of one call always share a worker
    pub dispatch_workers: usize,
    /// RFC 3261 T1 in milliseconds
    pub t1_ms: u64,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            local_address: "0.0.0.0".to_string(),
            local_port: 5070,
            public_address: None,
            proxy_address: "127.0.0.1".to_string(),
            proxy_port: 5060,
            transport: TransportProtocol::Udp,
            max_forwards: 70,
            expires: 3600,
            user_agent: format!("sipua/{}", env!("CARGO_PKG_VERSION")),
            registrar: None,
            local_uri: None,
            dispatch_workers: 4,
            t1_ms: 500,
        }
    }
}

impl SipConfig {
    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub period_ms: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 5000,
        }
    }
}

impl KeepAliveConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Config {
    /// Defaults, then the optional file, then `SIPUA_*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, UaError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), UaError> {
        if self.sip.transport != TransportProtocol::Udp {
            return Err(UaError::Config(format!(
                "transport {} is not supported",
                self.sip.transport.as_str()
            )));
        }
        if self.sip.max_forwards == 0 {
            return Err(UaError::Config("max_forwards must be positive".to_string()));
        }
        if self.sip.dispatch_workers == 0 {
            return Err(UaError::Config(
                "dispatch_workers must be positive".to_string(),
            ));
        }
        if self.keep_alive.enabled && self.keep_alive.period_ms == 0 {
            return Err(UaError::Config(
                "keep_alive.period_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
