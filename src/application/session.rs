//! A running user agent: UDP stack, dispatcher and keep-alive wired together

use super::user_agent::UserAgent;
use crate::config::Config;
use crate::domain::shared::result::Result;
use crate::infrastructure::protocols::sip::keep_alive::NatKeepAlive;
use crate::infrastructure::protocols::sip::stack::{LocalEndpoint, MessageStack};
use crate::infrastructure::protocols::sip::udp_stack::UdpMessageStack;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct UaSession {
    user_agent: UserAgent,
    stack: Arc<UdpMessageStack>,
    keep_alive: Option<NatKeepAlive>,
    dispatcher: JoinHandle<()>,
}

impl UaSession {
    /// Binds the transport and starts dispatching
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;

        let (stack, events) = UdpMessageStack::bind(&config.sip).await?;
        let stack = Arc::new(stack);
        let user_agent = UserAgent::new(stack.clone(), config.sip.clone());

        let dispatcher = {
            let user_agent = user_agent.clone();
            tokio::spawn(async move { user_agent.run(events).await })
        };

        let keep_alive = config.keep_alive.enabled.then(|| {
            let mut keep_alive = NatKeepAlive::new(&config.keep_alive);
            keep_alive.start(stack.clone());
            keep_alive
        });

        info!("User agent session started");
        Ok(Self {
            user_agent,
            stack,
            keep_alive,
            dispatcher,
        })
    }

    pub fn user_agent(&self) -> &UserAgent {
        &self.user_agent
    }

    pub fn local_endpoint(&self) -> Option<LocalEndpoint> {
        self.stack.local_endpoint()
    }

    pub async fn shutdown(mut self) {
        if let Some(keep_alive) = self.keep_alive.as_mut() {
            keep_alive.stop().await;
        }
        self.dispatcher.abort();
        info!("User agent session stopped");
    }
}
