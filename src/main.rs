use sipua::config::Config;
use sipua::domain::call::{CallEvent, CallListener};
use sipua::{EndpointHandler, RegistrationState, SipCall, UaSession};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Logs every call state change
struct LogListener;

impl CallListener for LogListener {
    fn on_call_event(&self, event: &CallEvent) {
        info!("Call {}: {} -> {}", event.call_id, event.kind.name(), event.state);
    }
}

/// Answers every incoming call
struct AutoAnswer;

impl EndpointHandler for AutoAnswer {
    fn on_incoming_call(&self, call: SipCall) {
        tokio::spawn(async move {
            call.add_listener(Arc::new(LogListener)).await;
            if let Err(e) = call.accept(None).await {
                warn!("Could not answer {}: {}", call.key(), e);
            }
        });
    }

    fn on_registration_state(&self, uri: &str, state: RegistrationState) {
        info!("{} registration: {}", uri, state);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    info!("Starting sipua {}", config.sip.user_agent);

    let session = UaSession::start(config.clone()).await?;
    let user_agent = session.user_agent().clone();

    if let Some(local_uri) = &config.sip.local_uri {
        user_agent
            .register_endpoint(local_uri, Arc::new(AutoAnswer))
            .await?;

        if let Ok(target) = std::env::var("SIPUA_DIAL") {
            match user_agent
                .dial(local_uri, &target, None, Arc::new(LogListener))
                .await
            {
                Ok(call) => info!("Calling {} ({})", target, call.key()),
                Err(e) => error!("Dial to {} failed: {}", target, e),
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(local_uri) = &config.sip.local_uri {
        if let Err(e) = user_agent.unregister_endpoint(local_uri).await {
            warn!("Unregister failed: {}", e);
        }
    }
    session.shutdown().await;
    Ok(())
}
