//! Periodic CRLF keep-alives that hold the NAT binding towards the proxy open

use super::stack::MessageStack;
use crate::config::KeepAliveConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct NatKeepAlive {
    period: Duration,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl NatKeepAlive {
    pub fn new(config: &KeepAliveConfig) -> Self {
        Self {
            period: config.period(),
            token: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn start(&mut self, stack: Arc<dyn MessageStack>) {
        if self.is_running() {
            return;
        }
        let token = self.token.clone();
        let period = self.period;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match stack.send_heartbeat().await {
                            Ok(()) => debug!("Keep-alive sent"),
                            Err(e) => warn!("Keep-alive failed: {}", e),
                        }
                    }
                }
            }
        }));
        info!("NAT keep-alive every {:?}", self.period);
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            info!("NAT keep-alive stopped");
        }
    }
}

impl Drop for NatKeepAlive {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipError;
    use crate::infrastructure::protocols::sip::stack::MockMessageStack;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(period_ms: u64) -> KeepAliveConfig {
        KeepAliveConfig {
            enabled: true,
            period_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_heartbeat_each_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let mut stack = MockMessageStack::new();
        stack.expect_send_heartbeat().returning(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut keep_alive = NatKeepAlive::new(&config(1000));
        keep_alive.start(Arc::new(stack));
        assert!(keep_alive.is_running());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        keep_alive.stop().await;
        assert!(!keep_alive.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_going_after_send_failure() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let mut stack = MockMessageStack::new();
        stack.expect_send_heartbeat().returning(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(SipError::TransportError("unreachable".to_string()))
        });

        let mut keep_alive = NatKeepAlive::new(&config(100));
        keep_alive.start(Arc::new(stack));
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);
        keep_alive.stop().await;
    }
}
