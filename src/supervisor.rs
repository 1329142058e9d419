//! Supervised background loops
//!
//! Periodic tasks (config refresh, guard-stop monitor) run under one loop:
//! tick on an interval, back off exponentially on errors, stop when the
//! shutdown signal flips.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::Result;

/// Exponential backoff: 500ms doubling up to 30s, reset on success
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay to wait now; doubles the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Shutdown signal: `true` once shutdown has been requested
pub type ShutdownRx = watch::Receiver<bool>;

pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownRx) {
    watch::channel(false)
}

/// Resolves once shutdown is requested. A dropped sender never resolves.
pub async fn wait_for_shutdown(rx: &mut ShutdownRx) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep for `delay`; returns `true` if shutdown arrived first
pub async fn sleep_or_shutdown(delay: Duration, rx: &mut ShutdownRx) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = wait_for_shutdown(rx) => true,
    }
}

/// Run `tick` every `interval` until shutdown.
///
/// A failing tick is logged and retried after the backoff delay instead of
/// the normal interval.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: ShutdownRx,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = Backoff::default();
        info!("▶️  {} started", name);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = match tick().await {
                Ok(()) => {
                    backoff.reset();
                    interval
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "{}: tick failed, retrying",
                        name
                    );
                    delay
                }
            };
            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }
        info!("⏹️  {} stopped", name);
    })
}
