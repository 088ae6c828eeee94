//! Graceful shutdown handling with request draining.
//!
//! This module provides:
//! - Signal handling (SIGTERM, SIGINT, SIGHUP)
//! - Draining of in-flight tool calls with a configurable timeout
//! - Release of the XMLA session and its schema cache

use crate::constants::{DEFAULT_DRAIN_TIMEOUT, DRAIN_POLL_INTERVAL};
use crate::server::PowerBiMcpServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

/// Shutdown signal that can be awaited.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for the shutdown signal.
    pub async fn recv(&mut self) {
        let _ = self.receiver.wait_for(|&v| v).await;
    }

    /// Check if shutdown has been signaled without blocking.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Shutdown phases for coordinated cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Initiated,

    /// Waiting for in-flight tool calls.
    DrainingRequests,

    /// Disconnecting the XMLA session.
    ClosingSession,

    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Initiated => write!(f, "initiated"),
            ShutdownPhase::DrainingRequests => write!(f, "draining_requests"),
            ShutdownPhase::ClosingSession => write!(f, "closing_session"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Controller for managing graceful shutdown.
pub struct ShutdownController {
    sender: watch::Sender<bool>,

    shutting_down: Arc<AtomicBool>,

    phase_sender: broadcast::Sender<ShutdownPhase>,

    drain_timeout: Duration,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::with_drain_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        let (phase_sender, _) = broadcast::channel(16);

        Self {
            sender,
            shutting_down: Arc::new(AtomicBool::new(false)),
            phase_sender,
            drain_timeout,
        }
    }

    /// Get a shutdown signal receiver.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to shutdown phase notifications.
    pub fn subscribe_phases(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.phase_sender.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown...");
            let _ = self.sender.send(true);
            let _ = self.phase_sender.send(ShutdownPhase::Initiated);
        }
    }

    fn notify_phase(&self, phase: ShutdownPhase) {
        info!("Shutdown phase: {}", phase);
        let _ = self.phase_sender.send(phase);
    }

    /// Drain in-flight tool calls, then release the session.
    pub async fn graceful_shutdown(&self, server: &PowerBiMcpServer) {
        self.shutdown();

        self.notify_phase(ShutdownPhase::DrainingRequests);
        self.drain_requests(server).await;

        self.notify_phase(ShutdownPhase::ClosingSession);
        server.close().await;

        self.notify_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown complete");
    }

    async fn drain_requests(&self, server: &PowerBiMcpServer) {
        let start = Instant::now();

        loop {
            let running = server.in_flight();
            if running == 0 {
                info!("All requests drained");
                break;
            }

            if start.elapsed() > self.drain_timeout {
                warn!(
                    "Drain timeout exceeded with {} requests still running",
                    running
                );
                break;
            }

            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared shutdown controller type.
pub type SharedShutdownController = Arc<ShutdownController>;

/// Create a shutdown controller from configuration.
pub fn new_shutdown_controller(config: &ShutdownConfig) -> SharedShutdownController {
    Arc::new(ShutdownController::with_drain_timeout(config.drain_timeout))
}

/// Install signal handlers for graceful shutdown.
///
/// SIGINT (Ctrl+C) everywhere, SIGTERM and SIGHUP on Unix.
pub async fn install_signal_handlers(controller: SharedShutdownController) {
    let ctrl_c_controller = controller.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                ctrl_c_controller.shutdown();
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C signal: {}", e);
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::hangup(), "SIGHUP"),
        ] {
            let controller = controller.clone();
            tokio::spawn(async move {
                match signal(kind) {
                    Ok(mut stream) => {
                        stream.recv().await;
                        info!("Received {}, initiating shutdown...", name);
                        controller.shutdown();
                    }
                    Err(e) => {
                        error!("Failed to install {} handler: {}", name, e);
                    }
                }
            });
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Timeout for draining in-flight tool calls.
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl ShutdownConfig {
    /// Read `POWERBI_SHUTDOWN_DRAIN_TIMEOUT` (seconds); invalid values keep the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(drain) = std::env::var("POWERBI_SHUTDOWN_DRAIN_TIMEOUT") {
            if let Ok(secs) = drain.parse::<u64>() {
                config.drain_timeout = Duration::from_secs(secs);
            }
        }

        config
    }
}
