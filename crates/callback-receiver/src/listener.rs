//! HTTP server lifecycle
//!
//! A [`Listener`] moves through `Unstarted -> Starting -> Running -> Stopping
//! -> Stopped`. `Stopped` is terminal. A failed start returns to `Unstarted`
//! so the caller may retry.
//!
//! # Shutdown
//!
//! Triggered by SIGINT / SIGTERM (when enabled) or [`Listener::stop`]:
//! - Stops accepting new connections
//! - Waits for in-flight requests and dispatched batches, up to the grace period
//! - Abandons requests still running after the grace period and aborts the server
//!
//! Handler code that is still running when the grace period ends is not
//! cancelled; it continues detached.

use crate::inbound::CallbackReceiver;
use crate::{ReceiverError, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle state of a [`Listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unstarted,
    /// Binding the listen address
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// What triggered shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    Requested,
}

/// How shutdown completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// All connections drained within the grace period
    Graceful,
    /// Connections were force-closed after the grace period
    Forced,
}

/// Summary returned by [`Listener::run`]
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    pub outcome: ShutdownOutcome,
    /// Time from the shutdown trigger to `Stopped`
    pub elapsed: Duration,
    /// Dispatched batches still running when the listener stopped
    pub detached_batches: usize,
}

struct ListenerShared {
    receiver: CallbackReceiver,
    state: watch::Sender<ListenerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    stop: Mutex<CancellationToken>,
}

/// Owns the HTTP server serving a [`CallbackReceiver`].
///
/// Clones share the same lifecycle, so one task can [`run`](Self::run)
/// while another calls [`stop`](Self::stop).
#[derive(Clone)]
pub struct Listener {
    shared: Arc<ListenerShared>,
}

impl Listener {
    pub fn new(receiver: CallbackReceiver) -> Self {
        let (state, _) = watch::channel(ListenerState::Unstarted);
        Self {
            shared: Arc::new(ListenerShared {
                receiver,
                state,
                local_addr: Mutex::new(None),
                stop: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.shared.state.subscribe()
    }

    /// Address actually bound, available once running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Request a graceful shutdown.
    ///
    /// Returns `false` when there is nothing to stop.
    pub fn stop(&self) -> bool {
        match self.state() {
            ListenerState::Starting | ListenerState::Running => {
                info!("Callback listener stop requested");
                self.shared.stop.lock().cancel();
                true
            }
            _ => false,
        }
    }

    /// Bind, serve until shutdown, then drain.
    ///
    /// Blocks the calling task until the listener reaches `Stopped`. Spawn it
    /// to embed the listener in a larger service.
    pub async fn run(&self) -> Result<ShutdownReport> {
        let stop = self.begin_start()?;
        let config = self.shared.receiver.config();

        let tcp = match self.bind(&config.listen_addr, config.startup_timeout()).await {
            Ok(tcp) => tcp,
            Err(e) => {
                self.shared.state.send_replace(ListenerState::Unstarted);
                return Err(e);
            }
        };
        let addr = tcp.local_addr().ok();
        *self.shared.local_addr.lock() = addr;

        let force_close = CancellationToken::new();
        let graceful = CancellationToken::new();
        let app = self.shared.receiver.build_router(force_close.clone());
        let mut server: JoinHandle<std::io::Result<()>> = tokio::spawn({
            let graceful = graceful.clone();
            async move {
                axum::serve(tcp, app)
                    .with_graceful_shutdown(graceful.cancelled_owned())
                    .await
            }
        });

        self.shared.state.send_replace(ListenerState::Running);
        info!(
            addr = ?addr,
            path = %config.path,
            "Callback listener running"
        );

        let reason = tokio::select! {
            joined = &mut server => {
                self.shared.state.send_replace(ListenerState::Stopped);
                let message = match joined {
                    Ok(Ok(())) => "server exited unexpectedly".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };
                error!(error = %message, "Callback listener failed");
                return Err(ReceiverError::Server(message));
            }
            reason = wait_for_shutdown(stop, config.handle_signals) => reason,
        };

        self.shared.state.send_replace(ListenerState::Stopping);
        let started = Instant::now();
        let deadline = started + config.grace_period();
        info!(
            reason = ?reason,
            grace_ms = config.grace_period_ms,
            "Callback listener shutting down"
        );

        graceful.cancel();
        let mut outcome = match tokio::time::timeout_at(deadline, &mut server).await {
            Ok(Ok(Ok(()))) => ShutdownOutcome::Graceful,
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "HTTP server reported an error while draining");
                ShutdownOutcome::Graceful
            }
            Ok(Err(e)) => {
                warn!(error = %e, "HTTP server task ended abnormally while draining");
                ShutdownOutcome::Graceful
            }
            Err(_) => {
                force_close_server(&force_close, server).await?;
                ShutdownOutcome::Forced
            }
        };

        let tracker = self.shared.receiver.dispatcher().tracker();
        tracker.close();
        let detached_batches = match tokio::time::timeout_at(deadline, tracker.wait()).await {
            Ok(()) => 0,
            Err(_) => {
                let pending = tracker.len();
                warn!(pending, "Dispatched batches still running, leaving them detached");
                outcome = ShutdownOutcome::Forced;
                pending
            }
        };

        self.shared.state.send_replace(ListenerState::Stopped);
        let report = ShutdownReport {
            reason,
            outcome,
            elapsed: started.elapsed(),
            detached_batches,
        };
        info!(
            outcome = ?report.outcome,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Callback listener stopped"
        );
        Ok(report)
    }

    /// Move `Unstarted -> Starting` and hand out a fresh stop token.
    ///
    /// The token is installed before `Starting` becomes visible, so a
    /// `stop()` that observes `Starting` always cancels this run.
    fn begin_start(&self) -> Result<CancellationToken> {
        let token = CancellationToken::new();
        let mut rejected = None;
        self.shared.state.send_if_modified(|state| match *state {
            ListenerState::Unstarted => {
                *self.shared.stop.lock() = token.clone();
                *state = ListenerState::Starting;
                true
            }
            ListenerState::Stopped => {
                rejected = Some(ReceiverError::AlreadyStopped);
                false
            }
            _ => {
                rejected = Some(ReceiverError::AlreadyRunning);
                false
            }
        });
        if let Some(e) = rejected {
            warn!(error = %e, "Callback listener start rejected");
            return Err(e);
        }

        Ok(token)
    }

    async fn bind(&self, addr: &str, startup_timeout: Duration) -> Result<TcpListener> {
        match tokio::time::timeout(startup_timeout, TcpListener::bind(addr)).await {
            Ok(Ok(tcp)) => Ok(tcp),
            Ok(Err(source)) => {
                error!(addr = %addr, error = %source, "Failed to bind callback listener");
                Err(ReceiverError::Bind {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                error!(addr = %addr, "Callback listener did not start in time");
                Err(ReceiverError::StartupTimeout(startup_timeout))
            }
        }
    }
}

async fn force_close_server(
    force_close: &CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
) -> Result<()> {
    warn!("Grace period elapsed, force-closing callback connections");
    force_close.cancel();
    server.abort();

    match server.await {
        Err(e) if e.is_panic() => {
            error!(error = %e, "Forced close of callback listener failed");
            Err(ReceiverError::ForceClose(e.to_string()))
        }
        _ => Ok(()),
    }
}

/// Wait for a stop request or, when enabled, CTRL+C / SIGTERM
async fn wait_for_shutdown(stop: CancellationToken, handle_signals: bool) -> ShutdownReason {
    if !handle_signals {
        stop.cancelled().await;
        return ShutdownReason::Requested;
    }

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = stop.cancelled() => ShutdownReason::Requested,
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
            ShutdownReason::Signal
        }
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
            ShutdownReason::Signal
        }
    }
}
