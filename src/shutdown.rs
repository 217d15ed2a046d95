//! Graceful shutdown.
//!
//! The listener and a watcher run side by side and share one cancellation
//! signal. When the signal fires the watcher stops accepting new work and gives
//! in-flight connections a bounded window to finish.

use crate::error::ListenerError;
use std::future::Future;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct ShutdownCoordinator {
  signal: CancellationToken,
  sessions: TaskTracker,
  grace: Duration,
}

impl ShutdownCoordinator {
  pub fn new(grace: Duration) -> Self {
    Self {
      signal: CancellationToken::new(),
      sessions: TaskTracker::new(),
      grace,
    }
  }

  /// The daemon-wide signal. Every connection and session token derives from
  /// it.
  pub fn signal(&self) -> CancellationToken {
    self.signal.clone()
  }

  /// Where connection and session tasks are spawned so shutdown can wait for
  /// them.
  pub fn sessions(&self) -> TaskTracker {
    self.sessions.clone()
  }

  /// Drive `listener` to completion alongside the watcher. A listener error is
  /// only returned when it was not caused by shutdown.
  pub async fn run<F>(&self, listener: F) -> Result<(), ListenerError>
  where
    F: Future<Output = Result<(), ListenerError>>,
  {
    let listener_done = CancellationToken::new();

    let listening = async {
      let result = listener.await;
      listener_done.cancel();
      match result {
        Err(error) if self.signal.is_cancelled() => {
          tracing::debug!(?error, "listener error during shutdown");
          Ok(())
        }
        other => other,
      }
    };

    let watching = async {
      tokio::select! {
        _ = self.signal.cancelled() => self.drain().await,
        _ = listener_done.cancelled() => {
          if self.signal.is_cancelled() {
            self.drain().await;
          } else {
            tracing::error!("server stopped unexpectedly");
          }
        }
      }
    };

    let (result, ()) = tokio::join!(listening, watching);
    result
  }

  async fn drain(&self) {
    tracing::info!("shutting down server gracefully");
    self.sessions.close();
    match tokio::time::timeout(self.grace, self.sessions.wait()).await {
      Ok(()) => tracing::info!("all connections finished"),
      Err(_) => tracing::warn!(
        grace = ?self.grace,
        remaining = self.sessions.len(),
        "server shutdown did not complete in time"
      ),
    }
  }
}

/// Wait for SIGINT or SIGTERM.
pub async fn termination() -> std::io::Result<()> {
  let mut terminate = signal(SignalKind::terminate())?;
  let mut interrupt = signal(SignalKind::interrupt())?;
  tokio::select! {
    _ = terminate.recv() => tracing::info!("received SIGTERM"),
    _ = interrupt.recv() => tracing::info!("received SIGINT"),
  }
  Ok(())
}
