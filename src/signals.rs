//! Termination request capture.
//!
//! SIGINT and SIGTERM delivered to the launcher are forwarded into a
//! single-slot channel. The forwarder is installed before anything else
//! happens, so a request that arrives while the image is still being pulled
//! is held until the supervisor waits on it. Requests that arrive while one
//! is already pending are dropped.

use crate::error::Result;
use crate::runtime::Signal;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

/// Capacity of the holding area.
const HOLDING_SLOTS: usize = 1;

/// Sending half of the termination request channel.
#[derive(Debug, Clone)]
pub struct TerminationSender {
    tx: mpsc::Sender<Signal>,
}

impl TerminationSender {
    /// Offers a termination request without blocking.
    ///
    /// Returns false if a request is already pending or nobody listens.
    pub fn request(&self, signal: Signal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(%signal, "termination request already pending, dropping");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Returns true once the receiving half is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of the termination request channel.
#[derive(Debug)]
pub struct TerminationRequests {
    rx: mpsc::Receiver<Signal>,
}

impl TerminationRequests {
    /// Creates a detached channel; requests are injected through the sender.
    pub fn channel() -> (TerminationSender, Self) {
        let (tx, rx) = mpsc::channel(HOLDING_SLOTS);
        (TerminationSender { tx }, Self { rx })
    }

    /// Installs the SIGINT/SIGTERM forwarder.
    ///
    /// Must be called from within a tokio runtime.
    #[cfg(unix)]
    pub fn install() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let (sender, requests) = Self::channel();

        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    Some(()) = sigterm.recv() => Signal::Term,
                    Some(()) = sigint.recv() => Signal::Int,
                    else => break,
                };
                info!(%signal, "received termination request");
                sender.request(signal);
                if sender.is_closed() {
                    break;
                }
            }
        });

        Ok(requests)
    }

    /// Installs the Ctrl-C forwarder.
    #[cfg(not(unix))]
    pub fn install() -> Result<Self> {
        let (sender, requests) = Self::channel();

        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("received termination request");
                sender.request(Signal::Int);
                if sender.is_closed() {
                    break;
                }
            }
        });

        Ok(requests)
    }

    /// Waits for the next termination request.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }

    /// Takes a pending request without waiting.
    pub fn try_recv(&mut self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }
}
