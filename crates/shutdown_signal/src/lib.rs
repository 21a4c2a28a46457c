use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use cfg_if::cfg_if;
use futures::{future::Shared, FutureExt};
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Which OS signal asked the process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    Hangup,
    /// Windows console close, logoff or shutdown
    ConsoleClose,
}

impl Display for ShutdownReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShutdownReason::Interrupt => "interrupt",
            ShutdownReason::Terminate => "terminate",
            ShutdownReason::Hangup => "hangup",
            ShutdownReason::ConsoleClose => "console close",
        };
        write!(f, "{name}")
    }
}

cfg_if! {
    if #[cfg(windows)] {
        use tokio::signal::windows::*;

        async fn raw_shutdown_signal() -> ShutdownReason {
            let (Ok(mut ctrl_c), Ok(mut ctrl_close), Ok(mut ctrl_shutdown), Ok(mut ctrl_logoff)) =
                (ctrl_c(), ctrl_close(), ctrl_shutdown(), ctrl_logoff())
            else {
                error!("Failed to attach console shutdown handlers, OS signals will be ignored");
                return std::future::pending().await;
            };
            select! {
                _ = ctrl_c.recv() => ShutdownReason::Interrupt,
                _ = ctrl_close.recv() => ShutdownReason::ConsoleClose,
                _ = ctrl_shutdown.recv() => ShutdownReason::ConsoleClose,
                _ = ctrl_logoff.recv() => ShutdownReason::ConsoleClose,
            }
        }
    } else if #[cfg(unix)] {
        use tokio::signal::unix::*;

        async fn unix_shutdown_signal(signal_kind: SignalKind) {
            match signal(signal_kind) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen to unix shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
        }

        async fn raw_shutdown_signal() -> ShutdownReason {
            select! {
                _ = unix_shutdown_signal(SignalKind::interrupt()) => ShutdownReason::Interrupt,
                _ = unix_shutdown_signal(SignalKind::terminate()) => ShutdownReason::Terminate,
                _ = unix_shutdown_signal(SignalKind::hangup()) => ShutdownReason::Hangup,
            }
        }
    } else {
        compile_error!("Your OS does not support shutdown signal ! Are you targeting wasm ?");
    }
}

pub type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ShutdownReason> + Send>>>;

/// A cloneable future resolving on the first shutdown signal received by the process.
pub fn shutdown_signal() -> ShutdownSignal {
    async {
        let reason = raw_shutdown_signal().await;
        info!(%reason, "Shutdown signal detected. Attempting graceful shutdown...");
        reason
    }
    .boxed()
    .shared()
}

/// Cancels `token` once a shutdown signal arrives.
///
/// The returned task stops listening as soon as the token is cancelled by someone else.
pub fn cancel_on_shutdown_signal(token: CancellationToken) -> JoinHandle<Option<ShutdownReason>> {
    let signal = shutdown_signal();
    tokio::spawn(async move {
        select! {
            reason = signal => {
                token.cancel();
                Some(reason)
            }
            _ = token.cancelled() => None,
        }
    })
}
