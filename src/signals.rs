/// Child-exit notification for one supervised attempt.
///
/// SIGCHLD is turned into a pollable event by tokio's signal driver, which
/// only writes a wakeup byte from the handler. Reaping and exit-status work
/// happen wherever `notified()` is awaited, never in the handler.
///
/// The notifier is scoped: created when the watchdog loop starts, dropped on
/// every way out of it, so no listener leaks into the next attempt.
use tokio::signal::unix::{signal, Signal, SignalKind};

pub struct ExitNotifier {
    signal: Signal,
}

impl ExitNotifier {
    pub fn install() -> std::io::Result<ExitNotifier> {
        let signal = signal(SignalKind::child())?;
        tracing::debug!("child-exit notifier installed");
        Ok(ExitNotifier { signal })
    }

    /// Wait for the next SIGCHLD.
    ///
    /// Any child of this process may be the sender, so callers must check
    /// their own child with a non-blocking reap. Returns `false` once the
    /// signal driver has shut down and no more notifications will arrive.
    pub async fn notified(&mut self) -> bool {
        self.signal.recv().await.is_some()
    }
}

impl Drop for ExitNotifier {
    fn drop(&mut self) {
        tracing::debug!("child-exit notifier released");
    }
}
