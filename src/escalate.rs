/// Escalating termination of a stalled process tree.
///
/// SIGINT goes to the whole tree first, leaves before parents. Whatever is
/// still alive once the grace period is over gets SIGKILL, and the attempt
/// is then classified as a forced kill.
use crate::config::EscalationConfig;
use crate::outcome::{exit_code, SupervisionResult, TerminationOutcome, FAILURE_EXIT_CODE};
use crate::proctree::{ProcessInfo, ProcessSnapshot};
use crate::signals::ExitNotifier;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;

pub struct Escalator {
    grace_period: Duration,
    poll_interval: Duration,
}

impl Escalator {
    pub fn new(grace_period: Duration, poll_interval: Duration) -> Self {
        Self {
            grace_period,
            // A zero tick would spin while waiting out the grace period.
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        }
    }

    pub fn from_config(config: &EscalationConfig) -> Self {
        Self::new(config.grace_period(), config.poll_interval())
    }

    /// Terminate `child` (pid `root_pid`) and everything it spawned.
    ///
    /// The returned exit code is the root's own wait status. The outcome is
    /// `ForcedKill` as soon as any member of the tree outlived the grace
    /// period, whatever the root did.
    pub async fn terminate(
        &self,
        child: &mut Child,
        root_pid: i32,
        snapshot: &ProcessSnapshot,
        notifier: Option<&mut ExitNotifier>,
    ) -> SupervisionResult {
        let mut kill_set = snapshot.kill_order(root_pid);
        if !kill_set.iter().any(|p| p.pid == root_pid) {
            tracing::debug!(pid = root_pid, "root not in process table, signaling it anyway");
            kill_set.push(ProcessInfo {
                pid: root_pid,
                parent_pid: 0,
                command_line: String::new(),
            });
        }

        tracing::info!(
            pid = root_pid,
            processes = kill_set.len(),
            visible = snapshot.len(),
            grace_secs = self.grace_period.as_secs_f64(),
            "interrupting process tree"
        );
        for process in &kill_set {
            send(process.pid, Signal::SIGINT);
        }

        let mut status = self.wait_for_tree(child, root_pid, &kill_set, notifier).await;
        if status.is_none() {
            status = try_reap(child);
        }

        let mut outcome = TerminationOutcome::InterruptedExit;
        for process in survivors(&kill_set, root_pid, status.is_some()) {
            outcome = TerminationOutcome::ForcedKill;
            tracing::warn!(
                pid = process.pid,
                cmdline = %process.command_line,
                "process not interrupted, forcibly killing"
            );
            send(process.pid, Signal::SIGKILL);
        }

        let status = match status {
            Some(status) => Some(status),
            None => match child.wait().await {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::error!(pid = root_pid, error = %e, "failed to reap build command");
                    None
                }
            },
        };

        let code = status.map(exit_code).unwrap_or(FAILURE_EXIT_CODE);
        tracing::debug!(pid = root_pid, exit_code = code, ?outcome, "escalation finished");
        SupervisionResult::new(code, outcome)
    }

    /// Wait out the grace period, returning early once the root is reaped and
    /// nothing else in the kill set is alive.
    ///
    /// Wakes on child-exit notifications and on a coarse tick, since
    /// grandchildren exiting do not signal us.
    async fn wait_for_tree(
        &self,
        child: &mut Child,
        root_pid: i32,
        kill_set: &[ProcessInfo],
        mut notifier: Option<&mut ExitNotifier>,
    ) -> Option<ExitStatus> {
        let deadline = Instant::now() + self.grace_period;
        let mut status = None;

        loop {
            if status.is_none() {
                status = try_reap(child);
            }
            if status.is_some() && survivors(kill_set, root_pid, true).next().is_none() {
                tracing::debug!("process tree gone before grace period ended");
                return status;
            }

            let now = Instant::now();
            if now >= deadline {
                return status;
            }
            let tick = (deadline - now).min(self.poll_interval);

            let live = match notifier.as_deref_mut() {
                Some(n) => tokio::select! {
                    live = n.notified() => live,
                    _ = tokio::time::sleep(tick) => true,
                },
                None => {
                    tokio::time::sleep(tick).await;
                    true
                }
            };
            if !live {
                notifier = None;
            }
        }
    }
}

fn try_reap(child: &mut Child) -> Option<ExitStatus> {
    match child.try_wait() {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!(error = %e, "non-blocking reap failed");
            None
        }
    }
}

/// Members of the kill set that are still running.
///
/// Once the root has been reaped its pid is free for reuse, so it is no
/// longer probed.
fn survivors<'a>(
    kill_set: &'a [ProcessInfo],
    root_pid: i32,
    root_reaped: bool,
) -> impl Iterator<Item = &'a ProcessInfo> {
    kill_set
        .iter()
        .filter(move |p| !(root_reaped && p.pid == root_pid))
        .filter(|p| is_alive(p.pid))
}

fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Best-effort signal; a process that is already gone is not an error.
fn send(pid: i32, signal: Signal) {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, ?signal, error = %e, "failed to signal process"),
    }
}
