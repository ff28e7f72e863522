/// Idle-output watchdog for one supervised attempt.
///
/// Relays the child's stdout and stderr byte-for-byte and tracks when the
/// last output arrived. Total runtime is never limited: only a gap of at
/// least `timeout` without any output counts as a stall, and a stall hands
/// the child's process tree to the escalator.
use crate::config::WatchdogConfig;
use crate::escalate::Escalator;
use crate::outcome::{exit_code, SupervisionResult};
use crate::proctree::{scan_proc_root, DEFAULT_PROC_ROOT};
use crate::session::SpawnedChild;
use crate::signals::ExitNotifier;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::time::{sleep_until, Instant};

/// After exit, give up on a pipe that stays silent this long. A backgrounded
/// grandchild can hold it open indefinitely.
const EXIT_DRAIN_QUIET: Duration = Duration::from_millis(100);
const EXIT_DRAIN_LIMIT: Duration = Duration::from_secs(2);

pub struct Watchdog {
    timeout: Duration,
    escalator: Escalator,
    read_buffer_bytes: usize,
    proc_root: PathBuf,
}

impl Watchdog {
    pub fn new(timeout: Duration, escalator: Escalator) -> Self {
        Self {
            timeout,
            escalator,
            read_buffer_bytes: 4096,
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
        }
    }

    pub fn from_config(timeout: Duration, config: &WatchdogConfig) -> Self {
        Self::new(timeout, Escalator::from_config(&config.escalation))
            .with_read_buffer(config.output.read_buffer_bytes)
            .with_proc_root(config.proc.root.clone())
    }

    pub fn with_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer_bytes = bytes.max(1);
        self
    }

    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// Supervise `spawned` until it exits or stalls.
    ///
    /// Child output is copied to `stdout_sink` and `stderr_sink`. A clean
    /// exit carries the child's own exit code; a stall returns whatever the
    /// escalator decided.
    pub async fn run<O, E>(
        &self,
        spawned: SpawnedChild,
        stdout_sink: &mut O,
        stderr_sink: &mut E,
    ) -> SupervisionResult
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let SpawnedChild {
            pid,
            mut child,
            stdout,
            stderr,
        } = spawned;
        let mut out = Relay::new("stdout", stdout, stdout_sink);
        let mut err = Relay::new("stderr", stderr, stderr_sink);
        let mut out_buf = vec![0u8; self.read_buffer_bytes];
        let mut err_buf = vec![0u8; self.read_buffer_bytes];

        let mut notifier = match ExitNotifier::install() {
            Ok(notifier) => notifier,
            Err(e) => {
                tracing::error!(error = %e, "cannot watch for child exit, stopping build command");
                let snapshot = scan_proc_root(&self.proc_root);
                return self.escalator.terminate(&mut child, pid, &snapshot, None).await;
            }
        };
        let mut notifier_live = true;
        // Checked once up front: the child may have exited before the
        // notifier existed.
        let mut exit_pending = true;
        let mut last_activity = Instant::now();

        loop {
            if exit_pending || !notifier_live {
                exit_pending = false;
                if let Some(status) = reap(&mut child) {
                    let limit = Instant::now() + EXIT_DRAIN_LIMIT;
                    out.drain_after_exit(&mut out_buf, limit).await;
                    err.drain_after_exit(&mut err_buf, limit).await;
                    return finished(pid, status);
                }
            }

            let deadline = idle_deadline(last_activity, self.timeout);
            tokio::select! {
                biased;

                read = out.read(&mut out_buf), if out.is_open() => {
                    if out.forward(read, &mut out_buf).await {
                        last_activity = Instant::now();
                    }
                }
                read = err.read(&mut err_buf), if err.is_open() => {
                    if err.forward(read, &mut err_buf).await {
                        last_activity = Instant::now();
                    }
                }
                live = notifier.notified(), if notifier_live => {
                    if live {
                        exit_pending = true;
                    } else {
                        tracing::warn!("child-exit notifications stopped, checking on each wakeup");
                        notifier_live = false;
                    }
                }
                _ = sleep_until(deadline) => {
                    let idle = last_activity.elapsed();
                    if is_stalled(idle, self.timeout) {
                        tracing::warn!(
                            pid,
                            idle_secs = idle.as_secs(),
                            timeout_secs = self.timeout.as_secs(),
                            "build command produced no output, interrupting"
                        );
                        let snapshot = scan_proc_root(&self.proc_root);
                        if snapshot.is_empty() {
                            tracing::warn!(pid, "process table is empty, only the build command will be signaled");
                        }
                        return self
                            .escalator
                            .terminate(&mut child, pid, &snapshot, Some(&mut notifier))
                            .await;
                    }
                }
            }
        }
    }
}

/// When the child counts as stalled if nothing arrives first.
fn idle_deadline(last_activity: Instant, timeout: Duration) -> Instant {
    last_activity + timeout
}

fn is_stalled(idle: Duration, timeout: Duration) -> bool {
    idle >= timeout
}

fn reap(child: &mut Child) -> Option<ExitStatus> {
    match child.try_wait() {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!(error = %e, "non-blocking reap failed");
            None
        }
    }
}

fn finished(pid: i32, status: ExitStatus) -> SupervisionResult {
    let code = exit_code(status);
    tracing::debug!(pid, exit_code = code, %status, "build command exited");
    SupervisionResult::clean(code)
}

/// One child output pipe and where its bytes go.
///
/// The read end stays open until EOF whatever goes wrong: closing it early
/// would kill the child with SIGPIPE on its next write.
struct Relay<'a, R, W> {
    name: &'static str,
    /// `None` once the pipe hit EOF.
    source: Option<R>,
    sink: &'a mut W,
    /// Set after a read error. The pipe is held but no longer polled.
    parked: bool,
    /// Set after a write error. Bytes are still read, then dropped.
    sink_broken: bool,
}

impl<'a, R, W> Relay<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn new(name: &'static str, source: R, sink: &'a mut W) -> Self {
        Self {
            name,
            source: Some(source),
            sink,
            parked: false,
            sink_broken: false,
        }
    }

    fn is_open(&self) -> bool {
        self.source.is_some() && !self.parked
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.source.as_mut() {
            Some(source) if !self.parked => source.read(buf).await,
            _ => std::future::pending().await,
        }
    }

    /// Handle the result of a ready read, then keep copying until the pipe
    /// would block. Returns whether the child produced any bytes, forwarded
    /// or not.
    async fn forward(&mut self, first: std::io::Result<usize>, buf: &mut [u8]) -> bool {
        let mut result = first;
        let mut received = false;
        let mut written = false;
        loop {
            match result {
                Ok(0) => {
                    tracing::debug!(stream = self.name, "child closed its end of the pipe");
                    self.source = None;
                    break;
                }
                Ok(n) => {
                    received = true;
                    if !self.sink_broken {
                        match self.sink.write_all(&buf[..n]).await {
                            Ok(()) => written = true,
                            Err(e) => self.abandon_sink(&e),
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(
                        stream = self.name,
                        error = %e,
                        "read failed, no longer copying this stream"
                    );
                    self.parked = true;
                    break;
                }
            }

            let Some(source) = self.source.as_mut() else {
                break;
            };
            // Zero timeout: take what is already there, never wait for more.
            result = match tokio::time::timeout(Duration::ZERO, source.read(buf)).await {
                Ok(result) => result,
                Err(_) => break,
            };
        }

        if written && !self.sink_broken {
            if let Err(e) = self.sink.flush().await {
                self.abandon_sink(&e);
            }
        }
        received
    }

    fn abandon_sink(&mut self, error: &std::io::Error) {
        tracing::warn!(
            stream = self.name,
            error = %error,
            "cannot forward output, discarding the rest of this stream"
        );
        self.sink_broken = true;
    }

    /// Copy what is left in the pipe after the child exited.
    async fn drain_after_exit(&mut self, buf: &mut [u8], limit: Instant) {
        while self.is_open() {
            let Some(source) = self.source.as_mut() else {
                break;
            };
            let now = Instant::now();
            if now >= limit {
                tracing::debug!(stream = self.name, "pipe still open after exit, leaving it");
                break;
            }
            let wait = EXIT_DRAIN_QUIET.min(limit - now);
            let read = match tokio::time::timeout(wait, source.read(buf)).await {
                Ok(read) => read,
                Err(_) => break,
            };
            self.forward(read, buf).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::TerminationOutcome;
    use crate::session::spawn;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// A sink whose reader went away.
    struct ClosedSink;

    impl AsyncWrite for ClosedSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::from(ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn watchdog(timeout: Duration) -> Watchdog {
        Watchdog::new(
            timeout,
            Escalator::new(Duration::from_secs(3), Duration::from_millis(100)),
        )
    }

    async fn supervise(
        watchdog: &Watchdog,
        script: &str,
    ) -> (SupervisionResult, String, String, Duration) {
        let spawned = spawn("sh", &["-c".to_string(), script.to_string()]).unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let started = std::time::Instant::now();
        let result = watchdog.run(spawned, &mut out, &mut err).await;
        (
            result,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
            started.elapsed(),
        )
    }

    #[test]
    fn test_is_stalled_boundary() {
        let timeout = Duration::from_secs(5);
        assert!(!is_stalled(Duration::from_millis(4999), timeout));
        assert!(is_stalled(Duration::from_secs(5), timeout));
        assert!(is_stalled(Duration::from_secs(60), timeout));
    }

    #[test]
    fn test_idle_deadline_follows_last_activity() {
        let start = Instant::now();
        let timeout = Duration::from_secs(5);
        let later = start + Duration::from_secs(3);
        assert_eq!(idle_deadline(start, timeout), start + timeout);
        assert_eq!(idle_deadline(later, timeout), later + timeout);
    }

    #[test]
    fn test_from_config_applies_settings() {
        let mut config = WatchdogConfig::default();
        config.output.read_buffer_bytes = 0;
        config.proc.root = PathBuf::from("/nonexistent-proc");
        let wd = Watchdog::from_config(Duration::from_secs(9), &config);
        assert_eq!(wd.timeout, Duration::from_secs(9));
        assert_eq!(wd.read_buffer_bytes, 1);
        assert_eq!(wd.proc_root, PathBuf::from("/nonexistent-proc"));
    }

    #[tokio::test]
    async fn test_clean_exit_relays_output_and_code() {
        let wd = watchdog(Duration::from_secs(5));
        let (result, out, err, _) = supervise(&wd, "printf out; printf err >&2; exit 7").await;
        assert_eq!(result, SupervisionResult::clean(7));
        assert_eq!(out, "out");
        assert_eq!(err, "err");
    }

    #[tokio::test]
    async fn test_large_output_is_copied_completely() {
        let wd = watchdog(Duration::from_secs(5)).with_read_buffer(64);
        let script = "i=0; while [ $i -lt 2000 ]; do echo line-$i; i=$((i+1)); done";
        let (result, out, _, _) = supervise(&wd, script).await;
        assert_eq!(result, SupervisionResult::clean(0));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2000);
        assert_eq!(lines[0], "line-0");
        assert_eq!(lines[1999], "line-1999");
    }

    #[tokio::test]
    async fn test_killed_by_signal_reports_128_plus_signo() {
        let wd = watchdog(Duration::from_secs(5));
        let (result, _, _, _) = supervise(&wd, "kill -9 $$").await;
        assert_eq!(result, SupervisionResult::clean(137));
    }

    #[tokio::test]
    async fn test_steady_output_never_escalates() {
        let wd = watchdog(Duration::from_secs(1));
        let script = "for i in 1 2 3 4 5 6; do echo tick; sleep 0.3; done";
        let (result, out, _, elapsed) = supervise(&wd, script).await;
        assert_eq!(result.outcome, TerminationOutcome::CleanExit);
        assert_eq!(result.exit_code, 0);
        assert_eq!(out.lines().count(), 6);
        // Ran longer than the idle timeout without being touched.
        assert!(elapsed > Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_stalled_child_is_interrupted() {
        let wd = watchdog(Duration::from_secs(1));
        let (result, out, _, elapsed) = supervise(&wd, "echo started; sleep 30").await;
        assert_eq!(result.outcome, TerminationOutcome::InterruptedExit);
        assert_eq!(result.exit_code, 130);
        assert_eq!(out, "started\n");
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_stall_detected_soon_after_timeout() {
        let wd = watchdog(Duration::from_secs(1));
        let (result, _, _, elapsed) = supervise(&wd, "exec sleep 30").await;
        assert_eq!(result.outcome, TerminationOutcome::InterruptedExit);
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_activity_pushes_back_the_deadline() {
        let wd = watchdog(Duration::from_secs(1));
        let script = "echo a; sleep 0.6; echo b >&2; sleep 0.6; echo c; sleep 30";
        let (result, out, err, elapsed) = supervise(&wd, script).await;
        assert_eq!(result.outcome, TerminationOutcome::InterruptedExit);
        assert_eq!(out, "a\nc\n");
        assert_eq!(err, "b\n");
        // Last output at ~1.2s, so the stall cannot fire before ~2.2s.
        assert!(elapsed >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_closed_pipes_still_time_out() {
        let wd = watchdog(Duration::from_secs(1));
        let (result, _, _, _) = supervise(&wd, "exec >/dev/null 2>&1; sleep 30").await;
        assert_eq!(result.outcome, TerminationOutcome::InterruptedExit);
    }

    #[tokio::test]
    async fn test_sequential_attempts_each_see_their_exit() {
        let wd = watchdog(Duration::from_secs(5));
        for code in [0, 4, 0] {
            let (result, _, _, _) = supervise(&wd, &format!("exit {code}")).await;
            assert_eq!(result, SupervisionResult::clean(code));
        }
    }

    #[tokio::test]
    async fn test_broken_sink_does_not_kill_the_child() {
        let wd = watchdog(Duration::from_secs(5));
        let script = "echo a; sleep 0.5; echo b; echo still-running >&2; exit 5";
        let spawned = spawn("sh", &["-c".to_string(), script.to_string()]).unwrap();
        let mut out = ClosedSink;
        let mut err = Vec::new();
        let result = wd.run(spawned, &mut out, &mut err).await;
        // The child kept writing to stdout after the sink failed and still
        // reached its own exit.
        assert_eq!(result, SupervisionResult::clean(5));
        assert_eq!(String::from_utf8(err).unwrap(), "still-running\n");
    }

    #[tokio::test]
    async fn test_discarded_output_still_counts_as_activity() {
        let wd = watchdog(Duration::from_secs(1));
        let script = "for i in 1 2 3 4 5; do echo tick; sleep 0.4; done; exit 0";
        let spawned = spawn("sh", &["-c".to_string(), script.to_string()]).unwrap();
        let mut out = ClosedSink;
        let mut err = Vec::new();
        let result = wd.run(spawned, &mut out, &mut err).await;
        assert_eq!(result, SupervisionResult::clean(0));
    }

    #[tokio::test]
    async fn test_read_error_parks_the_pipe_without_closing_it() {
        let mut sink = Vec::new();
        let mut relay = Relay::new("stdout", tokio::io::empty(), &mut sink);
        let mut buf = vec![0u8; 16];
        let failed = std::io::Error::new(ErrorKind::Other, "input/output error");

        assert!(!relay.forward(Err(failed), &mut buf).await);
        assert!(!relay.is_open());
        // Still held, so the writer on the other end does not get SIGPIPE.
        assert!(relay.source.is_some());

        // A parked pipe is skipped by the exit drain instead of being polled.
        relay
            .drain_after_exit(&mut buf, Instant::now() + Duration::from_secs(1))
            .await;
        assert!(relay.source.is_some());
    }

    #[tokio::test]
    async fn test_eof_releases_the_pipe() {
        let mut sink = Vec::new();
        let mut relay = Relay::new("stdout", &b"done"[..], &mut sink);
        let mut buf = vec![0u8; 16];
        let first = relay.read(&mut buf).await;
        // The follow-up read inside forward sees EOF right away.
        assert!(relay.forward(first, &mut buf).await);
        assert!(relay.source.is_none());
        assert!(!relay.is_open());
        assert_eq!(sink, b"done");
    }
}
