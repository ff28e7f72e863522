use crate::outcome::{SupervisionResult, TerminationOutcome};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Decision returned by the retry session after an attempt finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The command exited on its own: stop and report its exit code.
    Succeeded,
    /// The attempt was interrupted cleanly: run it again (1-based number of
    /// the attempt about to start).
    Retry { attempt: u32 },
    /// Attempts exhausted, or cleanup was forced: stop and report failure.
    GiveUp,
}

/// Bounded retry state for one program invocation.
///
/// A stalled attempt whose tree went away on SIGINT is retried until
/// `max_attempts` is reached. A forced kill ends the session at once: when
/// something had to be SIGKILLed, leftover state may break the next run.
#[derive(Debug)]
pub struct RetrySession {
    timeout: Duration,
    max_attempts: u32,
    current_attempt: u32,
}

impl RetrySession {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        if max_attempts == 0 {
            warn!("max attempts is 0, running the command once");
        }
        Self {
            timeout,
            max_attempts: max_attempts.max(1),
            current_attempt: 0,
        }
    }

    /// Idle timeout applied to every attempt.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Current attempt (0 = none started yet).
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Move to the next attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.current_attempt += 1;
        self.current_attempt
    }

    /// Classify the result of the current attempt.
    pub fn evaluate(&mut self, result: &SupervisionResult) -> RetryDecision {
        match result.outcome {
            TerminationOutcome::CleanExit => RetryDecision::Succeeded,
            TerminationOutcome::InterruptedExit if self.current_attempt >= self.max_attempts => {
                warn!(
                    exit_code = result.exit_code,
                    max_attempts = self.max_attempts,
                    "build command timed out, maximum number of attempts reached, failing"
                );
                RetryDecision::GiveUp
            }
            TerminationOutcome::InterruptedExit => {
                warn!(
                    attempt = self.current_attempt,
                    max_attempts = self.max_attempts,
                    "build command timed out, interrupting and retrying"
                );
                RetryDecision::Retry {
                    attempt: self.current_attempt + 1,
                }
            }
            TerminationOutcome::ForcedKill => {
                warn!(
                    exit_code = result.exit_code,
                    attempt = self.current_attempt,
                    "build command timed out, force killed, failing"
                );
                RetryDecision::GiveUp
            }
        }
    }
}

/// Run supervised attempts until one succeeds or the session gives up.
///
/// `attempt` is called with the 1-based attempt number. The result of the
/// last attempt is returned; its exit code is the program's exit code.
pub async fn run_attempts<F, Fut>(session: &mut RetrySession, mut attempt: F) -> SupervisionResult
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SupervisionResult>,
{
    loop {
        let number = session.begin_attempt();
        info!(
            attempt = number,
            max_attempts = session.max_attempts(),
            timeout_secs = session.timeout().as_secs(),
            "starting supervised attempt"
        );
        let result = attempt(number).await;
        match session.evaluate(&result) {
            RetryDecision::Retry { attempt } => {
                tracing::debug!(next_attempt = attempt, "retrying build command");
            }
            RetryDecision::Succeeded | RetryDecision::GiveUp => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn interrupted(code: i32) -> SupervisionResult {
        SupervisionResult::new(code, TerminationOutcome::InterruptedExit)
    }

    fn forced(code: i32) -> SupervisionResult {
        SupervisionResult::new(code, TerminationOutcome::ForcedKill)
    }

    fn session(max_attempts: u32) -> RetrySession {
        RetrySession::new(Duration::from_secs(5), max_attempts)
    }

    #[test]
    fn test_clean_exit_succeeds() {
        let mut s = session(3);
        s.begin_attempt();
        assert_eq!(
            s.evaluate(&SupervisionResult::clean(0)),
            RetryDecision::Succeeded
        );
    }

    #[test]
    fn test_nonzero_clean_exit_still_succeeds() {
        let mut s = session(3);
        s.begin_attempt();
        assert_eq!(
            s.evaluate(&SupervisionResult::clean(2)),
            RetryDecision::Succeeded
        );
    }

    #[test]
    fn test_interrupted_retries_until_last_attempt() {
        let mut s = session(3);
        s.begin_attempt();
        assert_eq!(s.evaluate(&interrupted(130)), RetryDecision::Retry { attempt: 2 });
        s.begin_attempt();
        assert_eq!(s.evaluate(&interrupted(130)), RetryDecision::Retry { attempt: 3 });
        s.begin_attempt();
        assert_eq!(s.evaluate(&interrupted(130)), RetryDecision::GiveUp);
    }

    #[test]
    fn test_forced_kill_gives_up_on_first_attempt() {
        let mut s = session(5);
        s.begin_attempt();
        assert_eq!(s.evaluate(&forced(137)), RetryDecision::GiveUp);
    }

    #[test]
    fn test_single_attempt_interrupted_gives_up() {
        let mut s = session(1);
        s.begin_attempt();
        assert_eq!(s.evaluate(&interrupted(130)), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let s = session(0);
        assert_eq!(s.max_attempts(), 1);
        assert_eq!(s.current_attempt(), 0);
    }

    #[tokio::test]
    async fn test_perpetual_stall_runs_exactly_max_attempts() {
        let mut s = session(4);
        let calls = Cell::new(0u32);
        let result = run_attempts(&mut s, |n| {
            calls.set(calls.get() + 1);
            async move { interrupted(128 + n as i32) }
        })
        .await;
        assert_eq!(calls.get(), 4);
        assert_eq!(s.current_attempt(), 4);
        // Exit code of the last attempt, not the first.
        assert_eq!(result, interrupted(132));
    }

    #[tokio::test]
    async fn test_forced_kill_stops_retries_immediately() {
        let mut s = session(3);
        let calls = Cell::new(0u32);
        let result = run_attempts(&mut s, |_| {
            calls.set(calls.get() + 1);
            async { forced(137) }
        })
        .await;
        assert_eq!(calls.get(), 1);
        assert_eq!(result.exit_code, 137);
    }

    #[tokio::test]
    async fn test_clean_exit_on_first_attempt_stops() {
        let mut s = session(3);
        let calls = Cell::new(0u32);
        let result = run_attempts(&mut s, |_| {
            calls.set(calls.get() + 1);
            async { SupervisionResult::clean(0) }
        })
        .await;
        assert_eq!(calls.get(), 1);
        assert_eq!(result, SupervisionResult::clean(0));
    }

    #[tokio::test]
    async fn test_recovers_after_interrupted_attempt() {
        let mut s = session(3);
        let result = run_attempts(&mut s, |n| async move {
            if n == 1 {
                interrupted(130)
            } else {
                SupervisionResult::clean(0)
            }
        })
        .await;
        assert_eq!(s.current_attempt(), 2);
        assert_eq!(result, SupervisionResult::clean(0));
    }

    #[tokio::test]
    async fn test_forced_kill_after_interrupt_stops() {
        let mut s = session(5);
        let result = run_attempts(&mut s, |n| async move {
            if n == 1 {
                interrupted(130)
            } else {
                forced(137)
            }
        })
        .await;
        assert_eq!(s.current_attempt(), 2);
        assert_eq!(result, forced(137));
    }
}
