/// Attempt results shared by the watchdog, the escalator and the retry loop.
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Exit code for the watchdog's own failures.
///
/// Never 1 or 2: make uses those for its own results.
pub const FAILURE_EXIT_CODE: i32 = 3;

/// How a supervised attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The child exited on its own before the idle timeout.
    CleanExit,
    /// The child stalled and its whole tree went away after SIGINT.
    InterruptedExit,
    /// Something in the tree survived the grace period and was SIGKILLed.
    /// Cleanup state is unreliable.
    ForcedKill,
}

/// Result of one supervised attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisionResult {
    pub exit_code: i32,
    pub outcome: TerminationOutcome,
}

impl SupervisionResult {
    pub fn new(exit_code: i32, outcome: TerminationOutcome) -> Self {
        Self { exit_code, outcome }
    }

    /// The child finished by itself with the given code.
    pub fn clean(exit_code: i32) -> Self {
        Self::new(exit_code, TerminationOutcome::CleanExit)
    }

    /// The attempt could not be set up (spawn failure and the like).
    ///
    /// Classified as a clean exit so the retry loop stops and reports the code.
    pub fn setup_failure() -> Self {
        Self::clean(FAILURE_EXIT_CODE)
    }
}

/// Map a wait status onto the exit code we report.
///
/// Normal exit passes the code through, death by signal becomes
/// `128 + signo` like a shell reports it, anything else is a failure.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        FAILURE_EXIT_CODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_exit_code_passes_through() {
        let status = ExitStatus::from_raw(7 << 8);
        assert_eq!(exit_code(status), 7);
    }

    #[test]
    fn test_zero_exit_code() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
    }

    #[test]
    fn test_sigkill_maps_to_137() {
        let status = ExitStatus::from_raw(9);
        assert_eq!(exit_code(status), 137);
    }

    #[test]
    fn test_sigint_maps_to_130() {
        let status = ExitStatus::from_raw(2);
        assert_eq!(exit_code(status), 130);
    }

    #[test]
    fn test_stopped_status_is_failure() {
        // WIFSTOPPED with SIGSTOP: neither exited nor signaled
        let status = ExitStatus::from_raw((19 << 8) | 0x7f);
        assert_eq!(exit_code(status), FAILURE_EXIT_CODE);
    }

    #[test]
    fn test_setup_failure_is_clean_with_sentinel() {
        let result = SupervisionResult::setup_failure();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.outcome, TerminationOutcome::CleanExit);
    }
}
