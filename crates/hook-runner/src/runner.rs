use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use system_utils::process::{
    run_supervised, CapturedOutput, CommandSpec, ProcessOutcome, TerminationFailed,
};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub(crate) trait CommandRunner: Send + Sync {
    async fn run(&self, input: Bytes) -> ProcessOutcome;
}

pub(crate) struct Supervisor {
    spec: CommandSpec,
    capture_dir: PathBuf,
    fatal: CancellationToken,
}

impl Supervisor {
    /// `fatal` is cancelled when a timed-out command could not be killed.
    pub(crate) fn new(spec: CommandSpec, capture_dir: PathBuf, fatal: CancellationToken) -> Self {
        Self {
            spec,
            capture_dir,
            fatal,
        }
    }

    fn abort(&self, err: TerminationFailed) -> ProcessOutcome {
        tracing::error!(
            event = "command.kill_failed",
            command = %self.spec,
            error = %err,
            "could not kill long running process, aborting in dirty state"
        );
        self.fatal.cancel();
        ProcessOutcome::Failed {
            detail: err.to_string(),
            output: CapturedOutput::default(),
        }
    }
}

#[async_trait]
impl CommandRunner for Supervisor {
    async fn run(&self, input: Bytes) -> ProcessOutcome {
        match run_supervised(&self.spec, input, &self.capture_dir).await {
            Ok(outcome) => outcome,
            Err(err) => self.abort(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    fn supervisor(fatal: CancellationToken) -> Supervisor {
        let spec = CommandSpec::from_argv(&["true".to_string()], None, Duration::from_secs(5))
            .expect("spec");
        Supervisor::new(spec, std::env::temp_dir(), fatal)
    }

    #[test]
    fn termination_failure_trips_fatal_token() {
        let fatal = CancellationToken::new();
        let outcome = supervisor(fatal.clone()).abort(TerminationFailed {
            pid: Some(4242),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "operation not permitted"),
        });
        assert!(fatal.is_cancelled());
        assert!(!outcome.is_success());
        assert!(outcome.to_string().contains("could not terminate process 4242"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_runs_leave_fatal_token_alone() {
        let fatal = CancellationToken::new();
        let outcome = supervisor(fatal.clone()).run(Bytes::new()).await;
        assert!(outcome.is_success());
        assert!(!fatal.is_cancelled());
    }
}
