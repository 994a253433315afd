//! Job handler that runs an external command.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use fleet_scheduler::{HandlerError, JobContext, JobHandler};

/// Runs `program args...` once per attempt.
///
/// Exit status 0 is success. Codes listed as non-retryable fail the firing
/// for good; any other failure, including a failed wait or death by signal,
/// is retryable. A program that cannot be spawned is never retried.
/// Cancellation kills the child.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    non_retryable_exit_codes: Vec<i32>,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            non_retryable_exit_codes: Vec::new(),
        }
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn envs(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn non_retryable_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.non_retryable_exit_codes = codes;
        self
    }

    fn command(&self, ctx: &JobContext) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("FLEET_JOB_NAME", ctx.job_name())
            .env("FLEET_EXECUTION_ID", ctx.execution_id().to_string())
            .env("FLEET_ATTEMPT", ctx.attempt().to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn execute(&self, ctx: JobContext) -> Result<(), HandlerError> {
        let mut child = self.command(&ctx).spawn().map_err(|e| {
            HandlerError::fatal(format!("failed to spawn '{}': {}", self.program, e))
        })?;
        debug!(job = %ctx.job_name(), program = %self.program, pid = child.id(), "Spawned command");

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = ctx.cancelled() => None,
        };

        let Some(status) = waited else {
            if let Err(e) = child.kill().await {
                warn!(job = %ctx.job_name(), error = %e, "Failed to kill cancelled command");
            }
            return Err(HandlerError::retryable("cancelled"));
        };

        let status = status?;
        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(code) if self.non_retryable_exit_codes.contains(&code) => Err(
                HandlerError::fatal(format!("'{}' exited with status {}", self.program, code)),
            ),
            Some(code) => Err(HandlerError::retryable(format!(
                "'{}' exited with status {}",
                self.program, code
            ))),
            None => Err(HandlerError::retryable(format!(
                "'{}' terminated by signal",
                self.program
            ))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn detached(job: &str) -> (JobContext, CancellationToken) {
        let token = CancellationToken::new();
        (JobContext::detached(job, token.clone()), token)
    }

    fn sh(script: &str) -> CommandHandler {
        CommandHandler::new("sh").args(vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_zero_exit_is_success() {
        let (ctx, _token) = detached("ok");
        assert!(sh("exit 0").execute(ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_retryable() {
        let (ctx, _token) = detached("flaky");
        let err = sh("exit 3").execute(ctx).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("status 3"));
    }

    #[tokio::test]
    async fn test_listed_exit_code_is_fatal() {
        let (ctx, _token) = detached("strict");
        let err = sh("exit 2")
            .non_retryable_exit_codes(vec![2])
            .execute(ctx)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let (ctx, _token) = detached("missing");
        let err = CommandHandler::new("/definitely/not/a/program")
            .execute(ctx)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _token) = detached("env-check");
        let handler = sh("test \"$MODE\" = full && test \"$FLEET_JOB_NAME\" = env-check && touch marker")
            .envs(vec![("MODE".to_string(), "full".to_string())])
            .working_dir(Some(dir.path().to_path_buf()));

        handler.execute(ctx).await.unwrap();
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let (ctx, token) = detached("long");
        let task = tokio::spawn(async move { sh("sleep 30").execute(ctx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "cancelled");
    }
}
