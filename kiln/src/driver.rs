//! Stage drivers.
//!
//! Both drivers share one contract: given a container and a stage, return a
//! clean exit (or the user script's non-zero code as a build failure), an
//! infrastructure error, or a cancellation.
//!
//! The attach driver writes a one-line command to the long-lived shell of
//! the target container and takes the exit code out of band, from the exit
//! sentinel the stage script's trap appends to the shared log file. The
//! legacy exec driver spawns a transient exec per stage, streams the script
//! over stdin, and takes the exit code from the exec status. Stream
//! establishment is retried on transport errors in both drivers; a
//! cancellation aborts immediately.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kiln_shell::TrapExitStatus;
use kube::Api;
use kube::api::AttachParams;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::sync::mpsc;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_retry2::strategy::ExponentialFactorBackoff;
use tokio_retry2::strategy::MaxInterval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::logs::UNKNOWN_TAIL_EXIT_CODE;
use crate::trace::Trace;

/// The exec status reason reporting a non-zero exit.
const NON_ZERO_EXIT_REASON: &str = "NonZeroExitCode";

/// The exec status cause carrying the exit code.
const EXIT_CODE_CAUSE: &str = "ExitCode";

/// The retry delays for establishing an exec or attach stream.
fn stream_retry_durations() -> impl Iterator<Item = Duration> {
    const INITIAL_DELAY_MILLIS: u64 = 1000;
    const BASE_FACTOR: f64 = 2.0;
    const MAX_DURATION: Duration = Duration::from_secs(5);
    const RETRIES: usize = 2;

    ExponentialFactorBackoff::from_millis(INITIAL_DELAY_MILLIS, BASE_FACTOR)
        .max_duration(MAX_DURATION)
        .take(RETRIES)
}

/// Helper for notifying that a stage stream failed and will be retried.
fn notify_retry(e: &Error, duration: Duration) {
    warn!(
        "stage stream failed: {e} (retrying after {duration} seconds)",
        duration = duration.as_secs()
    );
}

/// Runs a stage through the attached shell of a container.
///
/// The command references the stage script by path; the script content never
/// crosses the attach stream. The exit code arrives out of band on
/// `exit_rx`, published by the log demultiplexer when the stage's exit
/// sentinel passes through the tail.
pub async fn run_attach(
    pods: &Api<Pod>,
    pod: &str,
    container: &str,
    command: &str,
    exit_rx: &mut mpsc::Receiver<TrapExitStatus>,
    cancel: &CancellationToken,
) -> Result<()> {
    debug!("starting stage in container `{container}` with command `{command}`");

    let send = Retry::spawn_notify(
        stream_retry_durations(),
        || send_attach_command(pods, pod, container, command),
        notify_retry,
    );

    select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        sent = send => sent?,
    }

    let status = select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        status = exit_rx.recv() => status,
    };

    classify_exit(status)
}

/// Classifies the sentinel status of a stage into its result.
///
/// A missing status means the sentinel channel closed underneath the
/// driver, which is indistinguishable from an unclassified tail failure.
fn classify_exit(status: Option<TrapExitStatus>) -> Result<()> {
    let code = status
        .and_then(|status| status.command_exit_code)
        .unwrap_or(UNKNOWN_TAIL_EXIT_CODE);

    match code {
        0 => Ok(()),
        code => Err(Error::BuildFailed { code }),
    }
}

/// Writes the stage command to the container's attached stdin.
async fn send_attach_command(
    pods: &Api<Pod>,
    pod: &str,
    container: &str,
    command: &str,
) -> std::result::Result<(), RetryError<Error>> {
    let params = AttachParams::default()
        .container(container)
        .stdin(true)
        .stdout(false)
        .stderr(false);

    let mut attached = pods
        .attach(pod, &params)
        .await
        .map_err(|e| RetryError::transient(Error::Kube(e)))?;

    let mut stdin = attached.stdin().ok_or_else(|| {
        RetryError::permanent(Error::Transport("attach stream has no stdin".to_string()))
    })?;

    let mut line = command.as_bytes().to_vec();
    line.push(b'\n');

    stdin
        .write_all(&line)
        .await
        .map_err(|e| RetryError::transient(Error::Transport(e.to_string())))?;
    stdin
        .shutdown()
        .await
        .map_err(|e| RetryError::transient(Error::Transport(e.to_string())))?;
    drop(stdin);

    attached
        .join()
        .await
        .map_err(|e| RetryError::transient(Error::Transport(e.to_string())))
}

/// Runs a stage through a transient exec in a container.
///
/// The script body is streamed over stdin and stdout/stderr are wired to
/// the trace; the exit code comes from the exec status.
pub async fn run_exec(
    pods: &Api<Pod>,
    pod: &str,
    container: &str,
    command: &[String],
    script: &str,
    trace: &Trace,
    cancel: &CancellationToken,
) -> Result<()> {
    debug!("starting stage in container `{container}` with exec command {command:?}");

    let exec = Retry::spawn_notify(
        stream_retry_durations(),
        || exec_script(pods, pod, container, command, script, trace),
        notify_retry,
    );

    select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = exec => result,
    }
}

/// Executes the script once through the exec subresource.
async fn exec_script(
    pods: &Api<Pod>,
    pod: &str,
    container: &str,
    command: &[String],
    script: &str,
    trace: &Trace,
) -> std::result::Result<(), RetryError<Error>> {
    let params = AttachParams::default()
        .container(container)
        .stdin(true)
        .stdout(true)
        .stderr(true);

    let mut attached = pods
        .exec(pod, command.to_vec(), &params)
        .await
        .map_err(|e| RetryError::transient(Error::Kube(e)))?;

    let mut stdin = attached.stdin().ok_or_else(|| {
        RetryError::permanent(Error::Transport("exec stream has no stdin".to_string()))
    })?;
    let stdout = attached.stdout();
    let stderr = attached.stderr();
    let status = attached.take_status();

    stdin
        .write_all(script.as_bytes())
        .await
        .map_err(|e| RetryError::transient(Error::Transport(e.to_string())))?;
    stdin
        .shutdown()
        .await
        .map_err(|e| RetryError::transient(Error::Transport(e.to_string())))?;
    drop(stdin);

    tokio::join!(
        pump_to_trace(stdout, trace),
        pump_to_trace(stderr, trace)
    );

    let status = match status {
        Some(status) => status.await,
        None => None,
    };

    attached
        .join()
        .await
        .map_err(|e| RetryError::transient(Error::Transport(e.to_string())))?;

    let Some(status) = status else {
        // The stream closed cleanly without a status; the exec succeeded.
        return Ok(());
    };

    match exec_exit_code(&status) {
        Some(0) => Ok(()),
        Some(code) => Err(RetryError::permanent(Error::BuildFailed { code })),
        None => Err(RetryError::permanent(Error::Transport(format!(
            "exec terminated without an exit code: {message}",
            message = status.message.as_deref().unwrap_or("unknown failure")
        )))),
    }
}

/// Copies an exec output stream into the trace.
async fn pump_to_trace(read: Option<impl AsyncRead + Unpin>, trace: &Trace) {
    let Some(mut read) = read else {
        return;
    };

    let mut buffer = [0u8; 4096];

    loop {
        match read.read(&mut buffer).await {
            Ok(0) => return,
            Ok(n) => {
                if let Err(e) = trace.write_all(&buffer[..n]) {
                    warn!("error writing stage output to trace: {e}");
                }
            }
            Err(e) => {
                debug!("stage output stream ended: {e}");
                return;
            }
        }
    }
}

/// Extracts the exit code from an exec status.
///
/// A success status is exit code zero; a `NonZeroExitCode` failure carries
/// the code in its `ExitCode` cause. Anything else has no code.
fn exec_exit_code(status: &Status) -> Option<i32> {
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }

    if status.reason.as_deref() != Some(NON_ZERO_EXIT_REASON) {
        return None;
    }

    status
        .details
        .as_ref()?
        .causes
        .as_ref()?
        .iter()
        .find(|cause| cause.reason.as_deref() == Some(EXIT_CODE_CAUSE))?
        .message
        .as_deref()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::StatusCause;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::StatusDetails;

    use super::*;

    fn failure(reason: &str, causes: Vec<StatusCause>) -> Status {
        Status {
            status: Some("Failure".to_string()),
            reason: Some(reason.to_string()),
            details: Some(StatusDetails {
                causes: Some(causes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn success_status_is_exit_code_zero() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };

        assert_eq!(exec_exit_code(&status), Some(0));
    }

    #[test]
    fn non_zero_exit_carries_the_code() {
        let status = failure(
            NON_ZERO_EXIT_REASON,
            vec![StatusCause {
                reason: Some(EXIT_CODE_CAUSE.to_string()),
                message: Some("7".to_string()),
                ..Default::default()
            }],
        );

        assert_eq!(exec_exit_code(&status), Some(7));
    }

    #[test]
    fn other_failures_have_no_exit_code() {
        assert_eq!(exec_exit_code(&failure("InternalError", Vec::new())), None);

        let unparsable = failure(
            NON_ZERO_EXIT_REASON,
            vec![StatusCause {
                reason: Some(EXIT_CODE_CAUSE.to_string()),
                message: Some("seven".to_string()),
                ..Default::default()
            }],
        );
        assert_eq!(exec_exit_code(&unparsable), None);
    }

    #[test]
    fn sentinel_exit_codes_classify_the_stage_result() {
        assert!(classify_exit(Some(TrapExitStatus::exited(0))).is_ok());

        assert!(matches!(
            classify_exit(Some(TrapExitStatus::exited(7))),
            Err(Error::BuildFailed { code: 7 })
        ));

        // A closed sentinel channel degrades to the unknown tail code.
        assert!(matches!(
            classify_exit(None),
            Err(Error::BuildFailed {
                code: UNKNOWN_TAIL_EXIT_CODE
            })
        ));
    }
}
