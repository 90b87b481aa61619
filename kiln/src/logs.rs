//! Log tailing with resumable reads.
//!
//! The helper container publishes the shared log file on its stdout, and the
//! tailer follows it through the pod-log API. Disconnects are routine — node
//! restarts, API server rollouts, plain stream resets — so the tailer
//! reconnects with exponential backoff for as long as the job runs, and a
//! byte offset of consumed lines guarantees that no line is delivered twice
//! across reconnects: every connection re-reads the helper's view of the
//! file from the start and skips what was already consumed.

use std::time::Duration;

use futures::AsyncBufRead;
use futures::AsyncBufReadExt;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time;
use tokio_retry2::strategy::ExponentialFactorBackoff;
use tokio_retry2::strategy::MaxInterval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error;

/// The exit code reported when the log file never became available.
pub const LOG_UNAVAILABLE_EXIT_CODE: i32 = 100;

/// The exit code reported for unclassified tail failures.
pub const UNKNOWN_TAIL_EXIT_CODE: i32 = 1000;

/// How long a missing log stream is tolerated before turning fatal.
///
/// The helper container needs a moment after the pod reports running before
/// its tail has the log file open.
const WAIT_LOG_FILE_TIMEOUT: Duration = Duration::from_secs(60);

/// The initial reconnect delay.
const BACKOFF_MIN_MILLIS: u64 = 1000;

/// The growth factor of the reconnect delay.
const BACKOFF_FACTOR: f64 = 2.0;

/// The longest reconnect delay.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// A fatal log tailing error.
#[derive(Debug, thiserror::Error)]
pub enum TailError {
    /// The log stream did not become available in time.
    #[error("timed out waiting for the job log stream to become available")]
    Unavailable,

    /// The log stream is permanently gone.
    #[error("job log stream terminated: {0}")]
    Terminated(String),
}

impl TailError {
    /// The synthetic exit code reported for the error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Unavailable => LOG_UNAVAILABLE_EXIT_CODE,
            Self::Terminated(_) => UNKNOWN_TAIL_EXIT_CODE,
        }
    }
}

/// Tracks consumed stream bytes across reconnects.
///
/// Offsets are recorded at line boundaries; a resumed read skips whole lines
/// until the recorded offset is reached.
struct Resume {
    /// Total bytes of delivered lines, including their newlines.
    offset: u64,

    /// Bytes still to skip on the current connection.
    skip: u64,
}

impl Resume {
    /// Creates a tracker with nothing consumed.
    fn new() -> Self {
        Self { offset: 0, skip: 0 }
    }

    /// Starts a new connection, arming the skip window.
    fn reconnect(&mut self) {
        self.skip = self.offset;
    }

    /// Decides whether a line read from the stream should be delivered.
    ///
    /// Lines inside the skip window were delivered by a previous connection.
    fn admit(&mut self, line: &str) -> bool {
        let len = line.len() as u64 + 1;

        if self.skip >= len {
            self.skip -= len;
            return false;
        }

        self.skip = 0;
        self.offset += len;
        true
    }
}

/// How one log connection ended.
enum ConnectionEnd {
    /// The consumer or the job is gone; stop tailing.
    Stopped,

    /// The stream ended or failed; reconnect.
    Disconnected,
}

/// Follows the helper container's log stream.
pub struct LogTailer {
    /// The pods API.
    pods: Api<Pod>,

    /// The pod name.
    pod: String,

    /// The container whose logs are followed.
    container: String,
}

impl LogTailer {
    /// Creates a tailer for a container of the given pod.
    pub fn new(pods: Api<Pod>, pod: String, container: String) -> Self {
        Self {
            pods,
            pod,
            container,
        }
    }

    /// Starts tailing, returning the line and error channels.
    ///
    /// The line channel yields every log line exactly once, in order. The
    /// error channel yields at most one fatal error; transient failures are
    /// retried internally until `cancel` fires.
    pub fn process(
        self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<String>, mpsc::Receiver<TailError>) {
        let (lines_tx, lines_rx) = mpsc::channel(64);
        let (err_tx, err_rx) = mpsc::channel(1);

        tokio::spawn(self.run(cancel, lines_tx, err_tx));

        (lines_rx, err_rx)
    }

    /// The tailing loop.
    async fn run(
        self,
        cancel: CancellationToken,
        lines_tx: mpsc::Sender<String>,
        err_tx: mpsc::Sender<TailError>,
    ) {
        let params = LogParams {
            container: Some(self.container.clone()),
            follow: true,
            ..Default::default()
        };

        let mut resume = Resume::new();
        let mut backoff = reconnect_backoff();
        let mut unavailable_since: Option<time::Instant> = None;

        loop {
            let connection = select! {
                biased;
                _ = cancel.cancelled() => return,
                connection = self.pods.log_stream(&self.pod, &params) => connection,
            };

            match connection {
                Ok(read) => {
                    unavailable_since = None;
                    resume.reconnect();

                    match consume(read, &mut resume, &lines_tx, &cancel).await {
                        ConnectionEnd::Stopped => return,
                        ConnectionEnd::Disconnected => {}
                    }

                    backoff = reconnect_backoff();
                }
                Err(err) if is_log_unavailable(&err) => {
                    let since = *unavailable_since.get_or_insert_with(time::Instant::now);
                    if since.elapsed() >= WAIT_LOG_FILE_TIMEOUT {
                        let _ = err_tx.send(TailError::Unavailable).await;
                        return;
                    }

                    debug!("job log stream is not available yet: {err}");
                }
                Err(err) if error::is_not_found(&err) => {
                    let _ = err_tx.send(TailError::Terminated(err.to_string())).await;
                    return;
                }
                Err(err) => {
                    warn!("connecting to the job log stream: {err}");
                }
            }

            let delay = backoff.next().expect("backoff iterator is unbounded");
            select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
        }
    }
}

/// Consumes one log connection until it ends.
async fn consume(
    read: impl AsyncBufRead + Unpin,
    resume: &mut Resume,
    lines_tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> ConnectionEnd {
    let mut lines = read.lines();

    loop {
        let next = select! {
            biased;
            _ = cancel.cancelled() => return ConnectionEnd::Stopped,
            next = lines.next() => next,
        };

        match next {
            Some(Ok(line)) => {
                if !resume.admit(&line) {
                    continue;
                }

                if lines_tx.send(line).await.is_err() {
                    return ConnectionEnd::Stopped;
                }
            }
            Some(Err(err)) => {
                warn!("reading the job log stream: {err}");
                return ConnectionEnd::Disconnected;
            }
            None => return ConnectionEnd::Disconnected,
        }
    }
}

/// The reconnect delay sequence.
fn reconnect_backoff() -> impl Iterator<Item = Duration> {
    ExponentialFactorBackoff::from_millis(BACKOFF_MIN_MILLIS, BACKOFF_FACTOR)
        .max_duration(BACKOFF_MAX)
}

/// Whether a log request failed because the stream is not available yet.
///
/// The API answers 400 while the target container has not started its
/// process.
fn is_log_unavailable(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 400)
}
