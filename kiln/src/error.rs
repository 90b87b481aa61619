//! The executor error taxonomy.
//!
//! Components return typed errors; classification into coordinator-facing
//! outcomes (build failure, runner failure, abort) happens only here and in
//! the executor. A build failure carries the user script's exit code
//! verbatim and must never be reported as a runner failure, since the
//! coordinator retries runner failures on another runner.

use crate::patch::PatchError;
use crate::pull::ImagePullError;

/// An error produced while executing a job.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The runner or job configuration is invalid.
    ///
    /// Configuration errors are fatal at prepare time and are surfaced
    /// verbatim.
    #[error("configuration error: {0}")]
    Config(String),

    /// A Kubernetes API request failed.
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// A container image could not be pulled.
    #[error(transparent)]
    ImagePull(#[from] ImagePullError),

    /// A configured pod-spec patch could not be applied.
    #[error(transparent)]
    Patch(#[from] PatchError),

    /// The user script exited with a non-zero code.
    ///
    /// This is a build failure, not a runner failure.
    #[error("command terminated with exit code {code}")]
    BuildFailed {
        /// The exit code of the user script.
        code: i32,
    },

    /// The pod left the running state while the job was executing.
    #[error("pod `{name}` status is `{phase}`")]
    PodPhase {
        /// The pod name.
        name: String,
        /// The reported pod phase.
        phase: String,
    },

    /// The pod no longer exists on the cluster.
    #[error("pod `{0}` not found")]
    PodNotFound(String),

    /// The pod did not reach the running state within the configured timeout.
    #[error("timed out waiting for pod `{name}` to enter the running state")]
    PodRunningTimeout {
        /// The pod name.
        name: String,
    },

    /// An exec or attach stream failed in a way that is not retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The job was aborted.
    #[error("job aborted")]
    Cancelled,
}

impl Error {
    /// Creates a configuration error.
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the error is a clean non-zero exit of the user script.
    pub fn is_build_failure(&self) -> bool {
        matches!(self, Self::BuildFailed { .. })
    }

    /// Whether the error is a cancellation of the job.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the error reports the job pod as missing from the cluster.
    pub fn is_pod_not_found(&self) -> bool {
        matches!(self, Self::PodNotFound(_))
    }
}

/// A [`Result`](std::result::Result) with an executor [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Whether a Kubernetes API error is a "not found" response.
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;

    use super::*;

    #[test]
    fn build_failures_are_not_runner_failures() {
        let err = Error::BuildFailed { code: 7 };
        assert!(err.is_build_failure());
        assert!(!err.is_cancellation());
        assert!(!err.is_pod_not_found());
    }

    #[test]
    fn not_found_matches_only_404() {
        let not_found = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "pods \"job\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(is_not_found(&not_found));

        let forbidden = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        assert!(!is_not_found(&forbidden));
    }
}
