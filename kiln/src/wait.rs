//! Pod readiness and status watching.
//!
//! The readiness watcher polls a freshly created pod until it first enters
//! the running phase, surfacing image-pull progress to the trace so users
//! see where pull latency goes. The status watcher guards an active stage:
//! it keeps polling in the background and reports the first fatal phase so
//! the stage driver is not left waiting on a pod that no longer runs.

use std::time::Duration;

use k8s_openapi::api::core::v1::ContainerStatus;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error;
use crate::error::Error;
use crate::error::Result;
use crate::pull::ImagePullError;
use crate::trace::Trace;

/// Container waiting reasons reported for image pull failures.
const IMAGE_PULL_FAILURE_REASONS: &[&str] =
    &["ErrImagePull", "ImagePullBackOff", "InvalidImageName"];

/// The observed readiness of a pod.
#[derive(Debug)]
enum Readiness {
    /// The pod is running.
    Running,

    /// The pod has not started yet.
    Pending {
        /// The reported phase.
        phase: String,

        /// Per-container progress lines for the trace.
        progress: Vec<String>,
    },
}

/// Waits for the pod to enter the running phase.
///
/// Returns an error when the pod reaches a phase it cannot run from, when an
/// image pull fails, when the pod disappears, or when the configured timeout
/// elapses. Transient API failures are logged and polling continues.
pub async fn wait_for_pod_running(
    pods: &Api<Pod>,
    name: &str,
    trace: &Trace,
    poll_interval: Duration,
    poll_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = time::Instant::now() + poll_timeout;

    loop {
        match pods.get(name).await {
            Ok(pod) => match assess(&pod, name)? {
                Readiness::Running => {
                    debug!("pod `{name}` is running");
                    return Ok(());
                }
                Readiness::Pending { phase, progress } => {
                    trace.message(&format!(
                        "Waiting for pod `{name}` to be running, status is {phase}"
                    ));
                    for line in progress {
                        trace.message(&line);
                    }
                }
            },
            Err(err) if error::is_not_found(&err) => {
                return Err(Error::PodNotFound(name.to_string()));
            }
            Err(err) => {
                warn!("getting job pod status: {err}");
            }
        }

        if time::Instant::now() >= deadline {
            return Err(Error::PodRunningTimeout {
                name: name.to_string(),
            });
        }

        select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = time::sleep(poll_interval) => {}
        }
    }
}

/// Spawns a background watcher reporting the first fatal pod status.
///
/// The receiver yields at most one error. The channel is buffered so the
/// watcher can publish and exit even when the consumer has already moved on.
pub fn watch_pod_status(
    pods: Api<Pod>,
    name: String,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> mpsc::Receiver<Error> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut interval = time::interval(poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = check_pod_status(&pods, &name).await {
                        let _ = tx.send(err).await;
                        break;
                    }
                }
            }
        }
    });

    rx
}

/// Checks that the pod still exists and is running.
async fn check_pod_status(pods: &Api<Pod>, name: &str) -> Result<()> {
    let pod = match pods.get(name).await {
        Ok(pod) => pod,
        Err(err) if error::is_not_found(&err) => {
            return Err(Error::PodNotFound(name.to_string()));
        }
        Err(err) => {
            // General request failure; leave it to the next poll.
            warn!("getting job pod status: {err}");
            return Ok(());
        }
    };

    let phase = phase(&pod);
    if phase != "Running" {
        return Err(Error::PodPhase {
            name: name.to_string(),
            phase: phase.to_string(),
        });
    }

    Ok(())
}

/// Assesses a pod's readiness from its status.
fn assess(pod: &Pod, name: &str) -> Result<Readiness> {
    match phase(pod) {
        "Running" => Ok(Readiness::Running),
        "Succeeded" | "Failed" | "Unknown" => Err(Error::PodPhase {
            name: name.to_string(),
            phase: phase(pod).to_string(),
        }),
        pending => {
            if let Some(err) = image_pull_failure(pod) {
                return Err(err.into());
            }

            Ok(Readiness::Pending {
                phase: pending.to_string(),
                progress: progress_lines(pod),
            })
        }
    }
}

/// The reported phase of a pod, defaulting to `Pending`.
fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or("Pending")
}

/// All container statuses of a pod, init containers included.
fn container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    pod.status
        .as_ref()
        .into_iter()
        .flat_map(|status| {
            status
                .init_container_statuses
                .iter()
                .chain(status.container_statuses.iter())
        })
        .flatten()
}

/// Finds an image pull failure among the pod's container statuses.
fn image_pull_failure(pod: &Pod) -> Option<ImagePullError> {
    container_statuses(pod).find_map(|status| {
        let waiting = status.state.as_ref()?.waiting.as_ref()?;
        let reason = waiting.reason.as_deref()?;

        IMAGE_PULL_FAILURE_REASONS
            .contains(&reason)
            .then(|| ImagePullError {
                image: status.image.clone(),
                message: waiting
                    .message
                    .clone()
                    .unwrap_or_else(|| reason.to_string()),
            })
    })
}

/// Builds per-container progress lines for the trace.
fn progress_lines(pod: &Pod) -> Vec<String> {
    container_statuses(pod)
        .filter_map(|status| {
            let waiting = status.state.as_ref()?.waiting.as_ref()?;
            let reason = waiting.reason.as_deref().unwrap_or("Waiting");

            Some(match &waiting.message {
                Some(message) => format!("\t{name}: {reason}: {message}", name = status.name),
                None => format!("\t{name}: {reason}", name = status.name),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ContainerState;
    use k8s_openapi::api::core::v1::ContainerStateWaiting;
    use k8s_openapi::api::core::v1::PodStatus;

    use super::*;

    fn pod(phase: &str, statuses: Vec<ContainerStatus>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(statuses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn waiting(name: &str, image: &str, reason: &str, message: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            image: image.to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    message: message.map(str::to_string),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn running_pods_are_ready() {
        assert!(matches!(
            assess(&pod("Running", Vec::new()), "job").unwrap(),
            Readiness::Running
        ));
    }

    #[test]
    fn pending_pods_report_progress() {
        let pod = pod(
            "Pending",
            vec![waiting(
                "build",
                "busybox:latest",
                "ContainerCreating",
                None,
            )],
        );

        match assess(&pod, "job").unwrap() {
            Readiness::Pending { phase, progress } => {
                assert_eq!(phase, "Pending");
                assert_eq!(progress, ["\tbuild: ContainerCreating"]);
            }
            Readiness::Running => panic!("pod should be pending"),
        }
    }

    #[test]
    fn fatal_phases_are_pod_phase_errors() {
        for phase in ["Failed", "Unknown", "Succeeded"] {
            let err = assess(&pod(phase, Vec::new()), "job").unwrap_err();
            assert!(
                matches!(&err, Error::PodPhase { phase: p, .. } if p == phase),
                "unexpected error for `{phase}`: {err}"
            );
        }
    }

    #[test]
    fn image_pull_failures_carry_the_image() {
        let pod = pod(
            "Pending",
            vec![waiting(
                "build",
                "registry.example.com/ci:1",
                "ErrImagePull",
                Some("401 Unauthorized"),
            )],
        );

        match assess(&pod, "job").unwrap_err() {
            Error::ImagePull(err) => {
                assert_eq!(err.image, "registry.example.com/ci:1");
                assert_eq!(err.message, "401 Unauthorized");
            }
            err => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn image_pull_backoff_is_also_a_pull_failure() {
        let pod = pod(
            "Pending",
            vec![waiting("svc-0", "postgres:16", "ImagePullBackOff", None)],
        );

        assert!(matches!(
            assess(&pod, "job").unwrap_err(),
            Error::ImagePull(_)
        ));
    }

    #[test]
    fn missing_status_counts_as_pending() {
        let pod = Pod::default();
        assert!(matches!(
            assess(&pod, "job").unwrap(),
            Readiness::Pending { .. }
        ));
    }
}
