//! Pull-policy management with per-image failover.
//!
//! The runner configuration carries an ordered list of pull policies. Every
//! container of a job starts out on the first policy; when the cluster
//! reports a pull failure for an image, the manager advances that image to
//! the next policy and the executor retries pod creation. Advancement is
//! monotone per image: a policy that failed is never retried for the same
//! image within one job.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::trace::Trace;

/// A Kubernetes image pull policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Always pull the image.
    Always,
    /// Pull the image only when it is not present on the node.
    IfNotPresent,
    /// Never pull the image.
    Never,
}

impl PullPolicy {
    /// The policy name as used in a Kubernetes container spec.
    pub fn as_kubernetes(self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_kubernetes())
    }
}

/// A failure to pull a container image.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to pull image `{image}`: {message}")]
pub struct ImagePullError {
    /// The image that could not be pulled.
    pub image: String,

    /// The message reported by the cluster.
    pub message: String,
}

/// Tracks the effective pull policy for every image of a job.
pub struct PullManager {
    /// The configured policies, in failover order.
    policies: Vec<PullPolicy>,

    /// The index of the current policy, per image.
    current: HashMap<String, usize>,

    /// The job trace, informed about failovers.
    trace: Trace,
}

impl PullManager {
    /// Creates a manager for the given policy order.
    ///
    /// An empty list defaults to a single [`PullPolicy::Always`] entry.
    pub fn new(policies: Vec<PullPolicy>, trace: Trace) -> Self {
        let policies = if policies.is_empty() {
            vec![PullPolicy::Always]
        } else {
            policies
        };

        Self {
            policies,
            current: HashMap::new(),
            trace,
        }
    }

    /// Gets the current pull policy for an image.
    pub fn policy_for(&self, image: &str) -> Result<PullPolicy, Error> {
        let index = self.current.get(image).copied().unwrap_or(0);

        self.policies.get(index).copied().ok_or_else(|| {
            Error::config(format!("no pull policy remaining for image `{image}`"))
        })
    }

    /// Advances the policy for the failed image.
    ///
    /// Returns `true` if another policy is available and the caller should
    /// retry pod creation, `false` if the policy list is exhausted and the
    /// job should fail with the pull error.
    pub fn update_policy_for(&mut self, attempt: usize, err: &ImagePullError) -> bool {
        let index = self.current.entry(err.image.clone()).or_insert(0);
        let failed = self.policies[*index];

        let Some(next) = self.policies.get(*index + 1).copied() else {
            self.trace.message(&format!(
                "Failed to pull image `{image}` with policy `{failed}`: {message}",
                image = err.image,
                message = err.message,
            ));
            return false;
        };

        *index += 1;

        self.trace.warning(&format!(
            "Failed to pull image `{image}` with policy `{failed}`: {message} (attempt {attempt}); \
             retrying with policy `{next}`",
            image = err.image,
            message = err.message,
        ));

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::tests::SharedBuffer;

    fn manager(policies: Vec<PullPolicy>) -> (PullManager, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let trace = Trace::new(buffer.clone());
        (PullManager::new(policies, trace), buffer)
    }

    fn pull_error(image: &str) -> ImagePullError {
        ImagePullError {
            image: image.to_string(),
            message: "401 Unauthorized".to_string(),
        }
    }

    #[test]
    fn first_policy_is_used_initially() {
        let (manager, _) = manager(vec![PullPolicy::Always, PullPolicy::IfNotPresent]);

        assert_eq!(
            manager.policy_for("alpine:latest").unwrap(),
            PullPolicy::Always
        );
    }

    #[test]
    fn empty_configuration_defaults_to_always() {
        let (manager, _) = manager(Vec::new());

        assert_eq!(manager.policy_for("busybox").unwrap(), PullPolicy::Always);
    }

    #[test]
    fn failure_advances_to_the_next_policy() {
        let (mut manager, buffer) = manager(vec![PullPolicy::Always, PullPolicy::IfNotPresent]);

        assert!(manager.update_policy_for(1, &pull_error("busybox")));
        assert_eq!(
            manager.policy_for("busybox").unwrap(),
            PullPolicy::IfNotPresent
        );
        assert!(buffer.contents().contains("retrying with policy"));
    }

    #[test]
    fn exhausted_policies_stop_the_retry_loop() {
        let (mut manager, _) = manager(vec![PullPolicy::Always, PullPolicy::IfNotPresent]);

        assert!(manager.update_policy_for(1, &pull_error("busybox")));
        assert!(!manager.update_policy_for(2, &pull_error("busybox")));

        // The cursor does not move past the last policy.
        assert_eq!(
            manager.policy_for("busybox").unwrap(),
            PullPolicy::IfNotPresent
        );
    }

    #[test]
    fn advancement_is_tracked_per_image() {
        let (mut manager, _) = manager(vec![PullPolicy::Always, PullPolicy::IfNotPresent]);

        assert!(manager.update_policy_for(1, &pull_error("busybox")));

        assert_eq!(
            manager.policy_for("busybox").unwrap(),
            PullPolicy::IfNotPresent
        );
        assert_eq!(
            manager.policy_for("postgres:16").unwrap(),
            PullPolicy::Always
        );
    }
}
