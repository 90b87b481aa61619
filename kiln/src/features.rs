//! Cluster capability discovery.
//!
//! Some pod features are only accepted by sufficiently new API servers.
//! The checker queries the server version once per executor instance and
//! answers capability questions from the cached result. Managed clusters
//! report decorated version components such as `1+` or `14-eks-1234`; the
//! leading digits decide, and a component without leading digits is a typed
//! error that callers treat as "feature absent" rather than failing the job.

use k8s_openapi::apimachinery::pkg::version::Info;
use kube::Client;
use tokio::sync::OnceCell;

/// The minimum server version accepting host aliases in a pod spec.
const HOST_ALIASES_VERSION: (u64, u64) = (1, 7);

/// The minimum server version accepting a runtime class name in a pod spec.
const RUNTIME_CLASS_VERSION: (u64, u64) = (1, 14);

/// A server version that could not be interpreted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cluster returned unparsable version: major `{major}`, minor `{minor}`")]
pub struct BadVersionError {
    /// The reported major version component.
    major: String,

    /// The reported minor version component.
    minor: String,
}

/// An error checking a cluster capability.
#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    /// The server version could not be interpreted.
    #[error(transparent)]
    BadVersion(#[from] BadVersionError),

    /// The version query failed.
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl FeatureError {
    /// Whether the error is a bad version rather than a failed request.
    ///
    /// Bad versions are logged and degrade to "feature absent"; request
    /// failures propagate.
    pub fn is_bad_version(&self) -> bool {
        matches!(self, Self::BadVersion(_))
    }
}

/// Answers cluster capability questions, caching the server version.
pub struct FeatureChecker {
    /// The shared API client.
    client: Client,

    /// The cached version info.
    ///
    /// Only successful queries are cached; a failed query is retried on the
    /// next check.
    version: OnceCell<Info>,
}

impl FeatureChecker {
    /// Creates a checker over the given client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            version: OnceCell::new(),
        }
    }

    /// Whether the cluster accepts host aliases in a pod spec.
    pub async fn is_host_alias_supported(&self) -> Result<bool, FeatureError> {
        Ok(supports(self.version().await?, HOST_ALIASES_VERSION)?)
    }

    /// Whether the cluster accepts a runtime class name in a pod spec.
    pub async fn is_runtime_class_supported(&self) -> Result<bool, FeatureError> {
        Ok(supports(self.version().await?, RUNTIME_CLASS_VERSION)?)
    }

    /// Gets the server version, querying it on first use.
    async fn version(&self) -> Result<&Info, kube::Error> {
        self.version
            .get_or_try_init(|| async { self.client.apiserver_version().await })
            .await
    }
}

/// Whether the reported version is at least the required one.
fn supports(info: &Info, required: (u64, u64)) -> Result<bool, BadVersionError> {
    let bad_version = || BadVersionError {
        major: info.major.clone(),
        minor: info.minor.clone(),
    };

    let major = leading_number(&info.major).ok_or_else(bad_version)?;
    let minor = leading_number(&info.minor).ok_or_else(bad_version)?;

    Ok((major, minor) >= required)
}

/// Parses the leading decimal digits of a version component.
///
/// Returns `None` when the component does not start with a digit.
fn leading_number(component: &str) -> Option<u64> {
    let digits: String = component
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();

    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(major: &str, minor: &str) -> Info {
        Info {
            major: major.to_string(),
            minor: minor.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn versions_meeting_the_requirement_are_supported() {
        assert!(supports(&info("1", "7"), HOST_ALIASES_VERSION).unwrap());
        assert!(supports(&info("1", "11"), HOST_ALIASES_VERSION).unwrap());
        assert!(supports(&info("1", "14"), RUNTIME_CLASS_VERSION).unwrap());
        assert!(supports(&info("2", "0"), RUNTIME_CLASS_VERSION).unwrap());
    }

    #[test]
    fn versions_below_the_requirement_are_unsupported() {
        assert!(!supports(&info("1", "6"), HOST_ALIASES_VERSION).unwrap());
        assert!(!supports(&info("1", "11"), RUNTIME_CLASS_VERSION).unwrap());
    }

    #[test]
    fn decorated_components_use_their_leading_digits() {
        assert!(!supports(&info("1+535111", "6.^&5151111"), HOST_ALIASES_VERSION).unwrap());
        assert!(supports(&info("1*)(535111", "14^^%&5151111"), RUNTIME_CLASS_VERSION).unwrap());
    }

    #[test]
    fn components_without_leading_digits_are_bad_versions() {
        for (major, minor) in [("+1", "-14"), ("aaa", "bbb"), ("", "")] {
            let err = supports(&info(major, minor), HOST_ALIASES_VERSION).unwrap_err();
            assert!(err.to_string().contains("unparsable version"));
        }
    }
}
