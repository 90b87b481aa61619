//! Helper image resolution.
//!
//! Every job pod carries a helper container built from the runner's own
//! helper image. It hosts the predefined stages (clone, cache, artifacts)
//! and publishes the shared log file. The image reference is derived from
//! the runner version and the target node's operating system and
//! architecture, unless the configuration overrides it outright.

use serde::Deserialize;
use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::flags;

/// The node label carrying the operating system.
pub const OS_LABEL: &str = "kubernetes.io/os";

/// The node label carrying the CPU architecture.
pub const ARCH_LABEL: &str = "kubernetes.io/arch";

/// The node label referencing a specific Windows build.
pub const WINDOWS_BUILD_LABEL: &str = "node.kubernetes.io/windows-build";

/// The Docker Hub helper repository.
const DOCKER_HUB_IMAGE: &str = "kilnci/kiln-helper";

/// The vendor registry helper repository.
const REGISTRY_IMAGE: &str = "registry.kiln-ci.io/kiln/kiln-helper";

/// The operating system of the node the job pod is scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    /// Linux nodes.
    #[default]
    Linux,
    /// Windows nodes.
    Windows,
}

/// The resolved helper image for one job.
#[derive(Debug, Clone)]
pub struct HelperImage {
    /// The full image reference.
    reference: String,

    /// The command executing a predefined stage script from standard input.
    command: Vec<String>,

    /// The operating system the image targets.
    os: OsType,
}

impl HelperImage {
    /// Resolves the helper image for the given configuration.
    pub fn resolve(config: &RuntimeConfig) -> Self {
        let os = config.os_type();
        let command = vec!["kiln-runner-build".to_string()];

        if let Some(reference) = &config.helper_image {
            return Self {
                reference: reference.clone(),
                command,
                os,
            };
        }

        let repository = if flags::use_registry_helper_image() {
            REGISTRY_IMAGE
        } else {
            DOCKER_HUB_IMAGE
        };

        let arch = config
            .node_selector
            .get(ARCH_LABEL)
            .map(String::as_str)
            .unwrap_or("amd64");

        let flavor = match os {
            OsType::Linux => String::new(),
            OsType::Windows => {
                let build = config
                    .node_selector
                    .get(WINDOWS_BUILD_LABEL)
                    .map(String::as_str)
                    .unwrap_or("ltsc2022");
                format!("-windows-{build}")
            }
        };

        Self {
            reference: format!(
                "{repository}:{arch}-v{version}{flavor}",
                version = env!("CARGO_PKG_VERSION")
            ),
            command,
            os,
        }
    }

    /// The full image reference.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// The command executing a predefined stage script from standard input.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// The operating system the image targets.
    pub fn os(&self) -> OsType {
        self.os
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_amd64_is_the_default() {
        let image = HelperImage::resolve(&RuntimeConfig::default());

        assert!(
            image.reference().starts_with("kilnci/kiln-helper:amd64-v"),
            "unexpected reference `{}`",
            image.reference()
        );
        assert_eq!(image.os(), OsType::Linux);
    }

    #[test]
    fn node_selector_labels_refine_the_image() {
        let config = RuntimeConfig::builder()
            .node_selector([
                (OS_LABEL.to_string(), "windows".to_string()),
                (ARCH_LABEL.to_string(), "arm64".to_string()),
                (WINDOWS_BUILD_LABEL.to_string(), "ltsc2019".to_string()),
            ])
            .build();

        let image = HelperImage::resolve(&config);

        assert_eq!(image.os(), OsType::Windows);
        assert!(image.reference().contains(":arm64-v"));
        assert!(image.reference().ends_with("-windows-ltsc2019"));
    }

    #[test]
    fn configured_override_wins() {
        let config = RuntimeConfig::builder()
            .helper_image("registry.example.com/ci/helper:pinned".to_string())
            .build();

        let image = HelperImage::resolve(&config);

        assert_eq!(image.reference(), "registry.example.com/ci/helper:pinned");
    }
}
