//! Process-wide feature flags.
//!
//! Each flag is read from the environment at most once and latched for the
//! lifetime of the process.

use std::sync::OnceLock;

/// Selects the legacy exec-based stage driver over the attach driver.
const LEGACY_EXECUTION_STRATEGY: &str = "FF_USE_LEGACY_KUBERNETES_EXECUTION_STRATEGY";

/// Selects the vendor container registry for helper images instead of
/// Docker Hub.
const REGISTRY_HELPER_IMAGE: &str = "FF_GITLAB_REGISTRY_HELPER_IMAGE";

/// Whether stages should be executed with the legacy exec strategy.
pub fn use_legacy_execution_strategy() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| env_flag(LEGACY_EXECUTION_STRATEGY))
}

/// Whether helper images should be pulled from the vendor registry.
pub fn use_registry_helper_image() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| env_flag(REGISTRY_HELPER_IMAGE))
}

/// Reads a boolean flag from the environment.
fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| is_enabled(&value))
}

/// Whether a flag value counts as enabled.
fn is_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values_enable() {
        for value in ["1", "true", "TRUE", "yes", "on", " true "] {
            assert!(is_enabled(value), "`{value}` should enable the flag");
        }
    }

    #[test]
    fn other_values_disable() {
        for value in ["", "0", "false", "no", "off", "enabled"] {
            assert!(!is_enabled(value), "`{value}` should disable the flag");
        }
    }
}
