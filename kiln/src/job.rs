//! The job description received from the coordinator.
//!
//! A [`JobSpec`] is immutable for the lifetime of one execution. The
//! executor derives every per-job name and path from it: the unique name
//! that stems all generated Kubernetes object names, the shared log and
//! scripts directories, and the per-stage script paths.

use serde::Deserialize;
use serde::Serialize;

/// A single CI job handed to the executor by the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    /// The job identifier.
    pub job_id: u64,

    /// The project identifier.
    pub project_id: u64,

    /// The image the build container runs.
    pub image: ImageSpec,

    /// Service containers started alongside the build container.
    #[serde(default)]
    pub services: Vec<ServiceSpec>,

    /// Environment variables, in coordinator order.
    #[serde(default)]
    pub variables: Vec<Variable>,

    /// The ordered stages of the job.
    #[serde(default)]
    pub stages: Vec<Stage>,

    /// The directory the repository is placed in.
    pub build_root: String,

    /// Registry credentials used to materialize the image-pull secret.
    #[serde(default)]
    pub credentials: Vec<RegistryCredential>,
}

impl JobSpec {
    /// The DNS-safe name stemming every Kubernetes object of this job.
    pub fn unique_name(&self) -> String {
        format!(
            "kiln-project-{project}-job-{job}",
            project = self.project_id,
            job = self.job_id
        )
    }

    /// The shared log directory mounted into every container of the pod.
    pub fn logs_dir(&self) -> String {
        format!(
            "/logs-{project}-{job}",
            project = self.project_id,
            job = self.job_id
        )
    }

    /// The shared log file stage output is collected in.
    pub fn log_file(&self) -> String {
        format!("{dir}/output.log", dir = self.logs_dir())
    }

    /// The directory the scripts config map is projected into.
    pub fn scripts_dir(&self) -> String {
        format!(
            "/scripts-{project}-{job}",
            project = self.project_id,
            job = self.job_id
        )
    }

    /// The projection path of a stage script.
    pub fn script_path(&self, stage: &str) -> String {
        format!("{dir}/{stage}", dir = self.scripts_dir())
    }
}

/// An image reference with its optional entrypoint and command overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageSpec {
    /// The image reference.
    pub name: String,

    /// Overrides the image's entrypoint when non-empty.
    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// Overrides the image's command when non-empty.
    #[serde(default)]
    pub command: Vec<String>,

    /// Ports the container exposes.
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

/// A service container definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// The service image.
    #[serde(flatten)]
    pub image: ImageSpec,

    /// The alias the service is reachable under from the build container.
    #[serde(default)]
    pub alias: Option<String>,
}

/// An exposed container port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// The port number.
    pub number: i32,

    /// An optional port name.
    #[serde(default)]
    pub name: Option<String>,

    /// An optional protocol (`TCP` or `UDP`).
    #[serde(default)]
    pub protocol: Option<String>,
}

/// An environment variable passed to job containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    /// The variable name.
    pub key: String,

    /// The variable value.
    pub value: String,
}

/// One stage of the job: a name and the script body to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// The stage name, used as the script's config-map key.
    pub name: String,

    /// The script body.
    pub script: String,
}

/// A registry credential provided by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCredential {
    /// The registry host.
    pub registry: String,

    /// The user name.
    pub username: String,

    /// The password or token.
    pub password: String,
}

/// The command for one stage execution.
#[derive(Debug, Clone)]
pub struct StageCommand {
    /// The stage name, selecting the script the stage driver executes.
    pub stage: String,

    /// The script body, used by the legacy exec driver.
    pub script: String,

    /// Whether the stage is a predefined runner stage executed in the helper
    /// container rather than a user stage executed in the build container.
    pub predefined: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobSpec {
        JobSpec {
            job_id: 42,
            project_id: 7,
            ..Default::default()
        }
    }

    #[test]
    fn names_and_paths_derive_from_identifiers() {
        let job = job();

        assert_eq!(job.unique_name(), "kiln-project-7-job-42");
        assert_eq!(job.logs_dir(), "/logs-7-42");
        assert_eq!(job.log_file(), "/logs-7-42/output.log");
        assert_eq!(job.scripts_dir(), "/scripts-7-42");
        assert_eq!(job.script_path("step_script"), "/scripts-7-42/step_script");
    }
}
