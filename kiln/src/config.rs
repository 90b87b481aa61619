//! The resolved runner configuration for one job.
//!
//! [`RuntimeConfig`] is the runner's Kubernetes section merged with any
//! per-job overrides the coordinator applied; it is immutable once the
//! executor is prepared. Kubernetes-shaped fields (affinity, tolerations,
//! security contexts, DNS config) use the `k8s-openapi` types directly so
//! configuration files can express anything a pod spec can.

use std::collections::BTreeMap;
use std::time::Duration;

use bon::Builder;
use k8s_openapi::api::core::v1::Affinity;
use k8s_openapi::api::core::v1::HostAlias;
use k8s_openapi::api::core::v1::Lifecycle;
use k8s_openapi::api::core::v1::PodDNSConfig;
use k8s_openapi::api::core::v1::PodSecurityContext;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kiln_shell::Shell;
use serde::Deserialize;

use crate::helper::OS_LABEL;
use crate::helper::OsType;
use crate::patch::PodSpecPatch;
use crate::pull::PullPolicy;

/// The default interval between pod status polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// The default limit on waiting for the pod to enter the running state.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(180);

/// The resolved runner configuration for one job.
#[derive(Debug, Clone, Default, Builder, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// The namespace job resources are created in.
    ///
    /// Defaults to `default`, with a warning, when empty.
    #[builder(into)]
    pub namespace: Option<String>,

    /// The service account of the job pod.
    #[builder(into)]
    pub service_account: Option<String>,

    /// The default build image when the job does not specify one.
    #[builder(into)]
    pub image: Option<String>,

    /// Overrides the resolved helper image reference.
    #[builder(into)]
    pub helper_image: Option<String>,

    /// The shell stage scripts are generated for.
    #[builder(default)]
    pub shell: Shell,

    /// Overrides the operating system inferred from the node selector.
    pub os: Option<OsType>,

    /// The Kubernetes API server URL.
    ///
    /// When absent, the client configuration is inferred from the
    /// environment (kubeconfig or in-cluster service account).
    #[builder(into)]
    pub host: Option<String>,

    /// Resource requests and limits for the build container.
    #[builder(default)]
    pub build_resources: ContainerResources,

    /// Resource requests and limits for the helper container.
    #[builder(default)]
    pub helper_resources: ContainerResources,

    /// Resource requests and limits for each service container.
    #[builder(default)]
    pub service_resources: ContainerResources,

    /// Glob patterns of images allowed for the build container.
    ///
    /// An empty list allows any image.
    #[builder(default, into)]
    pub allowed_images: Vec<String>,

    /// Glob patterns of images allowed for service containers.
    #[builder(default, into)]
    pub allowed_services: Vec<String>,

    /// The node selector of the job pod.
    #[builder(default, into)]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations of the job pod.
    #[builder(default)]
    pub tolerations: Vec<Toleration>,

    /// The affinity of the job pod.
    pub affinity: Option<Affinity>,

    /// Additional host aliases added to the job pod.
    #[builder(default)]
    pub host_aliases: Vec<HostAlias>,

    /// The DNS policy of the job pod.
    pub dns_policy: Option<DnsPolicy>,

    /// The DNS configuration of the job pod.
    pub dns_config: Option<PodDNSConfig>,

    /// The runtime class of the job pod, applied when the cluster supports
    /// runtime classes.
    #[builder(into)]
    pub runtime_class_name: Option<String>,

    /// User-configured volumes mounted into every job container.
    #[builder(default)]
    pub volumes: VolumesConfig,

    /// The ordered image pull policies; later entries are failovers.
    #[builder(default)]
    pub pull_policies: Vec<PullPolicy>,

    /// Names of pre-existing image pull secrets attached to the pod.
    #[builder(default, into)]
    pub image_pull_secrets: Vec<String>,

    /// The termination grace period of the job pod.
    pub termination_grace_period_seconds: Option<i64>,

    /// Seconds between pod status polls.
    pub poll_interval_seconds: Option<u64>,

    /// Seconds to wait for the pod to enter the running state.
    pub poll_timeout_seconds: Option<u64>,

    /// Additional labels applied to the job pod.
    #[builder(default, into)]
    pub pod_labels: BTreeMap<String, String>,

    /// Annotations applied to the job pod.
    #[builder(default, into)]
    pub pod_annotations: BTreeMap<String, String>,

    /// The pod-level security context.
    pub pod_security_context: Option<PodSecurityContext>,

    /// Whether job containers run privileged.
    pub privileged: Option<bool>,

    /// Whether job containers may gain privileges.
    pub allow_privilege_escalation: Option<bool>,

    /// Capabilities added to job containers.
    #[builder(default, into)]
    pub cap_add: Vec<String>,

    /// Capabilities dropped from job containers.
    #[builder(default, into)]
    pub cap_drop: Vec<String>,

    /// Lifecycle hooks applied to job containers.
    pub container_lifecycle: Option<Lifecycle>,

    /// Patches applied to the generated pod spec, in order.
    #[builder(default)]
    pub pod_spec_patches: Vec<PodSpecPatch>,
}

impl RuntimeConfig {
    /// The operating system of the nodes the job pod targets.
    ///
    /// An explicit configuration wins; otherwise the node selector's OS
    /// label decides, defaulting to Linux.
    pub fn os_type(&self) -> OsType {
        if let Some(os) = self.os {
            return os;
        }

        match self.node_selector.get(OS_LABEL).map(String::as_str) {
            Some("windows") => OsType::Windows,
            _ => OsType::Linux,
        }
    }

    /// The interval between pod status polls.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    /// The limit on waiting for the pod to enter the running state.
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_TIMEOUT)
    }
}

/// Resource requests and limits for one container role.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerResources {
    /// The CPU request, e.g. `500m`.
    pub cpu_request: Option<String>,

    /// The CPU limit.
    pub cpu_limit: Option<String>,

    /// The memory request, e.g. `1Gi`.
    pub memory_request: Option<String>,

    /// The memory limit.
    pub memory_limit: Option<String>,
}

impl ContainerResources {
    /// Converts the configuration into Kubernetes resource requirements.
    pub fn to_requirements(&self) -> Option<ResourceRequirements> {
        let requests = resource_list(self.cpu_request.as_deref(), self.memory_request.as_deref());
        let limits = resource_list(self.cpu_limit.as_deref(), self.memory_limit.as_deref());

        if requests.is_none() && limits.is_none() {
            return None;
        }

        Some(ResourceRequirements {
            requests,
            limits,
            ..Default::default()
        })
    }
}

/// Builds a Kubernetes resource list from optional CPU and memory values.
fn resource_list(cpu: Option<&str>, memory: Option<&str>) -> Option<BTreeMap<String, Quantity>> {
    let mut list = BTreeMap::new();

    if let Some(cpu) = cpu {
        list.insert("cpu".to_string(), Quantity(cpu.to_string()));
    }

    if let Some(memory) = memory {
        list.insert("memory".to_string(), Quantity(memory.to_string()));
    }

    (!list.is_empty()).then_some(list)
}

/// The DNS policy of the job pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DnsPolicy {
    /// Ignore cluster DNS settings.
    None,
    /// Use the node's DNS configuration.
    Default,
    /// Use cluster DNS first.
    ClusterFirst,
    /// Use cluster DNS first for pods on the host network.
    ClusterFirstWithHostNet,
}

impl DnsPolicy {
    /// The policy name as used in a Kubernetes pod spec.
    pub fn as_kubernetes(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Default => "Default",
            Self::ClusterFirst => "ClusterFirst",
            Self::ClusterFirstWithHostNet => "ClusterFirstWithHostNet",
        }
    }
}

/// User-configured volumes mounted into every job container.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VolumesConfig {
    /// Host path volumes.
    pub host_paths: Vec<HostPathVolume>,

    /// Secret volumes.
    pub secrets: Vec<SecretVolume>,

    /// Persistent volume claims.
    pub pvcs: Vec<PvcVolume>,

    /// Config map volumes.
    pub config_maps: Vec<ConfigMapVolume>,

    /// Empty directory volumes.
    pub empty_dirs: Vec<EmptyDirVolume>,

    /// CSI volumes.
    pub csi: Vec<CsiVolume>,
}

/// A host path mounted into job containers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostPathVolume {
    /// The volume name.
    pub name: String,

    /// The mount path inside the containers.
    pub mount_path: String,

    /// The sub path mounted from the volume.
    pub sub_path: Option<String>,

    /// Whether the mount is read-only.
    pub read_only: bool,

    /// The path on the host; the mount path when absent.
    pub host_path: Option<String>,
}

/// A secret mounted into job containers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecretVolume {
    /// The secret name, also used as the volume name.
    pub name: String,

    /// The mount path inside the containers.
    pub mount_path: String,

    /// The sub path mounted from the volume.
    pub sub_path: Option<String>,

    /// Whether the mount is read-only.
    pub read_only: bool,

    /// Maps secret keys to projection paths.
    pub items: BTreeMap<String, String>,
}

/// A persistent volume claim mounted into job containers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PvcVolume {
    /// The claim name, also used as the volume name.
    pub name: String,

    /// The mount path inside the containers.
    pub mount_path: String,

    /// The sub path mounted from the volume.
    pub sub_path: Option<String>,

    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// A config map mounted into job containers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigMapVolume {
    /// The config map name, also used as the volume name.
    pub name: String,

    /// The mount path inside the containers.
    pub mount_path: String,

    /// The sub path mounted from the volume.
    pub sub_path: Option<String>,

    /// Whether the mount is read-only.
    pub read_only: bool,

    /// Maps config map keys to projection paths.
    pub items: BTreeMap<String, String>,
}

/// An empty directory mounted into job containers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmptyDirVolume {
    /// The volume name.
    pub name: String,

    /// The mount path inside the containers.
    pub mount_path: String,

    /// The sub path mounted from the volume.
    pub sub_path: Option<String>,

    /// The storage medium, e.g. `Memory`.
    pub medium: Option<String>,
}

/// A CSI volume mounted into job containers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CsiVolume {
    /// The volume name.
    pub name: String,

    /// The mount path inside the containers.
    pub mount_path: String,

    /// The sub path mounted from the volume.
    pub sub_path: Option<String>,

    /// Whether the mount is read-only.
    pub read_only: bool,

    /// The CSI driver name.
    pub driver: String,

    /// The filesystem type.
    pub fs_type: Option<String>,

    /// Driver-specific attributes.
    pub volume_attributes: BTreeMap<String, String>,
}
