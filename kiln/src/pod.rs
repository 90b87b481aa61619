//! Pod construction.
//!
//! Translates a job spec and the runtime configuration into a complete pod
//! object. Construction is deterministic and free of side effects: the
//! resource manager is handed the finished object, and the proxy pool
//! assembled here is what drives proxy-service creation after the pod
//! exists.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::CSIVolumeSource;
use k8s_openapi::api::core::v1::Capabilities;
use k8s_openapi::api::core::v1::ConfigMapVolumeSource;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::ContainerPort;
use k8s_openapi::api::core::v1::EmptyDirVolumeSource;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::HostAlias;
use k8s_openapi::api::core::v1::HostPathVolumeSource;
use k8s_openapi::api::core::v1::KeyToPath;
use k8s_openapi::api::core::v1::LocalObjectReference;
use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::SecretVolumeSource;
use k8s_openapi::api::core::v1::SecurityContext;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use kiln_shell::Shell;
use kube::api::ObjectMeta;

use crate::config::RuntimeConfig;
use crate::dns;
use crate::error::Error;
use crate::error::Result;
use crate::helper::HelperImage;
use crate::helper::OsType;
use crate::job::ImageSpec;
use crate::job::JobSpec;
use crate::job::PortSpec;
use crate::patch;
use crate::pull::PullManager;

/// The name of the build container.
pub const BUILD_CONTAINER: &str = "build";

/// The name of the helper container.
pub const HELPER_CONTAINER: &str = "helper";

/// The name of the permissions init container.
pub const INIT_PERMISSIONS_CONTAINER: &str = "init-permissions";

/// The label linking proxy services to the job pod.
pub const POD_LABEL: &str = "pod";

/// The name of the scripts config-map volume.
const SCRIPTS_VOLUME: &str = "scripts";

/// The name of the shared log volume.
const LOGS_VOLUME: &str = "logs";

/// The name of the fallback build-root volume.
const REPO_VOLUME: &str = "repo";

/// The projection mode of stage scripts on Linux.
const SCRIPTS_VOLUME_MODE: i32 = 0o777;

/// A pod builder output: the pod and the assembled proxy pool.
#[derive(Debug)]
pub struct BuiltPod {
    /// The pod object, ready for creation.
    pub pod: Pod,

    /// Proxy-service names mapped to the ports they expose.
    pub proxies: BTreeMap<String, Vec<PortSpec>>,
}

/// Builds the job pod from a job spec and the runtime configuration.
pub struct PodBuilder<'a> {
    /// The job being executed.
    pub job: &'a JobSpec,

    /// The runtime configuration.
    pub config: &'a RuntimeConfig,

    /// The pull-policy manager, consulted per container image.
    pub pull: &'a PullManager,

    /// The resolved helper image.
    pub helper_image: &'a HelperImage,

    /// The shell stage scripts are generated for.
    pub shell: Shell,

    /// The name of the created scripts config map.
    ///
    /// `None` selects the legacy exec layout, which mounts no scripts or
    /// logs volume and runs no init container.
    pub scripts_config_map: Option<&'a str>,

    /// The name of the created image-pull secret, if any.
    pub credentials_secret: Option<&'a str>,

    /// Whether the cluster accepts host aliases.
    pub host_aliases_supported: bool,

    /// Whether the cluster accepts runtime classes.
    pub runtime_class_supported: bool,

    /// Whether a fallback build-root volume is needed.
    pub build_root_volume_required: bool,
}

/// Whether no configured volume already covers the build root.
///
/// The decision is memoised per executor instance by the caller.
pub fn build_root_volume_required(config: &RuntimeConfig, job: &JobSpec) -> bool {
    let volumes = &config.volumes;

    let mut mount_paths = volumes
        .host_paths
        .iter()
        .map(|v| v.mount_path.as_str())
        .chain(volumes.secrets.iter().map(|v| v.mount_path.as_str()))
        .chain(volumes.pvcs.iter().map(|v| v.mount_path.as_str()))
        .chain(volumes.config_maps.iter().map(|v| v.mount_path.as_str()))
        .chain(volumes.empty_dirs.iter().map(|v| v.mount_path.as_str()))
        .chain(volumes.csi.iter().map(|v| v.mount_path.as_str()));

    !mount_paths.any(|path| path == job.build_root)
}

impl PodBuilder<'_> {
    /// Builds the pod object and the proxy pool.
    pub fn build(&self) -> Result<BuiltPod> {
        let mut proxies = BTreeMap::new();

        let build_image = self.job.image.name.clone();
        if build_image.is_empty() {
            return Err(Error::config("no build image specified"));
        }

        let build_container = self.container(
            BUILD_CONTAINER,
            build_image,
            &self.job.image,
            self.config.build_resources.to_requirements(),
            self.shell_command(),
        )?;
        self.register_proxy(&mut proxies, BUILD_CONTAINER, None, &self.job.image.ports);

        let helper_definition = ImageSpec::default();
        let helper_container = self.container(
            HELPER_CONTAINER,
            self.helper_image.reference().to_string(),
            &helper_definition,
            self.config.helper_resources.to_requirements(),
            self.helper_command(),
        )?;

        let mut containers = vec![build_container, helper_container];

        for (i, service) in self.job.services.iter().enumerate() {
            let name = format!("svc-{i}");
            let container = self.container(
                &name,
                service.image.name.clone(),
                &service.image,
                self.config.service_resources.to_requirements(),
                Vec::new(),
            )?;
            self.register_proxy(
                &mut proxies,
                &name,
                service.alias.as_deref(),
                &service.image.ports,
            );
            containers.push(container);
        }

        let mut spec = PodSpec {
            volumes: some_if_not_empty(self.volumes()),
            service_account_name: self.config.service_account.clone(),
            restart_policy: Some("Never".to_string()),
            node_selector: some_if_not_empty_map(self.config.node_selector.clone()),
            tolerations: some_if_not_empty(self.config.tolerations.clone()),
            init_containers: self
                .scripts_config_map
                .is_some()
                .then(|| vec![self.init_permissions_container()]),
            containers,
            termination_grace_period_seconds: self.config.termination_grace_period_seconds,
            image_pull_secrets: some_if_not_empty(self.image_pull_secrets()),
            security_context: self.config.pod_security_context.clone(),
            host_aliases: self.host_aliases(),
            affinity: self.config.affinity.clone(),
            dns_policy: self.config.dns_policy.map(|p| p.as_kubernetes().to_string()),
            dns_config: self.config.dns_config.clone(),
            runtime_class_name: self
                .runtime_class_supported
                .then(|| self.config.runtime_class_name.clone())
                .flatten(),
            ..Default::default()
        };

        spec = patch::apply(&spec, &self.config.pod_spec_patches)?;

        let unique = self.job.unique_name();
        let mut labels = BTreeMap::from([(POD_LABEL.to_string(), unique.clone())]);
        labels.extend(self.config.pod_labels.clone());

        let pod = Pod {
            metadata: ObjectMeta {
                generate_name: Some(format!("{unique}-")),
                namespace: self.config.namespace.clone(),
                labels: Some(labels),
                annotations: some_if_not_empty_map(self.config.pod_annotations.clone()),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        };

        Ok(BuiltPod { pod, proxies })
    }

    /// Builds one job container.
    fn container(
        &self,
        name: &str,
        image: String,
        definition: &ImageSpec,
        resources: Option<ResourceRequirements>,
        default_command: Vec<String>,
    ) -> Result<Container> {
        self.verify_allowed_image(name, &image)?;

        let pull_policy = self.pull.policy_for(&image)?;

        let ports = definition
            .ports
            .iter()
            .map(|port| ContainerPort {
                container_port: port.number,
                protocol: port.protocol.clone(),
                ..Default::default()
            })
            .collect::<Vec<_>>();

        let (command, args) = command_and_args(definition, default_command);

        Ok(Container {
            name: name.to_string(),
            image: Some(image),
            image_pull_policy: Some(pull_policy.as_kubernetes().to_string()),
            command,
            args,
            env: some_if_not_empty(
                self.job
                    .variables
                    .iter()
                    .map(|variable| EnvVar {
                        name: variable.key.clone(),
                        value: Some(variable.value.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            resources,
            ports: some_if_not_empty(ports),
            volume_mounts: some_if_not_empty(self.volume_mounts()),
            security_context: Some(SecurityContext {
                privileged: self.config.privileged,
                allow_privilege_escalation: self.config.allow_privilege_escalation,
                capabilities: self.capabilities(),
                ..Default::default()
            }),
            lifecycle: self.config.container_lifecycle.clone(),
            stdin: Some(true),
            ..Default::default()
        })
    }

    /// Checks a container image against the configured allow lists.
    fn verify_allowed_image(&self, container: &str, image: &str) -> Result<()> {
        let (option, allowed) = if container.starts_with("svc-") {
            ("services", self.config.allowed_services.as_slice())
        } else if container == BUILD_CONTAINER {
            ("images", self.config.allowed_images.as_slice())
        } else {
            return Ok(());
        };

        if allowed.is_empty() {
            return Ok(());
        }

        let internal = [
            self.config.image.as_deref().unwrap_or_default(),
            self.helper_image.reference(),
        ];
        if internal.contains(&image) {
            return Ok(());
        }

        if allowed.iter().any(|pattern| glob_match(pattern, image)) {
            return Ok(());
        }

        Err(Error::config(format!(
            "the image `{image}` is not present on the list of allowed {option}"
        )))
    }

    /// Records a container's ports in the proxy pool.
    ///
    /// The service name is the DNS-safe alias when one is usable; otherwise
    /// the container name, prefixed with `proxy-` for non-build containers.
    /// A name collision also falls back to the prefixed container name.
    fn register_proxy(
        &self,
        proxies: &mut BTreeMap<String, Vec<PortSpec>>,
        container: &str,
        alias: Option<&str>,
        ports: &[PortSpec],
    ) {
        if ports.is_empty() {
            return;
        }

        let fallback = || {
            if container == BUILD_CONTAINER {
                container.to_string()
            } else {
                format!("proxy-{container}")
            }
        };

        let mut name = alias.map(dns::make_rfc1123_compatible).unwrap_or_default();
        if name.is_empty() || proxies.contains_key(&name) {
            name = fallback();
        }

        proxies.insert(name, ports.to_vec());
    }

    /// The long-lived command of the build container.
    ///
    /// The container idles in a shell reading standard input; the stage
    /// driver feeds it commands over the attach stream.
    fn shell_command(&self) -> Vec<String> {
        match self.shell {
            Shell::Pwsh => pwsh_stdin_command(),
            _ => vec![
                "sh".to_string(),
                "-c".to_string(),
                kiln_shell::DETECT_SHELL_SCRIPT.to_string(),
            ],
        }
    }

    /// The long-lived command of the helper container.
    ///
    /// A background tail publishes the shared log file on the container's
    /// stdout, where the log tailer picks it up through the pod-log API,
    /// while the foreground shell accepts attach input for predefined
    /// stages. The legacy layout has no shared log file and runs a plain
    /// shell.
    fn helper_command(&self) -> Vec<String> {
        if self.scripts_config_map.is_none() {
            return match self.helper_image.os() {
                OsType::Linux => vec!["sh".to_string()],
                OsType::Windows => pwsh_stdin_command(),
            };
        }

        let log = self.job.log_file();

        match self.helper_image.os() {
            OsType::Linux => vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("touch {log}; tail -n +1 -F {log} 2>/dev/null & exec sh"),
            ],
            OsType::Windows => vec![
                "pwsh".to_string(),
                "-NoLogo".to_string(),
                "-NoProfile".to_string(),
                "-Command".to_string(),
                format!(
                    "New-Item -ItemType File -Force -Path '{log}' | Out-Null; \
                     Start-ThreadJob -StreamingHost $Host -ScriptBlock {{ Get-Content \
                     -LiteralPath '{log}' -Wait }} | Out-Null; \
                     pwsh -NoLogo -NoProfile -Command -"
                ),
            ],
        }
    }

    /// Builds the init container that opens permissions on the shared log.
    ///
    /// The build and helper containers often run as different users, and
    /// ownership of a shared volume is decided by whichever container
    /// touches it first; the init container makes the log file writable for
    /// both before either starts. Windows permissions are opened recursively
    /// on the log and build directories instead, since its containers never
    /// share security identifiers.
    fn init_permissions_container(&self) -> Container {
        let command = match self.helper_image.os() {
            OsType::Windows => {
                let chmod = |path: &str| {
                    format!(
                        "icacls $ExecutionContext.SessionState.Path.\
                         GetUnresolvedProviderPathFromPSPath('{path}') /grant \
                         'Everyone:(OI)(CI)F' /t /q | out-null"
                    )
                };
                vec![
                    "pwsh".to_string(),
                    "-c".to_string(),
                    format!(
                        "{logs};\n{root}",
                        logs = chmod(&self.job.logs_dir()),
                        root = chmod(&self.job.build_root)
                    ),
                ]
            }
            OsType::Linux => {
                let log = self.job.log_file();
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("touch {log} && (chmod 777 {log} || exit 0)"),
                ]
            }
        };

        Container {
            name: INIT_PERMISSIONS_CONTAINER.to_string(),
            image: Some(self.helper_image.reference().to_string()),
            command: Some(command),
            volume_mounts: some_if_not_empty(self.volume_mounts()),
            image_pull_policy: self
                .pull
                .policy_for(self.helper_image.reference())
                .ok()
                .map(|policy| policy.as_kubernetes().to_string()),
            ..Default::default()
        }
    }

    /// The volume mounts shared by every job container.
    fn volume_mounts(&self) -> Vec<VolumeMount> {
        let mut mounts = Vec::new();

        // The scripts and logs mounts must not be nested inside another
        // volume mount: the first container to touch a parent volume decides
        // its ownership, which locks out non-root images.
        if self.scripts_config_map.is_some() {
            mounts.push(VolumeMount {
                name: SCRIPTS_VOLUME.to_string(),
                mount_path: self.job.scripts_dir(),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: LOGS_VOLUME.to_string(),
                mount_path: self.job.logs_dir(),
                ..Default::default()
            });
        }

        mounts.extend(self.configured_volume_mounts());

        if self.build_root_volume_required {
            mounts.push(VolumeMount {
                name: REPO_VOLUME.to_string(),
                mount_path: self.job.build_root.clone(),
                ..Default::default()
            });
        }

        mounts
    }

    /// The volume mounts declared in the runtime configuration.
    fn configured_volume_mounts(&self) -> Vec<VolumeMount> {
        let volumes = &self.config.volumes;
        let mut mounts = Vec::new();

        for volume in &volumes.host_paths {
            mounts.push(mount(
                &volume.name,
                &volume.mount_path,
                volume.sub_path.clone(),
                volume.read_only,
            ));
        }

        for volume in &volumes.secrets {
            mounts.push(mount(
                &volume.name,
                &volume.mount_path,
                volume.sub_path.clone(),
                volume.read_only,
            ));
        }

        for volume in &volumes.pvcs {
            mounts.push(mount(
                &volume.name,
                &volume.mount_path,
                volume.sub_path.clone(),
                volume.read_only,
            ));
        }

        for volume in &volumes.config_maps {
            mounts.push(mount(
                &volume.name,
                &volume.mount_path,
                volume.sub_path.clone(),
                volume.read_only,
            ));
        }

        for volume in &volumes.empty_dirs {
            mounts.push(mount(
                &volume.name,
                &volume.mount_path,
                volume.sub_path.clone(),
                false,
            ));
        }

        for volume in &volumes.csi {
            mounts.push(mount(
                &volume.name,
                &volume.mount_path,
                volume.sub_path.clone(),
                volume.read_only,
            ));
        }

        mounts
    }

    /// The pod's volume list.
    fn volumes(&self) -> Vec<Volume> {
        let mut volumes = self.configured_volumes();

        if self.build_root_volume_required {
            volumes.push(Volume {
                name: REPO_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }

        let Some(config_map) = self.scripts_config_map else {
            return volumes;
        };

        let default_mode = match self.helper_image.os() {
            OsType::Linux => Some(SCRIPTS_VOLUME_MODE),
            OsType::Windows => None,
        };

        volumes.push(Volume {
            name: SCRIPTS_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.to_string(),
                default_mode,
                optional: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        });
        volumes.push(Volume {
            name: LOGS_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });

        volumes
    }

    /// The volumes declared in the runtime configuration.
    fn configured_volumes(&self) -> Vec<Volume> {
        let config = &self.config.volumes;
        let mut volumes = Vec::new();

        for volume in &config.host_paths {
            volumes.push(Volume {
                name: volume.name.clone(),
                host_path: Some(HostPathVolumeSource {
                    // Volumes declared before the host path field existed
                    // used the mount path on both sides.
                    path: volume
                        .host_path
                        .clone()
                        .unwrap_or_else(|| volume.mount_path.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        for volume in &config.secrets {
            volumes.push(Volume {
                name: volume.name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(volume.name.clone()),
                    items: key_items(&volume.items),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        for volume in &config.pvcs {
            volumes.push(Volume {
                name: volume.name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: volume.name.clone(),
                    read_only: Some(volume.read_only),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        for volume in &config.config_maps {
            volumes.push(Volume {
                name: volume.name.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: volume.name.clone(),
                    items: key_items(&volume.items),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        for volume in &config.empty_dirs {
            volumes.push(Volume {
                name: volume.name.clone(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: volume.medium.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        for volume in &config.csi {
            volumes.push(Volume {
                name: volume.name.clone(),
                csi: Some(CSIVolumeSource {
                    driver: volume.driver.clone(),
                    fs_type: volume.fs_type.clone(),
                    read_only: Some(volume.read_only),
                    volume_attributes: some_if_not_empty_map(volume.volume_attributes.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        volumes
    }

    /// The image-pull secrets of the pod.
    fn image_pull_secrets(&self) -> Vec<LocalObjectReference> {
        let mut secrets = self
            .config
            .image_pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect::<Vec<_>>();

        if let Some(name) = self.credentials_secret {
            secrets.push(LocalObjectReference {
                name: name.to_string(),
            });
        }

        secrets
    }

    /// The host aliases of the pod.
    ///
    /// Service aliases are mapped onto the loopback address so build scripts
    /// reach services by name; configured aliases are appended. Omitted
    /// entirely when the cluster does not accept host aliases.
    fn host_aliases(&self) -> Option<Vec<HostAlias>> {
        if !self.host_aliases_supported {
            return None;
        }

        let mut aliases = Vec::new();

        let hostnames = self
            .job
            .services
            .iter()
            .filter_map(|service| service.alias.as_deref())
            .map(dns::make_rfc1123_compatible)
            .filter(|alias| !alias.is_empty())
            .collect::<Vec<_>>();

        if !hostnames.is_empty() {
            aliases.push(HostAlias {
                ip: "127.0.0.1".to_string(),
                hostnames: Some(hostnames),
            });
        }

        aliases.extend(self.config.host_aliases.clone());

        some_if_not_empty(aliases)
    }

    /// The capability set of job containers.
    ///
    /// `NET_RAW` is dropped by default on Linux and untouched on Windows;
    /// configured additions win over the default drop.
    fn capabilities(&self) -> Option<Capabilities> {
        let default_drop: &[&str] = match self.helper_image.os() {
            OsType::Linux => &["NET_RAW"],
            OsType::Windows => &[],
        };

        let add = self.config.cap_add.clone();

        let mut drop: Vec<String> = default_drop
            .iter()
            .map(|cap| cap.to_string())
            .chain(self.config.cap_drop.iter().cloned())
            .filter(|cap| !add.contains(cap))
            .collect();
        drop.dedup();

        if add.is_empty() && drop.is_empty() {
            return None;
        }

        Some(Capabilities {
            add: some_if_not_empty(add),
            drop: some_if_not_empty(drop),
        })
    }
}

/// Maps an image definition onto a container command and arguments.
///
/// An image-defined entrypoint replaces the default command; an
/// image-defined command becomes the arguments.
fn command_and_args(
    definition: &ImageSpec,
    default_command: Vec<String>,
) -> (Option<Vec<String>>, Option<Vec<String>>) {
    let command = if default_command.is_empty() && !definition.entrypoint.is_empty() {
        definition.entrypoint.clone()
    } else {
        default_command
    };

    (
        some_if_not_empty(command),
        some_if_not_empty(definition.command.clone()),
    )
}

/// The stdin-reading PowerShell invocation used as a container command.
fn pwsh_stdin_command() -> Vec<String> {
    vec![
        "pwsh".to_string(),
        "-NoLogo".to_string(),
        "-NoProfile".to_string(),
        "-Command".to_string(),
        "-".to_string(),
    ]
}

/// Builds one volume mount.
fn mount(name: &str, path: &str, sub_path: Option<String>, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        sub_path,
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

/// Converts a key-to-path map into Kubernetes projection items.
fn key_items(items: &BTreeMap<String, String>) -> Option<Vec<KeyToPath>> {
    some_if_not_empty(
        items
            .iter()
            .map(|(key, path)| KeyToPath {
                key: key.clone(),
                path: path.clone(),
                ..Default::default()
            })
            .collect(),
    )
}

/// Wraps a vector in `Some` unless it is empty.
fn some_if_not_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    (!values.is_empty()).then_some(values)
}

/// Wraps a map in `Some` unless it is empty.
fn some_if_not_empty_map<K, V>(map: BTreeMap<K, V>) -> Option<BTreeMap<K, V>> {
    (!map.is_empty()).then_some(map)
}

/// Matches an image reference against an allow-list pattern.
///
/// `*` matches within a path segment, `**` matches across segments.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[char], text: &[char]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some(('*', rest)) if rest.first() == Some(&'*') => {
                let rest = &rest[1..];
                (0..=text.len()).any(|i| inner(rest, &text[i..]))
            }
            Some(('*', rest)) => (0..=text.len())
                .take_while(|&i| i == 0 || text[i - 1] != '/')
                .any(|i| inner(rest, &text[i..])),
            Some((&c, rest)) => text.first() == Some(&c) && inner(rest, &text[1..]),
        }
    }

    let pattern = pattern.chars().collect::<Vec<_>>();
    let text = text.chars().collect::<Vec<_>>();
    inner(&pattern, &text)
}
