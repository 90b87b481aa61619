//! Kubernetes resource management.
//!
//! Creates, updates, and deletes the per-job objects: the image-pull
//! secret, the scripts config map, the pod, and its proxy services. Owner
//! references are installed in two phases because the pod's UID does not
//! exist until the pod does: secret and config map are generated first, the
//! pod is created, and then both are patched to list the pod as their
//! owner. Anything still owner-less at cleanup time is deleted explicitly.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::api::core::v1::ServiceSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kiln_shell::Shell;
use kube::Api;
use kube::Client;
use kube::api::DeleteParams;
use kube::api::ObjectMeta;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error;
use crate::error::Error;
use crate::error::Result;
use crate::job::JobSpec;
use crate::job::PortSpec;
use crate::job::RegistryCredential;
use crate::pod::POD_LABEL;
use crate::trace::Trace;

/// The data key of a docker-config secret.
const DOCKER_CONFIG_KEY: &str = ".dockercfg";

/// The type of a docker-config secret.
const DOCKER_CONFIG_SECRET_TYPE: &str = "kubernetes.io/dockercfg";

/// How many proxy services are created concurrently.
const SERVICE_CREATION_CONCURRENCY: usize = 4;

/// Manages the Kubernetes objects of one job.
///
/// The manager owns nothing persistent: it issues API calls and returns
/// object references for the executor to hold.
pub struct ResourceManager {
    /// The pods API.
    pods: Api<Pod>,

    /// The secrets API.
    secrets: Api<Secret>,

    /// The config maps API.
    config_maps: Api<ConfigMap>,

    /// The services API.
    services: Api<Service>,

    /// The namespace job objects live in.
    namespace: String,
}

impl ResourceManager {
    /// Creates a manager for the given namespace.
    pub fn new(client: &Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            secrets: Api::namespaced(client.clone(), namespace),
            config_maps: Api::namespaced(client.clone(), namespace),
            services: Api::namespaced(client.clone(), namespace),
            namespace: namespace.to_string(),
        }
    }

    /// The pods API used by the manager.
    pub fn pods(&self) -> &Api<Pod> {
        &self.pods
    }

    /// Creates the image-pull secret from the job's registry credentials.
    ///
    /// No secret is created when the job carries no credentials.
    pub async fn create_credentials(&self, job: &JobSpec) -> Result<Option<Secret>> {
        if job.credentials.is_empty() {
            return Ok(None);
        }

        debug!("setting up the image pull secret");

        let secret = Secret {
            metadata: ObjectMeta {
                generate_name: Some(format!("{name}-", name = job.unique_name())),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            type_: Some(DOCKER_CONFIG_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                DOCKER_CONFIG_KEY.to_string(),
                ByteString(docker_config(&job.credentials)?),
            )])),
            ..Default::default()
        };

        Ok(Some(self.secrets.create(&PostParams::default(), &secret).await?))
    }

    /// Creates the scripts config map for the job's stages.
    pub async fn create_scripts_config_map(&self, job: &JobSpec, shell: Shell) -> Result<ConfigMap> {
        debug!("setting up the scripts config map");

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                generate_name: Some(format!("{name}-scripts-", name = job.unique_name())),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(scripts_data(job, shell)?),
            ..Default::default()
        };

        Ok(self
            .config_maps
            .create(&PostParams::default(), &config_map)
            .await?)
    }

    /// Creates the job pod.
    pub async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        debug!("creating the build pod");

        Ok(self.pods.create(&PostParams::default(), pod).await?)
    }

    /// Patches the secret and config map to be owned by the pod.
    ///
    /// Returns the updated objects, whose owner lists prove at cleanup time
    /// that deletion cascades from the pod.
    pub async fn install_owner_references(
        &self,
        pod: &Pod,
        credentials: Option<&Secret>,
        config_map: Option<&ConfigMap>,
    ) -> Result<(Option<Secret>, Option<ConfigMap>)> {
        let references = owner_references(pod);

        let credentials = match credentials {
            Some(secret) => {
                let name = secret.metadata.name.as_deref().unwrap_or_default();
                let patch = Secret {
                    metadata: ObjectMeta {
                        owner_references: Some(references.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };

                Some(
                    self.secrets
                        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?,
                )
            }
            None => None,
        };

        let config_map = match config_map {
            Some(config_map) => {
                let name = config_map.metadata.name.as_deref().unwrap_or_default();
                let patch = ConfigMap {
                    metadata: ObjectMeta {
                        owner_references: Some(references),
                        ..Default::default()
                    },
                    ..Default::default()
                };

                Some(
                    self.config_maps
                        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?,
                )
            }
            None => None,
        };

        Ok((credentials, config_map))
    }

    /// Creates the proxy services for the job's exposed service containers.
    ///
    /// Services are created concurrently through a bounded pool, each with
    /// the pod as its owner from the start. The first failure aborts
    /// collection; creations already in flight complete on their own and are
    /// swept up by pod deletion.
    pub async fn create_proxy_services(
        &self,
        pod: &Pod,
        unique_name: &str,
        proxies: &BTreeMap<String, Vec<PortSpec>>,
    ) -> Result<Vec<Service>> {
        if proxies.is_empty() {
            return Ok(Vec::new());
        }

        debug!("creating pod proxy services");

        let references = owner_references(pod);
        let semaphore = Arc::new(Semaphore::new(SERVICE_CREATION_CONCURRENCY));
        let (tx, mut rx) = mpsc::channel(proxies.len());

        for (name, ports) in proxies {
            let service = proxy_service(
                name,
                ports,
                unique_name,
                &self.namespace,
                references.clone(),
            );
            let api = self.services.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = api.create(&PostParams::default(), &service).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut services = Vec::new();
        while let Some(result) = rx.recv().await {
            match result {
                Ok(service) => services.push(service),
                Err(err) => return Err(Error::Kube(err)),
            }
        }

        Ok(services)
    }

    /// Deletes the job's resources, best effort.
    ///
    /// The pod is deleted with foreground propagation so the API server
    /// holds it until its dependents are gone. The secret and config map are
    /// deleted directly only when their owner list is still empty, which
    /// means pod creation never reached the owner-installation phase.
    /// Errors are reported to the trace, never returned.
    pub async fn cleanup(
        &self,
        pod: Option<Pod>,
        credentials: Option<Secret>,
        config_map: Option<ConfigMap>,
        trace: &Trace,
    ) {
        if let Some(pod) = pod {
            let name = pod.metadata.name.as_deref().unwrap_or_default();

            match self.pods.delete(name, &DeleteParams::foreground()).await {
                Ok(_) => {}
                Err(err) if error::is_not_found(&err) => {}
                Err(err) => trace.error(&format!("Error cleaning up pod: {err}")),
            }
        }

        if let Some(secret) = credentials {
            if is_ownerless(&secret.metadata) {
                let name = secret.metadata.name.as_deref().unwrap_or_default();

                match self.secrets.delete(name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(err) if error::is_not_found(&err) => {}
                    Err(err) => trace.error(&format!("Error cleaning up secret: {err}")),
                }
            }
        }

        if let Some(config_map) = config_map {
            if is_ownerless(&config_map.metadata) {
                let name = config_map.metadata.name.as_deref().unwrap_or_default();

                match self.config_maps.delete(name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(err) if error::is_not_found(&err) => {}
                    Err(err) => trace.error(&format!("Error cleaning up config map: {err}")),
                }
            }
        }
    }
}

/// Whether object metadata lists no owners.
fn is_ownerless(metadata: &ObjectMeta) -> bool {
    metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .is_empty()
}

/// The owner references pointing at the job pod.
pub fn owner_references(pod: &Pod) -> Vec<OwnerReference> {
    vec![OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        ..Default::default()
    }]
}

/// Serializes registry credentials into a docker-config payload.
fn docker_config(credentials: &[RegistryCredential]) -> Result<Vec<u8>> {
    let config: BTreeMap<&str, serde_json::Value> = credentials
        .iter()
        .map(|credential| {
            (
                credential.registry.as_str(),
                json!({
                    "username": credential.username,
                    "password": credential.password,
                }),
            )
        })
        .collect();

    serde_json::to_vec(&config)
        .map_err(|e| Error::config(format!("serializing registry credentials: {e}")))
}

/// Generates the scripts config-map data: the shell bootstrap plus one
/// self-reporting script per stage.
fn scripts_data(job: &JobSpec, shell: Shell) -> Result<BTreeMap<String, String>> {
    let mut data = BTreeMap::new();

    let bootstrap = match shell {
        Shell::Pwsh => kiln_shell::PWSH_BOOTSTRAP_SCRIPT,
        _ => kiln_shell::DETECT_SHELL_SCRIPT,
    };
    data.insert(shell.bootstrap_script_name().to_string(), bootstrap.to_string());

    for stage in &job.stages {
        let script = kiln_shell::stage_script(shell, &job.log_file(), &stage.script)
            .map_err(|e| Error::config(e.to_string()))?;
        data.insert(stage.name.clone(), script);
    }

    Ok(data)
}

/// Builds one proxy service declaration.
fn proxy_service(
    name: &str,
    ports: &[PortSpec],
    unique_name: &str,
    namespace: &str,
    owner_references: Vec<OwnerReference>,
) -> Service {
    let service_ports = ports
        .iter()
        .map(|port| ServicePort {
            // Kubernetes requires port names once a service has several.
            name: Some(format!("{name}-{number}", number = port.number)),
            port: port.number,
            target_port: Some(IntOrString::Int(port.number)),
            protocol: port.protocol.clone(),
            ..Default::default()
        })
        .collect();

    Service {
        metadata: ObjectMeta {
            generate_name: Some(format!("{name}-")),
            namespace: Some(namespace.to_string()),
            owner_references: Some(owner_references),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(service_ports),
            selector: Some(BTreeMap::from([(
                POD_LABEL.to_string(),
                unique_name.to_string(),
            )])),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use kiln_shell::DETECT_SHELL_SCRIPT_NAME;

    use super::*;
    use crate::job::Stage;

    fn job() -> JobSpec {
        JobSpec {
            job_id: 2,
            project_id: 1,
            stages: vec![
                Stage {
                    name: "get_sources".to_string(),
                    script: "git clone".to_string(),
                },
                Stage {
                    name: "step_script".to_string(),
                    script: "echo hi".to_string(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn owner_references_point_at_the_pod() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("kiln-project-1-job-2-x8k2p".to_string()),
                uid: Some("d2b1a6c0".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let references = owner_references(&pod);
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].api_version, "v1");
        assert_eq!(references[0].kind, "Pod");
        assert_eq!(references[0].name, "kiln-project-1-job-2-x8k2p");
        assert_eq!(references[0].uid, "d2b1a6c0");
    }

    #[test]
    fn docker_config_maps_registries_to_credentials() {
        let payload = docker_config(&[RegistryCredential {
            registry: "registry.example.com".to_string(),
            username: "ci".to_string(),
            password: "hunter2".to_string(),
        }])
        .unwrap();

        let decoded: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded["registry.example.com"]["username"], "ci");
        assert_eq!(decoded["registry.example.com"]["password"], "hunter2");
    }

    #[test]
    fn scripts_data_has_a_key_per_stage_plus_bootstrap() {
        let data = scripts_data(&job(), Shell::Bash).unwrap();

        assert_eq!(data.len(), 3);
        assert!(data.contains_key(DETECT_SHELL_SCRIPT_NAME));
        assert!(data["get_sources"].contains("git clone"));
        assert!(data["step_script"].contains("echo hi"));

        // Stage scripts report into the job's log file.
        assert!(data["step_script"].contains("/logs-1-2/output.log"));
    }

    #[test]
    fn proxy_service_selects_the_job_pod() {
        let service = proxy_service(
            "db",
            &[PortSpec {
                number: 5432,
                ..Default::default()
            }],
            "kiln-project-1-job-2",
            "ci",
            Vec::new(),
        );

        assert_eq!(service.metadata.generate_name.as_deref(), Some("db-"));

        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(
            spec.selector.unwrap().get(POD_LABEL).map(String::as_str),
            Some("kiln-project-1-job-2")
        );

        let ports = spec.ports.unwrap();
        assert_eq!(ports[0].port, 5432);
        assert_eq!(ports[0].name.as_deref(), Some("db-5432"));
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(5432)));
    }

    #[test]
    fn ownerless_detection_reads_the_reference_list() {
        let mut metadata = ObjectMeta::default();
        assert!(is_ownerless(&metadata));

        metadata.owner_references = Some(Vec::new());
        assert!(is_ownerless(&metadata));

        metadata.owner_references = Some(owner_references(&Pod::default()));
        assert!(!is_ownerless(&metadata));
    }
}
