//! The executor state machine.
//!
//! One executor instance drives one job: prepare validates the
//! configuration and builds the API client, each run call executes one
//! stage in order, finish records the outcome, and cleanup tears down every
//! cluster resource the job created. The executor owns all other components
//! and is the only place errors are classified into coordinator-facing
//! outcomes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::core::v1::Service;
use kiln_shell::DETECT_SHELL_SCRIPT_NAME;
use kiln_shell::PWSH_BOOTSTRAP_SCRIPT_NAME;
use kiln_shell::Shell;
use kiln_shell::TrapExitStatus;
use kube::Client;
use kube::Config;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::config::RuntimeConfig;
use crate::driver;
use crate::error::Error;
use crate::error::Result;
use crate::features::FeatureChecker;
use crate::features::FeatureError;
use crate::flags;
use crate::helper::HelperImage;
use crate::job::JobSpec;
use crate::job::PortSpec;
use crate::job::StageCommand;
use crate::logs::LogTailer;
use crate::logs::TailError;
use crate::pod;
use crate::pod::BUILD_CONTAINER;
use crate::pod::HELPER_CONTAINER;
use crate::pod::PodBuilder;
use crate::pull::PullManager;
use crate::resources::ResourceManager;
use crate::trace::Trace;
use crate::wait;

/// The inputs of [`KubernetesExecutor::prepare`].
pub struct PrepareOptions {
    /// The job to execute.
    pub job: JobSpec,

    /// The resolved runner configuration.
    pub config: RuntimeConfig,

    /// The user-visible job trace.
    pub trace: Trace,

    /// The job-level cancellation token.
    ///
    /// Cancelling it aborts the active stage, stops every background task,
    /// and surfaces [`Error::Cancelled`] to the caller.
    pub cancel: CancellationToken,
}

/// The lifecycle stage of the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorStage {
    /// The executor has been prepared and no stage has run yet.
    Ready,
    /// A stage is executing.
    Running,
    /// The final stage outcome has been recorded.
    Finishing,
    /// Resources are being torn down.
    Cleaning,
    /// The executor is done; cleanup has completed.
    Done,
}

/// The Kubernetes job executor.
pub struct KubernetesExecutor {
    /// The job being executed.
    job: JobSpec,

    /// The resolved runner configuration.
    config: RuntimeConfig,

    /// The user-visible job trace.
    trace: Trace,

    /// The job-level cancellation token.
    cancel: CancellationToken,

    /// The resource manager for the job's namespace.
    resources: ResourceManager,

    /// The pull-policy manager.
    pull: PullManager,

    /// The cluster feature checker.
    features: FeatureChecker,

    /// The resolved helper image.
    helper_image: HelperImage,

    /// The shell stage scripts are generated for.
    shell: Shell,

    /// The lifecycle stage of the executor.
    stage: ExecutorStage,

    /// The job pod, once created.
    pod: Option<Pod>,

    /// The scripts config map, once created.
    config_map: Option<ConfigMap>,

    /// The image-pull secret, once created.
    credentials: Option<Secret>,

    /// The proxy services, once created.
    services: Vec<Service>,

    /// The proxy pool assembled by the pod builder.
    proxies: BTreeMap<String, Vec<PortSpec>>,

    /// Memoised decision whether a fallback build-root volume is needed.
    build_root_volume_required: Option<bool>,

    /// The producer half of the sentinel channel, held by the log
    /// demultiplexer.
    sentinel_tx: mpsc::Sender<TrapExitStatus>,

    /// The consumer half of the sentinel channel, read by the stage driver.
    sentinel_rx: mpsc::Receiver<TrapExitStatus>,

    /// Cancels the log tailer and demultiplexer of the current pod.
    logs_cancel: Option<CancellationToken>,
}

impl KubernetesExecutor {
    /// Prepares an executor for one job.
    ///
    /// Validates the configuration, resolves the build and helper images,
    /// and constructs the API client. No cluster resources are created yet;
    /// pod construction is lazy and happens on the first [`run`] call.
    ///
    /// [`run`]: Self::run
    pub async fn prepare(options: PrepareOptions) -> Result<Self> {
        let PrepareOptions {
            mut job,
            mut config,
            trace,
            cancel,
        } = options;

        let shell = config.shell;
        if shell.requires_script_file() {
            return Err(Error::config(format!(
                "shell `{shell}` requires scripts to be passed as files, which the Kubernetes \
                 executor does not support"
            )));
        }

        resolve_build_image(&mut job, &config)?;

        let namespace = resolve_namespace(&config, &trace);
        config.namespace = Some(namespace.clone());

        let client_config = match &config.host {
            Some(host) => {
                let url = host.parse().map_err(|e| {
                    Error::config(format!("invalid Kubernetes API host `{host}`: {e}"))
                })?;
                Config::new(url)
            }
            None => Config::infer().await.map_err(|e| {
                Error::config(format!("inferring Kubernetes client configuration: {e}"))
            })?,
        };
        let client = Client::try_from(client_config)?;

        let helper_image = HelperImage::resolve(&config);
        let pull = PullManager::new(config.pull_policies.clone(), trace.clone());
        let features = FeatureChecker::new(client.clone());
        let resources = ResourceManager::new(&client, &namespace);

        trace.message(&format!(
            "Using Kubernetes executor with image {image} ...",
            image = job.image.name
        ));
        if !flags::use_legacy_execution_strategy() {
            trace.message("Using attach strategy to execute scripts...");
        }
        trace.message(&format!("Using Kubernetes namespace: {namespace}"));
        debug!(
            "using helper image `{reference}`",
            reference = helper_image.reference()
        );

        let (sentinel_tx, sentinel_rx) = mpsc::channel(1);

        Ok(Self {
            job,
            config,
            trace,
            cancel,
            resources,
            pull,
            features,
            helper_image,
            shell,
            stage: ExecutorStage::Ready,
            pod: None,
            config_map: None,
            credentials: None,
            services: Vec::new(),
            proxies: BTreeMap::new(),
            build_root_volume_required: None,
            sentinel_tx,
            sentinel_rx,
            logs_cancel: None,
        })
    }

    /// Runs one stage of the job.
    ///
    /// Stages must be run in order; the first call constructs the pod and
    /// subsequent calls reuse it. An image-pull failure consults the
    /// pull-policy manager: while it advances policies, all resources are
    /// torn down and pod creation is retried with the next policy.
    pub async fn run(&mut self, cmd: StageCommand) -> Result<()> {
        self.stage = ExecutorStage::Running;

        for attempt in 1usize.. {
            let result = if flags::use_legacy_execution_strategy() {
                debug!("starting Kubernetes command");
                self.run_with_exec(&cmd).await
            } else {
                debug!("starting Kubernetes command with attach");
                self.run_with_attach(&cmd).await
            };

            if let Err(Error::ImagePull(ref err)) = result {
                if self.pull.update_policy_for(attempt, err) {
                    self.teardown_attempt().await;
                    continue;
                }
            }

            return result;
        }

        unreachable!("the stage attempt loop always returns")
    }

    /// Records the final stage outcome.
    ///
    /// A pod-not-found failure clears the pod handle so cleanup does not
    /// attempt a second delete of a pod that is already gone.
    pub fn finish(&mut self, error: Option<&Error>) {
        self.stage = ExecutorStage::Finishing;

        if error.is_some_and(Error::is_pod_not_found) {
            self.pod = None;
        }
    }

    /// Tears down every resource the job created.
    ///
    /// Idempotent and best effort: errors are reported to the trace, never
    /// returned, and a second call has nothing left to delete.
    pub async fn cleanup(&mut self) {
        self.stage = ExecutorStage::Cleaning;
        self.teardown_attempt().await;
        self.stage = ExecutorStage::Done;
    }

    /// The current lifecycle stage.
    pub fn stage(&self) -> ExecutorStage {
        self.stage
    }

    /// The proxy services created for the job.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Runs a stage through the attach driver.
    async fn run_with_attach(&mut self, cmd: &StageCommand) -> Result<()> {
        let stage_cancel = self.cancel.child_token();

        self.ensure_pod_configured(&stage_cancel).await?;

        let pod_name = self.pod_name()?;
        let (container, command) = stage_command(&self.job, self.shell, &self.helper_image, cmd);

        let pods = self.resources.pods().clone();
        let mut status_rx = wait::watch_pod_status(
            pods.clone(),
            pod_name.clone(),
            self.config.poll_interval(),
            stage_cancel.clone(),
        );

        let job_cancel = self.cancel.clone();
        let result = select! {
            biased;
            _ = job_cancel.cancelled() => Err(Error::Cancelled),
            Some(err) = status_rx.recv() => Err(err),
            result = driver::run_attach(
                &pods,
                &pod_name,
                container,
                &command,
                &mut self.sentinel_rx,
                &stage_cancel,
            ) => result,
        };

        stage_cancel.cancel();
        result
    }

    /// Runs a stage through the legacy exec driver.
    ///
    /// The legacy layout mounts no scripts config map: the script body is
    /// streamed over the exec stdin each stage, and pod readiness is
    /// re-checked per stage since there is no log tailer watching the pod.
    async fn run_with_exec(&mut self, cmd: &StageCommand) -> Result<()> {
        let stage_cancel = self.cancel.child_token();

        if self.pod.is_none() {
            self.credentials = self.resources.create_credentials(&self.job).await?;

            let built = self.build_pod(None).await?;
            let pod = self.resources.create_pod(&built.pod).await?;
            self.proxies = built.proxies;

            let (credentials, _) = self
                .resources
                .install_owner_references(&pod, self.credentials.as_ref(), None)
                .await?;
            self.credentials = credentials;

            self.services = self
                .resources
                .create_proxy_services(&pod, &self.job.unique_name(), &self.proxies)
                .await?;

            self.pod = Some(pod);
        }

        let pod_name = self.pod_name()?;

        wait::wait_for_pod_running(
            self.resources.pods(),
            &pod_name,
            &self.trace,
            self.config.poll_interval(),
            self.config.poll_timeout(),
            &stage_cancel,
        )
        .await?;

        let (container, command) = if cmd.predefined {
            (HELPER_CONTAINER, self.helper_image.command().to_vec())
        } else {
            let command = match self.shell {
                Shell::Pwsh => vec![
                    "pwsh".to_string(),
                    "-NoLogo".to_string(),
                    "-NoProfile".to_string(),
                    "-Command".to_string(),
                    "-".to_string(),
                ],
                _ => vec!["sh".to_string()],
            };
            (BUILD_CONTAINER, command)
        };

        let pods = self.resources.pods().clone();
        driver::run_exec(
            &pods,
            &pod_name,
            container,
            &command,
            &cmd.script,
            &self.trace,
            &stage_cancel,
        )
        .await
    }

    /// Creates the pod and its satellites if this is the first stage.
    ///
    /// Creation order: image-pull secret, scripts config map, pod, owner
    /// references onto secret and config map, proxy services. The owner
    /// references are installed before the first stage runs so everything
    /// cascades from pod deletion.
    async fn ensure_pod_configured(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.pod.is_some() {
            return Ok(());
        }

        self.credentials = self.resources.create_credentials(&self.job).await?;

        let config_map = self
            .resources
            .create_scripts_config_map(&self.job, self.shell)
            .await?;
        self.config_map = Some(config_map);

        let scripts_name = self
            .config_map
            .as_ref()
            .and_then(|cm| cm.metadata.name.clone())
            .unwrap_or_default();

        let built = self.build_pod(Some(&scripts_name)).await?;
        let pod = self.resources.create_pod(&built.pod).await?;
        self.proxies = built.proxies;

        let (credentials, config_map) = self
            .resources
            .install_owner_references(&pod, self.credentials.as_ref(), self.config_map.as_ref())
            .await?;
        self.credentials = credentials;
        self.config_map = config_map;

        self.services = self
            .resources
            .create_proxy_services(&pod, &self.job.unique_name(), &self.proxies)
            .await?;

        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        wait::wait_for_pod_running(
            self.resources.pods(),
            &pod_name,
            &self.trace,
            self.config.poll_interval(),
            self.config.poll_timeout(),
            cancel,
        )
        .await?;

        self.start_log_processing(&pod_name);
        self.pod = Some(pod);

        Ok(())
    }

    /// Builds the pod object for the current attempt.
    async fn build_pod(&mut self, scripts_config_map: Option<&str>) -> Result<pod::BuiltPod> {
        let host_aliases_supported = match self.features.is_host_alias_supported().await {
            Ok(supported) => supported,
            Err(FeatureError::BadVersion(err)) => {
                self.trace.warning(&format!(
                    "Checking for host alias support: {err}. Host aliases will be disabled."
                ));
                false
            }
            Err(FeatureError::Kube(err)) => return Err(Error::Kube(err)),
        };

        let runtime_class_supported = if self.config.runtime_class_name.is_some() {
            match self.features.is_runtime_class_supported().await {
                Ok(supported) => supported,
                Err(FeatureError::BadVersion(err)) => {
                    self.trace.warning(&format!(
                        "Checking for runtime class support: {err}. The runtime class will not \
                         be set."
                    ));
                    false
                }
                Err(FeatureError::Kube(err)) => return Err(Error::Kube(err)),
            }
        } else {
            false
        };

        let build_root_volume_required = *self
            .build_root_volume_required
            .get_or_insert_with(|| pod::build_root_volume_required(&self.config, &self.job));

        PodBuilder {
            job: &self.job,
            config: &self.config,
            pull: &self.pull,
            helper_image: &self.helper_image,
            shell: self.shell,
            scripts_config_map,
            credentials_secret: self
                .credentials
                .as_ref()
                .and_then(|secret| secret.metadata.name.as_deref()),
            host_aliases_supported,
            runtime_class_supported,
            build_root_volume_required,
        }
        .build()
    }

    /// Starts tailing and demultiplexing the pod's log stream.
    fn start_log_processing(&mut self, pod_name: &str) {
        let cancel = self.cancel.child_token();

        let tailer = LogTailer::new(
            self.resources.pods().clone(),
            pod_name.to_string(),
            HELPER_CONTAINER.to_string(),
        );
        let (lines_rx, err_rx) = tailer.process(cancel.clone());

        tokio::spawn(process_logs(
            lines_rx,
            err_rx,
            self.sentinel_tx.clone(),
            self.trace.clone(),
        ));

        self.logs_cancel = Some(cancel);
    }

    /// Tears down the current attempt's resources and handles.
    async fn teardown_attempt(&mut self) {
        if let Some(cancel) = self.logs_cancel.take() {
            cancel.cancel();
        }

        self.resources
            .cleanup(
                self.pod.take(),
                self.credentials.take(),
                self.config_map.take(),
                &self.trace,
            )
            .await;

        self.services.clear();
        self.proxies.clear();

        // Drop any sentinel left over from the torn-down pod.
        while self.sentinel_rx.try_recv().is_ok() {}
    }

    /// The name of the created pod.
    fn pod_name(&self) -> Result<String> {
        self.pod
            .as_ref()
            .and_then(|pod| pod.metadata.name.clone())
            .ok_or_else(|| Error::config("the job pod has not been created".to_string()))
    }
}

/// Demultiplexes tailed log lines for one job.
///
/// Exit sentinels are published on the sentinel channel and never reach the
/// trace; start sentinels are consumed silently; everything else is user
/// output. Fatal tail errors become synthetic exit statuses so a stage
/// driver waiting on the sentinel channel can never block forever.
async fn process_logs(
    mut lines_rx: mpsc::Receiver<String>,
    mut err_rx: mpsc::Receiver<TailError>,
    sentinel_tx: mpsc::Sender<TrapExitStatus>,
    trace: Trace,
) {
    loop {
        select! {
            line = lines_rx.recv() => match line {
                Some(line) => handle_log_line(&line, &sentinel_tx, &trace).await,
                None => return,
            },
            Some(err) = err_rx.recv() => {
                trace.warning(&err.to_string());

                let status = TrapExitStatus::exited(err.exit_code());
                let _ = sentinel_tx.send(status).await;
            }
        }
    }
}

/// Routes one tailed log line.
async fn handle_log_line(line: &str, sentinel_tx: &mpsc::Sender<TrapExitStatus>, trace: &Trace) {
    match TrapExitStatus::try_parse(line) {
        Some(status) if status.command_exit_code.is_some() => {
            debug!(
                "stage script `{script}` exited with code {code}",
                script = status.script.as_deref().unwrap_or("unknown"),
                code = status.command_exit_code.unwrap_or_default()
            );

            let _ = sentinel_tx.send(status).await;
        }
        Some(status) => {
            debug!(
                "stage script `{script}` started",
                script = status.script.as_deref().unwrap_or("unknown")
            );
        }
        None => {
            if let Err(e) = trace.write_line(line) {
                warn!("error writing log line to trace: {e}");
            }
        }
    }
}

/// Applies the configured default image when the job does not name one.
fn resolve_build_image(job: &mut JobSpec, config: &RuntimeConfig) -> Result<()> {
    if !job.image.name.is_empty() {
        return Ok(());
    }

    match config.image.as_deref() {
        Some(image) if !image.is_empty() => {
            job.image.name = image.to_string();
            Ok(())
        }
        _ => Err(Error::config(
            "no image specified and no default set in the configuration".to_string(),
        )),
    }
}

/// Resolves the namespace, defaulting with a warning when empty.
fn resolve_namespace(config: &RuntimeConfig, trace: &Trace) -> String {
    match config.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => namespace.to_string(),
        _ => {
            trace.warning("Namespace is empty, therefore assuming `default`.");
            "default".to_string()
        }
    }
}

/// Computes the container and command line for a stage.
///
/// Build stages re-enter the shell bootstrap with the stage script and tee
/// their output into the shared log file. Predefined stages feed the stage
/// script to the helper command and append straight to the log file: the
/// helper's stdout already carries the tailed file, so a tee there would
/// duplicate every line.
fn stage_command(
    job: &JobSpec,
    shell: Shell,
    helper_image: &HelperImage,
    cmd: &StageCommand,
) -> (&'static str, String) {
    let script = job.script_path(&cmd.stage);
    let log = job.log_file();

    match (shell, cmd.predefined) {
        (Shell::Pwsh, false) => (
            BUILD_CONTAINER,
            format!(
                "{bootstrap} {script} 2>&1 | tee -a {log}",
                bootstrap = job.script_path(PWSH_BOOTSTRAP_SCRIPT_NAME)
            ),
        ),
        (Shell::Pwsh, true) => (
            HELPER_CONTAINER,
            format!(
                "Get-Content -Path {script} | {helper} >> {log} 2>&1",
                helper = helper_image.command().join(" ")
            ),
        ),
        (_, false) => (
            BUILD_CONTAINER,
            format!(
                "sh {detect} {script} 2>&1 | tee -a {log}",
                detect = job.script_path(DETECT_SHELL_SCRIPT_NAME)
            ),
        ),
        (_, true) => (
            HELPER_CONTAINER,
            format!(
                "{helper} <<< {script} >> {log} 2>&1",
                helper = helper_image.command().join(" ")
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use kiln_shell::sentinel::MARKER;

    use super::*;
    use crate::trace::tests::SharedBuffer;

    fn job() -> JobSpec {
        JobSpec {
            job_id: 2,
            project_id: 1,
            ..Default::default()
        }
    }

    fn command(stage: &str, predefined: bool) -> StageCommand {
        StageCommand {
            stage: stage.to_string(),
            script: String::new(),
            predefined,
        }
    }

    #[test]
    fn build_stages_run_through_the_shell_bootstrap() {
        let config = RuntimeConfig::default();
        let helper = HelperImage::resolve(&config);

        let (container, line) = stage_command(
            &job(),
            Shell::Bash,
            &helper,
            &command("step_script", false),
        );

        assert_eq!(container, BUILD_CONTAINER);
        assert_eq!(
            line,
            "sh /scripts-1-2/detect_shell_script /scripts-1-2/step_script 2>&1 | tee -a \
             /logs-1-2/output.log"
        );
    }

    #[test]
    fn predefined_stages_run_in_the_helper_container() {
        let config = RuntimeConfig::default();
        let helper = HelperImage::resolve(&config);

        let (container, line) =
            stage_command(&job(), Shell::Bash, &helper, &command("get_sources", true));

        assert_eq!(container, HELPER_CONTAINER);
        assert_eq!(
            line,
            "kiln-runner-build <<< /scripts-1-2/get_sources >> /logs-1-2/output.log 2>&1"
        );
    }

    #[test]
    fn pwsh_stages_use_the_bootstrap_wrapper() {
        let config = RuntimeConfig::default();
        let helper = HelperImage::resolve(&config);

        let (container, line) = stage_command(
            &job(),
            Shell::Pwsh,
            &helper,
            &command("step_script", false),
        );
        assert_eq!(container, BUILD_CONTAINER);
        assert!(line.starts_with("/scripts-1-2/parse_pwsh_script.ps1 /scripts-1-2/step_script"));

        let (container, line) =
            stage_command(&job(), Shell::Pwsh, &helper, &command("get_sources", true));
        assert_eq!(container, HELPER_CONTAINER);
        assert!(line.starts_with("Get-Content -Path /scripts-1-2/get_sources |"));
        assert!(line.ends_with(">> /logs-1-2/output.log 2>&1"));
    }

    #[test]
    fn missing_image_without_default_is_a_configuration_error() {
        let mut job = job();
        let err = resolve_build_image(&mut job, &RuntimeConfig::default()).unwrap_err();
        assert!(err.to_string().contains("no image specified"));

        let config = RuntimeConfig::builder().image("alpine:3.20").build();
        resolve_build_image(&mut job, &config).unwrap();
        assert_eq!(job.image.name, "alpine:3.20");

        // A job-specified image is never overridden.
        let config = RuntimeConfig::builder().image("debian:12").build();
        resolve_build_image(&mut job, &config).unwrap();
        assert_eq!(job.image.name, "alpine:3.20");
    }

    #[test]
    fn empty_namespace_defaults_with_a_warning() {
        let buffer = SharedBuffer::default();
        let trace = Trace::new(buffer.clone());

        assert_eq!(resolve_namespace(&RuntimeConfig::default(), &trace), "default");
        assert!(buffer.contents().contains("WARNING: Namespace is empty"));

        let config = RuntimeConfig::builder().namespace("ci").build();
        assert_eq!(resolve_namespace(&config, &trace), "ci");
    }

    #[tokio::test]
    async fn exit_sentinels_reach_the_driver_not_the_trace() {
        let (lines_tx, lines_rx) = mpsc::channel(8);
        let (_err_tx, err_rx) = mpsc::channel(1);
        let (sentinel_tx, mut sentinel_rx) = mpsc::channel(1);
        let buffer = SharedBuffer::default();

        let processor = tokio::spawn(process_logs(
            lines_rx,
            err_rx,
            sentinel_tx,
            Trace::new(buffer.clone()),
        ));

        let exit = TrapExitStatus {
            command_exit_code: Some(7),
            script: Some("/scripts-1-2/step_script".to_string()),
        };

        lines_tx.send("building...".to_string()).await.unwrap();
        lines_tx.send(exit.to_line()).await.unwrap();

        let status = sentinel_rx.recv().await.unwrap();
        assert_eq!(status.command_exit_code, Some(7));

        drop(lines_tx);
        processor.await.unwrap();

        assert_eq!(buffer.contents(), "building...\n");
    }

    #[tokio::test]
    async fn start_sentinels_are_consumed_silently() {
        let (lines_tx, lines_rx) = mpsc::channel(8);
        let (_err_tx, err_rx) = mpsc::channel(1);
        let (sentinel_tx, mut sentinel_rx) = mpsc::channel(1);
        let buffer = SharedBuffer::default();

        let processor = tokio::spawn(process_logs(
            lines_rx,
            err_rx,
            sentinel_tx,
            Trace::new(buffer.clone()),
        ));

        let start = TrapExitStatus {
            command_exit_code: None,
            script: Some("/scripts-1-2/step_script".to_string()),
        };
        lines_tx.send(start.to_line()).await.unwrap();
        drop(lines_tx);
        processor.await.unwrap();

        assert_eq!(buffer.contents(), "");
        assert!(sentinel_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lines_resembling_sentinels_stay_user_output() {
        let (lines_tx, lines_rx) = mpsc::channel(8);
        let (_err_tx, err_rx) = mpsc::channel(1);
        let (sentinel_tx, mut sentinel_rx) = mpsc::channel(1);
        let buffer = SharedBuffer::default();

        let processor = tokio::spawn(process_logs(
            lines_rx,
            err_rx,
            sentinel_tx,
            Trace::new(buffer.clone()),
        ));

        // Outer markers match but the middle is not valid JSON.
        let fake = format!("{MARKER}TRAP{MARKER}not json{MARKER}");
        lines_tx.send(fake.clone()).await.unwrap();
        drop(lines_tx);
        processor.await.unwrap();

        assert_eq!(buffer.contents(), format!("{fake}\n"));
        assert!(sentinel_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tail_errors_become_synthetic_exit_codes() {
        let (lines_tx, lines_rx) = mpsc::channel(8);
        let (err_tx, err_rx) = mpsc::channel(1);
        let (sentinel_tx, mut sentinel_rx) = mpsc::channel(1);
        let buffer = SharedBuffer::default();

        let processor = tokio::spawn(process_logs(
            lines_rx,
            err_rx,
            sentinel_tx,
            Trace::new(buffer.clone()),
        ));

        err_tx.send(TailError::Unavailable).await.unwrap();

        let status = sentinel_rx.recv().await.unwrap();
        assert_eq!(status.command_exit_code, Some(100));
        assert!(buffer.contents().contains("WARNING:"));

        drop(lines_tx);
        drop(err_tx);
        processor.await.unwrap();
    }
}
