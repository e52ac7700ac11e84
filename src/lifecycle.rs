use crate::artifacts::{self, MANAGED_SERVICES, NOTEBOOK_PORT, NOTEBOOK_SERVICE, TERMINAL_HOST_PORT};
use crate::config::{EnvironmentConfig, Layout, COMPOSE_PROJECT};
use crate::docker::{execute_docker, parse_compose_ps_output, DockerRunner, ServiceState};
use crate::error::JupyError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvState {
    Unconfigured,
    Stopped,
    Starting,
    Running,
}

/// How long `start` waits for the readiness credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "readiness", rename_all = "snake_case")]
pub enum StartOutcome {
    Ready { token: String },
    StillStarting,
    Crashed { service: String, exit_code: i64 },
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub teardown_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub state: String,
    pub exit_code: i64,
}

impl From<ServiceState> for ServiceStatus {
    fn from(row: ServiceState) -> Self {
        Self {
            service: row.service,
            state: row.state,
            exit_code: row.exit_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub readiness_token: Option<String>,
    pub services: Vec<ServiceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceUrl {
    pub name: &'static str,
    pub url: String,
    pub ready: bool,
}

/// Present trimmed, non-empty credential content, or nothing.
pub fn read_readiness_token(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let token = content.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Jupyter always carries a token: the notebook's own once it is ready,
/// otherwise the configured access token.
pub fn service_urls(cfg: &EnvironmentConfig, readiness_token: Option<&str>) -> Vec<ServiceUrl> {
    let token = readiness_token.unwrap_or(cfg.access_token.as_str());
    let url = if token.is_empty() {
        format!("http://localhost:{NOTEBOOK_PORT}")
    } else {
        format!(
            "http://localhost:{NOTEBOOK_PORT}/lab?token={}",
            urlencoding::encode(token)
        )
    };
    let mut urls = vec![ServiceUrl {
        name: "Jupyter Lab",
        url,
        ready: readiness_token.is_some(),
    }];
    urls.push(ServiceUrl {
        name: "Web Terminal",
        url: format!("http://localhost:{TERMINAL_HOST_PORT}"),
        ready: true,
    });
    if let Some(port) = cfg.agent_kind.web_ui_port() {
        urls.push(ServiceUrl {
            name: cfg.agent_kind.display_name(),
            url: format!("http://localhost:{port}"),
            ready: true,
        });
    }
    urls
}

/// Drives one environment through build/start/stop against the compose CLI.
pub struct Controller<'a, R: DockerRunner + ?Sized> {
    layout: Layout,
    config: Option<EnvironmentConfig>,
    runner: &'a R,
    readiness: ReadinessPolicy,
    state: EnvState,
    stream_output: bool,
}

impl<'a, R: DockerRunner + ?Sized> Controller<'a, R> {
    pub fn new(layout: Layout, config: Option<EnvironmentConfig>, runner: &'a R) -> Self {
        let state = if config.is_some() {
            EnvState::Stopped
        } else {
            EnvState::Unconfigured
        };
        Self {
            layout,
            config,
            runner,
            readiness: ReadinessPolicy::default(),
            state,
            stream_output: false,
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Let `build` and `up` write straight to the terminal instead of being captured.
    pub fn with_streamed_output(mut self, stream: bool) -> Self {
        self.stream_output = stream;
        self
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    pub fn config(&self) -> Option<&EnvironmentConfig> {
        self.config.as_ref()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Replace the config after a reconfigure; running containers are untouched.
    pub fn set_config(&mut self, config: EnvironmentConfig) {
        if self.state == EnvState::Unconfigured {
            self.state = EnvState::Stopped;
        }
        self.config = Some(config);
    }

    /// Align the tracked state with what Docker reports.
    pub fn observe(&mut self, report: &StatusReport) {
        if self.config.is_none() {
            return;
        }
        self.state = if report.running {
            EnvState::Running
        } else {
            EnvState::Stopped
        };
    }

    fn require_config(&self) -> Result<&EnvironmentConfig, JupyError> {
        self.config.as_ref().ok_or(JupyError::NotConfigured)
    }

    fn compose_args(&self, action: &[&str]) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "--env-file".to_string(),
            self.layout.env_file().to_string_lossy().to_string(),
            "-p".to_string(),
            COMPOSE_PROJECT.to_string(),
            "-f".to_string(),
            self.layout.compose_file().to_string_lossy().to_string(),
        ];
        args.extend(action.iter().map(|part| part.to_string()));
        args
    }

    fn compose_env(&self) -> BTreeMap<String, String> {
        match artifacts::read_env_file(&self.layout.env_file()) {
            Ok(envs) => envs,
            Err(err) => {
                tracing::debug!(error = %err, "env file unavailable; running compose without overrides");
                BTreeMap::new()
            }
        }
    }

    fn run_compose(&self, action: &[&str], capture: bool) -> Result<Vec<u8>, JupyError> {
        let args = self.compose_args(action);
        let envs = self.compose_env();
        let output = execute_docker(self.runner, &args, self.layout.root(), &envs, capture)?;
        Ok(output.stdout)
    }

    fn query_services(&self) -> Result<Vec<ServiceState>, JupyError> {
        let stdout = self.run_compose(&["ps", "--all", "--format", "json"], true)?;
        let text = String::from_utf8_lossy(&stdout);
        Ok(parse_compose_ps_output(&text)
            .into_iter()
            .filter(|row| MANAGED_SERVICES.contains(&row.service.as_str()))
            .collect())
    }

    pub fn build(&self) -> Result<(), JupyError> {
        let cfg = self.require_config()?;
        artifacts::generate(cfg, &self.layout)?;
        tracing::info!("building images");
        self.run_compose(&["build"], !self.stream_output)
            .map_err(|err| JupyError::BuildFailed(Box::new(err)))?;
        Ok(())
    }

    pub fn start(&mut self) -> Result<StartOutcome, JupyError> {
        self.start_with_cancel(&AtomicBool::new(false))
    }

    /// Bring services up and wait for the readiness credential.
    ///
    /// `cancel` abandons only the wait; services stay up as issued.
    pub fn start_with_cancel(&mut self, cancel: &AtomicBool) -> Result<StartOutcome, JupyError> {
        let cfg = self.require_config()?.clone();
        artifacts::generate(&cfg, &self.layout)?;

        let credential = cfg.readiness_file();
        match fs::remove_file(&credential) {
            Ok(()) => tracing::debug!(path = %credential.display(), "removed stale readiness credential"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self.run_compose(&["up", "-d"], !self.stream_output) {
            self.state = EnvState::Stopped;
            return Err(JupyError::StartFailed(Box::new(err)));
        }

        self.state = EnvState::Starting;
        let outcome = self.wait_for_readiness(&credential, cancel);
        self.state = EnvState::Running;
        match &outcome {
            StartOutcome::Ready { .. } => tracing::info!("environment ready"),
            StartOutcome::StillStarting => tracing::info!(
                attempts = self.readiness.attempts,
                "readiness credential not written yet; services may still be initializing"
            ),
            StartOutcome::Crashed { service, exit_code } => {
                tracing::warn!(%service, exit_code, "service exited during startup")
            }
            StartOutcome::Interrupted => tracing::info!("readiness wait interrupted"),
        }
        Ok(outcome)
    }

    fn wait_for_readiness(&self, credential: &Path, cancel: &AtomicBool) -> StartOutcome {
        // One credential read per attempt, with a sleep only between attempts.
        for attempt in 1..=self.readiness.attempts {
            if let Some(token) = read_readiness_token(credential) {
                return StartOutcome::Ready { token };
            }
            if let Some(crashed) = self.crashed_notebook() {
                return crashed;
            }
            if attempt == self.readiness.attempts {
                break;
            }
            tracing::debug!(attempt, "waiting for readiness credential");
            if !sleep_unless_cancelled(self.readiness.interval, cancel) {
                return StartOutcome::Interrupted;
            }
        }
        StartOutcome::StillStarting
    }

    fn crashed_notebook(&self) -> Option<StartOutcome> {
        let rows = self.query_services().ok()?;
        rows.into_iter()
            .find(|row| row.service == NOTEBOOK_SERVICE && row.has_exited())
            .map(|row| StartOutcome::Crashed {
                service: row.service,
                exit_code: row.exit_code,
            })
    }

    /// Tear down. Always ends `Stopped`; a failed teardown is reported, not raised.
    pub fn stop(&mut self) -> StopReport {
        let mut teardown_error = None;
        if self.layout.compose_file().exists() {
            if let Err(err) = self.run_compose(&["down"], true) {
                tracing::warn!(error = %err, "teardown failed; treating environment as stopped");
                teardown_error = Some(err.to_string());
            }
        } else {
            tracing::debug!("no compose file; nothing to tear down");
        }
        if self.config.is_some() {
            self.state = EnvState::Stopped;
        }
        StopReport { teardown_error }
    }

    /// Side-effect-free probe of container state plus the readiness credential.
    pub fn status(&self) -> StatusReport {
        let readiness_token = self
            .config
            .as_ref()
            .and_then(|cfg| read_readiness_token(&cfg.readiness_file()));
        if !self.layout.compose_file().exists() {
            return StatusReport {
                running: false,
                readiness_token,
                services: Vec::new(),
                query_error: None,
            };
        }
        match self.query_services() {
            Ok(rows) => {
                let running = rows.iter().any(ServiceState::is_running);
                StatusReport {
                    running,
                    readiness_token,
                    services: rows.into_iter().map(ServiceStatus::from).collect(),
                    query_error: None,
                }
            }
            Err(err) => StatusReport {
                running: false,
                readiness_token,
                services: Vec::new(),
                query_error: Some(err.to_string()),
            },
        }
    }
}

/// SIGINT routing for the readiness wait.
///
/// Outside [`InterruptGate::guard`] the flag stays set, so SIGINT keeps its
/// default action. Inside, the first SIGINT only sets the flag.
pub struct InterruptGate {
    flag: Arc<AtomicBool>,
}

impl InterruptGate {
    pub fn install() -> Result<Self, JupyError> {
        let flag = Arc::new(AtomicBool::new(true));
        #[cfg(unix)]
        {
            use signal_hook::consts::signal::SIGINT;
            use signal_hook::flag;
            // Order matters: the default check must see the flag before it is set.
            flag::register_conditional_default(SIGINT, Arc::clone(&flag))?;
            flag::register(SIGINT, Arc::clone(&flag))?;
        }
        Ok(Self { flag })
    }

    /// Run `f` with a cancellation flag that SIGINT sets.
    pub fn guard<T>(&self, f: impl FnOnce(&AtomicBool) -> T) -> T {
        self.flag.store(false, Ordering::SeqCst);
        let out = f(&self.flag);
        self.flag.store(true, Ordering::SeqCst);
        out
    }
}

/// Sleep `total` in short slices; returns false as soon as `cancel` is set.
fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) -> bool {
    let slice = Duration::from_millis(100);
    let deadline = Instant::now() + total;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(slice.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ComposeFile;
    use crate::config::AgentKind;
    use crate::docker::CommandOutput;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[derive(Debug, Clone)]
    struct RecordedCall {
        args: Vec<String>,
        env_overrides: BTreeMap<String, String>,
    }

    #[derive(Default)]
    struct MockDockerRunner {
        calls: RefCell<Vec<RecordedCall>>,
        outputs: RefCell<Vec<CommandOutput>>,
    }

    impl MockDockerRunner {
        fn push_output(&self, output: CommandOutput) {
            self.outputs.borrow_mut().push(output);
        }

        fn calls(&self) -> Vec<RecordedCall> {
            self.calls.borrow().clone()
        }

        fn actions(&self) -> Vec<String> {
            self.calls()
                .iter()
                .map(|call| {
                    let idx = call.args.iter().position(|a| a.ends_with(".yml")).unwrap();
                    call.args[idx + 1..].join(" ")
                })
                .collect()
        }
    }

    impl DockerRunner for MockDockerRunner {
        fn run(
            &self,
            args: &[String],
            _cwd: &Path,
            env_overrides: &BTreeMap<String, String>,
            _capture_output: bool,
        ) -> Result<CommandOutput, io::Error> {
            self.calls.borrow_mut().push(RecordedCall {
                args: args.to_vec(),
                env_overrides: env_overrides.clone(),
            });
            let mut queued = self.outputs.borrow_mut();
            if queued.is_empty() {
                return Ok(CommandOutput::default());
            }
            Ok(queued.remove(0))
        }
    }

    fn ok_stdout(text: &str) -> CommandOutput {
        CommandOutput {
            status_code: 0,
            stdout: text.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            status_code: 1,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    fn fast_policy(attempts: u32) -> ReadinessPolicy {
        ReadinessPolicy {
            attempts,
            interval: Duration::from_millis(10),
        }
    }

    fn setup(root: &Path) -> (Layout, EnvironmentConfig) {
        let layout = Layout::new(root.join("home"));
        let ro = root.join("ro");
        fs::create_dir_all(&ro).unwrap();
        let cfg = EnvironmentConfig {
            version: crate::config::current_version().to_string(),
            agent_kind: AgentKind::Opencode,
            read_only_path: ro,
            read_write_path: root.join("rw"),
            access_token: "jupyagent".to_string(),
            secrets: BTreeMap::new(),
            configured_at: None,
        };
        (layout, cfg)
    }

    #[test]
    fn operations_require_config() {
        let dir = tempdir().unwrap();
        let runner = MockDockerRunner::default();
        let mut controller = Controller::new(Layout::new(dir.path()), None, &runner);
        assert_eq!(controller.state(), EnvState::Unconfigured);
        assert!(matches!(controller.build(), Err(JupyError::NotConfigured)));
        assert!(matches!(controller.start(), Err(JupyError::NotConfigured)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn build_runs_compose_build_with_env_overrides() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        let runner = MockDockerRunner::default();
        let controller = Controller::new(layout.clone(), Some(cfg.clone()), &runner);
        controller.build().unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let args = &calls[0].args;
        assert_eq!(args[0], "compose");
        let env_idx = args.iter().position(|a| a == "--env-file").unwrap();
        assert_eq!(args[env_idx + 1], layout.env_file().to_string_lossy());
        let p_idx = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p_idx + 1], "jupyagent");
        assert_eq!(args.last().unwrap(), "build");
        assert_eq!(
            calls[0].env_overrides.get("RW_PATH").map(String::as_str),
            Some(cfg.read_write_path.to_string_lossy().as_ref())
        );
        assert_eq!(controller.state(), EnvState::Stopped);
    }

    #[test]
    fn build_failure_is_reported_and_config_untouched() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        crate::config::save(&layout, &cfg).unwrap();
        let runner = MockDockerRunner::default();
        runner.push_output(failed("failed to solve: dockerfile parse error"));
        let controller = Controller::new(layout.clone(), Some(cfg.clone()), &runner);
        let err = controller.build().unwrap_err();
        assert!(matches!(err, JupyError::BuildFailed(_)));
        assert_eq!(crate::config::load(&layout), Some(cfg));
        assert_eq!(controller.state(), EnvState::Stopped);
    }

    #[test]
    fn start_removes_stale_credential_before_up() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        fs::create_dir_all(&cfg.read_write_path).unwrap();
        fs::write(cfg.readiness_file(), "stale-token\n").unwrap();
        let runner = MockDockerRunner::default();
        let mut controller =
            Controller::new(layout, Some(cfg.clone()), &runner).with_readiness(fast_policy(2));
        let outcome = controller.start().unwrap();
        assert_eq!(outcome, StartOutcome::StillStarting);
        assert!(!cfg.readiness_file().exists());
        assert_eq!(controller.state(), EnvState::Running);
        let actions = runner.actions();
        assert_eq!(actions[0], "up -d");
    }

    #[test]
    fn start_failure_keeps_stopped_state() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        let runner = MockDockerRunner::default();
        runner.push_output(failed("Bind for 127.0.0.1:8888 failed: port is already allocated"));
        let mut controller = Controller::new(layout, Some(cfg), &runner);
        let err = controller.start().unwrap_err();
        assert!(matches!(err, JupyError::StartFailed(_)));
        assert_eq!(
            err.process_details().map(|d| d.error_code.as_str()),
            Some("docker_port_conflict")
        );
        assert_eq!(controller.state(), EnvState::Stopped);
        assert_eq!(runner.actions(), vec!["up -d"]);
    }

    #[test]
    fn start_captures_credential_written_during_poll() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        let runner = MockDockerRunner::default();
        let mut controller = Controller::new(layout, Some(cfg.clone()), &runner).with_readiness(
            ReadinessPolicy {
                attempts: 100,
                interval: Duration::from_millis(50),
            },
        );
        let credential = cfg.readiness_file();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            fs::write(&credential, "  abc123\n").unwrap();
        });
        let outcome = controller.start().unwrap();
        writer.join().unwrap();
        assert_eq!(
            outcome,
            StartOutcome::Ready {
                token: "abc123".to_string()
            }
        );
        assert_eq!(controller.state(), EnvState::Running);
    }

    #[test]
    fn empty_credential_is_not_ready() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        let runner = MockDockerRunner::default();
        let mut controller =
            Controller::new(layout, Some(cfg.clone()), &runner).with_readiness(fast_policy(3));
        let credential = cfg.readiness_file();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            fs::write(&credential, "   \n").unwrap();
        });
        let outcome = controller.start().unwrap();
        writer.join().unwrap();
        assert_eq!(outcome, StartOutcome::StillStarting);
    }

    #[test]
    fn poll_detects_crashed_notebook() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        let runner = MockDockerRunner::default();
        runner.push_output(ok_stdout(""));
        runner.push_output(ok_stdout(
            r#"[{"Service":"notebook","State":"exited","ExitCode":1},{"Service":"terminal","State":"running","ExitCode":0}]"#,
        ));
        let mut controller =
            Controller::new(layout, Some(cfg), &runner).with_readiness(fast_policy(30));
        let outcome = controller.start().unwrap();
        assert_eq!(
            outcome,
            StartOutcome::Crashed {
                service: "notebook".to_string(),
                exit_code: 1
            }
        );
        assert_eq!(
            runner.actions(),
            vec!["up -d", "ps --all --format json"]
        );
    }

    #[test]
    fn cancelled_wait_leaves_services_up() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        let runner = MockDockerRunner::default();
        let mut controller =
            Controller::new(layout, Some(cfg), &runner).with_readiness(ReadinessPolicy {
                attempts: 30,
                interval: Duration::from_secs(1),
            });
        let cancel = AtomicBool::new(true);
        let started = Instant::now();
        let outcome = controller.start_with_cancel(&cancel).unwrap();
        assert_eq!(outcome, StartOutcome::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!runner.actions().iter().any(|a| a == "down"));

        runner.push_output(ok_stdout(r#"{"Service":"notebook","State":"running"}"#));
        let report = controller.status();
        assert!(report.running);
        assert_eq!(report.readiness_token, None);
    }

    #[test]
    fn repeated_start_does_not_accumulate_mounts() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        let runner = MockDockerRunner::default();
        let mut controller =
            Controller::new(layout.clone(), Some(cfg), &runner).with_readiness(fast_policy(1));
        controller.start().unwrap();
        let first = fs::read_to_string(layout.compose_file()).unwrap();
        controller.start().unwrap();
        let second = fs::read_to_string(layout.compose_file()).unwrap();
        assert_eq!(first, second);
        let topology: ComposeFile = serde_yaml::from_str(&second).unwrap();
        let notebook = &topology.services[NOTEBOOK_SERVICE];
        assert_eq!(notebook.volumes.len(), 2);
        assert_eq!(notebook.ports.len(), 1);
    }

    #[test]
    fn stop_is_stopped_even_when_teardown_fails() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        crate::artifacts::generate(&cfg, &layout).unwrap();
        let runner = MockDockerRunner::default();
        runner.push_output(failed("Error response from daemon: conflict"));
        let mut controller = Controller::new(layout, Some(cfg), &runner);
        controller.observe(&StatusReport {
            running: true,
            readiness_token: None,
            services: Vec::new(),
            query_error: None,
        });
        assert_eq!(controller.state(), EnvState::Running);
        let report = controller.stop();
        assert_eq!(controller.state(), EnvState::Stopped);
        let error = report.teardown_error.expect("teardown failure is observable");
        assert!(error.contains("conflict"));
        assert_eq!(runner.actions(), vec!["down"]);

        let report = controller.stop();
        assert!(report.teardown_error.is_none());
        assert_eq!(controller.state(), EnvState::Stopped);
    }

    #[test]
    fn stop_without_artifacts_runs_nothing() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        let runner = MockDockerRunner::default();
        let mut controller = Controller::new(layout, Some(cfg), &runner);
        let report = controller.stop();
        assert!(report.teardown_error.is_none());
        assert!(runner.calls().is_empty());
        assert_eq!(controller.state(), EnvState::Stopped);
    }

    #[test]
    fn status_without_credential_reports_starting() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        crate::artifacts::generate(&cfg, &layout).unwrap();
        fs::write(cfg.readiness_file(), "abc123").unwrap();
        fs::remove_file(cfg.readiness_file()).unwrap();
        let runner = MockDockerRunner::default();
        runner.push_output(ok_stdout(
            "{\"Service\":\"notebook\",\"State\":\"running\"}\n{\"Service\":\"agent\",\"State\":\"running\"}\n{\"Service\":\"unrelated\",\"State\":\"running\"}",
        ));
        let controller = Controller::new(layout, Some(cfg), &runner);
        let report = controller.status();
        assert!(report.running);
        assert_eq!(report.readiness_token, None);
        assert_eq!(report.services.len(), 2);
        assert_eq!(runner.actions(), vec!["ps --all --format json"]);
    }

    #[test]
    fn status_reads_credential_and_tolerates_query_failure() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        crate::artifacts::generate(&cfg, &layout).unwrap();
        fs::write(cfg.readiness_file(), "abc123\n").unwrap();
        let runner = MockDockerRunner::default();
        runner.push_output(failed("Cannot connect to the Docker daemon"));
        let controller = Controller::new(layout, Some(cfg), &runner);
        let report = controller.status();
        assert!(!report.running);
        assert_eq!(report.readiness_token.as_deref(), Some("abc123"));
        assert!(report.query_error.unwrap().contains("Cannot connect"));
    }

    #[test]
    fn status_without_compose_file_is_not_running() {
        let dir = tempdir().unwrap();
        let runner = MockDockerRunner::default();
        let controller = Controller::new(Layout::new(dir.path()), None, &runner);
        let report = controller.status();
        assert!(!report.running);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn fresh_host_scenario_reaches_ready() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        assert!(crate::config::load(&layout).is_none());
        crate::config::save(&layout, &cfg).unwrap();
        let loaded = crate::config::load(&layout).unwrap();

        let runner = MockDockerRunner::default();
        let mut controller = Controller::new(layout, Some(loaded), &runner).with_readiness(
            ReadinessPolicy {
                attempts: 30,
                interval: Duration::from_millis(100),
            },
        );
        controller.build().unwrap();
        assert!(cfg.read_write_path.is_dir());

        let credential: PathBuf = cfg.readiness_file();
        let harness = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            fs::write(&credential, "abc123").unwrap();
        });
        let outcome = controller.start().unwrap();
        harness.join().unwrap();
        assert!(matches!(outcome, StartOutcome::Ready { .. }));

        runner.push_output(ok_stdout(r#"[{"Service":"notebook","State":"running"}]"#));
        let report = controller.status();
        assert!(report.running);
        assert_eq!(report.readiness_token.as_deref(), Some("abc123"));
    }

    #[test]
    fn service_urls_embed_token_when_ready() {
        let dir = tempdir().unwrap();
        let (_, mut cfg) = setup(dir.path());
        let urls = service_urls(&cfg, Some("abc123"));
        assert_eq!(urls[0].url, "http://localhost:8888/lab?token=abc123");
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[2].url, "http://localhost:3000");

        cfg.agent_kind = AgentKind::Claude;
        let urls = service_urls(&cfg, None);
        assert_eq!(urls.len(), 2);
        assert!(!urls[0].ready);
        assert_eq!(urls[0].url, "http://localhost:8888/lab?token=jupyagent");
    }

    #[test]
    fn service_urls_percent_encode_token() {
        let dir = tempdir().unwrap();
        let (_, mut cfg) = setup(dir.path());
        let urls = service_urls(&cfg, Some("a&b#c d"));
        assert_eq!(urls[0].url, "http://localhost:8888/lab?token=a%26b%23c%20d");

        cfg.access_token = "x/y?z".to_string();
        let urls = service_urls(&cfg, None);
        assert_eq!(urls[0].url, "http://localhost:8888/lab?token=x%2Fy%3Fz");
        assert!(!urls[0].ready);
    }

    #[test]
    fn default_readiness_is_thirty_one_second_checks() {
        let policy = ReadinessPolicy::default();
        assert_eq!((policy.attempts, policy.interval), (30, Duration::from_secs(1)));
    }

    #[test]
    fn readiness_checks_are_bounded_by_attempts() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = setup(dir.path());
        let runner = MockDockerRunner::default();
        let mut controller =
            Controller::new(layout, Some(cfg), &runner).with_readiness(fast_policy(3));
        assert_eq!(controller.start().unwrap(), StartOutcome::StillStarting);
        let polls = runner
            .actions()
            .iter()
            .filter(|action| action.starts_with("ps "))
            .count();
        assert_eq!(polls, 3);

        let runner = MockDockerRunner::default();
        let (layout, cfg) = setup(dir.path());
        let mut controller = Controller::new(layout, Some(cfg), &runner).with_readiness(
            ReadinessPolicy {
                attempts: 0,
                ..ReadinessPolicy::default()
            },
        );
        assert_eq!(controller.start().unwrap(), StartOutcome::StillStarting);
        assert_eq!(runner.actions(), vec!["up -d"]);
    }

    #[test]
    fn gate_clears_flag_only_inside_guard() {
        let gate = InterruptGate {
            flag: Arc::new(AtomicBool::new(true)),
        };
        let seen = gate.guard(|cancel| cancel.load(Ordering::SeqCst));
        assert!(!seen);
        assert!(gate.flag.load(Ordering::SeqCst));
    }

    #[test]
    fn sleep_returns_early_on_cancel() {
        let cancel = AtomicBool::new(false);
        assert!(sleep_unless_cancelled(Duration::from_millis(20), &cancel));
        cancel.store(true, Ordering::SeqCst);
        let started = Instant::now();
        assert!(!sleep_unless_cancelled(Duration::from_secs(10), &cancel));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
