use crate::error::{JupyError, ProcessErrorDetails};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::io;
use std::io::IsTerminal;
use std::path::Path;
use std::process::{Command, Stdio};

/// Invocation prefix that reaches the daemon, resolved once per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerCommand {
    prefix: Vec<String>,
}

impl DockerCommand {
    pub fn direct() -> Self {
        Self {
            prefix: vec!["docker".to_string()],
        }
    }

    pub fn escalated() -> Self {
        Self {
            prefix: vec!["sudo".to_string(), "docker".to_string()],
        }
    }

    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }

    pub fn is_escalated(&self) -> bool {
        self.prefix.first().map(String::as_str) == Some("sudo")
    }
}

fn daemon_hint(os: &str) -> String {
    match os {
        "linux" => "try running: sudo systemctl start docker".to_string(),
        "macos" => "please open Docker Desktop".to_string(),
        _ => "start the Docker daemon and retry".to_string(),
    }
}

/// Pick the first prefix for which `probe` succeeds on `info`.
///
/// The privileged attempt is only made on Linux; elsewhere Docker Desktop
/// owns the socket and sudo does not help.
pub fn resolve_with<P>(os: &str, mut probe: P) -> Result<DockerCommand, JupyError>
where
    P: FnMut(&DockerCommand) -> bool,
{
    let direct = DockerCommand::direct();
    if probe(&direct) {
        return Ok(direct);
    }
    if os == "linux" {
        let escalated = DockerCommand::escalated();
        if probe(&escalated) {
            tracing::info!("docker daemon reachable only through sudo");
            return Ok(escalated);
        }
    }
    Err(JupyError::DaemonUnreachable {
        hint: daemon_hint(os),
    })
}

pub fn resolve_docker_command() -> Result<DockerCommand, JupyError> {
    if which::which("docker").is_err() {
        return Err(JupyError::DockerNotFound);
    }
    let interactive = io::stdin().is_terminal();
    resolve_with(env::consts::OS, |command| {
        let mut argv: Vec<String> = command.prefix().to_vec();
        if command.is_escalated() && !interactive {
            argv.insert(1, "-n".to_string());
        }
        argv.push("info".to_string());
        tracing::debug!(command = %argv.join(" "), "probing docker daemon");
        Command::new(&argv[0])
            .args(&argv[1..])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    })
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

pub trait DockerRunner {
    fn run(
        &self,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error>;

    fn render(&self, args: &[String]) -> String {
        render_docker_command(&["docker".to_string()], args)
    }
}

pub struct RealDockerRunner {
    command: DockerCommand,
}

impl RealDockerRunner {
    pub fn new(command: DockerCommand) -> Self {
        Self { command }
    }
}

impl DockerRunner for RealDockerRunner {
    fn run(
        &self,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        let prefix = self.command.prefix();
        let mut cmd = Command::new(&prefix[0]);
        cmd.args(&prefix[1..]).args(args).current_dir(cwd);
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        if capture_output {
            let output = cmd.output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    fn render(&self, args: &[String]) -> String {
        render_docker_command(self.command.prefix(), args)
    }
}

pub fn render_docker_command(prefix: &[String], args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    prefix
        .iter()
        .chain(args.iter())
        .map(|part| shell_quote(part))
        .collect::<Vec<_>>()
        .join(" ")
}

fn docker_spawn_error_details(err: &io::Error, command: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        return ProcessErrorDetails {
            error_code: "docker_not_found".to_string(),
            hint: Some("Install Docker and ensure `docker` is on your PATH.".to_string()),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ProcessErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

pub fn classify_docker_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("unknown command: docker compose")
        || lower.contains("is not a docker command")
        || lower.contains("unknown flag: --env-file")
    {
        return (
            "docker_compose_unavailable".to_string(),
            Some("Docker Compose v2 is unavailable. Install the compose plugin and retry.".to_string()),
        );
    }

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some("Docker daemon is unreachable. Start Docker and retry.".to_string()),
        );
    }

    if lower.contains("port is already allocated")
        || lower.contains("address already in use")
    {
        return (
            "docker_port_conflict".to_string(),
            Some(
                "A required host port (8888, 8282, 3000 or 1455) is already in use. Free it and retry."
                    .to_string(),
            ),
        );
    }

    if lower.contains("pull access denied")
        || lower.contains("unauthorized")
        || lower.contains("authentication required")
    {
        return (
            "docker_registry_auth".to_string(),
            Some("Image pull was denied. Check `docker login` and network access.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

/// Run a docker command and turn spawn errors or non-zero exits into `ProcessDetailed`.
pub fn execute_docker<R: DockerRunner + ?Sized>(
    runner: &R,
    args: &[String],
    cwd: &Path,
    env_overrides: &BTreeMap<String, String>,
    capture_output: bool,
) -> Result<CommandOutput, JupyError> {
    let command = runner.render(args);
    tracing::debug!(%command, "running docker");
    let cmd_output = runner
        .run(args, cwd, env_overrides, capture_output)
        .map_err(|err| {
            let details = docker_spawn_error_details(&err, &command);
            JupyError::ProcessDetailed {
                message: format!("failed to run command `{command}`: {err}"),
                details,
            }
        })?;
    if !cmd_output.success() {
        let stderr = String::from_utf8_lossy(&cmd_output.stderr)
            .trim()
            .to_string();
        let (error_code, hint) = classify_docker_command_failure(&stderr);
        let mut message = format!(
            "command failed with status {} while running `{}`",
            cmd_output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        if let Some(ref hint_message) = hint {
            message = format!("{message}\nHint: {hint_message}");
        }
        return Err(JupyError::ProcessDetailed {
            message,
            details: ProcessErrorDetails {
                error_code,
                hint,
                command: Some(command),
                raw_stderr: if stderr.is_empty() {
                    None
                } else {
                    Some(stderr)
                },
            },
        });
    }
    Ok(cmd_output)
}

/// One row of `docker compose ps --format json`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServiceState {
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
}

impl ServiceState {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }

    pub fn has_exited(&self) -> bool {
        self.state.eq_ignore_ascii_case("exited") || self.state.eq_ignore_ascii_case("dead")
    }
}

/// Compose prints an array, a single object, or one object per line
/// depending on version; accept all three.
pub fn parse_compose_ps_output(text: &str) -> Vec<ServiceState> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        Ok(value @ serde_json::Value::Object(_)) => {
            serde_json::from_value::<ServiceState>(value)
                .into_iter()
                .collect()
        }
        Ok(_) => Vec::new(),
        Err(_) => trimmed
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_str::<ServiceState>(line).ok())
            .collect(),
    }
}
