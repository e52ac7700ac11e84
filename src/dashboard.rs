use crate::config;
use crate::docker::DockerRunner;
use crate::error::JupyError;
use crate::lifecycle::{self, Controller, InterruptGate, StartOutcome, StatusReport};
use crate::lock::EnvLock;
use crate::setup::{self, SetupRequest};
use dialoguer::console::{style, Term};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Select};
use std::env;
use std::io::{self, IsTerminal};
use std::process::{Command, Stdio};

const HELP_TEXT: &str = "\
JupyAgent runs an AI coding agent next to Jupyter Lab inside Docker containers.

Services:
  Jupyter Lab    notebook server the agent drives; opened with an access token
  Web Terminal   browser shell into the workspace (localhost only, no auth)
  Agent          opencode (web UI on :3000), Claude Code or Gemini CLI

Paths:
  Read-only path    mounted at /mnt/ro_data; agents can read but not modify it
  Read-write path   mounted at /workspace; your work persists here between sessions

Agent sign-in state is kept under the jupyagent home directory and survives
reconfiguration and image rebuilds.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuAction {
    Toggle,
    OpenJupyter,
    OpenTerminal,
    OpenAgent,
    Reconfigure,
    Help,
    Exit,
}

/// Open `url` with the platform opener. Returns false when none could run.
pub fn open_browser(url: &str) -> bool {
    let mut cmd = match env::consts::OS {
        "macos" => {
            let mut cmd = Command::new("open");
            cmd.arg(url);
            cmd
        }
        "windows" => {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", "start", "", url]);
            cmd
        }
        _ => {
            let mut cmd = Command::new("xdg-open");
            cmd.arg(url);
            cmd
        }
    };
    let opened = cmd
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if !opened {
        tracing::debug!(%url, "no browser opener available");
    }
    opened
}

fn open_or_print(label: &str, url: &str) -> String {
    if open_browser(url) {
        format!("Opened {label} at {url}")
    } else {
        format!("Unable to open a browser automatically. Please open: {url}")
    }
}

pub fn show_help() -> Result<(), JupyError> {
    println!();
    println!("{}", style("About JupyAgent").bold().cyan());
    println!();
    println!("{HELP_TEXT}");
    println!();
    let _: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Press Enter to continue")
        .allow_empty(true)
        .interact_text()?;
    Ok(())
}

fn render_header(report: &StatusReport) {
    let status = if report.running {
        style("● Running").green().bold()
    } else {
        style("○ Stopped").red().bold()
    };
    println!();
    println!("{}  {}", style("JupyAgent").cyan().bold(), status);
    if let Some(err) = &report.query_error {
        println!("{}", style(format!("status query failed: {err}")).yellow());
    }
}

fn render_services<R: DockerRunner + ?Sized>(controller: &Controller<'_, R>, report: &StatusReport) {
    let Some(cfg) = controller.config() else {
        return;
    };
    println!();
    println!("{}", style("Services").bold());
    for url in lifecycle::service_urls(cfg, report.readiness_token.as_deref()) {
        let suffix = if url.ready {
            String::new()
        } else {
            format!(" {}", style("(starting...)").dim())
        };
        println!("  {:<14} {}{}", style(url.name).bold(), url.url, suffix);
    }
    if cfg.agent_kind.web_ui_port().is_none() {
        println!(
            "  {:<14} {}",
            style(cfg.agent_kind.display_name()).bold(),
            style(format!("docker exec -it jupyagent-agent {}", cfg.agent_kind)).dim()
        );
    }
}

fn start_message<R: DockerRunner + ?Sized>(
    controller: &mut Controller<'_, R>,
    gate: &InterruptGate,
) -> String {
    let _lock = match EnvLock::acquire(controller.layout()) {
        Ok(lock) => lock,
        Err(err) => return format!("Cannot start services: {err}"),
    };
    println!("{}", style("Starting services...").cyan());
    let outcome = gate.guard(|cancel| controller.start_with_cancel(cancel));
    match outcome {
        Ok(StartOutcome::Ready { token }) => {
            if let Some(cfg) = controller.config() {
                for url in lifecycle::service_urls(cfg, Some(&token)) {
                    open_browser(&url.url);
                }
            }
            "Services started successfully.".to_string()
        }
        Ok(StartOutcome::StillStarting) => {
            "Services are up but Jupyter is still initializing; check again shortly.".to_string()
        }
        Ok(StartOutcome::Crashed { service, exit_code }) => format!(
            "The {service} service exited with code {exit_code} during startup. Check `docker logs jupyagent-{service}`."
        ),
        Ok(StartOutcome::Interrupted) => {
            "Stopped waiting; services keep starting in the background.".to_string()
        }
        Err(err) => format!("Failed to start services: {err}"),
    }
}

fn stop_message<R: DockerRunner + ?Sized>(controller: &mut Controller<'_, R>) -> String {
    let _lock = match EnvLock::acquire(controller.layout()) {
        Ok(lock) => lock,
        Err(err) => return format!("Cannot stop services: {err}"),
    };
    println!("{}", style("Stopping services...").yellow());
    match controller.stop().teardown_error {
        None => "Services stopped.".to_string(),
        Some(err) => format!("Services marked stopped, but teardown reported: {err}"),
    }
}

fn reconfigure<R: DockerRunner + ?Sized>(controller: &mut Controller<'_, R>) -> Result<String, JupyError> {
    let seed = SetupRequest::from_existing(controller.config());
    let Some(request) = setup::prompt_setup(controller.config(), seed)? else {
        return Ok("Setup aborted; configuration unchanged.".to_string());
    };
    let _lock = EnvLock::acquire(controller.layout())?;
    println!("{}", style("Building Docker environment...").cyan());
    match setup::configure(controller, &request, true) {
        Ok(_) => Ok("Configuration updated.".to_string()),
        Err(err @ JupyError::BuildFailed(_)) => Ok(format!("Configuration saved, but {err}")),
        Err(err) => Err(err),
    }
}

/// First-run setup and the version-drift prompt, before the menu loop.
fn ensure_configured<R: DockerRunner + ?Sized>(controller: &mut Controller<'_, R>) -> Result<bool, JupyError> {
    if controller.config().is_none() {
        show_help()?;
        let seed = SetupRequest::from_existing(None);
        let Some(request) = setup::prompt_setup(None, seed)? else {
            println!("{}", style("Aborted.").red());
            return Ok(false);
        };
        let _lock = EnvLock::acquire(controller.layout())?;
        println!("{}", style("Building Docker environment...").cyan());
        setup::configure(controller, &request, true)?;
        println!("{}", style("Setup complete!").green());
        return Ok(true);
    }
    let configured_version = controller
        .config()
        .map(|cfg| cfg.version.clone())
        .unwrap_or_default();

    let running = config::current_version();
    if config::needs_reconfigure(&configured_version, running) {
        let from = if configured_version.trim().is_empty() {
            "unknown"
        } else {
            configured_version.as_str()
        };
        println!(
            "{} {from} -> {running}",
            style("New version detected:").yellow()
        );
        let reconfigure_now = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Re-configure to apply updates?")
            .default(true)
            .interact()?;
        if reconfigure_now {
            println!("{}", reconfigure(controller)?);
        }
    }
    Ok(true)
}

fn menu(report: &StatusReport, agent_label: &str) -> Result<MenuAction, JupyError> {
    let toggle = if report.running {
        "Stop services"
    } else {
        "Start services"
    };
    let open_agent = format!("Open {agent_label}");
    let entries: [(&str, MenuAction); 7] = [
        (toggle, MenuAction::Toggle),
        ("Open Jupyter Lab", MenuAction::OpenJupyter),
        ("Open web terminal", MenuAction::OpenTerminal),
        (open_agent.as_str(), MenuAction::OpenAgent),
        ("Re-configure", MenuAction::Reconfigure),
        ("Help", MenuAction::Help),
        ("Exit", MenuAction::Exit),
    ];
    let items: Vec<&str> = entries.iter().map(|(label, _)| *label).collect();
    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("(↑/↓ to move, Enter to select, Esc to exit)")
        .items(&items)
        .default(0)
        .interact_opt()?;
    Ok(choice.map_or(MenuAction::Exit, |idx| entries[idx].1))
}

/// Interactive entry point: configure if needed, then loop over the menu.
pub fn run<R: DockerRunner + ?Sized>(
    controller: &mut Controller<'_, R>,
    gate: &InterruptGate,
) -> Result<(), JupyError> {
    if !io::stdin().is_terminal() {
        return Err(JupyError::Config(
            "the dashboard requires a TTY; use subcommands such as `jupyagent up` instead"
                .to_string(),
        ));
    }
    if !ensure_configured(controller)? {
        return Ok(());
    }

    let mut message = String::new();
    loop {
        let report = controller.status();
        controller.observe(&report);

        if io::stdout().is_terminal() {
            if let Err(err) = Term::stdout().clear_screen() {
                tracing::debug!(error = %err, "failed to clear screen");
            }
        }
        render_header(&report);
        if !message.is_empty() {
            println!("\n{message}");
            message.clear();
        }
        if report.running {
            render_services(controller, &report);
        }
        println!();

        let agent_label = controller
            .config()
            .map(|cfg| cfg.agent_kind.display_name())
            .unwrap_or("agent");
        message = match menu(&report, agent_label)? {
            MenuAction::Toggle if report.running => stop_message(controller),
            MenuAction::Toggle => start_message(controller, gate),
            MenuAction::OpenJupyter => match controller.config() {
                Some(cfg) => {
                    let urls = lifecycle::service_urls(cfg, report.readiness_token.as_deref());
                    open_or_print("Jupyter Lab", &urls[0].url)
                }
                None => "Not configured.".to_string(),
            },
            MenuAction::OpenTerminal => open_or_print(
                "Web Terminal",
                &format!("http://localhost:{}", crate::artifacts::TERMINAL_HOST_PORT),
            ),
            MenuAction::OpenAgent => match controller.config().map(|cfg| cfg.agent_kind) {
                Some(kind) => match kind.web_ui_port() {
                    Some(port) => {
                        open_or_print(kind.display_name(), &format!("http://localhost:{port}"))
                    }
                    None => format!(
                        "{} has no web UI. Attach with: docker exec -it jupyagent-agent {kind}",
                        kind.display_name()
                    ),
                },
                None => "Not configured.".to_string(),
            },
            MenuAction::Reconfigure => match reconfigure(controller) {
                Ok(msg) => msg,
                Err(err @ JupyError::Prompt(_)) => return Err(err),
                Err(err) => format!("Reconfiguration failed: {err}"),
            },
            MenuAction::Help => {
                show_help()?;
                String::new()
            }
            MenuAction::Exit => {
                println!("Bye!");
                return Ok(());
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts;
    use crate::config::{AgentKind, EnvironmentConfig, Layout};
    use crate::docker::CommandOutput;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingRunner {
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl DockerRunner for RecordingRunner {
        fn run(
            &self,
            args: &[String],
            _cwd: &Path,
            _env_overrides: &BTreeMap<String, String>,
            _capture_output: bool,
        ) -> Result<CommandOutput, io::Error> {
            self.calls.borrow_mut().push(args.to_vec());
            Ok(CommandOutput::default())
        }
    }

    fn configured(root: &Path) -> (Layout, EnvironmentConfig) {
        let layout = Layout::new(root.join("home"));
        let cfg = EnvironmentConfig {
            version: config::current_version().to_string(),
            agent_kind: AgentKind::Opencode,
            read_only_path: root.to_path_buf(),
            read_write_path: root.join("rw"),
            access_token: "jupyagent".to_string(),
            secrets: BTreeMap::new(),
            configured_at: None,
        };
        artifacts::generate(&cfg, &layout).unwrap();
        (layout, cfg)
    }

    #[test]
    fn stop_holds_lock_only_while_tearing_down() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = configured(dir.path());
        let runner = RecordingRunner::default();
        let mut controller = Controller::new(layout.clone(), Some(cfg), &runner);

        assert_eq!(stop_message(&mut controller), "Services stopped.");
        assert!(runner
            .calls
            .borrow()
            .iter()
            .any(|args| args.last().map(String::as_str) == Some("down")));
        assert!(EnvLock::acquire(&layout).is_ok());
    }

    #[test]
    fn stop_skips_teardown_while_another_process_mutates() {
        let dir = tempdir().unwrap();
        let (layout, cfg) = configured(dir.path());
        let runner = RecordingRunner::default();
        let mut controller = Controller::new(layout.clone(), Some(cfg), &runner);

        let _busy = EnvLock::acquire(&layout).unwrap();
        let message = stop_message(&mut controller);
        assert!(message.contains("another jupyagent instance"), "{message}");
        assert!(runner.calls.borrow().is_empty());
    }

    #[test]
    fn help_mentions_both_mount_points() {
        assert!(HELP_TEXT.contains("/mnt/ro_data"));
        assert!(HELP_TEXT.contains("/workspace"));
    }
}
