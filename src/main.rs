mod artifacts;
mod config;
mod dashboard;
mod docker;
mod error;
mod lifecycle;
mod lock;
mod setup;

use crate::config::{AgentKind, Layout};
use crate::docker::{resolve_docker_command, RealDockerRunner};
use crate::error::{JupyError, ProcessErrorDetails};
use crate::lifecycle::{Controller, InterruptGate, ReadinessPolicy, StartOutcome};
use crate::lock::EnvLock;
use crate::setup::SetupRequest;
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::console::style;
use serde::Serialize;
use serde_json::json;
use std::env;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_ENV: &str = "JUPYAGENT_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "jupyagent",
    version,
    about = "Jupyter Lab, a web terminal and an AI coding agent in one local Docker environment"
)]
struct Cli {
    /// State directory (defaults to $JUPYAGENT_HOME, then ~/.jupyagent)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configure paths and agent, then build images
    Setup {
        #[arg(long)]
        ro_path: Option<String>,
        #[arg(long)]
        rw_path: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, default_value_t = false)]
        yes: bool,
        #[arg(long, default_value_t = false)]
        no_build: bool,
    },
    Build,
    Up {
        #[arg(long, default_value_t = false)]
        no_wait: bool,
    },
    Down,
    Status,
    Urls,
    Open {
        #[arg(value_enum)]
        target: OpenTarget,
    },
    Paths,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OpenTarget {
    Jupyter,
    Terminal,
    Agent,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    layout: Layout,
    json: bool,
}

fn init_logging(verbose: bool) {
    let filter = match env::var(LOG_ENV) {
        Ok(spec) if !spec.trim().is_empty() => EnvFilter::new(spec),
        _ if verbose => EnvFilter::new("jupyagent=debug"),
        _ => EnvFilter::new("jupyagent=warn"),
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(io::stderr),
        )
        .with(filter)
        .init();
}

fn main() -> Result<(), JupyError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let ctx = Context {
        layout: Layout::resolve(cli.home.as_ref()),
        json: cli.json,
    };

    if let Err(err) = run(&ctx, cli.command) {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.process_details().cloned(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{} {err}", style("Error:").red().bold());
        }
        std::process::exit(if err.is_fatal_startup() { 2 } else { 1 });
    }
    Ok(())
}

fn run(ctx: &Context, command: Option<Commands>) -> Result<(), JupyError> {
    if let Some(Commands::Paths) = command {
        return handle_paths(ctx);
    }

    let docker = resolve_docker_command()?;
    tracing::debug!(prefix = ?docker.prefix(), "docker command resolved");
    let runner = RealDockerRunner::new(docker);
    let stream = !ctx.json && io::stdout().is_terminal();
    let mut controller = Controller::new(ctx.layout.clone(), config::load(&ctx.layout), &runner)
        .with_streamed_output(stream);

    match command {
        None => {
            let gate = InterruptGate::install()?;
            dashboard::run(&mut controller, &gate)
        }
        Some(Commands::Setup {
            ro_path,
            rw_path,
            agent,
            token,
            api_key,
            yes,
            no_build,
        }) => {
            let flags = SetupFlags {
                ro_path,
                rw_path,
                agent,
                token,
                api_key,
                yes,
                no_build,
            };
            handle_setup(ctx, &mut controller, flags)
        }
        Some(Commands::Build) => handle_build(ctx, &controller),
        Some(Commands::Up { no_wait }) => handle_up(ctx, controller, no_wait),
        Some(Commands::Down) => handle_down(ctx, &mut controller),
        Some(Commands::Status) => handle_status(ctx, &mut controller),
        Some(Commands::Urls) => handle_urls(ctx, &controller),
        Some(Commands::Open { target }) => handle_open(ctx, &controller, target),
        Some(Commands::Paths) => handle_paths(ctx),
    }
}

struct SetupFlags {
    ro_path: Option<String>,
    rw_path: Option<String>,
    agent: Option<String>,
    token: Option<String>,
    api_key: Option<String>,
    yes: bool,
    no_build: bool,
}

fn handle_setup<R: docker::DockerRunner + ?Sized>(
    ctx: &Context,
    controller: &mut Controller<'_, R>,
    flags: SetupFlags,
) -> Result<(), JupyError> {
    if ctx.json && !flags.yes {
        return Err(JupyError::Process(
            "--json is only supported with `jupyagent setup --yes`".to_string(),
        ));
    }
    if !flags.yes && !io::stdin().is_terminal() {
        return Err(JupyError::Process(
            "interactive setup requires a TTY; re-run with `--yes` for non-interactive mode"
                .to_string(),
        ));
    }

    let mut request = SetupRequest::from_existing(controller.config());
    if let Some(path) = flags.ro_path {
        request.read_only_path = path;
    }
    if let Some(path) = flags.rw_path {
        request.read_write_path = path;
    }
    if let Some(agent) = flags.agent {
        request.agent_kind = agent.parse::<AgentKind>()?;
    }
    request.access_token = flags.token;
    request.api_key = flags.api_key;

    let request = if flags.yes {
        if request.api_key.is_none() {
            request.api_key = env::var(request.agent_kind.api_key_env())
                .ok()
                .filter(|value| !value.trim().is_empty());
        }
        request
    } else {
        match setup::prompt_setup(controller.config(), request)? {
            Some(request) => request,
            None => {
                println!("{}", style("Aborted.").red());
                return Ok(());
            }
        }
    };

    let _lock = EnvLock::acquire(&ctx.layout)?;
    if !flags.no_build && !ctx.json {
        println!("{}", style("Building Docker environment...").cyan());
    }
    let summary = setup::configure(controller, &request, !flags.no_build)?;
    if ctx.json {
        return output(ctx, serde_json::to_value(summary)?);
    }
    println!("{}", style("Setup complete!").green());
    println!("  config:    {}", summary.config_path.display());
    println!("  read-only: {}", summary.ro_path.display());
    println!("  workspace: {}", summary.rw_path.display());
    println!("  agent:     {}", summary.agent.display_name());
    if !summary.built {
        println!("Images not built yet; run `jupyagent build` or `jupyagent up`.");
    }
    Ok(())
}

fn handle_build<R: docker::DockerRunner + ?Sized>(
    ctx: &Context,
    controller: &Controller<'_, R>,
) -> Result<(), JupyError> {
    let _lock = EnvLock::acquire(&ctx.layout)?;
    controller.build()?;
    if ctx.json {
        return output(ctx, json!({ "built": true }));
    }
    println!("Images built.");
    Ok(())
}

fn handle_up<R: docker::DockerRunner + ?Sized>(
    ctx: &Context,
    mut controller: Controller<'_, R>,
    no_wait: bool,
) -> Result<(), JupyError> {
    let _lock = EnvLock::acquire(&ctx.layout)?;
    let outcome = if no_wait {
        controller = controller.with_readiness(ReadinessPolicy {
            attempts: 0,
            ..ReadinessPolicy::default()
        });
        controller.start()?
    } else {
        let gate = InterruptGate::install()?;
        gate.guard(|cancel| controller.start_with_cancel(cancel))?
    };
    let token = match &outcome {
        StartOutcome::Ready { token } => Some(token.as_str()),
        _ => None,
    };
    let urls = match controller.config() {
        Some(cfg) => lifecycle::service_urls(cfg, token),
        None => Vec::new(),
    };
    if ctx.json {
        return output(
            ctx,
            json!({
                "state": controller.state(),
                "outcome": outcome,
                "urls": urls,
            }),
        );
    }
    match &outcome {
        StartOutcome::Ready { .. } => println!("{}", style("Services started.").green()),
        StartOutcome::StillStarting if no_wait => println!("Services starting in the background."),
        StartOutcome::StillStarting => println!(
            "{}",
            style("Services are up; Jupyter is still initializing. Check `jupyagent status`.")
                .yellow()
        ),
        StartOutcome::Crashed { service, exit_code } => println!(
            "{}",
            style(format!(
                "The {service} service exited with code {exit_code}. Inspect it with `docker logs jupyagent-{service}`."
            ))
            .red()
        ),
        StartOutcome::Interrupted => println!("Stopped waiting; services keep starting."),
    }
    for url in urls {
        println!("  {:<14} {}", url.name, url.url);
    }
    Ok(())
}

fn handle_down<R: docker::DockerRunner + ?Sized>(
    ctx: &Context,
    controller: &mut Controller<'_, R>,
) -> Result<(), JupyError> {
    let _lock = EnvLock::acquire(&ctx.layout)?;
    let report = controller.stop();
    if ctx.json {
        return output(
            ctx,
            json!({ "state": controller.state(), "teardown_error": report.teardown_error }),
        );
    }
    match report.teardown_error {
        None => println!("Services stopped."),
        Some(err) => println!(
            "{}",
            style(format!("Marked stopped, but teardown reported: {err}")).yellow()
        ),
    }
    Ok(())
}

fn handle_status<R: docker::DockerRunner + ?Sized>(
    ctx: &Context,
    controller: &mut Controller<'_, R>,
) -> Result<(), JupyError> {
    let report = controller.status();
    controller.observe(&report);
    let urls = match controller.config() {
        Some(cfg) if report.running => {
            lifecycle::service_urls(cfg, report.readiness_token.as_deref())
        }
        _ => Vec::new(),
    };
    if ctx.json {
        return output(
            ctx,
            json!({
                "state": controller.state(),
                "configured": controller.config().is_some(),
                "running": report.running,
                "readiness_token": report.readiness_token,
                "services": report.services,
                "query_error": report.query_error,
                "urls": urls,
            }),
        );
    }
    if controller.config().is_none() {
        println!("Not configured. Run `jupyagent setup`.");
        return Ok(());
    }
    if let Some(err) = &report.query_error {
        println!("{}", style(format!("status query failed: {err}")).yellow());
    }
    if !report.running {
        println!("{}", style("○ Stopped").red());
        return Ok(());
    }
    let label = if report.readiness_token.is_some() {
        style("● Running").green()
    } else {
        style("● Starting").yellow()
    };
    println!("{label}");
    for service in &report.services {
        println!("  {:<10} {}", service.service, service.state);
    }
    for url in urls {
        println!("  {:<14} {}", url.name, url.url);
    }
    Ok(())
}

fn readiness_token_for(cfg: &config::EnvironmentConfig) -> Option<String> {
    lifecycle::read_readiness_token(&cfg.readiness_file())
}

fn handle_urls<R: docker::DockerRunner + ?Sized>(
    ctx: &Context,
    controller: &Controller<'_, R>,
) -> Result<(), JupyError> {
    let cfg = controller.config().ok_or(JupyError::NotConfigured)?;
    let token = readiness_token_for(cfg);
    let urls = lifecycle::service_urls(cfg, token.as_deref());
    if ctx.json {
        return output(ctx, serde_json::to_value(urls)?);
    }
    for url in urls {
        println!("{:<14} {}", url.name, url.url);
    }
    Ok(())
}

fn handle_open<R: docker::DockerRunner + ?Sized>(
    ctx: &Context,
    controller: &Controller<'_, R>,
    target: OpenTarget,
) -> Result<(), JupyError> {
    let cfg = controller.config().ok_or(JupyError::NotConfigured)?;
    let token = readiness_token_for(cfg);
    let urls = lifecycle::service_urls(cfg, token.as_deref());
    let url = match target {
        OpenTarget::Jupyter => urls.first(),
        OpenTarget::Terminal => urls.get(1),
        OpenTarget::Agent => urls.get(2),
    }
    .map(|entry| entry.url.clone())
    .ok_or_else(|| {
        JupyError::Config(format!(
            "{} has no web UI; attach with `docker exec -it jupyagent-agent {}`",
            cfg.agent_kind.display_name(),
            cfg.agent_kind
        ))
    })?;
    let opened = !ctx.json && dashboard::open_browser(&url);
    if ctx.json {
        return output(ctx, json!({ "url": url, "opened": opened }));
    }
    if opened {
        println!("Opened {url}");
    } else {
        println!("Open this URL in your browser: {url}");
    }
    Ok(())
}

fn handle_paths(ctx: &Context) -> Result<(), JupyError> {
    let layout = &ctx.layout;
    let cfg = config::load(layout);
    let payload = json!({
        "home": layout.root(),
        "config_path": layout.config_file(),
        "config_exists": cfg.is_some(),
        "compose_file": layout.compose_file(),
        "env_file": layout.env_file(),
        "lock_file": layout.lock_file(),
        "readiness_file": cfg.as_ref().map(|cfg| cfg.readiness_file()),
        "version": config::current_version(),
    });
    if ctx.json {
        return output(ctx, payload);
    }
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), JupyError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), JupyError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_setup_flags() {
        let cli = Cli::try_parse_from([
            "jupyagent",
            "--home",
            "/tmp/jh",
            "setup",
            "--ro-path",
            "/data",
            "--agent",
            "claude",
            "--yes",
            "--no-build",
        ])
        .unwrap();
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/jh")));
        match cli.command {
            Some(Commands::Setup {
                ro_path,
                agent,
                yes,
                no_build,
                rw_path,
                ..
            }) => {
                assert_eq!(ro_path.as_deref(), Some("/data"));
                assert_eq!(agent.as_deref(), Some("claude"));
                assert!(yes && no_build);
                assert!(rw_path.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_defaults_to_dashboard_and_accepts_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["jupyagent"]).unwrap();
        assert!(cli.command.is_none());
        let cli = Cli::try_parse_from(["jupyagent", "status", "--json", "-v"]).unwrap();
        assert!(cli.json && cli.verbose);
        let cli = Cli::try_parse_from(["jupyagent", "open", "terminal"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Open {
                target: OpenTarget::Terminal
            })
        ));
        assert!(Cli::try_parse_from(["jupyagent", "open", "browser"]).is_err());
    }

    #[test]
    fn json_error_envelope_carries_details() {
        let err = JupyError::StartFailed(Box::new(JupyError::ProcessDetailed {
            message: "command failed".to_string(),
            details: ProcessErrorDetails {
                error_code: "docker_port_conflict".to_string(),
                hint: Some("free the port".to_string()),
                command: None,
                raw_stderr: None,
            },
        }));
        let payload = JsonResult::<serde_json::Value> {
            ok: false,
            result: None,
            error: Some(err.to_string()),
            error_details: err.process_details().cloned(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error_details"]["error_code"], "docker_port_conflict");
        assert!(value["error_details"].get("command").is_none());
    }
}
