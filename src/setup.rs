use crate::artifacts::{self, ArtifactSet};
use crate::config::{self, normalize_path, AgentKind, EnvironmentConfig, Layout};
use crate::docker::DockerRunner;
use crate::error::JupyError;
use crate::lifecycle::Controller;
use chrono::Utc;
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Password, Select};
use dirs::home_dir;
use serde::Serialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_READ_ONLY_PATH: &str = "/";
const DEFAULT_WORKSPACE_DIR: &str = "jupyagent";

/// Raw answers collected from flags or prompts, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupRequest {
    pub read_only_path: String,
    pub read_write_path: String,
    pub agent_kind: AgentKind,
    pub access_token: Option<String>,
    pub api_key: Option<String>,
}

impl SetupRequest {
    /// Start from the current config when there is one, else first-run defaults.
    pub fn from_existing(existing: Option<&EnvironmentConfig>) -> Self {
        match existing {
            Some(cfg) => Self {
                read_only_path: cfg.read_only_path.to_string_lossy().to_string(),
                read_write_path: cfg.read_write_path.to_string_lossy().to_string(),
                agent_kind: cfg.agent_kind,
                access_token: None,
                api_key: None,
            },
            None => Self {
                read_only_path: DEFAULT_READ_ONLY_PATH.to_string(),
                read_write_path: default_workspace_path(),
                agent_kind: AgentKind::default(),
                access_token: None,
                api_key: None,
            },
        }
    }
}

fn default_workspace_path() -> String {
    match home_dir() {
        Some(home) => home.join(DEFAULT_WORKSPACE_DIR).to_string_lossy().to_string(),
        None => format!("~/{DEFAULT_WORKSPACE_DIR}"),
    }
}

fn generate_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupSummary {
    pub config_path: PathBuf,
    pub ro_path: PathBuf,
    pub rw_path: PathBuf,
    pub agent: AgentKind,
    pub artifacts: ArtifactSet,
    pub built: bool,
}

/// Normalize the request into a config, persist it, and regenerate artifacts.
///
/// An existing token and existing secrets carry over unless the request
/// replaces them.
pub fn apply_setup(
    layout: &Layout,
    existing: Option<&EnvironmentConfig>,
    request: &SetupRequest,
    cwd: &Path,
) -> Result<(EnvironmentConfig, ArtifactSet), JupyError> {
    for (field, value) in [
        ("read-only path", &request.read_only_path),
        ("read-write path", &request.read_write_path),
    ] {
        if value.trim().is_empty() {
            return Err(JupyError::Config(format!("{field} must be non-empty")));
        }
    }
    let home = home_dir();
    let read_only_path = normalize_path(&request.read_only_path, cwd, home.as_deref());
    let read_write_path = normalize_path(&request.read_write_path, cwd, home.as_deref());
    if !read_only_path.exists() {
        tracing::warn!(path = %read_only_path.display(), "read-only path does not exist yet");
    }
    fs::create_dir_all(&read_write_path)?;

    let access_token = match request
        .access_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
    {
        Some(token) => token.to_string(),
        None => existing
            .map(|cfg| cfg.access_token.clone())
            .filter(|token| !token.is_empty())
            .unwrap_or_else(generate_token),
    };

    let mut secrets = existing.map(|cfg| cfg.secrets.clone()).unwrap_or_default();
    if let Some(key) = request
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
    {
        secrets.insert(request.agent_kind.api_key_env().to_string(), key.to_string());
    }

    let cfg = EnvironmentConfig {
        version: config::current_version().to_string(),
        agent_kind: request.agent_kind,
        read_only_path,
        read_write_path,
        access_token,
        secrets,
        configured_at: Some(Utc::now().to_rfc3339()),
    };
    config::save(layout, &cfg)?;
    let artifacts = artifacts::generate(&cfg, layout)?;
    tracing::info!(agent = %cfg.agent_kind, "environment configured");
    Ok((cfg, artifacts))
}

/// Apply `request`, hand the new config to `controller`, and optionally build images.
pub fn configure<R: DockerRunner + ?Sized>(
    controller: &mut Controller<'_, R>,
    request: &SetupRequest,
    build: bool,
) -> Result<SetupSummary, JupyError> {
    let cwd = env::current_dir()?;
    let (cfg, artifacts) = apply_setup(controller.layout(), controller.config(), request, &cwd)?;
    let summary = SetupSummary {
        config_path: controller.layout().config_file(),
        ro_path: cfg.read_only_path.clone(),
        rw_path: cfg.read_write_path.clone(),
        agent: cfg.agent_kind,
        artifacts,
        built: build,
    };
    controller.set_config(cfg);
    if build {
        controller.build()?;
    }
    Ok(summary)
}

fn print_current_paths(request: &SetupRequest) {
    println!("  {} {}", style("Read-only:").dim(), request.read_only_path);
    println!("  {} {}", style("Workspace:").dim(), request.read_write_path);
}

/// Interactive wizard. Returns `None` when the user declines to proceed.
pub fn prompt_setup(
    existing: Option<&EnvironmentConfig>,
    seed: SetupRequest,
) -> Result<Option<SetupRequest>, JupyError> {
    let theme = ColorfulTheme::default();
    let mut request = seed;

    println!();
    println!("{}", style("JupyAgent Setup").bold().cyan());

    let keep_paths = if existing.is_some() {
        println!("{}", style("Current paths:").bold());
        print_current_paths(&request);
        Confirm::with_theme(&theme)
            .with_prompt("Keep existing paths?")
            .default(true)
            .interact()?
    } else {
        false
    };
    if !keep_paths {
        println!(
            "{}",
            style("The read-only path is mounted at /mnt/ro_data; agents cannot modify it.").dim()
        );
        request.read_only_path = Input::with_theme(&theme)
            .with_prompt("Read-only path (context for the agent)")
            .default(request.read_only_path.clone())
            .interact_text()?;
        println!(
            "{}",
            style("The workspace is mounted at /workspace; agents save their work here.").dim()
        );
        request.read_write_path = Input::with_theme(&theme)
            .with_prompt("Read-write workspace path")
            .default(request.read_write_path.clone())
            .interact_text()?;
    }

    let items: Vec<&str> = AgentKind::ALL.iter().map(AgentKind::display_name).collect();
    let default_idx = AgentKind::ALL
        .iter()
        .position(|kind| *kind == request.agent_kind)
        .unwrap_or(0);
    let selection = Select::with_theme(&theme)
        .with_prompt("Coding agent")
        .items(&items)
        .default(default_idx)
        .interact()?;
    request.agent_kind = AgentKind::ALL[selection];

    let env_key = request.agent_kind.api_key_env();
    let has_stored_key = existing
        .map(|cfg| cfg.secrets.contains_key(env_key))
        .unwrap_or(false);
    let from_env = env::var(env_key).ok().filter(|value| !value.trim().is_empty());
    if request.api_key.is_none() {
        request.api_key = if let Some(value) = from_env {
            let use_env = Confirm::with_theme(&theme)
                .with_prompt(format!("Use ${env_key} from your environment?"))
                .default(true)
                .interact()?;
            if use_env {
                Some(value)
            } else {
                prompt_api_key(&theme, env_key, has_stored_key)?
            }
        } else {
            prompt_api_key(&theme, env_key, has_stored_key)?
        };
    }

    println!("\n{}", style("Configuration Summary").bold());
    print_current_paths(&request);
    println!(
        "  {} {}",
        style("Agent:").dim(),
        request.agent_kind.display_name()
    );

    let proceed = Confirm::with_theme(&theme)
        .with_prompt("Proceed with installation?")
        .default(true)
        .interact()?;
    Ok(proceed.then_some(request))
}

fn prompt_api_key(
    theme: &ColorfulTheme,
    env_key: &str,
    has_stored_key: bool,
) -> Result<Option<String>, JupyError> {
    let hint = if has_stored_key {
        "Enter = keep stored key"
    } else {
        "Enter = skip; sign in from the agent instead"
    };
    let value = Password::with_theme(theme)
        .with_prompt(format!("{env_key} ({hint})"))
        .allow_empty_password(true)
        .interact()?;
    Ok(Some(value).filter(|v| !v.trim().is_empty()))
}
