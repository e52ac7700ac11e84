use crate::error::JupyError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

pub const APP_NAME: &str = "jupyagent";
pub const HOME_ENV: &str = "JUPYAGENT_HOME";
pub const COMPOSE_PROJECT: &str = "jupyagent";
pub const READINESS_FILE_NAME: &str = "TOKEN.txt";

/// Version of the running build, compared against `EnvironmentConfig::version`.
pub fn current_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Fixed on-disk locations of everything this tool owns for one host identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `--home` flag, then `$JUPYAGENT_HOME`, then `~/.jupyagent`.
    ///
    /// The root is always absolute: compose runs with the root as its working
    /// directory and every generated path is derived from it.
    pub fn resolve(override_path: Option<&PathBuf>) -> Self {
        let root = match override_path {
            Some(path) => path.clone(),
            None => match env::var(HOME_ENV) {
                Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
                _ => {
                    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
                    base.push(format!(".{APP_NAME}"));
                    base
                }
            },
        };
        Self::new(absolute_root(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn compose_file(&self) -> PathBuf {
        self.root.join("docker-compose.yml")
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(".env")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(format!("{APP_NAME}.lock"))
    }

    pub fn build_context(&self, service: &str) -> PathBuf {
        self.root.join(service)
    }

    pub fn persist_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Opencode,
    Claude,
    Gemini,
}

/// A host directory that outlives artifact regeneration, mounted into the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentMount {
    pub host_dir: &'static str,
    pub target: &'static str,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Opencode, AgentKind::Claude, AgentKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opencode => "opencode",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Opencode => "Opencode",
            Self::Claude => "Claude Code",
            Self::Gemini => "Gemini CLI",
        }
    }

    /// Environment variable the backend reads its API key from.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Self::Opencode => "OPENAI_API_KEY",
            Self::Claude => "ANTHROPIC_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }

    /// Host ports published by the agent container, mapped 1:1.
    pub fn web_ports(&self) -> &'static [u16] {
        match self {
            Self::Opencode => &[3000, 1455],
            Self::Claude | Self::Gemini => &[],
        }
    }

    pub fn web_ui_port(&self) -> Option<u16> {
        self.web_ports().first().copied()
    }

    pub fn persistent_mounts(&self) -> &'static [PersistentMount] {
        match self {
            Self::Opencode => &[
                PersistentMount {
                    host_dir: "opencode_config",
                    target: "/home/agent/.config/opencode",
                },
                PersistentMount {
                    host_dir: "opencode_data",
                    target: "/home/agent/.local/share/opencode",
                },
            ],
            Self::Claude => &[PersistentMount {
                host_dir: "claude_config",
                target: "/home/agent/.claude",
            }],
            Self::Gemini => &[PersistentMount {
                host_dir: "gemini_config",
                target: "/home/agent/.gemini",
            }],
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = JupyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "opencode" => Ok(Self::Opencode),
            "claude" | "claude-code" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            other => Err(JupyError::Config(format!(
                "unknown agent '{other}'; supported: opencode, claude, gemini"
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub version: String,
    #[serde(rename = "agent_type", default)]
    pub agent_kind: AgentKind,
    #[serde(rename = "ro_path")]
    pub read_only_path: PathBuf,
    #[serde(rename = "rw_path")]
    pub read_write_path: PathBuf,
    #[serde(rename = "jupyter_token")]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configured_at: Option<String>,
}

impl EnvironmentConfig {
    pub fn readiness_file(&self) -> PathBuf {
        self.read_write_path.join(READINESS_FILE_NAME)
    }
}

/// Soft load: a missing or malformed descriptor reads as "unconfigured".
pub fn load(layout: &Layout) -> Option<EnvironmentConfig> {
    let path = layout.config_file();
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "config unreadable; treating as unconfigured");
            }
            return None;
        }
    };
    match serde_json::from_str::<EnvironmentConfig>(&content) {
        Ok(cfg) => Some(cfg),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "config malformed; treating as unconfigured");
            None
        }
    }
}

pub fn save(layout: &Layout, cfg: &EnvironmentConfig) -> Result<(), JupyError> {
    let path = layout.config_file();
    let body = serde_json::to_string_pretty(cfg)?;
    write_atomic(&path, format!("{body}\n").as_bytes())?;
    tracing::debug!(path = %path.display(), "config saved");
    Ok(())
}

/// Write to a temp sibling and rename over `path`, creating the parent first.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), JupyError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| APP_NAME.to_string()),
        std::process::id()
    ));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Expand `~/`, anchor relative input at `cwd`, and drop `.`/`..` lexically.
fn absolute_root(root: PathBuf) -> PathBuf {
    match env::current_dir() {
        Ok(cwd) => normalize_path(&root.to_string_lossy(), &cwd, home_dir().as_deref()),
        Err(err) => {
            tracing::debug!(error = %err, "cannot read working directory; keeping home as given");
            root
        }
    }
}

pub fn normalize_path(input: &str, cwd: &Path, home: Option<&Path>) -> PathBuf {
    let trimmed = input.trim();
    let expanded = match (trimmed, home) {
        ("~", Some(home)) => home.to_path_buf(),
        (value, Some(home)) if value.starts_with("~/") => home.join(&value[2..]),
        (value, _) => PathBuf::from(value),
    };
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDrift {
    Current,
    Older,
    Newer,
    Unknown,
}

fn parse_version_key(version: &str) -> Option<Vec<u64>> {
    let trimmed = version.trim();
    let raw = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if raw.is_empty() {
        return None;
    }
    raw.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

/// Compare the version a config was written by against the running build.
pub fn version_drift(config_version: &str, running_version: &str) -> VersionDrift {
    match (
        parse_version_key(config_version),
        parse_version_key(running_version),
    ) {
        (Some(a), Some(b)) => match a.cmp(&b) {
            Ordering::Less => VersionDrift::Older,
            Ordering::Equal => VersionDrift::Current,
            Ordering::Greater => VersionDrift::Newer,
        },
        _ if config_version.trim() == running_version.trim() => VersionDrift::Current,
        _ => VersionDrift::Unknown,
    }
}

pub fn needs_reconfigure(config_version: &str, running_version: &str) -> bool {
    version_drift(config_version, running_version) != VersionDrift::Current
}
