//! Deployment artifact set: compose descriptor, env file and image build
//! contexts, all derived from an [`EnvironmentConfig`].
//!
//! Everything here is regenerated wholesale; the only state that survives a
//! regeneration is the per-agent persistent directories.

use crate::config::{write_atomic, AgentKind, EnvironmentConfig, Layout, COMPOSE_PROJECT};
use crate::error::JupyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const NOTEBOOK_SERVICE: &str = "notebook";
pub const TERMINAL_SERVICE: &str = "terminal";
pub const AGENT_SERVICE: &str = "agent";
pub const MANAGED_SERVICES: [&str; 3] = [NOTEBOOK_SERVICE, TERMINAL_SERVICE, AGENT_SERVICE];

pub const NOTEBOOK_PORT: u16 = 8888;
pub const TERMINAL_HOST_PORT: u16 = 8282;
const TERMINAL_CONTAINER_PORT: u16 = 8080;
const LOOPBACK: &str = "127.0.0.1";

const RO_TARGET: &str = "/mnt/ro_data";
const WORKSPACE_TARGET: &str = "/workspace";

struct BuildFile {
    name: &'static str,
    content: &'static str,
    executable: bool,
}

const NOTEBOOK_FILES: &[BuildFile] = &[
    BuildFile {
        name: "Dockerfile",
        content: include_str!("../docker/notebook/Dockerfile"),
        executable: false,
    },
    BuildFile {
        name: "start.sh",
        content: include_str!("../docker/notebook/start.sh"),
        executable: true,
    },
];

const TERMINAL_FILES: &[BuildFile] = &[BuildFile {
    name: "Dockerfile",
    content: include_str!("../docker/terminal/Dockerfile"),
    executable: false,
}];

fn agent_dockerfile(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Opencode => include_str!("../docker/agent/opencode.Dockerfile"),
        AgentKind::Claude => include_str!("../docker/agent/claude.Dockerfile"),
        AgentKind::Gemini => include_str!("../docker/agent/gemini.Dockerfile"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComposeFile {
    pub name: String,
    pub services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComposeService {
    pub image: String,
    pub container_name: String,
    pub build: BuildSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortBinding>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeBinding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stdin_open: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildSpec {
    pub context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortBinding {
    pub target: u16,
    pub published: String,
    pub host_ip: String,
    pub protocol: String,
}

impl PortBinding {
    fn loopback(host: u16, container: u16) -> Self {
        Self {
            target: container,
            published: host.to_string(),
            host_ip: LOOPBACK.to_string(),
            protocol: "tcp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeBinding {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl VolumeBinding {
    fn bind(source: &Path, target: &str, read_only: bool) -> Self {
        Self {
            kind: "bind".to_string(),
            source: escape_interpolation(&source.to_string_lossy()),
            target: target.to_string(),
            read_only,
        }
    }
}

/// Paths of one generated artifact set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactSet {
    pub compose_file: PathBuf,
    pub env_file: PathBuf,
    pub build_contexts: Vec<PathBuf>,
    pub persistent_dirs: Vec<PathBuf>,
}

/// Compose interpolates `$VAR` everywhere in the file; `$$` is a literal dollar.
pub fn escape_interpolation(value: &str) -> String {
    value.replace('$', "$$")
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn secret_keys(cfg: &EnvironmentConfig) -> Result<Vec<String>, JupyError> {
    let mut keys: Vec<String> = cfg.secrets.keys().cloned().collect();
    let backend_key = cfg.agent_kind.api_key_env().to_string();
    if !keys.contains(&backend_key) {
        keys.push(backend_key);
    }
    keys.sort();
    for key in &keys {
        if !is_valid_env_key(key) {
            return Err(JupyError::Config(format!(
                "secret name '{key}' is not a valid environment variable name"
            )));
        }
    }
    Ok(keys)
}

pub fn compose_topology(
    cfg: &EnvironmentConfig,
    layout: &Layout,
) -> Result<ComposeFile, JupyError> {
    let ro_path = &cfg.read_only_path;
    let rw_path = &cfg.read_write_path;
    for (field, path) in [("ro_path", ro_path), ("rw_path", rw_path)] {
        if !path.is_absolute() {
            return Err(JupyError::Config(format!(
                "{field} must be absolute, got {}",
                path.display()
            )));
        }
    }
    let token = escape_interpolation(&cfg.access_token);
    let context = |service: &str| BuildSpec {
        context: escape_interpolation(&layout.build_context(service).to_string_lossy()),
    };

    let notebook = ComposeService {
        image: format!("{COMPOSE_PROJECT}-{NOTEBOOK_SERVICE}"),
        container_name: format!("{COMPOSE_PROJECT}-{NOTEBOOK_SERVICE}"),
        build: context(NOTEBOOK_SERVICE),
        ports: vec![PortBinding::loopback(NOTEBOOK_PORT, NOTEBOOK_PORT)],
        environment: BTreeMap::from([
            ("JUPYTER_TOKEN".to_string(), token.clone()),
            (
                "READINESS_FILE".to_string(),
                format!("{WORKSPACE_TARGET}/{}", crate::config::READINESS_FILE_NAME),
            ),
        ]),
        volumes: vec![
            VolumeBinding::bind(ro_path, RO_TARGET, true),
            VolumeBinding::bind(rw_path, WORKSPACE_TARGET, false),
        ],
        depends_on: Vec::new(),
        stdin_open: false,
        tty: false,
    };

    let terminal = ComposeService {
        image: format!("{COMPOSE_PROJECT}-{TERMINAL_SERVICE}"),
        container_name: format!("{COMPOSE_PROJECT}-{TERMINAL_SERVICE}"),
        build: context(TERMINAL_SERVICE),
        ports: vec![PortBinding::loopback(
            TERMINAL_HOST_PORT,
            TERMINAL_CONTAINER_PORT,
        )],
        environment: BTreeMap::new(),
        volumes: vec![
            VolumeBinding::bind(ro_path, RO_TARGET, true),
            VolumeBinding::bind(rw_path, WORKSPACE_TARGET, false),
        ],
        depends_on: Vec::new(),
        stdin_open: false,
        tty: false,
    };

    let kind = cfg.agent_kind;
    let mut agent_env = BTreeMap::from([
        (
            "JUPYTER_URL".to_string(),
            format!("http://{NOTEBOOK_SERVICE}:{NOTEBOOK_PORT}"),
        ),
        ("JUPYTER_TOKEN".to_string(), token),
        ("AGENT_TYPE".to_string(), kind.as_str().to_string()),
    ]);
    for key in secret_keys(cfg)? {
        let reference = format!("${{{key}:-}}");
        agent_env.insert(key, reference);
    }
    let mut agent_volumes = vec![VolumeBinding::bind(rw_path, WORKSPACE_TARGET, false)];
    for mount in kind.persistent_mounts() {
        agent_volumes.push(VolumeBinding::bind(
            &layout.persist_dir(mount.host_dir),
            mount.target,
            false,
        ));
    }
    let interactive_cli = kind.web_ports().is_empty();
    let agent = ComposeService {
        image: format!("{COMPOSE_PROJECT}-{AGENT_SERVICE}-{kind}"),
        container_name: format!("{COMPOSE_PROJECT}-{AGENT_SERVICE}"),
        build: context(AGENT_SERVICE),
        ports: kind
            .web_ports()
            .iter()
            .map(|port| PortBinding::loopback(*port, *port))
            .collect(),
        environment: agent_env,
        volumes: agent_volumes,
        depends_on: vec![NOTEBOOK_SERVICE.to_string()],
        stdin_open: interactive_cli,
        tty: interactive_cli,
    };

    Ok(ComposeFile {
        name: COMPOSE_PROJECT.to_string(),
        services: BTreeMap::from([
            (NOTEBOOK_SERVICE.to_string(), notebook),
            (TERMINAL_SERVICE.to_string(), terminal),
            (AGENT_SERVICE.to_string(), agent),
        ]),
    })
}

pub fn render_compose(cfg: &EnvironmentConfig, layout: &Layout) -> Result<String, JupyError> {
    let topology = compose_topology(cfg, layout)?;
    Ok(serde_yaml::to_string(&topology)?)
}

pub fn config_to_env(cfg: &EnvironmentConfig) -> BTreeMap<String, String> {
    let mut envs = BTreeMap::new();
    envs.insert("JUPYTER_TOKEN".to_string(), cfg.access_token.clone());
    envs.insert(
        "RO_PATH".to_string(),
        cfg.read_only_path.to_string_lossy().to_string(),
    );
    envs.insert(
        "RW_PATH".to_string(),
        cfg.read_write_path.to_string_lossy().to_string(),
    );
    envs.insert("AGENT_TYPE".to_string(), cfg.agent_kind.as_str().to_string());
    for (key, value) in &cfg.secrets {
        envs.insert(key.clone(), value.clone());
    }
    envs
}

fn is_plain_env_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '@' | '+' | ',' | '=' | '%')
}

/// Quote a value so the compose dotenv parser reads it back verbatim.
pub fn format_env_value(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_plain_env_char) {
        return value.to_string();
    }
    if !value.contains(['\'', '\\', '\n', '\r']) {
        return format!("'{value}'");
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn parse_env_value(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return raw[1..raw.len() - 1].to_string();
    }
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        }
        return out;
    }
    raw.to_string()
}

pub fn render_env_file(envs: &BTreeMap<String, String>) -> String {
    let mut content = String::new();
    for (key, value) in envs {
        content.push_str(&format!("{}={}\n", key, format_env_value(value)));
    }
    content
}

/// Parse an env file written by [`render_env_file`] into subprocess overrides.
pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>, JupyError> {
    let content = fs::read_to_string(path)?;
    let mut envs = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            envs.insert(key.trim().to_string(), parse_env_value(value));
        }
    }
    Ok(envs)
}

fn write_if_changed(path: &Path, content: &str) -> Result<(), JupyError> {
    if fs::read(path).map(|existing| existing == content.as_bytes()).unwrap_or(false) {
        return Ok(());
    }
    write_atomic(path, content.as_bytes())
}

#[cfg(unix)]
fn set_mode(path: &Path, executable: bool) -> Result<(), JupyError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _executable: bool) -> Result<(), JupyError> {
    Ok(())
}

fn write_build_context(dir: &Path, files: &[BuildFile]) -> Result<(), JupyError> {
    fs::create_dir_all(dir)?;
    for file in files {
        let path = dir.join(file.name);
        write_if_changed(&path, file.content)?;
        set_mode(&path, file.executable)?;
    }
    Ok(())
}

/// Regenerate the full artifact set for `cfg`. Never stops or restarts anything.
pub fn generate(cfg: &EnvironmentConfig, layout: &Layout) -> Result<ArtifactSet, JupyError> {
    fs::create_dir_all(layout.root())?;
    fs::create_dir_all(&cfg.read_write_path)?;

    let mut persistent_dirs = Vec::new();
    for mount in cfg.agent_kind.persistent_mounts() {
        let dir = layout.persist_dir(mount.host_dir);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            tracing::debug!(path = %dir.display(), "created persistent agent directory");
        }
        persistent_dirs.push(dir);
    }

    let agent_files = [BuildFile {
        name: "Dockerfile",
        content: agent_dockerfile(cfg.agent_kind),
        executable: false,
    }];
    let contexts = [
        (NOTEBOOK_SERVICE, NOTEBOOK_FILES),
        (TERMINAL_SERVICE, TERMINAL_FILES),
        (AGENT_SERVICE, &agent_files[..]),
    ];
    let mut build_contexts = Vec::new();
    for (service, files) in contexts {
        let dir = layout.build_context(service);
        write_build_context(&dir, files)?;
        build_contexts.push(dir);
    }

    let compose_file = layout.compose_file();
    write_if_changed(&compose_file, &render_compose(cfg, layout)?)?;
    let env_file = layout.env_file();
    write_if_changed(&env_file, &render_env_file(&config_to_env(cfg)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&env_file, fs::Permissions::from_mode(0o600))?;
    }

    tracing::debug!(compose = %compose_file.display(), "artifacts generated");
    Ok(ArtifactSet {
        compose_file,
        env_file,
        build_contexts,
        persistent_dirs,
    })
}
