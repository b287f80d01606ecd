//! Declarative configuration for the proxy
//!
//! The config file is YAML. Loading happens in two phases, mirroring the
//! split between what the file may say and what the runtime promises:
//! 1. A `File*` raw layer deserialized with serde (every field optional)
//! 2. Validation + macro expansion into the immutable runtime types the
//!    snapshot is built from
//!
//! A parsed [`Config`] never changes; reloads produce a fresh one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

mod self_heal;


pub use self_heal::try_self_heal;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default first port handed to upstream processes
pub const DEFAULT_START_PORT: u16 = 5800;

/// Default per-model health check timeout in seconds
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: u64 = 300;

/// Default readiness endpoint polled on the upstream
pub const DEFAULT_CHECK_ENDPOINT: &str = "/health";

/// Log substring that marks readiness when the upstream has no health endpoint
pub const DEFAULT_READY_MARKER: &str = "server listening";

/// Default upstream URL template
pub const DEFAULT_PROXY_TEMPLATE: &str = "http://127.0.0.1:${PORT}";

/// Macro substitution passes before giving up on unresolved references
const MACRO_MAX_DEPTH: usize = 4;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Structured validation failures. Each variant names the offending field so
/// reload logs point at the exact line to fix.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown top-level key `{0}`")]
    UnknownKey(String),

    #[error("model id `{0}` contains characters outside [A-Za-z0-9._-]")]
    InvalidId(String),

    #[error("model `{0}` has an empty cmd")]
    EmptyCmd(String),

    #[error("model `{0}`: proxy template references ${{PORT}} but cmd does not")]
    MissingPort(String),

    #[error("alias `{alias}` maps to both `{first}` and `{second}`")]
    DuplicateAlias {
        alias: String,
        first: String,
        second: String,
    },

    #[error("group `{group}` references unknown model `{id}`")]
    UnknownMember { group: String, id: String },

    #[error("model `{id}` belongs to more than one group (`{first}` and `{second}`)")]
    DuplicateMember {
        id: String,
        first: String,
        second: String,
    },

    #[error("startPort {0} is outside 1024-65535")]
    StartPortRange(u16),

    #[error("logLevel `{0}` is not one of debug|info|warn|error")]
    LogLevel(String),

    #[error("model `{id}`: macro `{name}` still unresolved after {depth} passes")]
    MacroDepth {
        id: String,
        name: String,
        depth: usize,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Global settings shared by every instance
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Default readiness deadline, seconds (models may override)
    pub health_check_timeout: u64,
    /// debug|info|warn|error, the default tracing filter level
    pub log_level: String,
    /// First port probed when an instance needs one
    pub start_port: u16,
    /// When set, /upstream/:id/* and /api/events require this key
    pub api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            log_level: "info".to_string(),
            start_port: DEFAULT_START_PORT,
            api_key: None,
        }
    }
}

/// One logical model: how to launch it and how to reach it.
/// Immutable within a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Command line, already macro-expanded, still holding `${PORT}`
    pub cmd: String,
    /// Upstream URL template, typically `http://127.0.0.1:${PORT}`
    pub proxy: String,
    pub aliases: Vec<String>,
    /// `KEY=VALUE` pairs appended to the parent environment, order preserved
    pub env: Vec<String>,
    /// Idle seconds before auto-unload; 0 = never
    pub ttl: u64,
    /// Hidden from /v1/models but still routable
    pub unlisted: bool,
    /// Exact string forwarded as `model` to the upstream, when set
    pub use_model_name: Option<String>,
    /// Readiness deadline, seconds
    pub health_check_timeout: u64,
    /// Max simultaneous in-flight requests; 0 = unbounded
    pub concurrency_limit: usize,
    /// Path polled for readiness on the upstream
    pub check_endpoint: String,
    /// Log substring fallback that also signals readiness
    pub ready_marker: String,
}

impl ModelConfig {
    /// Render the launch command for an assigned port
    pub fn command_for_port(&self, port: u16) -> String {
        self.cmd.replace("${PORT}", &port.to_string())
    }

    /// Render the upstream base URL for an assigned port
    pub fn proxy_url_for_port(&self, port: u16) -> String {
        self.proxy
            .replace("${PORT}", &port.to_string())
            .trim_end_matches('/')
            .to_string()
    }
}

/// Admission policy for a set of models
#[derive(Debug, Clone, PartialEq)]
pub struct GroupConfig {
    pub name: String,
    /// Member ids in config order; eviction walks this order
    pub members: Vec<String>,
    /// Serialize starts within the group
    pub swap: bool,
    /// At most one member non-stopped at a time
    pub exclusive: bool,
    /// Members never auto-unload, TTL ticks are ignored
    pub persistent: bool,
}

impl GroupConfig {
    /// Policy for a model that no configured group names
    fn singleton(id: &str) -> Self {
        Self {
            name: id.to_string(),
            members: vec![id.to_string()],
            swap: true,
            exclusive: true,
            persistent: false,
        }
    }
}

/// Fully validated configuration, the input to a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub settings: Settings,
    /// Sorted by id for deterministic iteration
    pub models: Vec<ModelConfig>,
    /// Configured groups first (file order by name), then implicit
    /// singleton groups for models no group names
    pub groups: Vec<GroupConfig>,
}

impl Config {
    /// Resolve a request's model name to a canonical id.
    /// Aliases and ids share one namespace; validation keeps it collision-free.
    pub fn resolve<'a>(&'a self, name: &str) -> Option<&'a ModelConfig> {
        self.models
            .iter()
            .find(|m| m.id == name || m.aliases.iter().any(|a| a == name))
    }

    /// The group a model id belongs to. Total after validation.
    pub fn group_of(&self, id: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.members.iter().any(|m| m == id))
    }

    /// Serialize back into the file schema. Used by tests to prove the
    /// parse → serialize → parse round trip and by `modelswap list`.
    pub fn to_yaml(&self) -> String {
        let file = FileConfig::from(self);
        serde_yaml::to_string(&file).unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File layer (deserialization)
// ─────────────────────────────────────────────────────────────────────────────

/// Raw config file shape. Everything optional; defaults and validation are
/// applied when converting to [`Config`].
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub macros: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub models: BTreeMap<String, FileModel>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, FileGroup>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileModel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlisted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_marker: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileGroup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

impl From<&Config> for FileConfig {
    fn from(config: &Config) -> Self {
        let models = config
            .models
            .iter()
            .map(|m| {
                (
                    m.id.clone(),
                    FileModel {
                        name: Some(m.name.clone()),
                        description: Some(m.description.clone()),
                        cmd: Some(m.cmd.clone()),
                        proxy: Some(m.proxy.clone()),
                        aliases: m.aliases.clone(),
                        env: m.env.clone(),
                        ttl: Some(m.ttl),
                        unlisted: Some(m.unlisted),
                        use_model_name: m.use_model_name.clone(),
                        health_check_timeout: Some(m.health_check_timeout),
                        concurrency_limit: Some(m.concurrency_limit),
                        check_endpoint: Some(m.check_endpoint.clone()),
                        ready_marker: Some(m.ready_marker.clone()),
                    },
                )
            })
            .collect();

        // Implicit singleton groups are runtime policy, not file content
        let groups = config
            .groups
            .iter()
            .filter(|g| !is_singleton(g))
            .map(|g| {
                (
                    g.name.clone(),
                    FileGroup {
                        swap: Some(g.swap),
                        exclusive: Some(g.exclusive),
                        persistent: Some(g.persistent),
                        members: g.members.clone(),
                    },
                )
            })
            .collect();

        FileConfig {
            health_check_timeout: Some(config.settings.health_check_timeout),
            log_level: Some(config.settings.log_level.clone()),
            start_port: Some(config.settings.start_port),
            api_key: config.settings.api_key.clone(),
            macros: BTreeMap::new(),
            models,
            groups,
        }
    }
}

fn is_singleton(g: &GroupConfig) -> bool {
    g.members.len() == 1 && g.name == g.members[0] && g.swap && g.exclusive && !g.persistent
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load and validate a config file from disk
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    parse(&text)
}

/// Parse and validate config text
pub fn parse(text: &str) -> Result<Config, ConfigError> {
    let value: serde_yaml::Value = serde_yaml::from_str(text)?;
    lint_keys(&value)?;
    let file: FileConfig = serde_yaml::from_value(value)?;
    build(file)
}

/// Top-level keys are a closed set; a typo'd section silently doing nothing
/// is worse than a rejected config. Unknown fields inside known sections are
/// warned about and ignored so older configs keep loading.
fn lint_keys(value: &serde_yaml::Value) -> Result<(), ConfigError> {
    const TOP: &[&str] = &[
        "healthCheckTimeout",
        "logLevel",
        "startPort",
        "apiKey",
        "macros",
        "models",
        "groups",
    ];
    const MODEL: &[&str] = &[
        "name",
        "description",
        "cmd",
        "proxy",
        "aliases",
        "env",
        "ttl",
        "unlisted",
        "useModelName",
        "healthCheckTimeout",
        "concurrencyLimit",
        "checkEndpoint",
        "readyMarker",
    ];
    const GROUP: &[&str] = &["swap", "exclusive", "persistent", "members"];

    let Some(map) = value.as_mapping() else {
        return Ok(());
    };
    for (key, val) in map {
        let Some(key) = key.as_str() else { continue };
        if !TOP.contains(&key) {
            return Err(ConfigError::UnknownKey(key.to_string()));
        }
        let allowed = match key {
            "models" => MODEL,
            "groups" => GROUP,
            _ => continue,
        };
        let Some(entries) = val.as_mapping() else {
            continue;
        };
        for (id, body) in entries {
            let Some(body) = body.as_mapping() else {
                continue;
            };
            for (field, _) in body {
                if let Some(field) = field.as_str() {
                    if !allowed.contains(&field) {
                        tracing::warn!(
                            "config: ignoring unknown field `{}` under {}.{:?}",
                            field,
                            key,
                            id.as_str().unwrap_or("?")
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

/// Expand `${name}` macro references, one map, bounded depth, no recursion
/// past [`MACRO_MAX_DEPTH`]. `${PORT}` is not a macro and passes through.
fn expand_macros(
    id: &str,
    cmd: &str,
    macros: &BTreeMap<String, String>,
) -> Result<String, ConfigError> {
    let mut out = cmd.to_string();
    for _ in 0..MACRO_MAX_DEPTH {
        let mut changed = false;
        for (name, value) in macros {
            let pattern = format!("${{{}}}", name);
            if out.contains(&pattern) {
                out = out.replace(&pattern, value);
                changed = true;
            }
        }
        if !changed {
            return Ok(out);
        }
    }
    // One final scan: anything still referencing a macro name is a cycle
    for name in macros.keys() {
        if out.contains(&format!("${{{}}}", name)) {
            return Err(ConfigError::MacroDepth {
                id: id.to_string(),
                name: name.clone(),
                depth: MACRO_MAX_DEPTH,
            });
        }
    }
    Ok(out)
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Apply defaults and validate the raw file layer
fn build(file: FileConfig) -> Result<Config, ConfigError> {
    let settings = Settings {
        health_check_timeout: file
            .health_check_timeout
            .unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT),
        log_level: file.log_level.unwrap_or_else(|| "info".to_string()),
        start_port: file.start_port.unwrap_or(DEFAULT_START_PORT),
        api_key: file.api_key.filter(|k| !k.is_empty()),
    };

    if !matches!(settings.log_level.as_str(), "debug" | "info" | "warn" | "error") {
        return Err(ConfigError::LogLevel(settings.log_level));
    }
    if settings.start_port < 1024 {
        return Err(ConfigError::StartPortRange(settings.start_port));
    }

    let mut models = Vec::with_capacity(file.models.len());
    for (id, raw) in &file.models {
        if !valid_id(id) {
            return Err(ConfigError::InvalidId(id.clone()));
        }
        let cmd = raw.cmd.as_deref().unwrap_or("").trim().to_string();
        if cmd.is_empty() {
            return Err(ConfigError::EmptyCmd(id.clone()));
        }
        let cmd = expand_macros(id, &cmd, &file.macros)?;
        let proxy = raw
            .proxy
            .clone()
            .unwrap_or_else(|| DEFAULT_PROXY_TEMPLATE.to_string());
        if proxy.contains("${PORT}") && !cmd.contains("${PORT}") {
            return Err(ConfigError::MissingPort(id.clone()));
        }
        models.push(ModelConfig {
            id: id.clone(),
            name: raw.name.clone().unwrap_or_else(|| id.clone()),
            description: raw.description.clone().unwrap_or_default(),
            cmd,
            proxy,
            aliases: raw.aliases.clone(),
            env: raw.env.clone(),
            ttl: raw.ttl.unwrap_or(0),
            unlisted: raw.unlisted.unwrap_or(false),
            use_model_name: raw.use_model_name.clone(),
            health_check_timeout: raw
                .health_check_timeout
                .unwrap_or(settings.health_check_timeout),
            concurrency_limit: raw.concurrency_limit.unwrap_or(0),
            check_endpoint: raw
                .check_endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_CHECK_ENDPOINT.to_string()),
            ready_marker: raw
                .ready_marker
                .clone()
                .unwrap_or_else(|| DEFAULT_READY_MARKER.to_string()),
        });
    }

    // Aliases and ids share one namespace and every name maps to one id
    let mut names: HashMap<String, String> = HashMap::new();
    for model in &models {
        for name in std::iter::once(&model.id).chain(model.aliases.iter()) {
            if let Some(first) = names.get(name) {
                return Err(ConfigError::DuplicateAlias {
                    alias: name.clone(),
                    first: first.clone(),
                    second: model.id.clone(),
                });
            }
            names.insert(name.clone(), model.id.clone());
        }
    }

    let known: HashSet<&str> = models.iter().map(|m| m.id.as_str()).collect();
    let mut grouped: HashMap<String, String> = HashMap::new();
    let mut groups = Vec::with_capacity(file.groups.len());
    for (name, raw) in &file.groups {
        for member in &raw.members {
            if !known.contains(member.as_str()) {
                return Err(ConfigError::UnknownMember {
                    group: name.clone(),
                    id: member.clone(),
                });
            }
            if let Some(first) = grouped.get(member) {
                return Err(ConfigError::DuplicateMember {
                    id: member.clone(),
                    first: first.clone(),
                    second: name.clone(),
                });
            }
            grouped.insert(member.clone(), name.clone());
        }
        groups.push(GroupConfig {
            name: name.clone(),
            members: raw.members.clone(),
            swap: raw.swap.unwrap_or(false),
            exclusive: raw.exclusive.unwrap_or(false),
            persistent: raw.persistent.unwrap_or(false),
        });
    }

    // Ungrouped models each get an implicit exclusive singleton group
    for model in &models {
        if !grouped.contains_key(&model.id) {
            groups.push(GroupConfig::singleton(&model.id));
        }
    }

    Ok(Config {
        settings,
        models,
        groups,
    })
}
