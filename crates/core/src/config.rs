use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::tool::Backend;
use crate::guard::GuardPolicy;

/// Placeholder in backend `args` replaced by `orchestrator.working_directory`.
pub const WORKING_DIRECTORY_PLACEHOLDER: &str = "{working_directory}";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub orchestrator: OrchestratorConfig,
    pub backends: BackendsConfig,
    pub guard: GuardConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub temperature: f32,
}

impl LlmConfig {
    pub fn endpoint(&self) -> String {
        let base = match (&self.base_url, self.provider) {
            (Some(url), _) => url.as_str(),
            (None, LlmProvider::OpenAi) => "https://api.openai.com/v1",
            (None, LlmProvider::Ollama) => "http://localhost:11434/v1",
        };
        base.trim_end_matches('/').to_string()
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    /// Empty means any origin is allowed.
    pub allowed_origins: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub reasoning_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub tool_retry_limit: u32,
    pub working_directory: PathBuf,
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, SecretString>,
    pub discovery_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct BackendsConfig {
    pub crm: BackendConfig,
    pub repo_host: BackendConfig,
    pub filesystem: BackendConfig,
}

impl BackendsConfig {
    pub fn get(&self, backend: Backend) -> &BackendConfig {
        match backend {
            Backend::Crm => &self.crm,
            Backend::RepoHost => &self.repo_host,
            Backend::Filesystem => &self.filesystem,
        }
    }

    fn get_mut(&mut self, backend: Backend) -> &mut BackendConfig {
        match backend {
            Backend::Crm => &mut self.crm,
            Backend::RepoHost => &mut self.repo_host,
            Backend::Filesystem => &mut self.filesystem,
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = (Backend, &BackendConfig)> {
        Backend::ALL
            .into_iter()
            .map(|backend| (backend, self.get(backend)))
            .filter(|(_, config)| config.enabled)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardConfig {
    pub crm: GuardPolicy,
    pub repo_host: GuardPolicy,
    pub filesystem: GuardPolicy,
}

impl GuardConfig {
    pub fn policy(&self, backend: Backend) -> &GuardPolicy {
        match backend {
            Backend::Crm => &self.crm,
            Backend::RepoHost => &self.repo_host,
            Backend::Filesystem => &self.filesystem,
        }
    }

    fn policy_mut(&mut self, backend: Backend) -> &mut GuardPolicy {
        match backend {
            Backend::Crm => &mut self.crm,
            Backend::RepoHost => &mut self.repo_host,
            Backend::Filesystem => &mut self.filesystem,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub server_port: Option<u16>,
    pub working_directory: Option<PathBuf>,
    pub disabled_backends: Vec<Backend>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

fn npx_backend(args: &[&str], discovery_timeout_secs: u64) -> BackendConfig {
    BackendConfig {
        enabled: true,
        command: "npx".to_string(),
        args: args.iter().map(|arg| (*arg).to_string()).collect(),
        env: BTreeMap::new(),
        discovery_timeout_secs,
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://parley.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 60,
                max_retries: 1,
                temperature: 0.0,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 5000,
                graceful_shutdown_secs: 15,
                allowed_origins: Vec::new(),
            },
            orchestrator: OrchestratorConfig {
                reasoning_timeout_secs: 60,
                tool_timeout_secs: 30,
                tool_retry_limit: 1,
                working_directory: PathBuf::from("."),
            },
            backends: BackendsConfig {
                crm: npx_backend(
                    &[
                        "@salesforce/mcp",
                        "--orgs",
                        "DEFAULT_TARGET_ORG",
                        "--toolsets",
                        "data,users,metadata,orgs",
                    ],
                    30,
                ),
                repo_host: npx_backend(&["-y", "@modelcontextprotocol/server-github"], 30),
                filesystem: npx_backend(
                    &[
                        "-y",
                        "@modelcontextprotocol/server-filesystem",
                        WORKING_DIRECTORY_PLACEHOLDER,
                    ],
                    30,
                ),
            },
            guard: GuardConfig {
                crm: GuardPolicy::defaults_for(Backend::Crm),
                repo_host: GuardPolicy::defaults_for(Backend::RepoHost),
                filesystem: GuardPolicy::defaults_for(Backend::Filesystem),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("parley.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.resolve_working_directory();
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(allowed_origins) = server.allowed_origins {
                self.server.allowed_origins = allowed_origins;
            }
        }

        if let Some(orchestrator) = patch.orchestrator {
            if let Some(secs) = orchestrator.reasoning_timeout_secs {
                self.orchestrator.reasoning_timeout_secs = secs;
            }
            if let Some(secs) = orchestrator.tool_timeout_secs {
                self.orchestrator.tool_timeout_secs = secs;
            }
            if let Some(limit) = orchestrator.tool_retry_limit {
                self.orchestrator.tool_retry_limit = limit;
            }
            if let Some(working_directory) = orchestrator.working_directory {
                self.orchestrator.working_directory = working_directory;
            }
        }

        if let Some(backends) = patch.backends {
            let patches = [
                (Backend::Crm, backends.crm),
                (Backend::RepoHost, backends.repo_host),
                (Backend::Filesystem, backends.filesystem),
            ];
            for (backend, maybe_patch) in patches {
                if let Some(backend_patch) = maybe_patch {
                    backend_patch.apply(self.backends.get_mut(backend));
                }
            }
        }

        if let Some(guard) = patch.guard {
            let patches = [
                (Backend::Crm, guard.crm),
                (Backend::RepoHost, guard.repo_host),
                (Backend::Filesystem, guard.filesystem),
            ];
            for (backend, maybe_patch) in patches {
                if let Some(policy_patch) = maybe_patch {
                    policy_patch.apply(self.guard.policy_mut(backend));
                }
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PARLEY_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("PARLEY_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("PARLEY_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("PARLEY_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PARLEY_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("PARLEY_LLM_API_KEY").or_else(|| read_env("OPENAI_API_KEY"))
        {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("PARLEY_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("PARLEY_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("PARLEY_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("PARLEY_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("PARLEY_LLM_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("PARLEY_LLM_TEMPERATURE") {
            self.llm.temperature = parse_f32("PARLEY_LLM_TEMPERATURE", &value)?;
        }

        if let Some(value) = read_env("PARLEY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PARLEY_SERVER_PORT") {
            self.server.port = parse_u16("PARLEY_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("PARLEY_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("PARLEY_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_SERVER_ALLOWED_ORIGINS") {
            self.server.allowed_origins = split_list(&value, ',');
        }

        if let Some(value) = read_env("PARLEY_ORCHESTRATOR_REASONING_TIMEOUT_SECS") {
            self.orchestrator.reasoning_timeout_secs =
                parse_u64("PARLEY_ORCHESTRATOR_REASONING_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_ORCHESTRATOR_TOOL_TIMEOUT_SECS") {
            self.orchestrator.tool_timeout_secs =
                parse_u64("PARLEY_ORCHESTRATOR_TOOL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_ORCHESTRATOR_TOOL_RETRY_LIMIT") {
            self.orchestrator.tool_retry_limit =
                parse_u32("PARLEY_ORCHESTRATOR_TOOL_RETRY_LIMIT", &value)?;
        }
        if let Some(value) = read_env("PARLEY_ORCHESTRATOR_WORKING_DIRECTORY") {
            self.orchestrator.working_directory = PathBuf::from(value);
        }

        for backend in Backend::ALL {
            let prefix = format!("PARLEY_BACKENDS_{}", backend.config_key().to_ascii_uppercase());
            let target = self.backends.get_mut(backend);

            let key = format!("{prefix}_ENABLED");
            if let Some(value) = read_env(&key) {
                target.enabled = parse_bool(&key, &value)?;
            }
            if let Some(value) = read_env(&format!("{prefix}_COMMAND")) {
                target.command = value;
            }
            if let Some(value) = read_env(&format!("{prefix}_ARGS")) {
                target.args = value.split_whitespace().map(str::to_string).collect();
            }
            let key = format!("{prefix}_DISCOVERY_TIMEOUT_SECS");
            if let Some(value) = read_env(&key) {
                target.discovery_timeout_secs = parse_u64(&key, &value)?;
            }
        }

        // The repository host server reads its token from this variable name.
        if let Some(value) =
            read_env("PARLEY_BACKENDS_REPO_HOST_TOKEN").or_else(|| read_env("GITHUB_TOKEN"))
        {
            self.backends
                .repo_host
                .env
                .insert("GITHUB_PERSONAL_ACCESS_TOKEN".to_string(), secret_value(value));
        }

        let log_level = read_env("PARLEY_LOGGING_LEVEL").or_else(|| read_env("PARLEY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PARLEY_LOGGING_FORMAT").or_else(|| read_env("PARLEY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(working_directory) = overrides.working_directory {
            self.orchestrator.working_directory = working_directory;
        }
        for backend in overrides.disabled_backends {
            self.backends.get_mut(backend).enabled = false;
        }
    }

    fn resolve_working_directory(&mut self) {
        if self.orchestrator.working_directory.is_relative() {
            if let Ok(current) = env::current_dir() {
                self.orchestrator.working_directory =
                    current.join(&self.orchestrator.working_directory);
            }
        }

        let directory = self.orchestrator.working_directory.display().to_string();
        for backend in Backend::ALL {
            for arg in &mut self.backends.get_mut(backend).args {
                if arg.contains(WORKING_DIRECTORY_PLACEHOLDER) {
                    *arg = arg.replace(WORKING_DIRECTORY_PLACEHOLDER, &directory);
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_orchestrator(&self.orchestrator)?;
        for backend in Backend::ALL {
            validate_backend(backend, self.backends.get(backend))?;
            validate_guard(backend, self.guard.policy(backend))?;
        }
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("parley.toml"), PathBuf::from("config/parley.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || !matches!(chars.peek(), Some('{')) {
            output.push(ch);
            continue;
        }
        chars.next();

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(next) => key.push(next),
                None => return Err(ConfigError::UnterminatedInterpolation),
            }
        }

        let value =
            env::var(&key).map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
        output.push_str(&value);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(
            "llm.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider (set PARLEY_LLM_API_KEY)"
                        .to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for the ollama provider".to_string(),
                ));
            }
        }
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    if let Some(origin) = server
        .allowed_origins
        .iter()
        .find(|origin| !origin.starts_with("http://") && !origin.starts_with("https://"))
    {
        return Err(ConfigError::Validation(format!(
            "server.allowed_origins entry `{origin}` must start with http:// or https://"
        )));
    }

    Ok(())
}

fn validate_orchestrator(orchestrator: &OrchestratorConfig) -> Result<(), ConfigError> {
    if orchestrator.reasoning_timeout_secs == 0 || orchestrator.reasoning_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "orchestrator.reasoning_timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if orchestrator.tool_timeout_secs == 0 || orchestrator.tool_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "orchestrator.tool_timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if orchestrator.tool_retry_limit > 1 {
        return Err(ConfigError::Validation(
            "orchestrator.tool_retry_limit must be 0 or 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_backend(backend: Backend, config: &BackendConfig) -> Result<(), ConfigError> {
    if !config.enabled {
        return Ok(());
    }

    let key = backend.config_key();
    if config.command.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "backends.{key}.command must not be empty when the backend is enabled"
        )));
    }

    if config.discovery_timeout_secs == 0 || config.discovery_timeout_secs > 300 {
        return Err(ConfigError::Validation(format!(
            "backends.{key}.discovery_timeout_secs must be in range 1..=300"
        )));
    }

    Ok(())
}

fn validate_guard(backend: Backend, policy: &GuardPolicy) -> Result<(), ConfigError> {
    let key = backend.config_key();
    if policy.max_items == 0 {
        return Err(ConfigError::Validation(format!(
            "guard.{key}.max_items must be greater than zero"
        )));
    }

    if policy.max_bytes < 256 {
        return Err(ConfigError::Validation(format!("guard.{key}.max_bytes must be at least 256")));
    }

    if policy.max_depth == 0 {
        return Err(ConfigError::Validation(format!(
            "guard.{key}.max_depth must be greater than zero"
        )));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse::<f32>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    orchestrator: Option<OrchestratorPatch>,
    backends: Option<BackendsPatch>,
    guard: Option<GuardPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct OrchestratorPatch {
    reasoning_timeout_secs: Option<u64>,
    tool_timeout_secs: Option<u64>,
    tool_retry_limit: Option<u32>,
    working_directory: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendsPatch {
    crm: Option<BackendPatch>,
    repo_host: Option<BackendPatch>,
    filesystem: Option<BackendPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendPatch {
    enabled: Option<bool>,
    command: Option<String>,
    args: Option<Vec<String>>,
    env: Option<BTreeMap<String, String>>,
    discovery_timeout_secs: Option<u64>,
}

impl BackendPatch {
    fn apply(self, target: &mut BackendConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(command) = self.command {
            target.command = command;
        }
        if let Some(args) = self.args {
            target.args = args;
        }
        if let Some(env) = self.env {
            target.env.extend(env.into_iter().map(|(key, value)| (key, secret_value(value))));
        }
        if let Some(secs) = self.discovery_timeout_secs {
            target.discovery_timeout_secs = secs;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GuardPatch {
    crm: Option<GuardPolicyPatch>,
    repo_host: Option<GuardPolicyPatch>,
    filesystem: Option<GuardPolicyPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct GuardPolicyPatch {
    max_items: Option<usize>,
    max_bytes: Option<usize>,
    max_depth: Option<usize>,
    redact: Option<Vec<String>>,
}

impl GuardPolicyPatch {
    fn apply(self, target: &mut GuardPolicy) {
        if let Some(max_items) = self.max_items {
            target.max_items = max_items;
        }
        if let Some(max_bytes) = self.max_bytes {
            target.max_bytes = max_bytes;
        }
        if let Some(max_depth) = self.max_depth {
            target.max_depth = max_depth;
        }
        if let Some(redact) = self.redact {
            target.redact = redact;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::path::PathBuf;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};
    use crate::domain::tool::Backend;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate_and_point_filesystem_at_working_directory() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                working_directory: Some(PathBuf::from("/srv/projects")),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.server.port == 5000, "default port should be 5000")?;
        ensure(config.orchestrator.tool_retry_limit == 1, "default retry limit should be 1")?;
        ensure(
            config.backends.filesystem.args.last().map(String::as_str) == Some("/srv/projects"),
            "filesystem backend should receive the working directory",
        )?;
        ensure(config.guard.filesystem.max_items == 50, "filesystem listing cap should be 50")?;
        ensure(config.backends.enabled().count() == 3, "all backends enabled by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_PARLEY_LLM_KEY", "sk-from-env");
        env::set_var("TEST_PARLEY_SF_ORG", "acme-prod");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("parley.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "openai"
api_key = "${TEST_PARLEY_LLM_KEY}"
model = "gpt-4o-mini"

[backends.crm]
args = ["@salesforce/mcp", "--orgs", "${TEST_PARLEY_SF_ORG}"]

[backends.crm.env]
NODE_TLS_REJECT_UNAUTHORIZED = "1"

[guard.crm]
max_items = 10
redact = ["Password", "SessionId"]
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should be openai")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be interpolated from the environment",
            )?;
            ensure(
                config.backends.crm.args.get(2).map(String::as_str) == Some("acme-prod"),
                "crm args should be interpolated",
            )?;
            ensure(config.backends.crm.env.len() == 1, "crm env should be loaded")?;
            ensure(config.guard.crm.max_items == 10, "guard patch should apply")?;
            ensure(config.guard.crm.redact.len() == 2, "redaction list should be replaced")?;
            ensure(config.guard.crm.max_bytes == 8_000, "unpatched guard fields keep defaults")?;
            Ok(())
        })();

        clear_vars(&["TEST_PARLEY_LLM_KEY", "TEST_PARLEY_SF_ORG"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_LOG_LEVEL", "warn");
        env::set_var("PARLEY_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["PARLEY_LOG_LEVEL", "PARLEY_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("PARLEY_ORCHESTRATOR_TOOL_TIMEOUT_SECS", "12");
        env::set_var("PARLEY_BACKENDS_REPO_HOST_ENABLED", "false");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("parley.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[orchestrator]
tool_timeout_secs = 45
reasoning_timeout_secs = 90

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    disabled_backends: vec![Backend::Crm],
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.orchestrator.tool_timeout_secs == 12, "env should win over file")?;
            ensure(
                config.orchestrator.reasoning_timeout_secs == 90,
                "file should win over defaults",
            )?;
            ensure(!config.backends.repo_host.enabled, "env should disable the repo host")?;
            ensure(!config.backends.crm.enabled, "override should disable the crm")?;
            ensure(config.backends.enabled().count() == 1, "only filesystem remains enabled")?;
            Ok(())
        })();

        clear_vars(&[
            "PARLEY_DATABASE_URL",
            "PARLEY_ORCHESTRATOR_TOOL_TIMEOUT_SECS",
            "PARLEY_BACKENDS_REPO_HOST_ENABLED",
        ]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_ORCHESTRATOR_TOOL_RETRY_LIMIT", "3");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("tool_retry_limit")
            );
            ensure(has_message, "validation failure should mention tool_retry_limit")
        })();

        clear_vars(&["PARLEY_ORCHESTRATOR_TOOL_RETRY_LIMIT"]);
        result
    }

    #[test]
    fn openai_provider_requires_api_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let error = match AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                llm_provider: Some(LlmProvider::OpenAi),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }) {
            Ok(config) if config.llm.api_key.is_some() => return Ok(()),
            Ok(_) => return Err("expected missing api key to fail validation".to_string()),
            Err(error) => error,
        };

        let mentions_key = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("llm.api_key")
        );
        ensure(mentions_key, "validation failure should mention llm.api_key")
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_SERVER_PORT", "not-a-port");
        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) if key == "PARLEY_SERVER_PORT" => {
                Ok(())
            }
            _ => Err("expected invalid env override error".to_string()),
        };
        clear_vars(&["PARLEY_SERVER_PORT"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_LLM_API_KEY", "sk-secret-value");
        env::set_var("PARLEY_BACKENDS_REPO_HOST_TOKEN", "ghp-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("ghp-secret-value"),
                "debug output should not contain backend token",
            )?;
            ensure(
                config.backends.repo_host.env.contains_key("GITHUB_PERSONAL_ACCESS_TOKEN"),
                "repo host token should be passed through to the backend env",
            )?;
            Ok(())
        })();

        clear_vars(&["PARLEY_LLM_API_KEY", "PARLEY_BACKENDS_REPO_HOST_TOKEN"]);
        result
    }

    #[test]
    fn missing_required_file_is_reported() {
        let result = AppConfig::load(LoadOptions {
            config_path: Some(PathBuf::from("/nonexistent/parley.toml")),
            require_file: true,
            ..LoadOptions::default()
        });
        assert!(matches!(result, Err(ConfigError::MissingConfigFile(_))));
    }
}
