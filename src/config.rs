use crate::cli::{Cli, OutputFormat, VerbosityLevel};
use crate::error::AuditError;
use crate::intake::UploadIntake;
use crate::scheduler::{self, SchedulerConfig};
use crate::validator::{DEFAULT_IDENTIFIER_FIELD, DEFAULT_REQUIRED_TAGS, TagSchema, ValidationPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "XML_TAG_AUDIT_";

/// Upper bound on configured workers
pub const MAX_WORKERS: usize = 256;

/// Trait for abstracting environment variable access
#[cfg_attr(test, mockall::automock)]
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// System environment variable provider for production use
pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),
}

impl From<ConfigError> for AuditError {
    fn from(e: ConfigError) -> Self {
        AuditError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub schema: SchemaConfig,
    pub processing: ProcessingConfig,
    pub files: FileConfig,
    pub export: ExportConfig,
    pub output: OutputConfig,
}

/// What a conformant document must contain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchemaConfig {
    /// Required tags, in report order
    pub required_tags: Vec<String>,
    /// Element holding the identifier
    pub identifier_field: String,
    pub policy: ValidationPolicy,
    /// Check tags in files whose identifier is missing
    pub check_tags_without_identifier: bool,
}

/// Worker pool and parser settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Concurrent parses; `None` picks `min(2 × cores, 8)`
    pub workers: Option<usize>,
    /// Per-file timeout in seconds; `None` disables it
    pub timeout_seconds: Option<u64>,
    /// Recover from malformed markup
    pub recover: bool,
    /// Progress events buffered ahead of the consumer
    pub channel_capacity: usize,
}

/// File intake configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// File extensions to process
    pub extensions: Vec<String>,
    /// Include patterns (glob syntax)
    pub include_patterns: Vec<String>,
    /// Exclude patterns (glob syntax)
    pub exclude_patterns: Vec<String>,
    /// Where uploaded files are stored
    pub upload_dir: PathBuf,
}

/// Export configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ExportConfig {
    /// Export directory; defaults to the upload directory
    pub directory: Option<PathBuf>,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format
    pub format: OutputFormatConfig,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode (errors only)
    pub quiet: bool,
}

/// Output format configuration (serializable version of CLI OutputFormat)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormatConfig {
    Human,
    Json,
}

impl From<OutputFormat> for OutputFormatConfig {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Human => OutputFormatConfig::Human,
            OutputFormat::Json => OutputFormatConfig::Json,
        }
    }
}

impl From<OutputFormatConfig> for OutputFormat {
    fn from(format: OutputFormatConfig) -> Self {
        match format {
            OutputFormatConfig::Human => OutputFormat::Human,
            OutputFormatConfig::Json => OutputFormat::Json,
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            required_tags: DEFAULT_REQUIRED_TAGS.iter().map(|t| t.to_string()).collect(),
            identifier_field: DEFAULT_IDENTIFIER_FIELD.to_string(),
            policy: ValidationPolicy::default(),
            check_tags_without_identifier: true,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: None,
            timeout_seconds: None,
            recover: true,
            channel_capacity: scheduler::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["xml".to_string()],
            include_patterns: vec![],
            exclude_patterns: vec![],
            upload_dir: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("xml-tag-audit")
                .join("uploads"),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormatConfig::Human,
            verbose: false,
            quiet: false,
        }
    }
}

/// Configuration manager for loading and merging configurations
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration with precedence: defaults -> file -> environment -> CLI
    pub async fn load_config(cli: &Cli) -> Result<Config> {
        Self::load_config_with(cli, &SystemEnvProvider).await
    }

    pub async fn load_config_with(cli: &Cli, env: &impl EnvProvider) -> Result<Config> {
        let mut config = Config::default();

        if let Some(config_path) = &cli.config {
            let file_config = Self::load_from_file(config_path).await?;
            config = Self::merge_configs(config, file_config);
        } else if let Some(found_config) = Self::find_config_file().await? {
            config = Self::merge_configs(config, found_config);
        }

        config = Self::apply_environment_overrides_with(env, config)?;
        config = Self::merge_with_cli(config, cli);

        Self::validate_config(&config)?;

        Ok(config)
    }

    /// Load configuration from a file (TOML or JSON)
    pub async fn load_from_file(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => {
                // Try to parse as TOML first, then JSON
                if let Ok(config) = toml::from_str::<Config>(&content) {
                    Ok(config)
                } else {
                    Ok(serde_json::from_str(&content)?)
                }
            }
        }
    }

    /// Find configuration file in standard locations
    pub async fn find_config_file() -> Result<Option<Config>> {
        let config_names = [
            "xml-tag-audit.toml",
            "xml-tag-audit.json",
            ".xml-tag-audit.toml",
            ".xml-tag-audit.json",
        ];

        for name in &config_names {
            let path = PathBuf::from(name);
            if path.exists() {
                return Ok(Some(Self::load_from_file(&path).await?));
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let app_config_dir = config_dir.join("xml-tag-audit");
            for name in &config_names {
                let path = app_config_dir.join(name);
                if path.exists() {
                    return Ok(Some(Self::load_from_file(&path).await?));
                }
            }
        }

        Ok(None)
    }

    /// Apply environment variable overrides with a custom environment provider
    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        // Schema settings
        if let Some(tags) = env_var(env, "TAGS") {
            config.schema.required_tags = split_list(&tags);
        }
        if let Some(identifier) = env_var(env, "IDENTIFIER") {
            config.schema.identifier_field = identifier;
        }
        if let Some(policy) = env_var(env, "POLICY") {
            config.schema.policy = match policy.to_lowercase().as_str() {
                "identifier-required" => ValidationPolicy::IdentifierRequired,
                "tag-completeness" => ValidationPolicy::TagCompleteness,
                _ => return Err(invalid_env("POLICY", &policy)),
            };
        }
        if let Some(check) = parse_env(env, "CHECK_TAGS_WITHOUT_IDENTIFIER")? {
            config.schema.check_tags_without_identifier = check;
        }

        // Processing settings
        if let Some(workers) = parse_env(env, "WORKERS")? {
            config.processing.workers = Some(workers);
        }
        if let Some(timeout) = parse_env(env, "TIMEOUT")? {
            config.processing.timeout_seconds = Some(timeout);
        }
        if let Some(recover) = parse_env(env, "RECOVER")? {
            config.processing.recover = recover;
        }
        if let Some(capacity) = parse_env(env, "CHANNEL_CAPACITY")? {
            config.processing.channel_capacity = capacity;
        }

        // File and export settings
        if let Some(extensions) = env_var(env, "EXTENSIONS") {
            config.files.extensions = split_list(&extensions);
        }
        if let Some(upload_dir) = env_var(env, "UPLOAD_DIR") {
            config.files.upload_dir = PathBuf::from(upload_dir);
        }
        if let Some(export_dir) = env_var(env, "EXPORT_DIR") {
            config.export.directory = Some(PathBuf::from(export_dir));
        }

        // Output settings
        if let Some(verbose) = parse_env(env, "VERBOSE")? {
            config.output.verbose = verbose;
        }
        if let Some(quiet) = parse_env(env, "QUIET")? {
            config.output.quiet = quiet;
        }
        if let Some(format) = env_var(env, "FORMAT") {
            config.output.format = match format.to_lowercase().as_str() {
                "human" => OutputFormatConfig::Human,
                "json" => OutputFormatConfig::Json,
                _ => return Err(invalid_env("FORMAT", &format)),
            };
        }

        Ok(config)
    }

    /// Merge CLI arguments with configuration (CLI takes precedence)
    pub fn merge_with_cli(mut config: Config, cli: &Cli) -> Config {
        // Schema settings
        if !cli.tags.is_empty() {
            config.schema.required_tags = cli.tags.iter().map(|t| t.trim().to_string()).collect();
        }
        if let Some(identifier) = &cli.identifier {
            config.schema.identifier_field = identifier.clone();
        }
        if let Some(policy) = cli.policy {
            config.schema.policy = policy;
        }
        if cli.skip_tags_without_identifier {
            config.schema.check_tags_without_identifier = false;
        }

        // Processing settings
        if cli.workers.is_some() {
            config.processing.workers = cli.workers;
        }
        if cli.timeout.is_some() {
            config.processing.timeout_seconds = cli.timeout;
        }
        if cli.no_recover {
            config.processing.recover = false;
        }

        // File and export settings
        if let Some(extensions) = cli.get_extensions() {
            config.files.extensions = extensions;
        }
        if !cli.include_patterns.is_empty() {
            config.files.include_patterns = cli.include_patterns.clone();
        }
        if !cli.exclude_patterns.is_empty() {
            config.files.exclude_patterns = cli.exclude_patterns.clone();
        }
        if let Some(upload_dir) = &cli.upload_dir {
            config.files.upload_dir = upload_dir.clone();
        }
        if let Some(export_dir) = &cli.export_dir {
            config.export.directory = Some(export_dir.clone());
        }

        // Output settings
        if let Some(format) = cli.output_format {
            config.output.format = format.into();
        }
        if cli.verbose > 0 {
            config.output.verbose = true;
            config.output.quiet = false;
        }
        if cli.quiet {
            config.output.quiet = true;
            config.output.verbose = false;
        }

        config
    }

    /// Merge two configurations (second takes precedence for non-None values)
    pub fn merge_configs(mut base: Config, override_config: Config) -> Config {
        // Schema settings
        if !override_config.schema.required_tags.is_empty() {
            base.schema.required_tags = override_config.schema.required_tags;
        }
        base.schema.identifier_field = override_config.schema.identifier_field;
        base.schema.policy = override_config.schema.policy;
        base.schema.check_tags_without_identifier =
            override_config.schema.check_tags_without_identifier;

        // Processing settings
        if override_config.processing.workers.is_some() {
            base.processing.workers = override_config.processing.workers;
        }
        if override_config.processing.timeout_seconds.is_some() {
            base.processing.timeout_seconds = override_config.processing.timeout_seconds;
        }
        base.processing.recover = override_config.processing.recover;
        base.processing.channel_capacity = override_config.processing.channel_capacity;

        // File settings
        if !override_config.files.extensions.is_empty() {
            base.files.extensions = override_config.files.extensions;
        }
        if !override_config.files.include_patterns.is_empty() {
            base.files.include_patterns = override_config.files.include_patterns;
        }
        if !override_config.files.exclude_patterns.is_empty() {
            base.files.exclude_patterns = override_config.files.exclude_patterns;
        }
        base.files.upload_dir = override_config.files.upload_dir;

        // Export settings
        if override_config.export.directory.is_some() {
            base.export.directory = override_config.export.directory;
        }

        // Output settings
        base.output.format = override_config.output.format;
        base.output.verbose = override_config.output.verbose;
        base.output.quiet = override_config.output.quiet;

        base
    }

    /// Validate configuration values
    pub fn validate_config(config: &Config) -> Result<()> {
        // Validate schema
        if config.schema.required_tags.is_empty() {
            return Err(ConfigError::Validation(
                "At least one required tag must be specified".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for tag in &config.schema.required_tags {
            if tag.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Required tag names cannot be empty".to_string(),
                ));
            }
            if !seen.insert(tag.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate required tag: {}",
                    tag
                )));
            }
        }
        if config.schema.identifier_field.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Identifier field cannot be empty".to_string(),
            ));
        }

        // Validate processing settings
        if let Some(workers) = config.processing.workers {
            if workers == 0 {
                return Err(ConfigError::Validation(
                    "Number of workers must be greater than 0".to_string(),
                ));
            }
            if workers > MAX_WORKERS {
                return Err(ConfigError::Validation(format!(
                    "Number of workers cannot exceed {}",
                    MAX_WORKERS
                )));
            }
        }
        if config.processing.timeout_seconds == Some(0) {
            return Err(ConfigError::Validation(
                "Timeout must be greater than 0".to_string(),
            ));
        }
        if config.processing.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "Channel capacity must be greater than 0".to_string(),
            ));
        }

        // Validate output settings
        if config.output.verbose && config.output.quiet {
            return Err(ConfigError::Validation(
                "Cannot enable both verbose and quiet modes".to_string(),
            ));
        }

        // Validate file settings
        if config.files.extensions.is_empty() {
            return Err(ConfigError::Validation(
                "At least one file extension must be specified".to_string(),
            ));
        }

        // Validate that extensions don't contain invalid characters
        for ext in &config.files.extensions {
            if ext.is_empty() || ext.contains('/') || ext.contains('\\') || ext.contains('.') {
                return Err(ConfigError::Validation(format!(
                    "Invalid file extension: {}",
                    ext
                )));
            }
        }

        Ok(())
    }

    /// Get the effective worker count
    pub fn get_worker_count(config: &Config) -> usize {
        config
            .processing
            .workers
            .unwrap_or_else(scheduler::default_workers)
    }

    /// Per-file timeout, if any
    pub fn get_timeout_duration(config: &Config) -> Option<Duration> {
        config.processing.timeout_seconds.map(Duration::from_secs)
    }

    /// Get the effective export directory
    pub fn get_export_directory(config: &Config) -> PathBuf {
        config
            .export
            .directory
            .clone()
            .unwrap_or_else(|| config.files.upload_dir.clone())
    }

    /// Verbosity after config, environment and CLI have been merged.
    /// A repeated `-v` still selects debug output.
    pub fn get_verbosity(config: &Config, cli_verbose: u8) -> VerbosityLevel {
        if config.output.quiet {
            VerbosityLevel::Quiet
        } else if cli_verbose >= 2 {
            VerbosityLevel::Debug
        } else if config.output.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }

    pub fn tag_schema(config: &Config) -> TagSchema {
        TagSchema {
            required_tags: config.schema.required_tags.clone(),
            identifier_field: config.schema.identifier_field.clone(),
            policy: config.schema.policy,
            check_tags_without_identifier: config.schema.check_tags_without_identifier,
        }
    }

    pub fn scheduler_config(config: &Config) -> SchedulerConfig {
        SchedulerConfig {
            workers: Self::get_worker_count(config),
            file_timeout: Self::get_timeout_duration(config),
            channel_capacity: config.processing.channel_capacity,
        }
    }

    pub fn upload_intake(config: &Config) -> UploadIntake {
        UploadIntake::new(&config.files.upload_dir)
            .with_extensions(config.files.extensions.clone())
            .with_include_patterns(config.files.include_patterns.clone())
            .with_exclude_patterns(config.files.exclude_patterns.clone())
    }
}

fn env_var(env: &impl EnvProvider, name: &str) -> Option<String> {
    env.get(&format!("{ENV_PREFIX}{name}"))
}

fn parse_env<T: FromStr>(env: &impl EnvProvider, name: &str) -> Result<Option<T>> {
    match env_var(env, name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid_env(name, &value)),
        None => Ok(None),
    }
}

fn invalid_env(name: &str, value: &str) -> ConfigError {
    ConfigError::Environment(format!("Invalid {ENV_PREFIX}{name} value: {value}"))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
