//! Configuration module for squid-redirector.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values; rule sources
//! from both are merged, config file first.

use crate::rules::RuleSource;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the redirector
#[derive(Parser, Debug)]
#[command(name = "squid-redirector")]
#[command(author = "squid-redirector authors")]
#[command(version)]
#[command(about = "A squid url_rewrite_program helper driven by regex rules", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Rewrite rule sources: JSON object literals or paths to JSON files
    #[arg(long, num_args = 1..)]
    pub rewrite: Vec<String>,

    /// Redirect rule sources: JSON object literals or paths to JSON files
    #[arg(long, num_args = 1..)]
    pub redirect: Vec<String>,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub rewrite: Vec<RuleEntry>,
    #[serde(default)]
    pub redirect: Vec<RuleEntry>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file; stderr when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// External rule sources, same syntax as the CLI flags
#[derive(Debug, Deserialize, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub rewrite: Vec<String>,
    #[serde(default)]
    pub redirect: Vec<String>,
}

/// One inline rule
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub pattern: String,
    pub replacement: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub rewrite_sources: Vec<RuleSource>,
    pub redirect_sources: Vec<RuleSource>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let log_level = if cli.verbose {
            "debug".to_string()
        } else if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        Config {
            log_level,
            log_file: cli.log_file.or(toml_config.logging.file),
            rewrite_sources: collect_sources(
                toml_config.rewrite,
                &toml_config.sources.rewrite,
                &cli.rewrite,
            ),
            redirect_sources: collect_sources(
                toml_config.redirect,
                &toml_config.sources.redirect,
                &cli.redirect,
            ),
        }
    }
}

/// Order: inline file entries, file sources, CLI sources.
fn collect_sources(inline: Vec<RuleEntry>, file: &[String], cli: &[String]) -> Vec<RuleSource> {
    let mut sources = Vec::new();
    if !inline.is_empty() {
        sources.push(RuleSource::Inline(
            inline
                .into_iter()
                .map(|entry| (entry.pattern, entry.replacement))
                .collect(),
        ));
    }
    sources.extend(file.iter().chain(cli).map(|arg| RuleSource::from_arg(arg)));
    sources
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
