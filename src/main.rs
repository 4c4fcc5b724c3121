//! squid-redirector: a url_rewrite_program helper for Squid
//!
//! Squid writes one line per request to stdin and waits for one line back
//! on stdout telling it to pass the request through, rewrite its URL, or
//! answer with a redirect. Decisions come from ordered regex rules:
//! - Rewrite rules are tried first
//! - Redirect rules (301) are tried next
//! - Anything else is answered with ERR
//!
//! Rules and logging are configured via CLI arguments or a TOML file.

mod config;
mod protocol;
mod rules;
mod server;

use config::Config;
use rules::{Category, RuleSet, RuleTable};
use server::Server;
use std::path::Path;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout belongs to the proxy
    let _guard = match init_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            init_stderr_logging(log_filter(&config));
            error!(error = %e, "Failed to open log file");
            return Err(e.into());
        }
    };

    let rules = match build_rules(&config) {
        Ok(rules) => rules,
        Err(e) => {
            error!(error = %e, "Failed to load rules");
            return Err(e.into());
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        rewrite_rules = rules.len(Category::Rewrite),
        redirect_rules = rules.len(Category::Redirect),
        "Starting squid-redirector"
    );

    let stats = Server::new(rules).run_stdio().map_err(|e| {
        error!(error = %e, "I/O failure, exiting");
        e
    })?;

    info!(requests = stats.requests, "Shutting down");
    Ok(())
}

fn build_rules(config: &Config) -> Result<RuleTable, rules::RuleError> {
    let rewrite = RuleSet::merge(&config.rewrite_sources)?;
    let redirect = RuleSet::merge(&config.redirect_sources)?;
    if rewrite.is_empty() && redirect.is_empty() {
        warn!("No rules configured, every request will be answered with ERR");
    }

    let table = RuleTable::new(&rewrite, &redirect)?;
    for category in [Category::Rewrite, Category::Redirect] {
        for (index, rule) in table.rules(category).iter().enumerate() {
            debug!(%category, index, pattern = rule.pattern(), "Rule loaded");
        }
    }
    Ok(table)
}

fn log_filter(config: &Config) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Open (append) the log file, creating its directory if needed.
fn open_log_file(path: &Path) -> Result<RollingFileAppender, InitError> {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .into_owned();

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(directory)
}

/// Log to the configured file, or to stderr without colors.
///
/// Nothing is installed if the log file cannot be opened.
fn init_logging(config: &Config) -> Result<Option<WorkerGuard>, InitError> {
    let Some(path) = &config.log_file else {
        init_stderr_logging(log_filter(config));
        return Ok(None);
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(open_log_file(path)?);
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(config))
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

fn init_stderr_logging(filter: EnvFilter) {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();
}
