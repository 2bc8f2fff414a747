//! Server configuration.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. The TOML file given with `--config` (optional)
//! 3. Environment variables prefixed `WADDLE__`, with `__` between keys,
//!    e.g. `WADDLE__ROUTER__DOMAIN=waddle.social`
//! 4. Command-line flags

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use waddle_router::RouterConfig;

/// Waddle routing server.
#[derive(Parser, Debug, Clone)]
#[command(name = "waddle-server")]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file (TOML)
    #[arg(long, short = 'c', default_value = "waddle.toml")]
    pub config: PathBuf,

    /// XMPP domain to serve (overrides the configuration file)
    #[arg(long, short = 'd')]
    pub domain: Option<String>,

    /// Emit logs as JSON (overrides the configuration file)
    #[arg(long)]
    pub json_logs: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print the default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is not set
    pub filter: String,
    /// Structured JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info,waddle_router=debug,waddle_server=debug".to_string(),
            json: false,
        }
    }
}

/// Everything the server process is configured with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub router: RouterConfig,
    pub telemetry: TelemetryConfig,
}

impl ServerConfig {
    /// Layer defaults, the file, the environment and `cli`.
    pub fn load(cli: &CliArgs) -> Result<Self> {
        let defaults =
            Config::try_from(&ServerConfig::default()).context("Failed to encode defaults")?;

        let mut builder = Config::builder()
            .add_source(defaults)
            .add_source(
                File::from(cli.config.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("WADDLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("router.domain", cli.domain.clone())
            .context("Invalid --domain")?;
        if cli.json_logs {
            builder = builder
                .set_override("telemetry.json", true)
                .context("Invalid --json-logs")?;
        }

        builder
            .build()
            .and_then(|loaded| loaded.try_deserialize::<ServerConfig>())
            .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))
    }

    /// The defaults rendered as TOML.
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&ServerConfig::default())
            .context("Failed to serialize default configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use waddle_router::config::OfflinePolicy;

    fn cli(path: &std::path::Path) -> CliArgs {
        CliArgs {
            config: path.to_path_buf(),
            domain: None,
            json_logs: false,
            validate: false,
            print_default_config: false,
        }
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(&cli(&dir.path().join("absent.toml"))).unwrap();

        assert_eq!(config.router.domain, RouterConfig::default().domain);
        assert_eq!(config.router.conflict_limit, 0);
        assert!(!config.telemetry.json);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[router]
domain = "waddle.social"
offline_policy = "bounce"
conflict_limit = 2

[router.sessions]
detach_timeout_secs = 30

[telemetry]
json = true
"#
        )
        .unwrap();

        let config = ServerConfig::load(&cli(file.path())).unwrap();

        assert_eq!(config.router.domain, "waddle.social");
        assert_eq!(config.router.offline_policy, OfflinePolicy::Bounce);
        assert_eq!(config.router.conflict_limit, 2);
        assert_eq!(config.router.sessions.detach_timeout_secs, 30);
        assert_eq!(
            config.router.sessions.pre_auth_timeout_secs,
            RouterConfig::default().sessions.pre_auth_timeout_secs
        );
        assert!(config.telemetry.json);
    }

    #[test]
    fn test_cli_flags_win() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[router]\ndomain = \"from-file.example\"").unwrap();
        let mut args = cli(file.path());
        args.domain = Some("waddle.social".to_string());
        args.json_logs = true;

        let config = ServerConfig::load(&args).unwrap();

        assert_eq!(config.router.domain, "waddle.social");
        assert!(config.telemetry.json);
    }

    #[test]
    fn test_default_toml_parses_back() {
        let rendered = ServerConfig::default_toml().unwrap();
        let parsed: ServerConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.router.domain, RouterConfig::default().domain);
    }
}
