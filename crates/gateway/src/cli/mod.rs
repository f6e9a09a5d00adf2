pub mod config;

use clap::{Parser, Subcommand};

use cf_domain::config::Config;

/// Confab: an agent turn-orchestration server.
#[derive(Debug, Parser)]
#[command(name = "confab", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the HTTP server (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

pub const CONFIG_ENV: &str = "CONFAB_CONFIG";

/// Load the configuration from the path in `CONFAB_CONFIG` (or
/// `config.toml` by default). Returns the parsed [`Config`] and the path
/// that was used.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".into());
    let config = load_config_from(&config_path)?;
    Ok((config, config_path))
}

/// Parse `path`, falling back to defaults when the file does not exist.
pub fn load_config_from(path: &str) -> anyhow::Result<Config> {
    if !std::path::Path::new(path).exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("reading {path}: {e}"))?;
    toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {path}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load_config_from("/definitely/not/here/confab.toml").unwrap();
        assert_eq!(cfg.engine.max_recursion_depth, Config::default().engine.max_recursion_depth);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nmax_recursion_depth = 3\n\n[server]\nport = 9999").unwrap();

        let cfg = load_config_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.engine.max_recursion_depth, 3);
        assert_eq!(cfg.server.port, 9999);
        assert_eq!(
            cfg.engine.flush_interval_ms,
            Config::default().engine.flush_interval_ms
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine\nmax_recursion_depth = ").unwrap();

        let err = load_config_from(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().starts_with("parsing"));
    }

    #[test]
    fn cli_parses_config_validate() {
        let cli = Cli::try_parse_from(["confab", "config", "validate"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigCommand::Validate))
        ));
    }
}
