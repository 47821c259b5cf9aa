//! # Daemon settings: config dir, `config.yml`, and runtime constants.
//!
//! Both the client and the daemon load the same settings file at
//! `~/.procvisor/config.yml`. The directory is created `0700` on first run
//! (the rendezvous socket lives there, and it can control the daemon), and a
//! commented default config file is written `0660` so the keys are
//! discoverable.
//!
//! Command-line overrides (`--fifo`, `--log`, `-v`) win over file values.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::config::duration::parse_duration;
use crate::error::ServerError;

/// Frequency at which the daemon touches the rendezvous file's mtime.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default wait between escalation signals when stopping a service.
pub const ESCALATION_INTERVAL: Duration = Duration::from_secs(10);

/// Default removal grace for exited temp services.
pub const CLEAN_TEMP_SERVICES_AFTER: Duration = Duration::from_secs(60 * 60);

const CONFIG_DIR: &str = ".procvisor";
const CONFIG_FILE: &str = "config.yml";
const SERVICES_FILE: &str = "services.yml";
const FIFO_FILE: &str = ".fifo";
const LOG_FILE: &str = "log";

const DEFAULT_CONFIG: &str = "\
# Config for procvisor

# Set 'log' to a path for the server to log there, or '-' for stdout.
#log: \"/path/to/procvisor.log\"

# Log level can be \"crit\", \"error\", \"warn\", \"info\", or \"debug\"
#log_level: \"info\"

# Path to the socket file that the clients and server use to communicate
#fifo: \"/path/to/procvisor.fifo\"

# When temp services exit, after this duration (unless they are restarted),
# they are auto-removed. This can be overridden from the cmdline for an
# individual service when creating it.
#
# Values can be like \"1s\" (1 second), \"1h\" (1 hour), \"1h15m10s\" (1 hour,
# 15 minutes and 10 seconds)
#clean_temp_services_after: \"1h\"
";

/// Yaml shape of `config.yml`.
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    log: Option<PathBuf>,
    #[serde(default)]
    fifo: Option<PathBuf>,
    #[serde(default)]
    clean_temp_services_after: Option<String>,
}

/// Command-line values that override file settings.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub fifo: Option<PathBuf>,
    pub log: Option<PathBuf>,
    /// Count of `-v` flags; bumps the log level toward debug.
    pub verbosity: u8,
}

/// Resolved settings shared by the client and the daemon.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the daemon's log file, or `-` for stdout.
    pub log_path: PathBuf,
    /// One of `crit`, `error`, `warn`, `info`, `debug`.
    pub log_level: String,
    /// Rendezvous file: the UNIX socket address and liveness indicator.
    pub fifo_path: PathBuf,
    /// Removal grace applied to temp services that didn't specify one.
    pub clean_temp_services_after: Duration,
    /// Path to `services.yml`, if it exists.
    pub service_file: Option<PathBuf>,
}

impl Settings {
    /// Loads settings, creating the config dir and a default `config.yml`
    /// when missing.
    ///
    /// `is_server` selects the default log level: the daemon defaults to
    /// `info`, short-lived clients to `warn`.
    pub fn load(overrides: &Overrides, is_server: bool) -> Result<Settings, ServerError> {
        let dir = config_dir()?;
        ensure_config_dir(&dir)?;

        let conf_path = dir.join(CONFIG_FILE);
        let raw = read_or_create_config(&conf_path)?;

        let log_level = if overrides.verbosity > 0 {
            bump_level(overrides.verbosity)
        } else if let Some(level) = raw.log_level.filter(|_| is_server) {
            validate_level(&level)?
        } else if is_server {
            "info".to_string()
        } else {
            "warn".to_string()
        };

        let log_path = overrides
            .log
            .clone()
            .or(raw.log)
            .unwrap_or_else(|| dir.join(LOG_FILE));

        let fifo_path = overrides
            .fifo
            .clone()
            .or(raw.fifo)
            .unwrap_or_else(|| dir.join(FIFO_FILE));

        let clean_temp_services_after = match raw.clean_temp_services_after {
            Some(s) => parse_duration(&s)
                .map_err(|e| ServerError::Config(format!("clean_temp_services_after: {e}")))?,
            None => CLEAN_TEMP_SERVICES_AFTER,
        };

        let services = dir.join(SERVICES_FILE);
        let service_file = match fs::metadata(&services) {
            Ok(_) => Some(services),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(ServerError::Config(format!(
                    "failed to stat {}: {e}",
                    services.display()
                )))
            }
        };

        Ok(Settings {
            log_path,
            log_level,
            fifo_path,
            clean_temp_services_after,
            service_file,
        })
    }
}

fn config_dir() -> Result<PathBuf, ServerError> {
    let home = dirs::home_dir()
        .ok_or_else(|| ServerError::Config("cannot determine home directory".to_string()))?;
    Ok(home.join(CONFIG_DIR))
}

/// Creates the config dir `0700`. An existing dir is success; only distinct
/// stat/create errors fail.
fn ensure_config_dir(dir: &Path) -> Result<(), ServerError> {
    match fs::create_dir(dir) {
        Ok(()) => {
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| ServerError::Config(format!("chmod {}: {e}", dir.display())))?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(ServerError::Config(format!(
            "failed to create config dir {}: {e}",
            dir.display()
        ))),
    }
}

fn read_or_create_config(path: &Path) -> Result<RawSettings, ServerError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::write(path, DEFAULT_CONFIG).map_err(|e| {
                ServerError::Config(format!("failed to create {}: {e}", path.display()))
            })?;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o660));
            DEFAULT_CONFIG.to_string()
        }
        Err(e) => {
            return Err(ServerError::Config(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };

    parse_settings(&data)
        .map_err(|e| ServerError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// A comments-only or empty file reads as null; that's a default config,
/// not an error.
fn parse_settings(data: &str) -> Result<RawSettings, serde_yaml::Error> {
    serde_yaml::from_str::<Option<RawSettings>>(data).map(Option::unwrap_or_default)
}

fn validate_level(level: &str) -> Result<String, ServerError> {
    match level {
        "crit" | "error" | "warn" | "info" | "debug" => Ok(level.to_string()),
        other => Err(ServerError::Config(format!("unknown log_level '{other}'"))),
    }
}

fn bump_level(verbosity: u8) -> String {
    match verbosity {
        1 => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Maps our level names onto a tracing filter directive.
pub fn tracing_directive(level: &str) -> &'static str {
    match level {
        "crit" | "error" => "error",
        "warn" => "warn",
        "debug" => "debug",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        // The shipped default is all comments; it must read as defaults.
        let raw = parse_settings(DEFAULT_CONFIG).unwrap();
        assert!(raw.log.is_none());
        assert!(raw.fifo.is_none());
        assert!(raw.clean_temp_services_after.is_none());
    }

    #[test]
    fn explicit_config_parses() {
        let raw = parse_settings(
            "log: \"/tmp/p.log\"\nlog_level: \"debug\"\nfifo: \"/tmp/p.fifo\"\nclean_temp_services_after: \"1h15m\"\n",
        )
        .unwrap();
        assert_eq!(raw.log.unwrap(), PathBuf::from("/tmp/p.log"));
        assert_eq!(raw.log_level.as_deref(), Some("debug"));
        assert_eq!(
            parse_duration(&raw.clean_temp_services_after.unwrap()).unwrap(),
            Duration::from_secs(75 * 60)
        );
    }

    #[test]
    fn level_validation() {
        assert!(validate_level("crit").is_ok());
        assert!(validate_level("verbose").is_err());
        assert_eq!(tracing_directive("crit"), "error");
    }
}
