//! # Service definitions: the record a service is made from.
//!
//! A [`ServiceConfig`] names a program plus everything needed to launch it,
//! and the behavior flags that drive supervision (`auto-start`,
//! `restart-on-exit`, temp/clean-after). Configs are immutable once
//! sanitized; the only post-creation mutations allowed anywhere are the
//! safe fields (see [`ServiceConfig::equal_ignoring_safe_fields`]).
//!
//! The on-disk service definition file is a YAML list of these records.
//! Unknown keys are rejected.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServiceError};

/// Settings a service is made from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,

    /// What to run; resolved via PATH at start time.
    pub program: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Working directory; empty means "home, else /".
    #[serde(default, skip_serializing_if = "path_is_empty")]
    pub dir: PathBuf,
    /// Environment passed verbatim; the parent env is not inherited.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, rename = "auto-start", skip_serializing_if = "is_false")]
    pub auto_start: bool,
    #[serde(default, rename = "restart-on-exit", skip_serializing_if = "is_false")]
    pub restart_on_exit: bool,

    /// True if this config was created at runtime rather than loaded from a
    /// file; temp services are auto-removed after exiting.
    #[serde(default, skip_serializing_if = "is_false")]
    pub temp: bool,
    #[serde(
        default,
        rename = "clean-after",
        with = "crate::config::duration::serde_compact",
        skip_serializing_if = "Duration::is_zero"
    )]
    pub clean_after: Duration,
}

fn path_is_empty(p: &Path) -> bool {
    p.as_os_str().is_empty()
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ServiceConfig {
    /// Checks a config for validity and fixes up values that are dynamic or
    /// have defaults.
    ///
    /// - `name` and `program` must be non-empty.
    /// - An empty `dir` falls back to the user's home, then `/`. The
    ///   daemon's own working directory is deliberately not consulted: it
    ///   may have chdir'd to `/` long before this service was defined.
    /// - `temp == false` forces `clean_after` to zero; a temp config
    ///   without a grace gets `default_clean_after`.
    pub fn sanitize(&mut self, default_clean_after: Duration) -> Result<(), ServiceError> {
        if self.name.is_empty() {
            return Err(ServiceError::InvalidConfig {
                reason: "service needs a name".to_string(),
            });
        }
        if self.program.is_empty() {
            return Err(ServiceError::InvalidConfig {
                reason: "service needs a program to run".to_string(),
            });
        }
        if path_is_empty(&self.dir) {
            self.dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        }

        if self.temp && self.clean_after.is_zero() {
            self.clean_after = default_clean_after;
        } else if !self.temp {
            self.clean_after = Duration::ZERO;
        }

        Ok(())
    }

    /// Returns true if this config equals another, ignoring the fields that
    /// can be safely changed on a running service.
    ///
    /// White-list approach: the safe fields are copied over before the
    /// comparison, so a future config field is unsafe unless listed here.
    pub fn equal_ignoring_safe_fields(&self, other: &ServiceConfig) -> bool {
        let mut masked = other.clone();
        masked.auto_start = self.auto_start;
        masked.restart_on_exit = self.restart_on_exit;
        masked.temp = self.temp;
        masked.clean_after = self.clean_after;
        *self == masked
    }
}

/// Reads a file for a list of service configs, sanitizing them all.
pub fn load_service_file(
    path: &Path,
    default_clean_after: Duration,
) -> Result<Vec<ServiceConfig>, ServerError> {
    let data = fs::read_to_string(path).map_err(|e| {
        ServerError::Config(format!("failed to read service conf {}: {e}", path.display()))
    })?;

    // An empty file reads as null: no services, not an error.
    let mut configs: Vec<ServiceConfig> = serde_yaml::from_str::<Option<Vec<ServiceConfig>>>(&data)
        .map(Option::unwrap_or_default)
        .map_err(|e| {
            ServerError::Config(format!("invalid service conf {}: {e}", path.display()))
        })?;

    for conf in &mut configs {
        conf.sanitize(default_clean_after).map_err(|e| {
            ServerError::Config(format!("bad service definition for name='{}': {e}", conf.name))
        })?;
    }

    Ok(configs)
}
