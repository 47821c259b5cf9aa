//! # Error types used by the procvisor daemon and services.
//!
//! This module defines two main error enums:
//!
//! - [`ServerError`] errors raised by the daemon itself: registry operations,
//!   the IPC endpoint, and the RPC surface.
//! - [`ServiceError`] errors raised by an individual service lifecycle
//!   (spawn, signal escalation, config sanitation).
//!
//! Both types provide `as_label()` helpers that yield short stable snake_case
//! strings for logs.

use std::io;

use thiserror::Error;

/// Errors produced by the daemon: registry, endpoint, and RPC handling.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ServerError {
    /// A named service does not exist in the registry.
    #[error("service '{name}' not found")]
    NotFound {
        /// The missing service name.
        name: String,
    },

    /// Attempted to add a service with a name that already exists.
    #[error("service '{name}' already exists")]
    AlreadyExists {
        /// The duplicate service name.
        name: String,
    },

    /// Attempted to replace a service that is currently running.
    #[error("can't replace running service '{name}'")]
    CannotReplaceRunning {
        /// The running service name.
        name: String,
    },

    /// A `clean` name glob failed to compile.
    #[error("bad service name pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The rendezvous file is fresh, so another daemon owns the endpoint.
    #[error("there's an active server still running")]
    AnotherInstance,

    /// Client and server versions are too far apart to talk safely.
    #[error("client ({client}) and server ({server}) versions are incompatible")]
    VersionIncompatible { client: String, server: String },

    /// No daemon reachable at the rendezvous path.
    #[error("failed to connect to server: {reason}")]
    ConnectFailed { reason: String },

    /// The RPC stream hit EOF in the middle of a call.
    #[error("Lost connection to backend server during a call to {method}.")]
    ConnectionLost { method: String },

    /// A handler panicked; converted by the recover trampoline.
    #[error("Server error: {detail}")]
    Panic { detail: String },

    /// The server rejected a call; carries the server-rendered message.
    #[error("{0}")]
    Remote(String),

    /// Configuration file or settings problem.
    #[error("config: {0}")]
    Config(String),

    /// A service-level failure bubbling up through a registry operation.
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ServerError::NotFound { .. } => "server_not_found",
            ServerError::AlreadyExists { .. } => "server_already_exists",
            ServerError::CannotReplaceRunning { .. } => "server_cannot_replace_running",
            ServerError::InvalidPattern { .. } => "server_invalid_pattern",
            ServerError::AnotherInstance => "server_another_instance",
            ServerError::VersionIncompatible { .. } => "server_version_incompatible",
            ServerError::ConnectFailed { .. } => "server_connect_failed",
            ServerError::ConnectionLost { .. } => "server_connection_lost",
            ServerError::Panic { .. } => "server_panic",
            ServerError::Remote(_) => "server_remote",
            ServerError::Config(_) => "server_config",
            ServerError::Service(_) => "server_service",
            ServerError::Io(_) => "server_io",
        }
    }
}

/// Errors produced by a single service's lifecycle.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Start was called while a child process is live.
    #[error("service is already running")]
    AlreadyRunning,

    /// The configured program could not be found on PATH.
    #[error("program '{program}' not found on PATH")]
    Resolve {
        /// The program as configured.
        program: String,
    },

    /// The child process failed to spawn.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Every signal escalation was exhausted without observing an exit.
    #[error("failed to stop service")]
    StopFailed,

    /// A config failed sanitation (missing name or program).
    #[error("invalid service config: {reason}")]
    InvalidConfig { reason: String },
}

impl ServiceError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ServiceError::AlreadyRunning => "service_already_running",
            ServiceError::Resolve { .. } => "service_resolve",
            ServiceError::Spawn { .. } => "service_spawn",
            ServiceError::StopFailed => "service_stop_failed",
            ServiceError::InvalidConfig { .. } => "service_invalid_config",
        }
    }
}
