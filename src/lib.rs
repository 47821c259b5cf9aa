//! # procvisor
//!
//! **Procvisor** is a personal-use process supervisor: a long-lived
//! background daemon that owns a registry of named services, controls their
//! lifecycles, captures their output, and answers short-lived command-line
//! clients over a local UNIX socket.
//!
//! ## Features
//!
//! | Area            | Description                                                        | Key types                             |
//! |-----------------|--------------------------------------------------------------------|---------------------------------------|
//! | **Services**    | One config, at most one live child; signal-escalated stop.         | [`Service`], [`ServiceConfig`]        |
//! | **Output**      | Bounded line store with cross-restart indexing and follow.         | [`OutputRing`], [`OutputLine`]        |
//! | **Supervision** | Restart-on-exit with exponential backoff; temp-service reaping.    | [`RestartWatch`], [`Reaper`]          |
//! | **Events**      | Lossy fan-out of full Info snapshots to the UI and watchers.       | [`Bus`], [`Info`]                     |
//! | **Endpoint**    | Rendezvous-file socket with heartbeat single-instance enforcement. | [`server::endpoint`]                  |
//! | **RPC**         | Newline-delimited JSON command surface.                            | [`server::rpc::Call`], [`Client`]     |
//! | **Errors**      | Typed errors for the daemon and for service lifecycles.            | [`ServerError`], [`ServiceError`]     |
//!
//! The single binary is both the CLI client and, via the hidden `init`
//! subcommand, the daemon itself: a client that finds no live daemon at the
//! rendezvous file boots one and connects to it.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod server;
pub mod service;

// ---- Public re-exports ----

pub use client::Client;
pub use config::{ServiceConfig, Settings, Version};
pub use error::{ServerError, ServiceError};
pub use events::{Bus, Info};
pub use server::{Reaper, RestartWatch, Server, SupervisorOps};
pub use service::{OutputLine, OutputRing, Service};
