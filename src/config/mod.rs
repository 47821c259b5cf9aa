//! Configuration: daemon settings, service definitions, version gating, and
//! the compact duration format they share.

pub mod duration;
pub mod service;
pub mod settings;
pub mod version;

pub use service::{load_service_file, ServiceConfig};
pub use settings::{Overrides, Settings};
pub use version::{Compatibility, Version};
