//! Service runtime: the per-service process lifecycle and its bounded
//! output capture.
//!
//! ## Contents
//! - [`Service`] one config, at most one live child, signal-escalated stop
//! - [`OutputRing`] size-bounded line store with cross-restart indexing
//! - [`OutputLine`], [`TailChunk`] the ring's read surface

mod instance;
pub mod output;

pub use instance::{Phase, Service};
pub use output::{OutputLine, OutputRing, TailChunk, MAX_OUTPUT_BYTES};
