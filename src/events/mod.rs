//! Service events: the Info snapshot data model and the bus that fans
//! snapshots out to the UI consumer and the temp-service reaper.
//!
//! ## Quick reference
//! - **Publishers**: `Service` (start, periodic, exit), `Server` (add,
//!   remove, dead notices).
//! - **Consumers**: the outward updates channel (UI), and the reaper via
//!   the pump's inline observer.

mod bus;
mod info;

pub use bus::{Bus, BusPump, UPDATES_BUFFER};
pub use info::{sort_by_activity, sort_by_name, Info, INFO_TAIL_LINES};
