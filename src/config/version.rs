//! # Client/server version gating.
//!
//! Every client calls `version` right after connecting and refuses servers
//! that are too far away from itself:
//!
//! - major or minor mismatch: hard error,
//! - any mismatch while either side is a pre-release: hard error (things
//!   change too fast on pre-release builds),
//! - patch-level mismatch: allowed, but worth a warning.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A `major.minor.patch[-pre]` version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Pre-release tail (`alpha.2` in `0.1.0-alpha.2`), empty for releases.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pre: String,
}

/// Outcome of comparing a client version against a server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// Close enough to talk.
    Ok,
    /// Talkable, but patch levels differ; a note to the user is warranted.
    PatchSkew,
    /// Refuse the connection.
    Incompatible,
}

impl Version {
    /// The version baked into this binary.
    pub fn current() -> Version {
        // CARGO_PKG_VERSION is a compile-time constant; a parse failure here
        // is a build bug, not a runtime condition.
        Version::parse(env!("CARGO_PKG_VERSION")).expect("crate version must parse")
    }

    /// Parses `major.minor.patch` with an optional `-pre` tail.
    pub fn parse(s: &str) -> Result<Version, String> {
        let (core, pre) = match s.split_once('-') {
            Some((core, pre)) => (core, pre.to_string()),
            None => (s, String::new()),
        };

        let mut parts = core.split('.');
        let mut next = |what: &str| -> Result<u64, String> {
            parts
                .next()
                .ok_or_else(|| format!("missing {what} in version '{s}'"))?
                .parse::<u64>()
                .map_err(|_| format!("bad {what} in version '{s}'"))
        };

        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if parts.next().is_some() {
            return Err(format!("trailing version components in '{s}'"));
        }

        Ok(Version {
            major,
            minor,
            patch,
            pre,
        })
    }

    /// Gate decision for a client at `self` talking to a server at `server`.
    pub fn compatibility(&self, server: &Version) -> Compatibility {
        if self.major != server.major || self.minor != server.minor {
            return Compatibility::Incompatible;
        }
        if self != server && (!self.pre.is_empty() || !server.pre.is_empty()) {
            return Compatibility::Incompatible;
        }
        if self.patch != server.patch {
            return Compatibility::PatchSkew;
        }
        Compatibility::Ok
    }

    /// Release-ordering between two versions, ignoring pre-release tags.
    pub fn release_cmp(&self, other: &Version) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre)?;
        }
        Ok(())
    }
}
