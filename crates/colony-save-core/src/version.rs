use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Save format version stamped into every envelope and snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SaveVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Version written by this build.
///
/// - 1.0.0: initial layout
/// - 1.1.0: `evolution` section
/// - 1.2.0: `view_state`, `settings.auto_save`, `statistics.play_time_secs`
pub const CURRENT_VERSION: SaveVersion = SaveVersion::new(1, 2, 0);

impl SaveVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn current() -> Self {
        CURRENT_VERSION
    }
}

impl Default for SaveVersion {
    fn default() -> Self {
        CURRENT_VERSION
    }
}

impl fmt::Display for SaveVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SaveVersion {
    type Err = String;

    /// Parse the dotted form used by the remote `game_version` column.
    /// A missing patch component defaults to zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = |name: &str, required: bool| -> Result<u32, String> {
            match parts.next() {
                Some(p) => p
                    .parse::<u32>()
                    .map_err(|e| format!("Invalid {} component in '{}': {}", name, s, e)),
                None if required => Err(format!("Missing {} component in '{}'", name, s)),
                None => Ok(0),
            }
        };
        let major = next("major", true)?;
        let minor = next("minor", true)?;
        let patch = next("patch", false)?;
        if parts.next().is_some() {
            return Err(format!("Too many components in '{}'", s));
        }
        Ok(Self::new(major, minor, patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_round_trip() {
        let v: SaveVersion = "1.2.0".parse().unwrap();
        assert_eq!(v, CURRENT_VERSION);
        assert_eq!(v.to_string(), "1.2.0");
    }

    #[test]
    fn test_missing_patch_defaults_to_zero() {
        let v: SaveVersion = "1.1".parse().unwrap();
        assert_eq!(v, SaveVersion::new(1, 1, 0));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("1".parse::<SaveVersion>().is_err());
        assert!("1.x.0".parse::<SaveVersion>().is_err());
        assert!("1.2.3.4".parse::<SaveVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(SaveVersion::new(1, 1, 9) < SaveVersion::new(1, 2, 0));
        assert!(SaveVersion::new(2, 0, 0) > CURRENT_VERSION);
    }
}
