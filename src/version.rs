use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Engine version as stamped in a data directory's version marker, e.g. `9.1` or `12`.
///
/// Engines before 10 identify their on-disk format by `major.minor`, later ones by `major`
/// alone, so `minor` is optional. A missing minor orders before any explicit one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
#[error("malformed engine version `{0}`")]
pub struct ParseVersionError(String);

impl EngineVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor: Some(minor),
        }
    }

    pub const fn major_only(major: u32) -> Self {
        Self { major, minor: None }
    }
}

impl FromStr for EngineVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError(s.to_string());
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.lines().count() != 1 {
            return Err(err());
        }

        let parse_part = |part: &str| -> Result<u32, ParseVersionError> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            part.parse().map_err(|_| err())
        };

        let mut split = trimmed.split('.');
        let major = parse_part(split.next().ok_or_else(err)?)?;
        let minor = split.next().map(parse_part).transpose()?;
        if split.next().is_some() {
            return Err(err());
        }

        Ok(Self { major, minor })
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Some(minor) => write!(f, "{}.{minor}", self.major),
            None => write!(f, "{}", self.major),
        }
    }
}

impl Serialize for EngineVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EngineVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
