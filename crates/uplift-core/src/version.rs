use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

/// Opaque version identifier.
///
/// Identifiers are trimmed and lower-cased on construction, so equality and
/// hashing are case-insensitive. The derived ordering is lexical and only
/// exists for deterministic listings; upgrade chains never rely on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct VersionId(String);

impl VersionId {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_tuple(&self) -> anyhow::Result<VersionTuple> {
        VersionTuple::parse(&self.0)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VersionId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let version = Self::new(value);
        if version.is_empty() {
            return Err(anyhow!("version identifier must not be empty"));
        }
        Ok(version)
    }
}

impl From<String> for VersionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for VersionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<VersionId> for String {
    fn from(value: VersionId) -> Self {
        value.0
    }
}

impl PartialEq<str> for VersionId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.trim().to_lowercase()
    }
}

impl PartialEq<&str> for VersionId {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseLevel {
    Alpha,
    Beta,
    Candidate,
    Final,
}

impl ReleaseLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alpha => "alpha",
            Self::Beta => "beta",
            Self::Candidate => "candidate",
            Self::Final => "final",
        }
    }

    fn parse(token: &str) -> anyhow::Result<Self> {
        match token {
            "a" | "alpha" => Ok(Self::Alpha),
            "b" | "beta" => Ok(Self::Beta),
            "c" | "rc" | "candidate" => Ok(Self::Candidate),
            "" | "final" => Ok(Self::Final),
            other => Err(anyhow!("unknown release level: {other}")),
        }
    }
}

/// Comparable view of a version string, for display and gating only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionTuple {
    pub major: u64,
    pub minor: u64,
    pub micro: u64,
    pub level: ReleaseLevel,
    pub serial: u64,
}

impl VersionTuple {
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let normalized = input.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(anyhow!("version string must not be empty"));
        }

        if let Ok(version) = semver::Version::parse(&normalized) {
            let (level, serial) = parse_release(version.pre.as_str())
                .with_context(|| format!("invalid pre-release in version '{input}'"))?;
            return Ok(Self {
                major: version.major,
                minor: version.minor,
                micro: version.patch,
                level,
                serial,
            });
        }

        let split_at = normalized
            .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
            .unwrap_or(normalized.len());
        let (numeric, release) = normalized.split_at(split_at);
        let numeric = numeric.trim_end_matches('.');
        if numeric.is_empty() {
            return Err(anyhow!("version '{input}' must start with a number"));
        }

        let components = numeric
            .split('.')
            .map(|part| {
                part.parse::<u64>()
                    .with_context(|| format!("invalid numeric component '{part}' in '{input}'"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        if components.len() > 3 {
            return Err(anyhow!(
                "version '{input}' has more than three numeric components"
            ));
        }

        let (level, serial) = parse_release(release)
            .with_context(|| format!("invalid release suffix in version '{input}'"))?;
        Ok(Self {
            major: components[0],
            minor: components.get(1).copied().unwrap_or(0),
            micro: components.get(2).copied().unwrap_or(0),
            level,
            serial,
        })
    }
}

impl fmt::Display for VersionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {}, {})",
            self.major,
            self.minor,
            self.micro,
            self.level.as_str(),
            self.serial
        )
    }
}

fn parse_release(raw: &str) -> anyhow::Result<(ReleaseLevel, u64)> {
    let trimmed = raw.trim_start_matches(['-', ' ', '_', '.']);
    let letters_end = trimmed
        .find(|ch: char| !ch.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (word, rest) = trimmed.split_at(letters_end);
    let level = ReleaseLevel::parse(word)?;

    let digits = rest.trim_start_matches(['-', ' ', '_', '.']);
    if digits.is_empty() {
        return Ok((level, 0));
    }
    let serial = digits
        .parse::<u64>()
        .with_context(|| format!("invalid release serial: {digits}"))?;
    Ok((level, serial))
}
