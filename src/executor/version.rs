use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A dotted numeric tool version such as `1.6.2`.
///
/// Ordering compares component-wise with missing components read as zero,
/// so `1.6` equals `1.6.0`. A leading `v` is accepted.
#[derive(Debug, Clone)]
pub struct TfVersion {
    raw: String,
    parts: Vec<u64>,
}

impl TfVersion {
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('v');
        if trimmed.is_empty() {
            bail!("empty version string");
        }
        let mut parts = Vec::new();
        // Pre-release suffixes ("1.6.0-rc1") compare on the numeric core only.
        let core = trimmed.split(['-', '+']).next().unwrap_or(trimmed);
        for piece in core.split('.') {
            match piece.parse::<u64>() {
                Ok(n) => parts.push(n),
                Err(_) => bail!("invalid version {:?}", s),
            }
        }
        Ok(Self {
            raw: trimmed.to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn compare_version_parts(a: &[u64], b: &[u64]) -> Ordering {
    let max_len = a.len().max(b.len());
    for i in 0..max_len {
        let av = a.get(i).copied().unwrap_or(0);
        let bv = b.get(i).copied().unwrap_or(0);
        match av.cmp(&bv) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl PartialEq for TfVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TfVersion {}

impl PartialOrd for TfVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TfVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_version_parts(&self.parts, &other.parts)
    }
}

impl fmt::Display for TfVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for TfVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for TfVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for TfVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TfVersion::parse(&s).map_err(serde::de::Error::custom)
    }
}
