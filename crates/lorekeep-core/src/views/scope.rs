//! Artifact scopes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::EntityId;

/// Unit of materialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactScope {
    /// The whole world, included in every pass
    Global,
    /// One qualifying group
    Group(EntityId),
    /// Shared overflow artifact for groups below the thresholds
    Minor,
}

impl ArtifactScope {
    /// Stable storage key (`global`, `group:<id>`, `minor`)
    pub fn key(&self) -> String {
        match self {
            ArtifactScope::Global => "global".to_string(),
            ArtifactScope::Group(id) => format!("group:{}", id),
            ArtifactScope::Minor => "minor".to_string(),
        }
    }

    /// Bundle name, also the export directory name
    pub fn bundle_name(&self) -> String {
        match self {
            ArtifactScope::Global => "world".to_string(),
            ArtifactScope::Group(id) => format!("group-{}", id),
            ArtifactScope::Minor => "minor-groups".to_string(),
        }
    }
}

impl fmt::Display for ArtifactScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for ArtifactScope {
    type Err = String;

    /// Accepts storage keys and bundle names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "global" | "world" => return Ok(ArtifactScope::Global),
            "minor" | "minor-groups" => return Ok(ArtifactScope::Minor),
            _ => {}
        }
        s.strip_prefix("group:")
            .or_else(|| s.strip_prefix("group-"))
            .and_then(|id| id.parse().ok())
            .map(ArtifactScope::Group)
            .ok_or_else(|| format!("unknown scope '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys_and_names() {
        for scope in [
            ArtifactScope::Global,
            ArtifactScope::Minor,
            ArtifactScope::Group(EntityId(12)),
        ] {
            assert_eq!(scope.key().parse::<ArtifactScope>().unwrap(), scope);
            assert_eq!(scope.bundle_name().parse::<ArtifactScope>().unwrap(), scope);
        }
        assert!("group:x".parse::<ArtifactScope>().is_err());
    }

    #[test]
    fn test_global_sorts_first() {
        let mut scopes = vec![
            ArtifactScope::Minor,
            ArtifactScope::Group(EntityId(2)),
            ArtifactScope::Global,
        ];
        scopes.sort();
        assert_eq!(scopes[0], ArtifactScope::Global);
    }
}
