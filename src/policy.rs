use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{endpoint::Changes, error::ConfigError};

/// Which classes of change may reach the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Everything passes.
    #[default]
    Sync,
    /// No deletions.
    UpsertOnly,
    /// Creations only.
    CreateOnly,
    /// Deletions only; used to drain a zone.
    DeleteOnly,
}

impl Policy {
    pub fn apply(&self, changes: Changes) -> Changes {
        match self {
            Policy::Sync => changes,
            Policy::UpsertOnly => Changes {
                delete: Vec::new(),
                ..changes
            },
            Policy::CreateOnly => Changes {
                create: changes.create,
                ..Changes::default()
            },
            Policy::DeleteOnly => Changes {
                delete: changes.delete,
                ..Changes::default()
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Sync => "sync",
            Policy::UpsertOnly => "upsert-only",
            Policy::CreateOnly => "create-only",
            Policy::DeleteOnly => "delete-only",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sync" | "" => Ok(Policy::Sync),
            "upsert-only" => Ok(Policy::UpsertOnly),
            "create-only" => Ok(Policy::CreateOnly),
            "delete-only" => Ok(Policy::DeleteOnly),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}
