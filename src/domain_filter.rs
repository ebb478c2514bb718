use serde::{Deserialize, Serialize};

use crate::{endpoint::normalize_dns_name, error::ConfigError};

/// Include/exclude list of domains.
///
/// An empty include list matches everything. An entry matches the domain
/// itself and every name below it; an entry with a leading dot (`.example.com`)
/// matches only names below it. Exclusions always win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl DomainFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, ConfigError> {
        Ok(Self {
            include: prepare(include)?,
            exclude: prepare(exclude)?,
        })
    }

    /// Filter matching every domain.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty()
    }

    pub fn matches(&self, domain: &str) -> bool {
        let domain = normalize_dns_name(domain);
        let included = self.include.is_empty() || self.include.iter().any(|f| matches_entry(f, &domain));
        included && !self.exclude.iter().any(|f| matches_entry(f, &domain))
    }
}

fn prepare(entries: &[String]) -> Result<Vec<String>, ConfigError> {
    let mut out = Vec::new();
    for raw in entries {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let leading_dot = trimmed.starts_with('.');
        let body = normalize_dns_name(trimmed.trim_start_matches('.'));
        if body.is_empty()
            || body.split('.').any(|label| label.is_empty())
            || body.chars().any(|c| c.is_whitespace() || c == '/' || c == ',')
        {
            return Err(ConfigError::DomainFilter(raw.clone()));
        }
        out.push(if leading_dot { format!(".{body}") } else { body });
    }
    Ok(out)
}

fn matches_entry(filter: &str, domain: &str) -> bool {
    if filter.starts_with('.') {
        return domain.ends_with(filter);
    }
    domain == filter || domain.ends_with(&format!(".{filter}"))
}
